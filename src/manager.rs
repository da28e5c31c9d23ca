//local shortcuts
use crate::*;

//third-party shortcuts
use tokio_util::sync::CancellationToken;

//standard shortcuts
use core::fmt::Debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Bound used when the manager stops a client on behalf of `reload`/`delete`.
const MANAGED_STOP_BOUND: Duration = Duration::from_secs(5);

//-------------------------------------------------------------------------------------------------------------------

/// Holds many tunnel clients keyed by client id.
///
/// The manager owns a root cancellation token that is deliberately not derived from any caller: HTTP handlers
/// and CLI commands bound the operations they invoke, never the lifetime of a running client.
pub struct TunnelClientManager
{
    store: Arc<dyn ClientStore>,
    clients: tokio::sync::RwLock<HashMap<String, Arc<TunnelClient>>>,
    root_token: CancellationToken,
}

impl TunnelClientManager
{
    /// Make a manager and load every persisted client from the store (not started).
    pub async fn new(store: Arc<dyn ClientStore>) -> Result<Self, TunnelError>
    {
        let manager = Self{
                store,
                clients    : tokio::sync::RwLock::new(HashMap::default()),
                root_token : CancellationToken::new(),
            };

        let records = manager.store.list_clients().await?;
        {
            let mut clients = manager.clients.write().await;
            for record in records
            {
                let client_id = record.client_id.clone();
                let client =
                    TunnelClient::with_parent_token(record.to_config(), manager.store.clone(), &manager.root_token);
                clients.insert(client_id, client);
            }
        }

        Ok(manager)
    }

    /// Start one client, loading it from the store if it is not yet held.
    pub async fn start(&self, client_id: &str) -> Result<(), TunnelError>
    {
        let client = match self.get_client(client_id).await
        {
            Some(client) => client,
            None =>
            {
                let Some(record) = self.store.get_by_id(client_id).await?
                else { return Err(TunnelError::Store(StoreError::NotFound(String::from(client_id)))); };

                let client =
                    TunnelClient::with_parent_token(record.to_config(), self.store.clone(), &self.root_token);
                self.clients.write().await.insert(String::from(client_id), client.clone());
                client
            }
        };

        client.start().await
    }

    /// Start every held client. Returns the number that started cleanly.
    pub async fn start_all(&self) -> usize
    {
        let clients = self.snapshot().await;
        let mut started = 0usize;
        for (client_id, client) in clients
        {
            match client.start().await
            {
                Ok(()) => started += 1usize,
                Err(TunnelError::AlreadyRunning) => started += 1usize,
                Err(err) => tracing::warn!(%err, %client_id, "failed to start client"),
            }
        }
        started
    }

    /// Stop one client, bounded.
    pub async fn stop(&self, client_id: &str, timeout: Duration) -> Result<(), TunnelError>
    {
        let Some(client) = self.get_client(client_id).await
        else { return Err(TunnelError::Store(StoreError::NotFound(String::from(client_id)))); };

        client.stop(timeout).await
    }

    /// Stop every held client, bounded per client.
    pub async fn stop_all(&self, timeout: Duration)
    {
        let clients = self.snapshot().await;
        for (client_id, client) in clients
        {
            if let Err(err) = client.stop(timeout).await
            {
                tracing::warn!(%err, %client_id, "failed to stop client");
            }
        }
    }

    /// Replace a client's configuration: stop the old client, install a new one, restart it if it was running.
    pub async fn reload(&self, record: TunnelClientRecord) -> Result<(), TunnelError>
    {
        let client_id = record.client_id.clone();

        let was_running = match self.get_client(&client_id).await
        {
            Some(old_client) =>
            {
                let was_running = old_client.is_running();
                if let Err(err) = old_client.stop(MANAGED_STOP_BOUND).await
                {
                    tracing::warn!(%err, %client_id, "failed to stop client for reload");
                }
                was_running
            }
            None => false,
        };

        let client = TunnelClient::with_parent_token(record.to_config(), self.store.clone(), &self.root_token);
        self.clients.write().await.insert(client_id, client.clone());

        match was_running
        {
            true  => client.start().await,
            false => Ok(()),
        }
    }

    /// Remove a client, stopping it first.
    pub async fn delete(&self, client_id: &str) -> Result<(), TunnelError>
    {
        let removed = self.clients.write().await.remove(client_id);
        let Some(client) = removed else { return Ok(()); };

        if let Err(err) = client.stop(MANAGED_STOP_BOUND).await
        {
            tracing::warn!(%err, %client_id, "failed to stop client for delete");
        }
        Ok(())
    }

    pub async fn get_client(&self, client_id: &str) -> Option<Arc<TunnelClient>>
    {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn client_count(&self) -> usize
    {
        self.clients.read().await.len()
    }

    /// Stop everything and cancel the root token.
    pub async fn shutdown(&self, timeout: Duration)
    {
        self.stop_all(timeout).await;
        self.root_token.cancel();
    }

    async fn snapshot(&self) -> Vec<(String, Arc<TunnelClient>)>
    {
        self.clients
            .read()
            .await
            .iter()
            .map(|(client_id, client)| (client_id.clone(), client.clone()))
            .collect()
    }
}

impl Debug for TunnelClientManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("TunnelClientManager").finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
