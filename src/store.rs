//local shortcuts
use crate::*;

//third-party shortcuts
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//standard shortcuts
use core::fmt::Debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Errors from a [`ClientStore`] implementation.
#[derive(Debug)]
pub enum StoreError
{
    /// The referenced client or service does not exist.
    NotFound(String),
    /// Backend failure (connectivity, serialization, etc.).
    Backend(String),
}

impl std::fmt::Display for StoreError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let _ = write!(f, "StoreError::");
        match self
        {
            StoreError::NotFound(id)     => write!(f, "NotFound({})", id),
            StoreError::Backend(reason)  => write!(f, "Backend({})", reason),
        }
    }
}
impl std::error::Error for StoreError {}

//-------------------------------------------------------------------------------------------------------------------

/// Persisted form of a tunnel client: configuration plus the statistics the core writes through.
///
/// The statistics fields are mutated only by the owning [`TunnelClient`](crate::TunnelClient) (single-writer
/// discipline); everything else is management-surface data the core treats as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelClientRecord
{
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    pub auth_token: String,
    pub server_address: String,
    pub server_port: u16,
    pub heartbeat_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    pub connection_status: ConnectionStatus,
    #[serde(default)]
    pub last_connect_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_disconnect_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reconnect_count: u32,
    #[serde(default)]
    pub total_reconnect_ms: u64,
}

fn default_auto_reconnect() -> bool { true }

impl TunnelClientRecord
{
    /// Make a fresh record from a config (statistics zeroed).
    pub fn from_config(config: &TunnelClientConfig) -> Self
    {
        Self{
                client_id               : config.client_id.clone(),
                client_name             : String::default(),
                auth_token              : config.auth_token.clone(),
                server_address          : config.server_address.clone(),
                server_port             : config.server_port,
                heartbeat_interval_secs : config.heartbeat_interval.as_secs(),
                retry_interval_secs     : config.retry_interval.as_secs(),
                max_retries             : config.max_retries,
                tls_enabled             : config.tls_enabled,
                auto_reconnect          : config.auto_reconnect,
                connection_status       : ConnectionStatus::Disconnected,
                last_connect_time       : None,
                last_disconnect_time    : None,
                last_heartbeat          : None,
                reconnect_count         : 0u32,
                total_reconnect_ms      : 0u64,
            }
    }

    /// Extract the runtime config.
    pub fn to_config(&self) -> TunnelClientConfig
    {
        TunnelClientConfig{
                client_id          : self.client_id.clone(),
                auth_token         : self.auth_token.clone(),
                server_address     : self.server_address.clone(),
                server_port        : self.server_port,
                heartbeat_interval : Duration::from_secs(self.heartbeat_interval_secs),
                retry_interval     : Duration::from_secs(self.retry_interval_secs),
                max_retries        : self.max_retries,
                tls_enabled        : self.tls_enabled,
                auto_reconnect     : self.auto_reconnect,
            }
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Repository surface consumed by the client core.
///
/// All calls are stateless; implementations own their concurrency. The core issues writes asynchronously where
/// latency matters (heartbeats) and awaits them where correctness matters (connect/disconnect transitions).
#[async_trait]
pub trait ClientStore: Send + Sync + 'static
{
    async fn get_by_id(&self, client_id: &str) -> Result<Option<TunnelClientRecord>, StoreError>;
    async fn list_clients(&self) -> Result<Vec<TunnelClientRecord>, StoreError>;
    /// Services persisted for one client, in the order they were defined.
    async fn services_by_client(&self, client_id: &str) -> Result<Vec<Service>, StoreError>;
    async fn update_connection_status(
        &self,
        client_id: &str,
        status: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn update_heartbeat(&self, client_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn update_reconnect_info(
        &self,
        client_id: &str,
        reconnect_count: u32,
        total_reconnect_ms: u64,
    ) -> Result<(), StoreError>;
    async fn update_service_status(
        &self,
        service_id: &str,
        status: ServiceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

//-------------------------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryStoreInner
{
    clients: HashMap<String, TunnelClientRecord>,
    /// (owning client id, service); a Vec so per-client ordering survives
    services: Vec<(String, Service)>,
    service_status: HashMap<String, (ServiceStatus, DateTime<Utc>)>,
}

/// In-memory [`ClientStore`] for tests and embedders that do not carry a database.
#[derive(Debug, Default)]
pub struct MemoryStore
{
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Insert or replace a client record.
    pub fn insert_client(&self, record: TunnelClientRecord)
    {
        let Ok(mut inner) = self.inner.lock() else { return; };
        inner.clients.insert(record.client_id.clone(), record);
    }

    /// Append a service for a client (replaces any existing service with the same id).
    pub fn insert_service(&self, client_id: &str, service: Service)
    {
        let Ok(mut inner) = self.inner.lock() else { return; };
        inner.services.retain(|(_, s)| s.service_id != service.service_id);
        inner.services.push((String::from(client_id), service));
    }

    pub fn remove_service(&self, service_id: &str)
    {
        let Ok(mut inner) = self.inner.lock() else { return; };
        inner.services.retain(|(_, s)| s.service_id != service_id);
        inner.service_status.remove(service_id);
    }

    /// Snapshot a client record.
    pub fn client(&self, client_id: &str) -> Option<TunnelClientRecord>
    {
        self.inner.lock().ok()?.clients.get(client_id).cloned()
    }

    /// Snapshot a service's persisted status.
    pub fn service_status(&self, service_id: &str) -> Option<ServiceStatus>
    {
        self.inner.lock().ok()?.service_status.get(service_id).map(|(status, _)| *status)
    }
}

impl MemoryStore
{
    fn locked(&self) -> Result<std::sync::MutexGuard<'_, MemoryStoreInner>, StoreError>
    {
        self.inner.lock().map_err(|_| StoreError::Backend(String::from("memory store lock poisoned")))
    }
}

#[async_trait]
impl ClientStore for MemoryStore
{
    async fn get_by_id(&self, client_id: &str) -> Result<Option<TunnelClientRecord>, StoreError>
    {
        Ok(self.locked()?.clients.get(client_id).cloned())
    }

    async fn list_clients(&self) -> Result<Vec<TunnelClientRecord>, StoreError>
    {
        let mut clients: Vec<TunnelClientRecord> = self.locked()?.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients)
    }

    async fn services_by_client(&self, client_id: &str) -> Result<Vec<Service>, StoreError>
    {
        let inner = self.locked()?;
        Ok(inner
            .services
            .iter()
            .filter(|(owner, _)| owner == client_id)
            .map(|(_, service)| service.clone())
            .collect())
    }

    async fn update_connection_status(
        &self,
        client_id: &str,
        status: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>
    {
        let mut inner = self.locked()?;
        let Some(record) = inner.clients.get_mut(client_id)
        else { return Err(StoreError::NotFound(String::from(client_id))); };
        record.connection_status = status;
        match status
        {
            ConnectionStatus::Connected    => record.last_connect_time = Some(at),
            ConnectionStatus::Disconnected => record.last_disconnect_time = Some(at),
            _                              => (),
        }
        Ok(())
    }

    async fn update_heartbeat(&self, client_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>
    {
        let mut inner = self.locked()?;
        let Some(record) = inner.clients.get_mut(client_id)
        else { return Err(StoreError::NotFound(String::from(client_id))); };
        record.last_heartbeat = Some(at);
        Ok(())
    }

    async fn update_reconnect_info(
        &self,
        client_id: &str,
        reconnect_count: u32,
        total_reconnect_ms: u64,
    ) -> Result<(), StoreError>
    {
        let mut inner = self.locked()?;
        let Some(record) = inner.clients.get_mut(client_id)
        else { return Err(StoreError::NotFound(String::from(client_id))); };
        record.reconnect_count = reconnect_count;
        record.total_reconnect_ms = total_reconnect_ms;
        Ok(())
    }

    async fn update_service_status(
        &self,
        service_id: &str,
        status: ServiceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>
    {
        let mut inner = self.locked()?;
        if !inner.services.iter().any(|(_, s)| s.service_id == service_id)
        {
            return Err(StoreError::NotFound(String::from(service_id)));
        }
        inner.service_status.insert(String::from(service_id), (status, at));
        Ok(())
    }
}

//-------------------------------------------------------------------------------------------------------------------
