//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

//standard shortcuts
use core::fmt::Debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Bound on stopping the heartbeat worker during client stop.
const STOP_HEARTBEAT_BOUND: Duration = Duration::from_secs(3);
/// Bound on disconnecting the control connection during client stop.
const STOP_DISCONNECT_BOUND: Duration = Duration::from_secs(5);
/// Independent bound on the final store write of a stop, so an expired caller context cannot starve it.
const STOP_PERSIST_BOUND: Duration = Duration::from_secs(5);

//-------------------------------------------------------------------------------------------------------------------

/// Handle to the cancellation token of the client's current run.
///
/// `stop` cancels the current token and `start` installs a fresh one, so long-lived components hold this cell
/// and read the live token at the moment they spawn work, never a stale copy.
#[derive(Clone)]
pub(crate) struct RunToken
{
    cell: Arc<Mutex<CancellationToken>>,
}

impl RunToken
{
    pub(crate) fn new(parent: &CancellationToken) -> Self
    {
        Self{ cell: Arc::new(Mutex::new(parent.child_token())) }
    }

    /// The token of the current run.
    pub(crate) fn current(&self) -> CancellationToken
    {
        match self.cell.lock()
        {
            Ok(token) => token.clone(),
            Err(_)    => CancellationToken::new(),
        }
    }

    /// Cancel the current run.
    pub(crate) fn cancel(&self)
    {
        if let Ok(token) = self.cell.lock() { token.cancel(); }
    }

    /// Install a fresh token for a new run.
    pub(crate) fn reset(&self, parent: &CancellationToken)
    {
        if let Ok(mut token) = self.cell.lock() { *token = parent.child_token(); }
    }
}

impl Debug for RunToken
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("RunToken").finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// One registered tunnel client.
///
/// Composes the control connection, heartbeat, reconnect, service, and proxy managers. The client's lifetime
/// token descends from its manager's root token, never from a caller's context: callers bound individual
/// operations, not the life of the client.
pub struct TunnelClient
{
    config: Arc<TunnelClientConfig>,
    store: Arc<dyn ClientStore>,
    control: Arc<ControlConnection>,
    heartbeat: Arc<HeartbeatManager>,
    reconnect: Arc<ReconnectManager>,
    services: Arc<ServiceManager>,
    proxies: Arc<ProxyManager>,
    status: Arc<Mutex<ConnectionStatus>>,
    stats: Arc<Mutex<ClientStats>>,
    errors: Arc<ErrorRing>,
    /// serializes start/stop
    running: tokio::sync::Mutex<bool>,
    running_flag: AtomicBool,
    lifetime_token: CancellationToken,
    run_token: RunToken,
}

impl TunnelClient
{
    /// Make a standalone client. Must be called within a tokio runtime (spawns the reconnect supervisor).
    pub fn new(config: TunnelClientConfig, store: Arc<dyn ClientStore>) -> Arc<Self>
    {
        Self::with_parent_token(config, store, &CancellationToken::new())
    }

    /// Make a client whose lifetime token descends from `parent` (used by the client manager).
    pub(crate) fn with_parent_token(
        config: TunnelClientConfig,
        store: Arc<dyn ClientStore>,
        parent: &CancellationToken,
    ) -> Arc<Self>
    {
        let config = Arc::new(config);
        let lifetime_token = parent.child_token();
        let run_token = RunToken::new(&lifetime_token);
        let status = Arc::new(Mutex::new(ConnectionStatus::Disconnected));
        let stats = Arc::new(Mutex::new(ClientStats::default()));
        let errors = Arc::new(ErrorRing::default());
        let registry: SharedServices = Arc::new(RwLock::new(HashMap::default()));
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel::<String>();

        let proxies = ProxyManager::new(config.clone(), registry.clone());
        let control = ControlConnection::new(
                config.clone(),
                store.clone(),
                proxies.clone(),
                errors.clone(),
                reconnect_tx.clone(),
                status.clone(),
                lifetime_token.clone(),
            );
        let heartbeat = HeartbeatManager::new(
                config.clone(),
                control.clone(),
                store.clone(),
                reconnect_tx,
                run_token.clone(),
            );
        let services = ServiceManager::new(
                config.clone(),
                control.clone(),
                proxies.clone(),
                registry,
                store.clone(),
            );
        let reconnect = ReconnectManager::new(
                config.clone(),
                control.clone(),
                heartbeat.clone(),
                services.clone(),
                store.clone(),
                status.clone(),
                stats.clone(),
                errors.clone(),
                run_token.clone(),
            );

        let client = Arc::new(Self{
                config,
                store,
                control,
                heartbeat,
                reconnect,
                services,
                proxies,
                status,
                stats,
                errors,
                running       : tokio::sync::Mutex::new(false),
                running_flag  : AtomicBool::new(false),
                lifetime_token,
                run_token,
            });

        // the supervisor lives as long as the client, across start/stop cycles
        tokio::spawn(Self::reconnect_supervisor(
                client.config.clone(),
                client.reconnect.clone(),
                Arc::downgrade(&client),
                reconnect_rx,
                client.lifetime_token.clone(),
            ));

        client
    }

    /// Start the client: connect, authenticate, start the heartbeat, and recover persisted services.
    pub async fn start(&self) -> Result<(), TunnelError>
    {
        let mut running = self.running.lock().await;
        if *running { return Err(TunnelError::AlreadyRunning); }

        self.run_token.reset(&self.lifetime_token);
        self.set_status(ConnectionStatus::Connecting);
        self.persist_status(ConnectionStatus::Connecting).await;

        if let Err(err) = self.control.connect().await
        {
            tracing::error!(%err, client_id = %self.config.client_id, "failed to connect");
            self.set_status(ConnectionStatus::Error);
            self.persist_status(ConnectionStatus::Error).await;
            return Err(err);
        }

        self.heartbeat.start().await;

        self.set_status(ConnectionStatus::Connected);
        if let Ok(mut stats) = self.stats.lock() { stats.last_connect_time = Some(Utc::now()); }
        self.persist_status(ConnectionStatus::Connected).await;

        // recover persisted services; partial failure is tolerated, total failure is not
        let services = match self.store.services_by_client(&self.config.client_id).await
        {
            Ok(services) => services,
            Err(err) =>
            {
                tracing::warn!(%err, "failed to load persisted services, starting with none");
                Vec::default()
            }
        };
        let total = services.len();
        let mut succeeded = 0usize;
        for service in services
        {
            let service_id = service.service_id.clone();
            match self.services.register_service(service).await
            {
                Ok(_) => succeeded += 1usize,
                Err(err) => tracing::warn!(%err, %service_id, "startup registration failed"),
            }
        }
        if total > 0usize && succeeded == 0usize
        {
            tracing::error!(total, "every startup registration failed");
            let _ = self.heartbeat.stop(STOP_HEARTBEAT_BOUND).await;
            let _ = self.control.disconnect(STOP_DISCONNECT_BOUND).await;
            self.set_status(ConnectionStatus::Error);
            self.persist_status(ConnectionStatus::Error).await;
            return Err(TunnelError::StartupRegistrationFailed);
        }

        *running = true;
        self.running_flag.store(true, Ordering::Release);
        tracing::info!(client_id = %self.config.client_id, registered = succeeded, "tunnel client started");
        Ok(())
    }

    /// Stop the client, bounded by `timeout`. Idempotent; shutdown continues past an expired bound.
    pub async fn stop(&self, timeout: Duration) -> Result<(), TunnelError>
    {
        let mut running = self.running.lock().await;
        if !*running { return Ok(()); }
        *running = false;
        self.running_flag.store(false, Ordering::Release);

        tracing::info!(client_id = %self.config.client_id, "tunnel client stopping");
        let deadline = tokio::time::Instant::now() + timeout;

        // cancel run-scoped work (heartbeat, reconnect runs, relays are cut at disconnect below)
        self.run_token.cancel();

        // unregister while the control channel can still carry the requests
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, self.services.unregister_all()).await.is_err()
        {
            tracing::warn!("unregistration did not finish in time, continuing shutdown");
        }

        if let Err(err) = self.heartbeat.stop(STOP_HEARTBEAT_BOUND).await
        {
            tracing::warn!(%err, "heartbeat did not stop cleanly");
        }
        if let Err(err) = self.control.disconnect(STOP_DISCONNECT_BOUND).await
        {
            tracing::warn!(%err, "control connection did not disconnect cleanly");
        }

        // wait for in-flight data connections with whatever remains of the caller's bound
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !self.proxies.await_idle(remaining).await
        {
            tracing::warn!("data connections did not drain in time, continuing shutdown");
        }

        self.set_status(ConnectionStatus::Stopped);
        if let Ok(mut stats) = self.stats.lock() { stats.last_disconnect_time = Some(Utc::now()); }

        // the final store write gets its own bound so an expired caller context cannot starve it
        let persist = self.store.update_connection_status(
                &self.config.client_id,
                ConnectionStatus::Disconnected,
                Utc::now(),
            );
        match tokio::time::timeout(STOP_PERSIST_BOUND, persist).await
        {
            Ok(Err(err)) => tracing::warn!(%err, "failed to persist disconnect status"),
            Err(_)       => tracing::warn!("persisting disconnect status timed out"),
            Ok(Ok(()))   => (),
        }

        tracing::info!(client_id = %self.config.client_id, "tunnel client stopped");
        Ok(())
    }

    /// Register a service with the server. Returns the remote port in effect after registration.
    pub async fn register_service(&self, service: Service) -> Result<Option<u16>, TunnelError>
    {
        self.services.register_service(service).await
    }

    /// Unregister a service.
    pub async fn unregister_service(&self, service_id: &str) -> Result<(), TunnelError>
    {
        self.services.unregister_service(service_id).await
    }

    /// Snapshot the client's observable state.
    pub fn status(&self) -> ClientStatus
    {
        let status = match self.status.lock()
        {
            Ok(status) => *status,
            Err(_)     => ConnectionStatus::Error,
        };
        let stats = match self.stats.lock()
        {
            Ok(stats) => stats.clone(),
            Err(_)    => ClientStats::default(),
        };

        ClientStatus{
                client_id            : self.config.client_id.clone(),
                status,
                registered_services  : self.services.service_count(),
                active_proxies       : self.proxies.active_count(),
                reconnect_count      : stats.reconnect_count,
                last_connect_time    : stats.last_connect_time,
                last_disconnect_time : stats.last_disconnect_time,
                recent_errors        : self.errors.snapshot(),
                connection           : self.control.connection_info(),
            }
    }

    /// Registry entry for one service.
    pub fn service(&self, service_id: &str) -> Option<ServiceEntry>
    {
        self.services.get(service_id)
    }

    /// All registry entries.
    pub fn services(&self) -> Vec<ServiceEntry>
    {
        self.services.list()
    }

    /// Counters of one armed proxy.
    pub fn proxy_stats(&self, service_id: &str) -> Option<ProxyStats>
    {
        self.proxies.proxy_stats(service_id)
    }

    pub fn is_running(&self) -> bool
    {
        self.running_flag.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool
    {
        self.reconnect.is_reconnecting()
    }

    /// Generation of the current heartbeat worker; changes whenever the worker is replaced.
    pub fn heartbeat_generation(&self) -> u64
    {
        self.heartbeat.generation()
    }

    /// Number of request sinks currently waiting for responses.
    pub fn pending_request_count(&self) -> usize
    {
        self.control.pending_count()
    }

    pub fn config(&self) -> &TunnelClientConfig
    {
        &self.config
    }

    fn set_status(&self, status: ConnectionStatus)
    {
        let Ok(mut current) = self.status.lock() else { return; };
        *current = status;
    }

    async fn persist_status(&self, status: ConnectionStatus)
    {
        if let Err(err) = self
            .store
            .update_connection_status(&self.config.client_id, status, Utc::now())
            .await
        {
            tracing::debug!(%err, ?status, "failed to persist connection status");
        }
    }

    /// Long-lived consumer of reconnect triggers.
    ///
    /// Holds only a weak reference to the client so a dropped client is not pinned by its own supervisor.
    async fn reconnect_supervisor(
        config: Arc<TunnelClientConfig>,
        reconnect: Arc<ReconnectManager>,
        client: std::sync::Weak<TunnelClient>,
        mut reconnect_rx: mpsc::UnboundedReceiver<String>,
        lifetime_token: CancellationToken,
    )
    {
        loop
        {
            let reason = tokio::select!
            {
                _ = lifetime_token.cancelled() => break,
                reason = reconnect_rx.recv() => reason,
            };
            let Some(reason) = reason else { break; };

            let Some(client) = client.upgrade() else { break; };
            if !client.is_running()
            {
                tracing::debug!(%reason, "ignoring reconnect trigger on stopped client");
                continue;
            }
            if !config.auto_reconnect
            {
                tracing::info!(%reason, "auto-reconnect disabled, staying disconnected");
                continue;
            }
            // `send_not_connected` is only emitted while the link is down, so a Connected status here means an
            // earlier run already repaired the connection; heartbeat triggers stay honored regardless because
            // a wedged-but-open socket still reads as Connected
            if reason == "send_not_connected" && client.status().status == ConnectionStatus::Connected
            {
                tracing::debug!(%reason, "connection already restored, dropping stale trigger");
                continue;
            }

            // spawn rather than await: triggers that land during a run must bounce off the single-flight
            // guard instead of queuing up serial runs
            let reconnect = reconnect.clone();
            tokio::spawn(async move {
                match reconnect.run(&reason).await
                {
                    Ok(()) => (),
                    Err(TunnelError::AlreadyReconnecting) =>
                    {
                        tracing::debug!(%reason, "reconnect already in flight, trigger coalesced");
                    }
                    Err(err) =>
                    {
                        tracing::error!(%err, %reason, "reconnect run failed");
                    }
                }
            });
        }
    }
}

impl Drop for TunnelClient
{
    fn drop(&mut self)
    {
        self.lifetime_token.cancel();
    }
}

impl Debug for TunnelClient
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("TunnelClient")
            .field("client_id", &self.config.client_id)
            .field("running", &self.is_running())
            .finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
