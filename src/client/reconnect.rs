//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::Utc;
use tokio_util::sync::CancellationToken;

//standard shortcuts
use core::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Cap on the backoff schedule.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Bound handed to `disconnect` at the top of each attempt.
const DISCONNECT_BOUND: Duration = Duration::from_secs(5);
/// Watchdog around the bounded disconnect; expiry means "proceed anyway".
const DISCONNECT_WATCHDOG: Duration = Duration::from_secs(6);
/// Settle time between tearing the old socket down and dialing again.
const QUIESCE_DELAY: Duration = Duration::from_secs(1);
/// How long to poll `is_connected` after a successful dial (covers the auth round trip).
const CONNECTED_WAIT: Duration = Duration::from_secs(2);
/// Poll slice while waiting for `is_connected`.
const CONNECTED_POLL: Duration = Duration::from_millis(100);
/// Bound on stopping the old heartbeat worker.
const HEARTBEAT_STOP_BOUND: Duration = Duration::from_secs(3);
/// Bound on one service re-registration attempt.
const REREGISTER_BOUND: Duration = Duration::from_secs(30);
/// Attempts per service during post-reconnect re-registration.
const REREGISTER_TRIES: u32 = 3;
/// Base backoff between re-registration attempts (doubles per try).
const REREGISTER_BACKOFF: Duration = Duration::from_secs(2);

//-------------------------------------------------------------------------------------------------------------------

/// Backoff schedule: `min(300s, base * 2^(n-1))` for attempt `n >= 1`.
pub fn backoff_interval(base: Duration, attempt: u32) -> Duration
{
    let exponent = attempt.saturating_sub(1u32).min(16u32);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

//-------------------------------------------------------------------------------------------------------------------

/// Clears the single-flight flag when a run exits, on every path.
struct RunGuard<'a>(&'a Mutex<bool>);

impl<'a> Drop for RunGuard<'a>
{
    fn drop(&mut self)
    {
        if let Ok(mut reconnecting) = self.0.lock() { *reconnecting = false; }
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Orchestrates reconnect runs: disconnect, backoff, redial, heartbeat restart, service re-registration.
///
/// At most one run is in flight per client; concurrent triggers bounce off with
/// [`TunnelError::AlreadyReconnecting`].
pub(crate) struct ReconnectManager
{
    config: Arc<TunnelClientConfig>,
    control: Arc<ControlConnection>,
    heartbeat: Arc<HeartbeatManager>,
    services: Arc<ServiceManager>,
    store: Arc<dyn ClientStore>,
    status: Arc<Mutex<ConnectionStatus>>,
    stats: Arc<Mutex<ClientStats>>,
    errors: Arc<ErrorRing>,
    run_token: RunToken,
    reconnecting: Mutex<bool>,
}

impl ReconnectManager
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<TunnelClientConfig>,
        control: Arc<ControlConnection>,
        heartbeat: Arc<HeartbeatManager>,
        services: Arc<ServiceManager>,
        store: Arc<dyn ClientStore>,
        status: Arc<Mutex<ConnectionStatus>>,
        stats: Arc<Mutex<ClientStats>>,
        errors: Arc<ErrorRing>,
        run_token: RunToken,
    ) -> Arc<Self>
    {
        Arc::new(Self{
                config,
                control,
                heartbeat,
                services,
                store,
                status,
                stats,
                errors,
                run_token,
                reconnecting: Mutex::new(false),
            })
    }

    pub(crate) fn is_reconnecting(&self) -> bool
    {
        match self.reconnecting.lock()
        {
            Ok(reconnecting) => *reconnecting,
            Err(_)           => false,
        }
    }

    /// Execute one reconnect run.
    pub(crate) async fn run(&self, reason: &str) -> Result<(), TunnelError>
    {
        // single-flight guard
        {
            let Ok(mut reconnecting) = self.reconnecting.lock()
            else { return Err(TunnelError::AlreadyReconnecting); };
            if *reconnecting { return Err(TunnelError::AlreadyReconnecting); }
            *reconnecting = true;
        }
        let _guard = RunGuard(&self.reconnecting);

        let token = self.run_token.current();
        let run_start = std::time::Instant::now();

        tracing::info!(%reason, client_id = %self.config.client_id, "reconnect run starting");
        self.set_status(ConnectionStatus::Reconnecting);
        self.persist_status(ConnectionStatus::Reconnecting).await;

        for attempt in 1u32..=self.config.max_retries
        {
            if token.is_cancelled() { return Err(TunnelError::Cancelled); }

            tracing::info!(attempt, max = self.config.max_retries, "reconnect attempt");

            // tear the old connection down; a stuck worker must not wedge the run
            let disconnect = self.control.disconnect(DISCONNECT_BOUND);
            if tokio::time::timeout(DISCONNECT_WATCHDOG, disconnect).await.is_err()
            {
                tracing::warn!("disconnect watchdog expired, proceeding");
            }

            if !self.sleep_cancellable(QUIESCE_DELAY, &token).await { return Err(TunnelError::Cancelled); }

            if let Err(err) = self.control.connect().await
            {
                tracing::warn!(%err, attempt, "reconnect dial failed");
                let backoff = backoff_interval(self.config.retry_interval, attempt);
                if !self.sleep_cancellable(backoff, &token).await { return Err(TunnelError::Cancelled); }
                continue;
            }

            if !self.await_connected(&token).await
            {
                tracing::warn!(attempt, "connection did not settle after dial");
                let backoff = backoff_interval(self.config.retry_interval, attempt);
                if !self.sleep_cancellable(backoff, &token).await { return Err(TunnelError::Cancelled); }
                continue;
            }

            // the heartbeat worker is sticky, so a bare start would be a no-op; stop it first
            if let Err(err) = self.heartbeat.stop(HEARTBEAT_STOP_BOUND).await
            {
                tracing::warn!(%err, "failed to stop old heartbeat worker cleanly");
            }
            self.heartbeat.start().await;

            self.set_status(ConnectionStatus::Connected);
            let (reconnect_count, total_reconnect_ms) = {
                match self.stats.lock()
                {
                    Ok(mut stats) =>
                    {
                        stats.reconnect_count += 1u32;
                        stats.total_reconnect_ms += run_start.elapsed().as_millis() as u64;
                        stats.last_connect_time = Some(Utc::now());
                        (stats.reconnect_count, stats.total_reconnect_ms)
                    }
                    Err(_) => (0u32, 0u64),
                }
            };
            self.persist_status(ConnectionStatus::Connected).await;
            if let Err(err) = self
                .store
                .update_reconnect_info(&self.config.client_id, reconnect_count, total_reconnect_ms)
                .await
            {
                tracing::debug!(%err, "failed to persist reconnect info");
            }

            self.reregister_services(&token).await;

            tracing::info!(attempt, reconnect_count, "reconnect run succeeded");
            return Ok(());
        }

        tracing::error!(max = self.config.max_retries, %reason, "reconnect run exhausted");
        self.set_status(ConnectionStatus::Error);
        self.persist_status(ConnectionStatus::Error).await;
        self.errors.push(
            "reconnect_failed",
            format!("all {} reconnect attempts failed ({})", self.config.max_retries, reason),
        );

        Err(TunnelError::ReconnectExhausted(self.config.max_retries))
    }

    /// Re-register every service persisted for this client.
    ///
    /// Partial success is acceptable; only the all-failed case is recorded as an error, and even that does not
    /// fail the surrounding reconnect run.
    async fn reregister_services(&self, token: &CancellationToken)
    {
        let services = match self.store.services_by_client(&self.config.client_id).await
        {
            Ok(services) => services,
            Err(err) =>
            {
                tracing::warn!(%err, "failed to load services for re-registration");
                return;
            }
        };
        if services.is_empty() { return; }

        let total = services.len();
        let mut succeeded = 0usize;

        for service in services
        {
            let service_id = service.service_id.clone();
            let mut registered = false;

            for try_num in 1u32..=REREGISTER_TRIES
            {
                if token.is_cancelled() { return; }

                let attempt = self.services.register_service(service.clone());
                match tokio::time::timeout(REREGISTER_BOUND, attempt).await
                {
                    Ok(Ok(_)) =>
                    {
                        registered = true;
                        break;
                    }
                    Ok(Err(err)) => tracing::warn!(%err, %service_id, try_num, "re-registration failed"),
                    Err(_)       => tracing::warn!(%service_id, try_num, "re-registration timed out"),
                }

                if try_num < REREGISTER_TRIES
                {
                    let backoff = REREGISTER_BACKOFF.saturating_mul(1u32 << (try_num - 1u32));
                    if !self.sleep_cancellable(backoff, token).await { return; }
                }
            }

            match registered
            {
                true  => succeeded += 1usize,
                false =>
                {
                    if let Err(err) = self
                        .store
                        .update_service_status(&service_id, ServiceStatus::Error, Utc::now())
                        .await
                    {
                        tracing::debug!(%err, %service_id, "failed to persist service error status");
                    }
                }
            }
        }

        tracing::info!(succeeded, total, "service re-registration finished");
        if succeeded == 0usize
        {
            self.errors.push("reregistration_failed", "no services re-registered after reconnect");
        }
    }

    /// Poll for the control connection to report connected, bounded by [`CONNECTED_WAIT`].
    async fn await_connected(&self, token: &CancellationToken) -> bool
    {
        let slices = (CONNECTED_WAIT.as_millis() / CONNECTED_POLL.as_millis()) as u32;
        for _ in 0u32..slices
        {
            if self.control.is_connected() { return true; }
            if !self.sleep_cancellable(CONNECTED_POLL, token).await { return false; }
        }
        self.control.is_connected()
    }

    /// Sleep unless cancelled; `false` means the run should abort.
    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool
    {
        tokio::select!
        {
            _ = tokio::time::sleep(duration) => true,
            _ = token.cancelled() => false,
        }
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
}

impl Debug for ReconnectManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ReconnectManager")
            .field("client_id", &self.config.client_id)
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
