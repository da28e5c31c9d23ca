//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

//standard shortcuts
use core::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Consecutive failed heartbeat submissions before a reconnect run is requested.
const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

//-------------------------------------------------------------------------------------------------------------------

struct HeartbeatWorker
{
    token: CancellationToken,
    handle: JoinHandle<()>,
}

//-------------------------------------------------------------------------------------------------------------------

/// Periodic liveness probe for the control channel.
///
/// Heartbeats go out with `send`, not `send_and_wait`: liveness is inferred from the absence of I/O errors on
/// the channel, so a "failure" here is a failed local submission, not a missing acknowledgement.
///
/// The worker is sticky: `start` on a running manager is a no-op, which is why the reconnect run must stop and
/// then start it rather than call `start` alone.
pub(crate) struct HeartbeatManager
{
    config: Arc<TunnelClientConfig>,
    control: Arc<ControlConnection>,
    store: Arc<dyn ClientStore>,
    reconnect_tx: mpsc::UnboundedSender<String>,
    run_token: RunToken,
    worker: tokio::sync::Mutex<Option<HeartbeatWorker>>,
    /// bumped on every start; lets observers verify the worker was actually replaced
    generation: AtomicU64,
}

impl HeartbeatManager
{
    pub(crate) fn new(
        config: Arc<TunnelClientConfig>,
        control: Arc<ControlConnection>,
        store: Arc<dyn ClientStore>,
        reconnect_tx: mpsc::UnboundedSender<String>,
        run_token: RunToken,
    ) -> Arc<Self>
    {
        Arc::new(Self{
                config,
                control,
                store,
                reconnect_tx,
                run_token,
                worker     : tokio::sync::Mutex::new(None),
                generation : AtomicU64::new(0u64),
            })
    }

    /// Start the heartbeat worker. Idempotent while a worker is running.
    pub(crate) async fn start(self: &Arc<Self>)
    {
        let mut worker = self.worker.lock().await;
        if worker.is_some()
        {
            tracing::debug!("heartbeat worker already running");
            return;
        }

        let generation = self.generation.fetch_add(1u64, Ordering::Relaxed) + 1u64;
        let token = self.run_token.current().child_token();
        let handle = tokio::spawn(Self::run(self.clone(), token.clone(), generation));
        *worker = Some(HeartbeatWorker{ token, handle });

        tracing::debug!(generation, "heartbeat worker started");
    }

    /// Stop the heartbeat worker and wait for it, bounded.
    pub(crate) async fn stop(&self, timeout: Duration) -> Result<(), TunnelError>
    {
        let taken = self.worker.lock().await.take();
        let Some(HeartbeatWorker{ token, mut handle }) = taken else { return Ok(()); };

        token.cancel();
        if tokio::time::timeout(timeout, &mut handle).await.is_err()
        {
            handle.abort();
            tracing::warn!("heartbeat worker did not exit in time, aborted");
            return Err(TunnelError::ShutdownTimeout);
        }

        Ok(())
    }

    /// Generation of the most recently started worker.
    pub(crate) fn generation(&self) -> u64
    {
        self.generation.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>, token: CancellationToken, generation: u64)
    {
        // floor the period so a degenerate config cannot produce a zero-period ticker
        let period = self.config.heartbeat_interval.max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut failures = 0u32;

        loop
        {
            tokio::select!
            {
                _ = token.cancelled() => break,
                _ = ticker.tick() => (),
            }

            let heartbeat = ControlMessage::with_session(
                    MSG_HEARTBEAT,
                    generate_session_id("hb"),
                    MessageData::default(),
                );

            match self.control.send(heartbeat).await
            {
                Ok(()) =>
                {
                    failures = 0u32;

                    // persist the probe time off the hot path
                    let store = self.store.clone();
                    let client_id = self.config.client_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = store.update_heartbeat(&client_id, Utc::now()).await
                        {
                            tracing::debug!(%err, "failed to persist heartbeat time");
                        }
                    });
                }
                Err(err) =>
                {
                    failures += 1u32;
                    tracing::warn!(%err, failures, generation, "heartbeat submission failed");

                    if failures >= CONSECUTIVE_FAILURE_THRESHOLD
                    {
                        let _ = self.reconnect_tx.send(String::from("heartbeat_consecutive_failures"));
                        failures = 0u32;
                    }
                }
            }
        }

        tracing::debug!(generation, "heartbeat worker stopped");
    }
}

impl Debug for HeartbeatManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("HeartbeatManager")
            .field("client_id", &self.config.client_id)
            .field("generation", &self.generation())
            .finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
