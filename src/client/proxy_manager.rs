//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

//standard shortcuts
use core::fmt::Debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Deadline for dialing the local endpoint behind a data connection.
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for dialing the server for a fresh data connection.
const DATA_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Linger before closing the server socket after a failed local dial.
const HALF_CLOSE_LINGER: Duration = Duration::from_millis(100);
/// Keep-alive period on both legs of a relay.
const RELAY_KEEPALIVE: Duration = Duration::from_secs(30);

//-------------------------------------------------------------------------------------------------------------------

/// Monotonic counters of one proxy instance.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProxyStats
{
    /// gauge: data connections currently relaying
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_bytes: u64,
}

//-------------------------------------------------------------------------------------------------------------------

/// One armed service: exists exactly while the service is registered with an assigned remote port.
///
/// Arming a proxy opens no sockets; it only makes the service eligible for server-initiated data-connection
/// requests.
#[derive(Debug)]
pub struct ProxyInstance
{
    pub service_id: String,
    pub remote_port: u16,
    pub started_at: DateTime<Utc>,
    stats: Mutex<ProxyStats>,
}

impl ProxyInstance
{
    fn new(service_id: &str, remote_port: u16) -> Arc<Self>
    {
        Arc::new(Self{
                service_id  : String::from(service_id),
                remote_port,
                started_at  : Utc::now(),
                stats       : Mutex::new(ProxyStats::default()),
            })
    }

    pub fn stats(&self) -> ProxyStats
    {
        match self.stats.lock()
        {
            Ok(stats) => stats.clone(),
            Err(_)    => ProxyStats::default(),
        }
    }

    fn begin_connection(&self)
    {
        let Ok(mut stats) = self.stats.lock() else { return; };
        stats.active_connections += 1;
        stats.total_connections += 1;
    }

    fn end_connection(&self)
    {
        let Ok(mut stats) = self.stats.lock() else { return; };
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }

    fn add_bytes(&self, bytes: u64)
    {
        let Ok(mut stats) = self.stats.lock() else { return; };
        stats.total_bytes += bytes;
    }
}

/// Decrements the active-connection gauge on every exit path of a relay.
struct ConnectionGuard(Arc<ProxyInstance>);

impl Drop for ConnectionGuard
{
    fn drop(&mut self)
    {
        self.0.end_connection();
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Tracks armed services and bridges server-initiated data connections to local endpoints.
///
/// Deliberately no connection pooling: the server signals "new connection needed" with `proxy_request`, and a
/// pooled socket would race the server's accounting of which sockets are attached to which session. Every
/// request dials fresh.
pub(crate) struct ProxyManager
{
    config: Arc<TunnelClientConfig>,
    /// registry shared with the service manager
    registry: SharedServices,
    proxies: RwLock<HashMap<String, Arc<ProxyInstance>>>,
    /// data-connection tasks, awaitable on shutdown
    tracker: TaskTracker,
}

impl ProxyManager
{
    pub(crate) fn new(config: Arc<TunnelClientConfig>, registry: SharedServices) -> Arc<Self>
    {
        Arc::new(Self{
                config,
                registry,
                proxies : RwLock::new(HashMap::default()),
                tracker : TaskTracker::new(),
            })
    }

    /// Look up a registered service.
    pub(crate) fn lookup_service(&self, service_id: &str) -> Option<Service>
    {
        let registry = self.registry.read().ok()?;
        registry.get(service_id).map(|entry| entry.service.clone())
    }

    /// Arm a proxy for a service. Idempotent: an existing instance is left untouched.
    pub(crate) fn start_proxy(&self, service_id: &str, remote_port: u16) -> Result<(), TunnelError>
    {
        if self.lookup_service(service_id).is_none()
        {
            return Err(TunnelError::ProxyNotFound(String::from(service_id)));
        }

        let Ok(mut proxies) = self.proxies.write()
        else { return Err(TunnelError::ProxyNotFound(String::from(service_id))); };
        if proxies.contains_key(service_id)
        {
            tracing::debug!(%service_id, "proxy already armed");
            return Ok(());
        }

        proxies.insert(String::from(service_id), ProxyInstance::new(service_id, remote_port));
        tracing::info!(%service_id, remote_port, "proxy armed");
        Ok(())
    }

    /// Disarm a proxy. Outstanding data connections run to their natural close.
    pub(crate) fn stop_proxy(&self, service_id: &str)
    {
        let Ok(mut proxies) = self.proxies.write() else { return; };
        if proxies.remove(service_id).is_some()
        {
            tracing::info!(%service_id, "proxy disarmed");
        }
    }

    pub(crate) fn active_count(&self) -> usize
    {
        match self.proxies.read()
        {
            Ok(proxies) => proxies.len(),
            Err(_)      => 0usize,
        }
    }

    /// Snapshot one instance's counters.
    pub(crate) fn proxy_stats(&self, service_id: &str) -> Option<ProxyStats>
    {
        let proxies = self.proxies.read().ok()?;
        proxies.get(service_id).map(|instance| instance.stats())
    }

    fn instance(&self, service_id: &str) -> Option<Arc<ProxyInstance>>
    {
        let proxies = self.proxies.read().ok()?;
        proxies.get(service_id).cloned()
    }

    /// Launch a data connection for a `proxy_request`, tracked for shutdown.
    pub(crate) fn spawn_data_connection(
        self: &Arc<Self>,
        service_id: &str,
        connection_id: &str,
        token: CancellationToken,
    )
    {
        let this = self.clone();
        let service_id = String::from(service_id);
        let connection_id = String::from(connection_id);
        self.tracker.spawn(async move {
            if let Err(err) = this.establish_data_connection(&service_id, &connection_id, &token).await
            {
                tracing::warn!(%err, %service_id, %connection_id, "data connection failed");
            }
        });
    }

    /// Wait for in-flight data connections to finish, bounded. Returns `false` on timeout.
    pub(crate) async fn await_idle(&self, timeout: Duration) -> bool
    {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        drained
    }

    /// Open a fresh outbound data connection and bridge it to the service's local endpoint.
    ///
    /// The handshake frame goes out immediately after the dial, with no pre-verification round-trip: the server
    /// is already waiting on the `connectionId` it handed us.
    async fn establish_data_connection(
        self: &Arc<Self>,
        service_id: &str,
        connection_id: &str,
        token: &CancellationToken,
    ) -> Result<(), TunnelError>
    {
        if self.lookup_service(service_id).is_none()
        {
            return Err(TunnelError::ProxyNotFound(String::from(service_id)));
        }

        let target = self.config.server_target();
        let dial = tokio::time::timeout(DATA_DIAL_TIMEOUT, TcpStream::connect(&target));
        let mut server_conn = tokio::select!
        {
            result = dial =>
            {
                match result
                {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(err)) => return Err(TunnelError::Dial(err)),
                    Err(_) => return Err(TunnelError::Dial(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "data connection dial timed out",
                        ))),
                }
            }
            _ = token.cancelled() => return Err(TunnelError::Cancelled),
        };

        let handshake = DataConnectionHandshake::new(connection_id, self.config.client_id.as_str());
        if let Err(err) = framing::write_handshake(&mut server_conn, &handshake).await
        {
            // a broken pipe or reset here usually means the server closed the request's race window before
            // this socket attached
            if let FramingError::Io(io_err) = &err
            {
                if matches!(io_err.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset)
                {
                    tracing::warn!(%connection_id, "server closed data connection before handshake completed");
                }
            }
            return Err(err.into());
        }

        self.handle_proxy_connection(server_conn, service_id, token).await.map(|_| ())
    }

    /// Bridge an established server-side data socket to the service's local endpoint.
    ///
    /// Returns the bytes copied by the relay direction that finished first.
    pub(crate) async fn handle_proxy_connection(
        &self,
        mut server_conn: TcpStream,
        service_id: &str,
        token: &CancellationToken,
    ) -> Result<u64, TunnelError>
    {
        let Some(instance) = self.instance(service_id)
        else
        {
            let _ = server_conn.shutdown().await;
            return Err(TunnelError::ProxyNotFound(String::from(service_id)));
        };
        let Some(service) = self.lookup_service(service_id)
        else
        {
            let _ = server_conn.shutdown().await;
            return Err(TunnelError::ProxyNotFound(String::from(service_id)));
        };

        instance.begin_connection();
        let _guard = ConnectionGuard(instance.clone());

        let local_target = service.local_target();
        let local_conn = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&local_target)).await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) =>
            {
                Self::half_close(server_conn).await;
                return Err(TunnelError::LocalDialFailed(String::from(service_id), err));
            }
            Err(_) =>
            {
                Self::half_close(server_conn).await;
                return Err(TunnelError::LocalDialFailed(
                        String::from(service_id),
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "local dial timed out"),
                    ));
            }
        };

        configure_relay_socket(&server_conn);
        configure_relay_socket(&local_conn);
        self.mark_service_active(service_id);

        tracing::debug!(%service_id, %local_target, "relaying data connection");

        // two relay directions; each forwards EOF as a close-write on the far side, and the relay ends as soon
        // as either direction finishes
        let (mut server_read, mut server_write) = server_conn.into_split();
        let (mut local_read, mut local_write) = local_conn.into_split();

        let server_to_local = async move {
            let copied = tokio::io::copy(&mut server_read, &mut local_write).await;
            let _ = local_write.shutdown().await;
            copied
        };
        let local_to_server = async move {
            let copied = tokio::io::copy(&mut local_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            copied
        };
        tokio::pin!(server_to_local);
        tokio::pin!(local_to_server);

        let copied = tokio::select!
        {
            result = &mut server_to_local => result,
            result = &mut local_to_server => result,
            _ = token.cancelled() =>
            {
                tracing::debug!(%service_id, "relay cancelled");
                return Err(TunnelError::Cancelled);
            }
        };

        let bytes = match copied
        {
            Ok(bytes) => bytes,
            Err(err) =>
            {
                tracing::debug!(%err, %service_id, "relay ended with error");
                0u64
            }
        };
        instance.add_bytes(bytes);

        tracing::debug!(%service_id, bytes, "data connection finished");
        Ok(bytes)
    }

    /// Close-write toward the server, linger briefly so the FIN outruns the drop, then close.
    async fn half_close(mut server_conn: TcpStream)
    {
        let _ = server_conn.shutdown().await;
        tokio::time::sleep(HALF_CLOSE_LINGER).await;
    }

    fn mark_service_active(&self, service_id: &str)
    {
        let Ok(mut registry) = self.registry.write() else { return; };
        let Some(entry) = registry.get_mut(service_id) else { return; };
        entry.status = ServiceStatus::Active;
        entry.last_active = Some(Utc::now());
    }
}

impl Debug for ProxyManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ProxyManager").field("active", &self.active_count()).finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Keep-alive and no-delay on one leg of a relay.
fn configure_relay_socket(stream: &TcpStream)
{
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(RELAY_KEEPALIVE);
    if let Err(err) = socket.set_tcp_keepalive(&keepalive)
    {
        tracing::debug!(?err, "failed to enable keep-alive on relay socket");
    }
    if let Err(err) = stream.set_nodelay(true)
    {
        tracing::debug!(?err, "failed to disable nagle on relay socket");
    }
}

//-------------------------------------------------------------------------------------------------------------------
