//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::Utc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

//standard shortcuts
use core::fmt::Debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Capacity of the outgoing queue between callers and the send worker.
const OUTGOING_CAPACITY: usize = 100;
/// Capacity of the inbound queue between the receive worker and the router.
const INBOUND_CAPACITY: usize = 100;
/// How long a caller may wait for the outgoing queue to admit a message.
const SEND_ADMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for dialing the server.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

//-------------------------------------------------------------------------------------------------------------------

/// Internal state of the control connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LinkState
{
    Idle,
    Connecting,
    Connected,
    Closing,
}

//-------------------------------------------------------------------------------------------------------------------

/// Inbound message queue: bounded, drop-oldest.
///
/// The control plane prefers freshness over durability: when the router falls behind, the oldest queued message
/// is discarded to admit the newest.
#[derive(Debug, Default)]
struct InboundQueue
{
    queue: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
}

impl InboundQueue
{
    fn push(&self, message: ControlMessage)
    {
        {
            let Ok(mut queue) = self.queue.lock() else { return; };
            if queue.len() >= INBOUND_CAPACITY
            {
                let dropped = queue.pop_front();
                tracing::warn!(
                    dropped_type = dropped.map(|m| m.msg_type).as_deref(),
                    "inbound queue full, dropping oldest message"
                );
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next message; `None` once `token` fires and the queue is drained.
    async fn pop(&self, token: &CancellationToken) -> Option<ControlMessage>
    {
        loop
        {
            {
                let Ok(mut queue) = self.queue.lock() else { return None; };
                if let Some(message) = queue.pop_front() { return Some(message); }
            }
            if token.is_cancelled() { return None; }

            tokio::select!
            {
                _ = self.notify.notified() => (),
                _ = token.cancelled() => (),
            }
        }
    }

    fn clear(&self)
    {
        let Ok(mut queue) = self.queue.lock() else { return; };
        queue.clear();
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Owner of the control socket.
///
/// Holds the single TCP connection to the tunnel server and the three workers that service it: a send loop
/// (sole writer), a receive loop (sole reader), and a router that dispatches inbound messages. Any I/O error on
/// the socket takes the fatal path exactly once: the connection is torn down, pending requests are drained, and
/// the reconnect manager is asked to start a run.
pub(crate) struct ControlConnection
{
    config: Arc<TunnelClientConfig>,
    store: Arc<dyn ClientStore>,
    /// proxy registry + data-connection machinery, consulted by the router
    proxies: Arc<ProxyManager>,
    /// recent-error ring shared with the owning client
    errors: Arc<ErrorRing>,
    /// asks the supervisor to start a reconnect run
    reconnect_tx: mpsc::UnboundedSender<String>,
    /// client-level status, shared with the owning client
    client_status: Arc<Mutex<ConnectionStatus>>,

    state: Mutex<LinkState>,
    outgoing: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    inbound: Arc<InboundQueue>,
    /// response sinks keyed by session id; read-mostly
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<ControlMessage>>>>,
    info: Mutex<Option<ConnectionInfo>>,
    /// per-connection token, child of the client token; recreated on every connect
    conn_token: Mutex<CancellationToken>,
    client_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlConnection
{
    pub(crate) fn new(
        config: Arc<TunnelClientConfig>,
        store: Arc<dyn ClientStore>,
        proxies: Arc<ProxyManager>,
        errors: Arc<ErrorRing>,
        reconnect_tx: mpsc::UnboundedSender<String>,
        client_status: Arc<Mutex<ConnectionStatus>>,
        client_token: CancellationToken,
    ) -> Arc<Self>
    {
        Arc::new(Self{
                config,
                store,
                proxies,
                errors,
                reconnect_tx,
                client_status,
                state         : Mutex::new(LinkState::Idle),
                outgoing      : Mutex::new(None),
                inbound       : Arc::new(InboundQueue::default()),
                pending       : Arc::new(RwLock::new(HashMap::default())),
                info          : Mutex::new(None),
                conn_token    : Mutex::new(client_token.child_token()),
                client_token,
                workers       : Mutex::new(Vec::default()),
            })
    }

    /// Dial the server, spawn the workers, and submit the auth message through the normal send path.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), TunnelError>
    {
        // claim the connection slot
        {
            let Ok(mut state) = self.state.lock() else { return Err(TunnelError::ConnectionClosed); };
            if *state != LinkState::Idle { return Err(TunnelError::AlreadyConnected); }
            *state = LinkState::Connecting;
        }

        let target = self.config.server_target();
        tracing::debug!(%target, "dialing tunnel server");

        let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) =>
            {
                self.set_state(LinkState::Idle);
                return Err(TunnelError::Dial(err));
            }
            Err(_) =>
            {
                self.set_state(LinkState::Idle);
                return Err(TunnelError::Dial(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "dial timed out",
                    )));
            }
        };

        if let Err(err) = stream.set_nodelay(true)
        {
            tracing::debug!(?err, "failed to disable nagle on control socket");
        }

        let (local_addr, remote_addr) = match (stream.local_addr(), stream.peer_addr())
        {
            (Ok(local), Ok(remote)) => (local, remote),
            _ =>
            {
                self.set_state(LinkState::Idle);
                return Err(TunnelError::Dial(std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "socket address unavailable",
                    )));
            }
        };
        if let Ok(mut info) = self.info.lock()
        {
            *info = Some(ConnectionInfo::new(local_addr, remote_addr));
        }

        // fresh per-connection plumbing
        let token = self.client_token.child_token();
        if let Ok(mut conn_token) = self.conn_token.lock() { *conn_token = token.clone(); }
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<ControlMessage>(OUTGOING_CAPACITY);
        if let Ok(mut outgoing) = self.outgoing.lock() { *outgoing = Some(outgoing_tx); }
        self.inbound.clear();

        let (read_half, write_half) = stream.into_split();
        let send_worker    = tokio::spawn(Self::send_loop(self.clone(), write_half, outgoing_rx, token.clone()));
        let receive_worker = tokio::spawn(Self::receive_loop(self.clone(), read_half, token.clone()));
        let router_worker  = tokio::spawn(Self::router(self.clone(), token.clone()));
        if let Ok(mut workers) = self.workers.lock()
        {
            // leftovers from a faulted connection are already dead
            for stale in workers.drain(..) { stale.abort(); }
            workers.push(send_worker);
            workers.push(receive_worker);
            workers.push(router_worker);
        }

        self.set_state(LinkState::Connected);

        // authenticate through the normal send path; liveness of the auth exchange is inferred from the
        // absence of I/O errors, like every other control-channel write
        let mut data = MessageData::default();
        data.insert(String::from("clientId"), self.config.client_id.clone().into());
        data.insert(String::from("token"), self.config.auth_token.clone().into());
        let auth = ControlMessage::new(MSG_AUTH, data);

        if let Err(err) = self.send(auth).await
        {
            tracing::error!(%err, "failed to submit auth message");
            let _ = self.disconnect(Duration::from_secs(1)).await;
            return Err(TunnelError::AuthSendFailed);
        }

        tracing::info!(client_id = %self.config.client_id, %remote_addr, "control connection established");
        Ok(())
    }

    /// Tear down the connection and wait for the workers, bounded by `timeout`.
    ///
    /// Idempotent. On timeout the workers are aborted (dropping the socket halves) and
    /// [`TunnelError::ShutdownTimeout`] is returned.
    pub(crate) async fn disconnect(&self, timeout: Duration) -> Result<(), TunnelError>
    {
        {
            let Ok(mut state) = self.state.lock() else { return Ok(()); };
            if *state == LinkState::Idle { return Ok(()); }
            *state = LinkState::Closing;
        }

        if let Ok(mut outgoing) = self.outgoing.lock() { *outgoing = None; }
        if let Ok(conn_token) = self.conn_token.lock() { conn_token.cancel(); }
        self.drain_pending();

        let workers: Vec<JoinHandle<()>> = match self.workers.lock()
        {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_)          => Vec::default(),
        };

        let mut timed_out = false;
        let deadline = tokio::time::Instant::now() + timeout;
        for mut worker in workers
        {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut worker).await.is_err()
            {
                // force the socket half held by this worker to drop
                worker.abort();
                timed_out = true;
            }
        }

        if let Ok(mut info) = self.info.lock() { *info = None; }
        self.set_state(LinkState::Idle);

        match timed_out
        {
            true =>
            {
                tracing::warn!("control connection workers did not exit in time, aborted");
                Err(TunnelError::ShutdownTimeout)
            }
            false => Ok(()),
        }
    }

    /// Enqueue a message for the send worker.
    ///
    /// Fails with [`TunnelError::NotConnected`] when there is no live connection; that failure also fires an
    /// asynchronous reconnect trigger.
    pub(crate) async fn send(&self, message: ControlMessage) -> Result<(), TunnelError>
    {
        let sender = match self.outgoing.lock()
        {
            Ok(outgoing) => outgoing.clone(),
            Err(_)       => None,
        };
        let Some(sender) = sender else
        {
            let _ = self.reconnect_tx.send(String::from("send_not_connected"));
            return Err(TunnelError::NotConnected);
        };
        if !self.is_connected()
        {
            let _ = self.reconnect_tx.send(String::from("send_not_connected"));
            return Err(TunnelError::NotConnected);
        }

        match sender.send_timeout(message, SEND_ADMIT_TIMEOUT).await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(TunnelError::SendTimeout),
            Err(mpsc::error::SendTimeoutError::Closed(_))  => Err(TunnelError::NotConnected),
        }
    }

    /// Send a request and wait for the response carrying the same session id.
    ///
    /// The response sink is registered before the message is enqueued so a fast response cannot slip past the
    /// waiter. The sink is deregistered on every exit path.
    pub(crate) async fn send_and_wait(&self, message: ControlMessage, timeout: Duration)
        -> Result<ControlMessage, TunnelError>
    {
        let session_id = message.session_id.clone();
        let (response_tx, response_rx) = oneshot::channel::<ControlMessage>();
        if let Ok(mut pending) = self.pending.write()
        {
            pending.insert(session_id.clone(), response_tx);
        }

        let result = async {
            self.send(message).await?;
            match tokio::time::timeout(timeout, response_rx).await
            {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_))       => Err(TunnelError::ConnectionClosed),
                Err(_)           => Err(TunnelError::ResponseTimeout),
            }
        }
        .await;

        if let Ok(mut pending) = self.pending.write()
        {
            pending.remove(&session_id);
        }

        result
    }

    pub(crate) fn is_connected(&self) -> bool
    {
        match self.state.lock()
        {
            Ok(state) => *state == LinkState::Connected,
            Err(_)    => false,
        }
    }

    /// Snapshot the per-socket bookkeeping.
    pub(crate) fn connection_info(&self) -> Option<ConnectionInfo>
    {
        self.info.lock().ok()?.clone()
    }

    /// Number of response sinks currently registered (observable for tests via the client).
    pub(crate) fn pending_count(&self) -> usize
    {
        match self.pending.read()
        {
            Ok(pending) => pending.len(),
            Err(_)      => 0usize,
        }
    }

    fn set_state(&self, new: LinkState)
    {
        let Ok(mut state) = self.state.lock() else { return; };
        *state = new;
    }

    fn drain_pending(&self)
    {
        let Ok(mut pending) = self.pending.write() else { return; };
        // dropping the sinks resolves every waiter with ConnectionClosed
        pending.clear();
    }

    fn record_sent(&self, bytes: usize)
    {
        let Ok(mut info) = self.info.lock() else { return; };
        let Some(info) = info.as_mut() else { return; };
        info.bytes_sent += bytes as u64;
        info.last_activity = Utc::now();
    }

    fn record_received(&self, bytes: usize)
    {
        let Ok(mut info) = self.info.lock() else { return; };
        let Some(info) = info.as_mut() else { return; };
        info.bytes_received += bytes as u64;
        info.last_activity = Utc::now();
    }

    /// Fatal path: runs at most once per connection.
    ///
    /// Marks the connection dead, drains pending requests, writes the disconnect through to the store, and asks
    /// the supervisor for a reconnect run.
    fn fail_connection(&self, reason: &str)
    {
        {
            let Ok(mut state) = self.state.lock() else { return; };
            match *state
            {
                // deliberate shutdown or an earlier fault already owns the teardown
                LinkState::Idle | LinkState::Closing => return,
                _ => *state = LinkState::Idle,
            }
        }

        tracing::error!(%reason, client_id = %self.config.client_id, "control connection fault");

        if let Ok(mut outgoing) = self.outgoing.lock() { *outgoing = None; }
        if let Ok(conn_token) = self.conn_token.lock() { conn_token.cancel(); }
        self.drain_pending();

        if let Ok(mut status) = self.client_status.lock() { *status = ConnectionStatus::Disconnected; }
        let store = self.store.clone();
        let client_id = self.config.client_id.clone();
        tokio::spawn(async move {
            if let Err(err) = store.update_connection_status(&client_id, ConnectionStatus::Disconnected, Utc::now()).await
            {
                tracing::warn!(%err, "failed to persist disconnect status");
            }
        });

        let _ = self.reconnect_tx.send(String::from(reason));
    }

    async fn send_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut outgoing_rx: mpsc::Receiver<ControlMessage>,
        token: CancellationToken,
    )
    {
        loop
        {
            let message = tokio::select!
            {
                _ = token.cancelled() => break,
                message = outgoing_rx.recv() => message,
            };
            let Some(message) = message else { break; };

            match framing::write_message(&mut write_half, &message).await
            {
                Ok(bytes) =>
                {
                    tracing::trace!(msg_type = %message.msg_type, bytes, "sent control message");
                    self.record_sent(bytes);
                }
                Err(err) =>
                {
                    tracing::error!(%err, msg_type = %message.msg_type, "control write failed");
                    self.fail_connection("send_error");
                    break;
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, token: CancellationToken)
    {
        loop
        {
            let result = tokio::select!
            {
                _ = token.cancelled() => break,
                result = framing::read_message(&mut read_half) => result,
            };

            match result
            {
                Ok((message, bytes)) =>
                {
                    tracing::trace!(msg_type = %message.msg_type, bytes, "received control message");
                    self.record_received(bytes);
                    self.inbound.push(message);
                }
                Err(FramingError::ConnectionConfusion) =>
                {
                    tracing::error!("non-protocol bytes on control channel, closing");
                    self.fail_connection("connection_confusion");
                    break;
                }
                Err(err) =>
                {
                    tracing::error!(%err, "control read failed");
                    self.fail_connection("receive_error");
                    break;
                }
            }
        }
    }

    async fn router(self: Arc<Self>, token: CancellationToken)
    {
        while let Some(message) = self.inbound.pop(&token).await
        {
            self.route_message(message);
        }
    }

    /// Dispatch one inbound message by type.
    ///
    /// Payload access is defensive throughout: a malformed message of a known type is logged and dropped, never
    /// allowed to abort the router.
    fn route_message(&self, message: ControlMessage)
    {
        match message.msg_type.as_str()
        {
            MSG_RESPONSE =>
            {
                let sink = match self.pending.write()
                {
                    Ok(mut pending) => pending.remove(&message.session_id),
                    Err(_)          => None,
                };
                match sink
                {
                    Some(sink) => { let _ = sink.send(message); }
                    None => tracing::debug!(session_id = %message.session_id, "response for unknown session, dropping"),
                }
            }
            MSG_NEW_PROXY =>
            {
                let (Some(service_id), Some(remote_port)) =
                    (message.data_str("serviceId"), message.data_u16("remotePort"))
                else
                {
                    tracing::warn!("malformed new_proxy message, dropping");
                    return;
                };
                if self.proxies.lookup_service(service_id).is_none()
                {
                    tracing::warn!(%service_id, "new_proxy for unknown service, dropping");
                    return;
                }
                if let Err(err) = self.proxies.start_proxy(service_id, remote_port)
                {
                    tracing::warn!(%err, %service_id, "failed to arm proxy");
                }
            }
            MSG_CLOSE_PROXY =>
            {
                let Some(service_id) = message.data_str("serviceId")
                else
                {
                    tracing::warn!("malformed close_proxy message, dropping");
                    return;
                };
                self.proxies.stop_proxy(service_id);
            }
            MSG_PROXY_REQUEST =>
            {
                let (Some(service_id), Some(connection_id)) =
                    (message.data_str("serviceId"), message.data_str("connectionId"))
                else
                {
                    tracing::warn!("malformed proxy_request message, dropping");
                    return;
                };
                let token = match self.conn_token.lock()
                {
                    Ok(conn_token) => conn_token.clone(),
                    Err(_)         => return,
                };
                self.proxies.spawn_data_connection(service_id, connection_id, token);
            }
            MSG_NOTIFICATION =>
            {
                tracing::info!(
                    message = message.data_str("message").unwrap_or("<empty>"),
                    "server notification"
                );
            }
            MSG_ERROR =>
            {
                let code = message.data_str("code").unwrap_or("unknown");
                let text = message.data_str("message").unwrap_or("");
                tracing::error!(%code, %text, "server error");
                self.errors.push(code, text);

                // an error that carries a session id resolves the matching in-flight request
                if !message.session_id.is_empty()
                {
                    let sink = match self.pending.write()
                    {
                        Ok(mut pending) => pending.remove(&message.session_id),
                        Err(_)          => None,
                    };
                    if let Some(sink) = sink { let _ = sink.send(message); }
                }
            }
            unknown =>
            {
                tracing::warn!(msg_type = %unknown, "unknown control message type, dropping");
            }
        }
    }
}

impl Debug for ControlConnection
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ControlConnection")
            .field("client_id", &self.config.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
