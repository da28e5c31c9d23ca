//local shortcuts

//third-party shortcuts
use simple_tunnel::{
    framing, ControlMessage, MessageData, Service, ServiceType, TunnelClientConfig, MSG_AUTH, MSG_HEARTBEAT,
    MSG_REGISTER_SERVICE, MSG_RESPONSE, MSG_UNREGISTER_SERVICE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

//standard shortcuts
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Behavior knobs for the scripted server.
#[derive(Debug, Default, Clone)]
pub(crate) struct StubConfig
{
    /// First remote port handed out for accepted registrations (increments per acceptance). 0 = assign none.
    pub(crate) remote_port_base: u16,
    /// Service ids whose registration is rejected with `{success:false}`.
    pub(crate) reject_service_ids: HashSet<String>,
    /// When set, registration requests are recorded but never answered.
    pub(crate) silent_registrations: bool,
}

//-------------------------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum StubEvent
{
    ControlConnected,
    AuthReceived{ client_id: String, token: String },
    HeartbeatReceived{ session_id: String },
    RegisterReceived{ service_id: String, accepted: bool },
    UnregisterReceived{ service_id: String },
    ControlClosed,
    DataConnection{ connection_id: String, client_id: String, stream: TcpStream },
}

enum StubCommand
{
    SendMessage(ControlMessage),
    SendRaw(Vec<u8>),
    CloseControl,
    PauseAccept,
    ResumeAccept,
}

//-------------------------------------------------------------------------------------------------------------------

/// Scripted in-process tunnel server for driving the client under test.
pub(crate) struct StubServer
{
    addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<StubCommand>,
    events_rx: mpsc::UnboundedReceiver<StubEvent>,
}

impl StubServer
{
    pub(crate) async fn spawn(config: StubConfig) -> StubServer
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(stub_main(listener, addr, Arc::new(config), cmd_rx, events_tx));

        StubServer{ addr, cmd_tx, events_rx }
    }

    pub(crate) fn port(&self) -> u16
    {
        self.addr.port()
    }

    /// Push a control message to the most recent control connection.
    pub(crate) fn send_control(&self, message: ControlMessage)
    {
        let _ = self.cmd_tx.send(StubCommand::SendMessage(message));
    }

    /// Push raw bytes onto the control socket (for malformed-frame scenarios).
    pub(crate) fn send_raw(&self, bytes: Vec<u8>)
    {
        let _ = self.cmd_tx.send(StubCommand::SendRaw(bytes));
    }

    /// Close the current control connection from the server side.
    pub(crate) fn close_control(&self)
    {
        let _ = self.cmd_tx.send(StubCommand::CloseControl);
    }

    /// Stop accepting connections (simulates a down server).
    pub(crate) fn pause_accept(&self)
    {
        let _ = self.cmd_tx.send(StubCommand::PauseAccept);
    }

    pub(crate) fn resume_accept(&self)
    {
        let _ = self.cmd_tx.send(StubCommand::ResumeAccept);
    }

    /// Wait for the next event matching `matcher`, discarding everything else (heartbeats, mostly).
    pub(crate) async fn wait_for<F>(&mut self, matcher: F, timeout: Duration) -> Option<StubEvent>
    where
        F: Fn(&StubEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop
        {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.events_rx.recv()).await
            {
                Ok(Some(event)) if matcher(&event) => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }
}

//-------------------------------------------------------------------------------------------------------------------

async fn stub_main(
    listener: TcpListener,
    addr: SocketAddr,
    config: Arc<StubConfig>,
    mut cmd_rx: mpsc::UnboundedReceiver<StubCommand>,
    events_tx: mpsc::UnboundedSender<StubEvent>,
)
{
    let writer_slot: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>> = Arc::new(tokio::sync::Mutex::new(None));
    let next_port = Arc::new(AtomicU16::new(config.remote_port_base));
    let mut listener = Some(listener);

    loop
    {
        tokio::select!
        {
            command = cmd_rx.recv() =>
            {
                let Some(command) = command else { break; };
                match command
                {
                    StubCommand::SendMessage(message) =>
                    {
                        let mut slot = writer_slot.lock().await;
                        if let Some(writer) = slot.as_mut()
                        {
                            let _ = framing::write_message(writer, &message).await;
                        }
                    }
                    StubCommand::SendRaw(bytes) =>
                    {
                        let mut slot = writer_slot.lock().await;
                        if let Some(writer) = slot.as_mut()
                        {
                            let _ = writer.write_all(&bytes).await;
                            let _ = writer.flush().await;
                        }
                    }
                    StubCommand::CloseControl =>
                    {
                        let mut slot = writer_slot.lock().await;
                        if let Some(mut writer) = slot.take()
                        {
                            let _ = writer.shutdown().await;
                        }
                    }
                    StubCommand::PauseAccept => listener = None,
                    StubCommand::ResumeAccept =>
                    {
                        if listener.is_none()
                        {
                            listener = TcpListener::bind(addr).await.ok();
                        }
                    }
                }
            }
            accepted = async { listener.as_ref().unwrap().accept().await }, if listener.is_some() =>
            {
                let Ok((stream, _)) = accepted else { continue; };
                tokio::spawn(handle_connection(
                        stream,
                        config.clone(),
                        writer_slot.clone(),
                        events_tx.clone(),
                        next_port.clone(),
                    ));
            }
        }
    }
}

//-------------------------------------------------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    config: Arc<StubConfig>,
    writer_slot: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    events_tx: mpsc::UnboundedSender<StubEvent>,
    next_port: Arc<AtomicU16>,
)
{
    let (mut read_half, write_half) = stream.into_split();

    // the first frame tells control and data connections apart
    let Ok(first) = read_json_frame(&mut read_half).await else { return; };

    if first.get("type").and_then(|v| v.as_str()) == Some("data_connection")
    {
        let connection_id = String::from(first.get("connectionId").and_then(|v| v.as_str()).unwrap_or(""));
        let client_id = String::from(first.get("clientId").and_then(|v| v.as_str()).unwrap_or(""));
        let Ok(stream) = read_half.reunite(write_half) else { return; };
        let _ = events_tx.send(StubEvent::DataConnection{ connection_id, client_id, stream });
        return;
    }

    // control connection: adopt the writer slot and run the message loop
    {
        *writer_slot.lock().await = Some(write_half);
    }
    let _ = events_tx.send(StubEvent::ControlConnected);

    let mut pending_first = Some(first);
    loop
    {
        let value = match pending_first.take()
        {
            Some(value) => value,
            None => match read_json_frame(&mut read_half).await
            {
                Ok(value) => value,
                Err(()) => break,
            },
        };
        let Ok(message) = serde_json::from_value::<ControlMessage>(value) else { continue; };

        match message.msg_type.as_str()
        {
            MSG_AUTH =>
            {
                let _ = events_tx.send(StubEvent::AuthReceived{
                        client_id : String::from(message.data_str("clientId").unwrap_or("")),
                        token     : String::from(message.data_str("token").unwrap_or("")),
                    });
            }
            MSG_HEARTBEAT =>
            {
                let _ = events_tx.send(StubEvent::HeartbeatReceived{ session_id: message.session_id.clone() });
            }
            MSG_REGISTER_SERVICE =>
            {
                let service_id = String::from(
                        message
                            .data
                            .get("service")
                            .and_then(|v| v.get("serviceId"))
                            .and_then(|v| v.as_str())
                            .unwrap_or(""),
                    );

                let accepted = !config.reject_service_ids.contains(&service_id);
                if config.silent_registrations
                {
                    let _ = events_tx.send(StubEvent::RegisterReceived{ service_id, accepted });
                    continue;
                }

                let mut data = MessageData::default();
                match accepted
                {
                    true =>
                    {
                        data.insert(String::from("success"), true.into());
                        if config.remote_port_base != 0
                        {
                            let port = next_port.fetch_add(1, Ordering::Relaxed);
                            data.insert(String::from("remotePort"), port.into());
                        }
                    }
                    false =>
                    {
                        data.insert(String::from("success"), false.into());
                        data.insert(String::from("message"), "service rejected by stub".into());
                    }
                }

                let response = ControlMessage::with_session(MSG_RESPONSE, message.session_id.clone(), data);
                {
                    let mut slot = writer_slot.lock().await;
                    if let Some(writer) = slot.as_mut()
                    {
                        let _ = framing::write_message(writer, &response).await;
                    }
                }
                let _ = events_tx.send(StubEvent::RegisterReceived{ service_id, accepted });
            }
            MSG_UNREGISTER_SERVICE =>
            {
                let service_id = String::from(message.data_str("serviceId").unwrap_or(""));

                let mut data = MessageData::default();
                data.insert(String::from("success"), true.into());
                let response = ControlMessage::with_session(MSG_RESPONSE, message.session_id.clone(), data);
                {
                    let mut slot = writer_slot.lock().await;
                    if let Some(writer) = slot.as_mut()
                    {
                        let _ = framing::write_message(writer, &response).await;
                    }
                }
                let _ = events_tx.send(StubEvent::UnregisterReceived{ service_id });
            }
            _ => (),
        }
    }

    let _ = events_tx.send(StubEvent::ControlClosed);
}

//-------------------------------------------------------------------------------------------------------------------

/// Read one length-prefixed JSON frame with an independent reader, so the tests do not depend on the codec they
/// are exercising.
async fn read_json_frame(reader: &mut OwnedReadHalf) -> Result<serde_json::Value, ()>
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|_| ())?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > 1024 * 1024 { return Err(()); }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|_| ())?;
    serde_json::from_slice(&body).map_err(|_| ())
}

//-------------------------------------------------------------------------------------------------------------------

/// Client config tuned for fast tests.
pub(crate) fn test_config(client_id: &str, server_port: u16) -> TunnelClientConfig
{
    TunnelClientConfig{
            client_id          : String::from(client_id),
            auth_token         : String::from("test-token"),
            server_address     : String::from("127.0.0.1"),
            server_port,
            heartbeat_interval : Duration::from_millis(500),
            retry_interval     : Duration::from_millis(100),
            max_retries        : 10,
            tls_enabled        : false,
            auto_reconnect     : true,
        }
}

//-------------------------------------------------------------------------------------------------------------------

/// A plain TCP service definition pointing at a local port.
pub(crate) fn test_service(service_id: &str, local_port: u16) -> Service
{
    Service{
            service_id      : String::from(service_id),
            service_name    : format!("{}-name", service_id),
            service_type    : ServiceType::Tcp,
            local_address   : String::from("127.0.0.1"),
            local_port,
            remote_port     : None,
            custom_domains  : Vec::default(),
            sub_domain      : None,
            http_user       : None,
            http_password   : None,
            use_encryption  : false,
            use_compression : false,
            bandwidth_limit : None,
            max_connections : 10,
        }
}

//-------------------------------------------------------------------------------------------------------------------

/// Poll a condition until it holds or the timeout expires.
pub(crate) async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline
    {
        if condition() { return true; }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

//-------------------------------------------------------------------------------------------------------------------

/// Spawn an echo server on an ephemeral port; returns the port.
pub(crate) async fn spawn_echo_server() -> u16
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop
        {
            let Ok((mut stream, _)) = listener.accept().await else { break; };
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });

    port
}

//-------------------------------------------------------------------------------------------------------------------
