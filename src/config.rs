//local shortcuts

//third-party shortcuts

//standard shortcuts
use core::fmt::Debug;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Config for a [`TunnelClient`](crate::TunnelClient).
///
/// Treated as read-only by the client core; runtime statistics live in the status snapshot and the store record,
/// never here.
#[derive(Debug, Clone)]
pub struct TunnelClientConfig
{
    /// Identity presented during authentication.
    pub client_id: String,
    /// Shared secret presented during authentication.
    pub auth_token: String,
    /// Tunnel server host (name or address).
    pub server_address: String,
    /// Tunnel server control port.
    pub server_port: u16,
    /// Interval between heartbeat probes. Defaults to 30 seconds.
    pub heartbeat_interval: Duration,
    /// Base interval of the reconnect backoff schedule. Defaults to 5 seconds.
    pub retry_interval: Duration,
    /// Maximum attempts in one reconnect run. Defaults to 10.
    pub max_retries: u32,
    /// Whether the control channel runs over TLS. Carried for embedders; below the framing layer.
    pub tls_enabled: bool,
    /// Whether control-channel faults start a reconnect run. Defaults to `true`.
    pub auto_reconnect: bool,
}

impl TunnelClientConfig
{
    /// The `host:port` the control connection and data connections dial.
    pub fn server_target(&self) -> String
    {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

impl Default for TunnelClientConfig
{
    fn default() -> TunnelClientConfig
    {
        TunnelClientConfig{
                client_id          : String::default(),
                auth_token         : String::default(),
                server_address     : String::from("127.0.0.1"),
                server_port        : 7000u16,
                heartbeat_interval : Duration::from_secs(30),
                retry_interval     : Duration::from_secs(5),
                max_retries        : 10u32,
                tls_enabled        : false,
                auto_reconnect     : true,
            }
    }
}

//-------------------------------------------------------------------------------------------------------------------
