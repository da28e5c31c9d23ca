//local shortcuts

//third-party shortcuts
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

//standard shortcuts
use core::fmt::Debug;

//-------------------------------------------------------------------------------------------------------------------

pub const MSG_AUTH               : &'static str = "auth";
pub const MSG_HEARTBEAT          : &'static str = "heartbeat";
pub const MSG_REGISTER_SERVICE   : &'static str = "register_service";
pub const MSG_UNREGISTER_SERVICE : &'static str = "unregister_service";
pub const MSG_RESPONSE           : &'static str = "response";
pub const MSG_NEW_PROXY          : &'static str = "new_proxy";
pub const MSG_CLOSE_PROXY        : &'static str = "close_proxy";
pub const MSG_PROXY_REQUEST      : &'static str = "proxy_request";
pub const MSG_NOTIFICATION       : &'static str = "notification";
pub const MSG_ERROR              : &'static str = "error";
pub const MSG_DATA_CONNECTION    : &'static str = "data_connection";

//-------------------------------------------------------------------------------------------------------------------

/// Connection status of a tunnel client, as observed by callers and written through to the store.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus
{
    /// No control connection and no reconnect pending.
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Control connection established and authenticated.
    Connected,
    /// A reconnect run is in flight.
    Reconnecting,
    /// Terminal failure (connect failed, or all reconnect attempts exhausted).
    Error,
    /// The client was stopped by its owner.
    Stopped,
}

impl ConnectionStatus
{
    pub fn as_str(&self) -> &'static str
    {
        match self
        {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting   => "connecting",
            ConnectionStatus::Connected    => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error        => "error",
            ConnectionStatus::Stopped      => "stopped",
        }
    }
}

impl std::fmt::Display for ConnectionStatus
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}", self.as_str())
    }
}

//-------------------------------------------------------------------------------------------------------------------

const SESSION_ID_RAND_LEN: usize = 24;

/// Make a session id with the given prefix (e.g. `hb` -> `hb_a8F...`).
///
/// The random segment draws 24 characters from the alphanumeric alphabet, which comfortably exceeds the
/// entropy needed to avoid correlator collisions between in-flight requests.
pub fn generate_session_id(prefix: &str) -> String
{
    let rand_part: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_RAND_LEN)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, rand_part)
}

//-------------------------------------------------------------------------------------------------------------------
