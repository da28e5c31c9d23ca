//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//standard shortcuts
use core::fmt::Debug;

//-------------------------------------------------------------------------------------------------------------------

/// Open key/value payload of a control message.
pub type MessageData = serde_json::Map<String, serde_json::Value>;

//-------------------------------------------------------------------------------------------------------------------

/// A single control-plane message.
///
/// Every message on the control channel has this shape. The `data` map carries heterogeneous fields, so readers
/// must go through the typed accessors, which check before use and return `None` on any mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage
{
    /// message type (see the `MSG_*` constants)
    #[serde(rename = "type")]
    pub msg_type: String,
    /// correlator for request/response pairs
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    /// creation time, ISO 8601 on the wire
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// open payload
    #[serde(default)]
    pub data: MessageData,
}

impl ControlMessage
{
    /// Make a message with a fresh session id derived from the message type.
    pub fn new(msg_type: &str, data: MessageData) -> Self
    {
        Self::with_session(msg_type, generate_session_id(msg_type), data)
    }

    /// Make a message with a caller-chosen session id.
    pub fn with_session(msg_type: &str, session_id: String, data: MessageData) -> Self
    {
        Self{
                msg_type: String::from(msg_type),
                session_id,
                timestamp: Some(Utc::now()),
                data,
            }
    }

    /// Get a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str>
    {
        self.data.get(key)?.as_str()
    }

    /// Get an unsigned integer field from the payload.
    pub fn data_u64(&self, key: &str) -> Option<u64>
    {
        self.data.get(key)?.as_u64()
    }

    /// Get a port-sized field from the payload.
    pub fn data_u16(&self, key: &str) -> Option<u16>
    {
        u16::try_from(self.data_u64(key)?).ok()
    }

    /// Get a boolean field from the payload.
    pub fn data_bool(&self, key: &str) -> Option<bool>
    {
        self.data.get(key)?.as_bool()
    }

    /// Check whether the server marked this message successful (used on `response` messages).
    pub fn is_success(&self) -> bool
    {
        self.data_bool("success").unwrap_or(false)
    }

    /// Get the server's human-readable message, if any.
    pub fn message_text(&self) -> Option<&str>
    {
        self.data_str("message")
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// First frame written on a fresh outbound data connection.
///
/// Unlike [`ControlMessage`], the fields sit at the top level of the JSON object; the server matches the
/// `connectionId` against the `proxy_request` it sent on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConnectionHandshake
{
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl DataConnectionHandshake
{
    pub fn new(connection_id: impl Into<String>, client_id: impl Into<String>) -> Self
    {
        Self{
                msg_type      : String::from(MSG_DATA_CONNECTION),
                connection_id : connection_id.into(),
                client_id     : client_id.into(),
            }
    }
}

//-------------------------------------------------------------------------------------------------------------------
