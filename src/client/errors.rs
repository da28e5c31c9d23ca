//local shortcuts
use crate::*;

//third-party shortcuts

//standard shortcuts
use core::fmt::Debug;

//-------------------------------------------------------------------------------------------------------------------

/// Errors surfaced by the tunnel client core.
///
/// Transient I/O errors on the control channel are never returned to in-flight callers; they surface as
/// [`TunnelError::NotConnected`] for new submissions while the reconnect manager takes over.
#[derive(Debug)]
pub enum TunnelError
{
    /// The client is already running.
    AlreadyRunning,
    /// The control connection is already established.
    AlreadyConnected,
    /// The control connection is not established.
    NotConnected,
    /// A reconnect run is already in flight.
    AlreadyReconnecting,
    /// Dialing the server failed.
    Dial(std::io::Error),
    /// The auth message could not be submitted after connecting.
    AuthSendFailed,
    /// The outgoing queue did not admit the message within the deadline.
    SendTimeout,
    /// No response arrived for the session id within the caller's timeout.
    ResponseTimeout,
    /// Workers did not exit within the shutdown bound.
    ShutdownTimeout,
    /// The connection was torn down while waiting.
    ConnectionClosed,
    /// Wire-format violation.
    Framing(FramingError),
    /// No proxy instance is armed for the service.
    ProxyNotFound(String),
    /// The local endpoint behind a data connection could not be dialed.
    LocalDialFailed(String, std::io::Error),
    /// Service-level validation failure; never reaches the wire.
    Validation(ValidationError),
    /// Store failure on a path where the caller must know.
    Store(StoreError),
    /// The server rejected a registration; carries the server's message verbatim.
    RegistrationRejected(String, String),
    /// Every reconnect attempt failed.
    ReconnectExhausted(u32),
    /// Every persisted service failed to register during startup.
    StartupRegistrationFailed,
    /// The operation was cancelled by its context.
    Cancelled,
}

impl std::fmt::Display for TunnelError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let _ = write!(f, "TunnelError::");
        match self
        {
            TunnelError::AlreadyRunning                  => write!(f, "AlreadyRunning"),
            TunnelError::AlreadyConnected                => write!(f, "AlreadyConnected"),
            TunnelError::NotConnected                    => write!(f, "NotConnected"),
            TunnelError::AlreadyReconnecting             => write!(f, "AlreadyReconnecting"),
            TunnelError::Dial(err)                       => write!(f, "Dial({})", err),
            TunnelError::AuthSendFailed                  => write!(f, "AuthSendFailed"),
            TunnelError::SendTimeout                     => write!(f, "SendTimeout"),
            TunnelError::ResponseTimeout                 => write!(f, "ResponseTimeout"),
            TunnelError::ShutdownTimeout                 => write!(f, "ShutdownTimeout"),
            TunnelError::ConnectionClosed                => write!(f, "ConnectionClosed"),
            TunnelError::Framing(err)                    => write!(f, "Framing({})", err),
            TunnelError::ProxyNotFound(id)               => write!(f, "ProxyNotFound({})", id),
            TunnelError::LocalDialFailed(id, err)        => write!(f, "LocalDialFailed({}, {})", id, err),
            TunnelError::Validation(err)                 => write!(f, "Validation({})", err),
            TunnelError::Store(err)                      => write!(f, "Store({})", err),
            TunnelError::RegistrationRejected(id, msg)   => write!(f, "RegistrationRejected({}, {})", id, msg),
            TunnelError::ReconnectExhausted(attempts)    => write!(f, "ReconnectExhausted({})", attempts),
            TunnelError::StartupRegistrationFailed       => write!(f, "StartupRegistrationFailed"),
            TunnelError::Cancelled                       => write!(f, "Cancelled"),
        }
    }
}
impl std::error::Error for TunnelError {}

impl From<FramingError> for TunnelError
{
    fn from(err: FramingError) -> Self { TunnelError::Framing(err) }
}

impl From<ValidationError> for TunnelError
{
    fn from(err: ValidationError) -> Self { TunnelError::Validation(err) }
}

impl From<StoreError> for TunnelError
{
    fn from(err: StoreError) -> Self { TunnelError::Store(err) }
}

//-------------------------------------------------------------------------------------------------------------------
