//local shortcuts
use crate::*;

//third-party shortcuts
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

//standard shortcuts
use core::fmt::Debug;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Largest frame body accepted on a control or data channel.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;
/// Smallest frame body accepted; no valid JSON control message is shorter.
pub const MIN_FRAME_LEN: u32 = 10;

/// Deadline for writing one control frame.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for reading one control frame.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Deadline for writing the data-connection handshake frame.
pub const HANDSHAKE_WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for a server-side read of the data-connection handshake frame.
pub const HANDSHAKE_READ_DEADLINE: Duration = Duration::from_secs(120);

/// Max leading NUL bytes tolerated on a frame body before the frame is rejected.
const MAX_LEADING_NULS: usize = 8;

//-------------------------------------------------------------------------------------------------------------------

/// Errors from the framing codec.
///
/// All variants are fatal to the frame they occur on; the connection fault path decides what happens next.
#[derive(Debug)]
pub enum FramingError
{
    /// The length prefix was zero.
    EmptyFrame,
    /// The length prefix was below [`MIN_FRAME_LEN`].
    FrameTooSmall(u32),
    /// The length prefix exceeded [`MAX_FRAME_LEN`].
    FrameTooLarge(u32),
    /// The frame body is not JSON; the peer is sending non-protocol bytes on this channel.
    ConnectionConfusion,
    /// The per-frame deadline expired.
    Timeout,
    /// Underlying socket error.
    Io(std::io::Error),
    /// The body failed to deserialize.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for FramingError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let _ = write!(f, "FramingError::");
        match self
        {
            FramingError::EmptyFrame          => write!(f, "EmptyFrame"),
            FramingError::FrameTooSmall(len)  => write!(f, "FrameTooSmall({})", len),
            FramingError::FrameTooLarge(len)  => write!(f, "FrameTooLarge({})", len),
            FramingError::ConnectionConfusion => write!(f, "ConnectionConfusion"),
            FramingError::Timeout             => write!(f, "Timeout"),
            FramingError::Io(err)             => write!(f, "Io({})", err),
            FramingError::Malformed(err)      => write!(f, "Malformed({})", err),
        }
    }
}
impl std::error::Error for FramingError {}

//-------------------------------------------------------------------------------------------------------------------

/// Read one length-prefixed frame body. A short read anywhere is fatal to the frame.
async fn read_frame_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FramingError>
{
    // full 4-byte length before the body
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(FramingError::Io)?;
    let len = u32::from_be_bytes(len_buf);

    // sanity-check the length field
    if len == 0 { return Err(FramingError::EmptyFrame); }
    if len > MAX_FRAME_LEN { return Err(FramingError::FrameTooLarge(len)); }
    if len < MIN_FRAME_LEN { return Err(FramingError::FrameTooSmall(len)); }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(FramingError::Io)?;
    Ok(body)
}

//-------------------------------------------------------------------------------------------------------------------

/// Trim the body down to its JSON payload.
///
/// Tolerates a handful of leading NUL bytes (stale pooled sockets have been observed to prepend them), then
/// requires the first non-whitespace byte to open a JSON object or array. Anything else means the peer is not
/// speaking this protocol on this socket.
fn frame_payload(body: &[u8]) -> Result<&[u8], FramingError>
{
    let mut start = 0usize;
    while start < body.len() && start < MAX_LEADING_NULS && body[start] == 0u8 { start += 1; }
    if start > 0
    {
        tracing::warn!(skipped = start, "skipped leading null bytes on frame body");
    }

    let payload = &body[start..];
    let Some(first) = payload.iter().find(|b| !b.is_ascii_whitespace())
    else { return Err(FramingError::ConnectionConfusion); };
    if *first != b'{' && *first != b'['
    {
        return Err(FramingError::ConnectionConfusion);
    }

    Ok(payload)
}

//-------------------------------------------------------------------------------------------------------------------

/// Write one length-prefixed frame.
async fn write_frame_bytes<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FramingError>
{
    let len = u32::try_from(body.len()).map_err(|_| FramingError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN { return Err(FramingError::FrameTooLarge(len)); }

    // single buffer so the prefix and body cannot interleave with other writers
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await.map_err(FramingError::Io)?;
    writer.flush().await.map_err(FramingError::Io)?;
    Ok(())
}

//-------------------------------------------------------------------------------------------------------------------

/// Read one control message. Bounded by [`READ_DEADLINE`]; the deadline covers only this frame.
///
/// Returns the message and the number of bytes consumed (prefix included) for the caller's counters.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(ControlMessage, usize), FramingError>
{
    let body = tokio::time::timeout(READ_DEADLINE, read_frame_bytes(reader))
        .await
        .map_err(|_| FramingError::Timeout)??;
    let payload = frame_payload(&body)?;
    let message = serde_json::from_slice::<ControlMessage>(payload).map_err(FramingError::Malformed)?;
    Ok((message, 4 + body.len()))
}

//-------------------------------------------------------------------------------------------------------------------

/// Write one control message. Bounded by [`WRITE_DEADLINE`].
///
/// Returns the number of bytes written (prefix included) for the caller's counters.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &ControlMessage)
    -> Result<usize, FramingError>
{
    let body = serde_json::to_vec(message).map_err(FramingError::Malformed)?;
    tokio::time::timeout(WRITE_DEADLINE, write_frame_bytes(writer, &body))
        .await
        .map_err(|_| FramingError::Timeout)??;
    Ok(4 + body.len())
}

//-------------------------------------------------------------------------------------------------------------------

/// Write the first frame of a fresh data connection. Bounded by [`HANDSHAKE_WRITE_DEADLINE`].
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &DataConnectionHandshake)
    -> Result<usize, FramingError>
{
    let body = serde_json::to_vec(handshake).map_err(FramingError::Malformed)?;
    tokio::time::timeout(HANDSHAKE_WRITE_DEADLINE, write_frame_bytes(writer, &body))
        .await
        .map_err(|_| FramingError::Timeout)??;
    Ok(4 + body.len())
}

//-------------------------------------------------------------------------------------------------------------------

/// Read the first frame of an inbound data connection (server side of the handshake).
///
/// Bounded by [`HANDSHAKE_READ_DEADLINE`], which is deliberately looser than [`READ_DEADLINE`]: the client may
/// dial early and attach traffic late.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R)
    -> Result<(DataConnectionHandshake, usize), FramingError>
{
    let body = tokio::time::timeout(HANDSHAKE_READ_DEADLINE, read_frame_bytes(reader))
        .await
        .map_err(|_| FramingError::Timeout)??;
    let payload = frame_payload(&body)?;
    let handshake = serde_json::from_slice::<DataConnectionHandshake>(payload).map_err(FramingError::Malformed)?;
    Ok((handshake, 4 + body.len()))
}

//-------------------------------------------------------------------------------------------------------------------
