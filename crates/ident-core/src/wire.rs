//! ident wire format — protocol ids, payloads, and framing.
//!
//! Every payload is a serde_json body preceded by a big-endian u32 length.
//! Readers refuse bodies larger than the configured maximum before
//! allocating for them. Payload fields are all optional on the wire so that
//! peers running older versions can still be understood.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Protocol ids ──────────────────────────────────────────────────────────────

/// The identify exchange: the opener reads one payload from the responder.
pub const ID: &str = "/ident/id/1.0.0";

/// Unsolicited full payload pushed to already-connected peers.
pub const ID_PUSH: &str = "/ident/id/push/1.0.0";

/// Incremental protocol-list change pushed to already-connected peers.
pub const ID_DELTA: &str = "/ident/id/delta/1.0.0";

/// Protocol version announced in every payload.
pub const PROTOCOL_VERSION: &str = "ident/0.1.0";

/// Default upper bound on a framed body.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

// ── Payloads ──────────────────────────────────────────────────────────────────

/// The identify payload.
///
/// Addresses and keys travel as raw bytes. See `PeerAddr::to_bytes` and
/// `PublicKey::to_bytes` for their encodings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyMessage {
    /// Every protocol the sender currently handles.
    pub protocols: Vec<String>,
    /// Addresses the sender listens on.
    pub listen_addrs: Vec<Vec<u8>>,
    /// The address the sender sees the receiver connecting from.
    pub observed_addr: Option<Vec<u8>>,
    /// Absent on unauthenticated transports.
    pub public_key: Option<Vec<u8>>,
    pub protocol_version: Option<String>,
    pub agent_version: Option<String>,
}

/// A change to the sender's protocol list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaMessage {
    pub added_protocols: Vec<String>,
    pub rm_protocols: Vec<String>,
}

impl DeltaMessage {
    pub fn is_empty(&self) -> bool {
        self.added_protocols.is_empty() && self.rm_protocols.is_empty()
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Write one length-prefixed message and flush.
pub async fn write_message<W, T>(writer: &mut W, msg: &T, max_size: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    let len = frame_len(body.len(), max_size)?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Length prefix for a body of `len` bytes. The prefix is a u32 whatever
/// `max_size` says.
fn frame_len(len: usize, max_size: usize) -> Result<u32, WireError> {
    if len > max_size {
        return Err(WireError::TooLarge { len, max: max_size });
    }
    u32::try_from(len).map_err(|_| WireError::TooLarge {
        len,
        max: max_size.min(u32::MAX as usize),
    })
}

/// Read one length-prefixed message.
pub async fn read_message<R, T>(reader: &mut R, max_size: usize) -> Result<T, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > max_size {
        return Err(WireError::TooLarge { len, max: max_size });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("stream I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}
