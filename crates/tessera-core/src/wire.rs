//! Tessera wire format: frames exchanged over a peer socket.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! of JSON. The RPC payloads themselves are opaque `serde_json::Value`s;
//! only the envelope is fixed here.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::headers::SystemHeaders;

// ── Close codes ───────────────────────────────────────────────────────────────

/// Normal closure. Also used when a socket loses arbitration.
pub const CLOSE_NORMAL: u16 = 1000;
/// The remote end went away without sending a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Generic transport error.
pub const CLOSE_SOCKET_ERROR: u16 = 1011;
/// The connection handshake was rejected or timed out.
pub const CLOSE_HANDSHAKE_FAILED: u16 = 4100;

pub const REASON_DEPRECATED: &str = "Deprecated by a better connection";
pub const REASON_REMOVED: &str = "Removed from peer pool";
pub const REASON_SOCKET_ERROR: &str = "Socket error";
pub const REASON_SHUTDOWN: &str = "Node shutting down";

// ── Frames ────────────────────────────────────────────────────────────────────

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame sent by the dialer.
    Handshake { headers: SystemHeaders },
    /// Acceptor's reply to a valid handshake.
    HandshakeAck { headers: SystemHeaders },
    /// Remote procedure invocation.
    Call {
        id: u64,
        procedure: String,
        data: Value,
    },
    /// Response to a `Call` with the same id.
    Reply { id: u64, result: Result<Value, String> },
    /// Fire-and-forget event.
    Event { event: String, data: Value },
    /// Closing handshake.
    Close { code: u16, reason: String },
}

impl Frame {
    /// Frame type name, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::HandshakeAck { .. } => "handshake_ack",
            Frame::Call { .. } => "call",
            Frame::Reply { .. } => "reply",
            Frame::Event { .. } => "event",
            Frame::Close { .. } => "close",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a frame with its length prefix.
pub fn encode(frame: &Frame) -> Result<Bytes, WireError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Validate a length prefix read off the wire.
pub fn body_len(prefix: [u8; LEN_PREFIX]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    Ok(len)
}

/// Decode a frame body (without its length prefix).
pub fn decode(body: &[u8]) -> Result<Frame, WireError> {
    Ok(serde_json::from_slice(body)?)
}
