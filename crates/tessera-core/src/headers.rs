//! Identity headers exchanged during the connection handshake.
//!
//! The dialer sends its headers as connection metadata; the acceptor
//! validates them before the socket is handed to the peer pool.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nonce::Nonce;

/// Protocol version spoken by this build. Peers must share the major part.
pub const PROTOCOL_VERSION: &str = "1.0";

/// This node's identity, as seen by remote peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHeaders {
    pub nonce: Nonce,
    /// Port on which this node accepts peer connections.
    pub ws_port: u16,
    /// Application version.
    pub version: String,
    pub protocol_version: String,
    pub os: String,
    /// Current chain height.
    #[serde(default)]
    pub height: u64,
}

impl SystemHeaders {
    pub fn new(nonce: Nonce, ws_port: u16) -> Self {
        Self {
            nonce,
            ws_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            height: 0,
        }
    }

    /// Check a remote peer's headers against ours.
    pub fn validate_remote(&self, remote: &SystemHeaders) -> Result<(), HandshakeError> {
        if remote.nonce.is_empty() {
            return Err(HandshakeError::MissingNonce);
        }
        if remote.nonce == self.nonce {
            return Err(HandshakeError::SelfConnection);
        }
        let ours = major(&self.protocol_version)?;
        let theirs = major(&remote.protocol_version)?;
        if ours != theirs {
            return Err(HandshakeError::IncompatibleProtocol {
                ours: self.protocol_version.clone(),
                theirs: remote.protocol_version.clone(),
            });
        }
        Ok(())
    }
}

fn major(version: &str) -> Result<u32, HandshakeError> {
    version
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| HandshakeError::InvalidProtocolVersion(version.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("peer did not supply a nonce")]
    MissingNonce,
    #[error("peer nonce matches our own")]
    SelfConnection,
    #[error("peer nonce {actual} does not match expected {expected}")]
    UnexpectedNonce { expected: Nonce, actual: Nonce },
    #[error("invalid protocol version {0:?}")]
    InvalidProtocolVersion(String),
    #[error("incompatible protocol version: ours {ours}, theirs {theirs}")]
    IncompatibleProtocol { ours: String, theirs: String },
}
