//! Transport factory seam.

use std::time::Duration;

use thiserror::Error;

use tessera_core::headers::HandshakeError;
use tessera_core::wire::{WireError, CLOSE_HANDSHAKE_FAILED, CLOSE_SOCKET_ERROR};
use tessera_core::{Nonce, SystemHeaders};

use crate::socket::Socket;

/// Parameters for an outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub hostname: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Heartbeats are not used between nodes.
    pub ping_timeout_disabled: bool,
    pub multiplex: bool,
    /// Our identity headers, sent as connection metadata.
    pub query: SystemHeaders,
    /// Nonce the remote end must present in its handshake ack.
    pub expected_nonce: Nonce,
}

/// Opens outbound sockets.
///
/// `connect` returns immediately with a socket in the `Connecting` state;
/// progress and failure are reported through the socket's events.
pub trait Transport: Send + Sync {
    fn connect(&self, options: ConnectOptions) -> Socket;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is closed")]
    Closed,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("peer rejected connection ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Close code reported when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            TransportError::Handshake(_)
            | TransportError::Rejected { .. }
            | TransportError::HandshakeTimeout => CLOSE_HANDSHAKE_FAILED,
            _ => CLOSE_SOCKET_ERROR,
        }
    }

    pub fn is_handshake_failure(&self) -> bool {
        self.close_code() == CLOSE_HANDSHAKE_FAILED
    }
}
