//! Peer records: what the pool knows about one logical peer.

use serde::Serialize;

use tessera_core::{Nonce, SystemHeaders};

use crate::socket::{Direction, OpenState, Socket, SocketId};

/// A candidate or adopted peer.
///
/// Records are values: changing the socket produces a new record rather
/// than mutating one the registry may still hold.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    nonce: Nonce,
    ip: String,
    port: u16,
    headers: Option<SystemHeaders>,
    socket: Option<Socket>,
}

impl PeerRecord {
    pub fn new(nonce: Nonce, ip: impl Into<String>, port: u16) -> Self {
        Self {
            nonce,
            ip: ip.into(),
            port,
            headers: None,
            socket: None,
        }
    }

    /// Build a record from a peer's handshake headers.
    /// The port is the one the peer advertises for incoming connections.
    pub fn from_headers(ip: impl Into<String>, headers: SystemHeaders) -> Self {
        Self {
            nonce: headers.nonce.clone(),
            ip: ip.into(),
            port: headers.ws_port,
            headers: Some(headers),
            socket: None,
        }
    }

    pub fn with_socket(self, socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            ..self
        }
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn headers(&self) -> Option<&SystemHeaders> {
        self.headers.as_ref()
    }

    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket.as_ref().map(Socket::id)
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            nonce: self.nonce.clone(),
            ip: self.ip.clone(),
            port: self.port,
            socket_id: self.socket_id(),
            direction: self.socket.as_ref().map(Socket::direction),
            state: self.socket.as_ref().map(Socket::state),
        }
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub nonce: Nonce,
    pub ip: String,
    pub port: u16,
    pub socket_id: Option<SocketId>,
    pub direction: Option<Direction>,
    pub state: Option<OpenState>,
}
