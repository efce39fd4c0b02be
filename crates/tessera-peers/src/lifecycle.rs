//! Socket lifecycle: the side effects of an arbitration decision.
//!
//! Connects outbound sockets, upgrades sockets to the call/publish
//! capability, attaches listeners, reacts to socket events, and tears
//! sockets down.

use std::sync::Arc;

use tessera_core::config::PoolConfig;
use tessera_core::wire::{CLOSE_HANDSHAKE_FAILED, CLOSE_SOCKET_ERROR, REASON_SOCKET_ERROR};
use tessera_core::{Nonce, SystemHeaders};

use crate::peer::PeerRecord;
use crate::rpc::{Endpoints, PeerRpc};
use crate::socket::{Direction, EventSink, OpenState, PoolEvent, Socket, SocketEvent};
use crate::transport::{ConnectOptions, Transport};

pub struct Lifecycle {
    transport: Arc<dyn Transport>,
    endpoints: Arc<Endpoints>,
    headers: SystemHeaders,
    config: PoolConfig,
    events: EventSink,
}

impl Lifecycle {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Arc<Endpoints>,
        headers: SystemHeaders,
        config: PoolConfig,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            endpoints,
            headers,
            config,
            events,
        }
    }

    /// Open an outbound socket to the peer described by `record`.
    pub fn connect(&self, record: &PeerRecord) -> Socket {
        let options = ConnectOptions {
            hostname: record.ip().to_string(),
            port: record.port(),
            connect_timeout: self.config.connect_timeout(),
            ack_timeout: self.config.ack_timeout(),
            ping_timeout_disabled: true,
            multiplex: true,
            query: self.headers.clone(),
            expected_nonce: record.nonce().clone(),
        };
        tracing::debug!(
            nonce = %record.nonce(),
            host = %options.hostname,
            port = options.port,
            "opening outbound socket"
        );
        self.transport.connect(options)
    }

    /// Attach the call/publish capability. No-op if already attached.
    pub fn upgrade(&self, socket: &Socket) {
        if socket.is_upgraded() {
            return;
        }
        let rpc = PeerRpc::new(socket, self.endpoints.clone(), self.config.ack_timeout());
        if socket.install_rpc(rpc) {
            tracing::trace!(socket_id = %socket.id(), "socket upgraded");
        }
    }

    /// Route the socket's events into the pool for peer `nonce`.
    pub fn attach_listeners(&self, socket: &Socket, nonce: &Nonce) {
        socket.attach(nonce.clone(), self.events.clone());
    }

    /// Upgrade and listen: everything an adopted socket needs.
    pub fn adopt(&self, socket: &Socket, nonce: &Nonce) {
        self.upgrade(socket);
        self.attach_listeners(socket, nonce);
    }

    /// Forcefully close a socket. Safe to call more than once.
    pub fn teardown(&self, socket: &Socket, code: u16, reason: &str) {
        if socket.state() == OpenState::Closed || !socket.mark_torn_down() {
            tracing::trace!(socket_id = %socket.id(), "teardown of closed socket skipped");
            return;
        }
        tracing::debug!(socket_id = %socket.id(), code, reason, "tearing down socket");
        if !socket.link().destroy(code, reason) {
            socket.link().disconnect(code, reason);
        }
    }

    /// Per-direction reaction to a socket event. Inbound sockets only
    /// matter when they close; outbound ones get full diagnostics.
    pub fn observe(&self, event: &PoolEvent) {
        let socket = &event.socket;
        let nonce = &event.nonce;
        match (socket.direction(), &event.event) {
            (_, SocketEvent::Closed { code, reason }) => {
                tracing::debug!(
                    %nonce,
                    socket_id = %socket.id(),
                    direction = %socket.direction(),
                    code,
                    reason,
                    "socket closed"
                );
            }
            (Direction::Inbound, other) => {
                tracing::trace!(%nonce, socket_id = %socket.id(), event = ?other, "inbound socket event");
            }
            (Direction::Outbound, SocketEvent::Connected) => {
                tracing::debug!(%nonce, socket_id = %socket.id(), "outbound socket connected");
            }
            (Direction::Outbound, SocketEvent::Disconnected { code, reason })
                if *code == CLOSE_HANDSHAKE_FAILED =>
            {
                tracing::debug!(%nonce, socket_id = %socket.id(), code, reason, "outbound handshake aborted");
                socket.link().disconnect(*code, reason);
            }
            (Direction::Outbound, SocketEvent::Disconnected { code, reason }) => {
                tracing::debug!(%nonce, socket_id = %socket.id(), code, reason, "outbound socket disconnected");
            }
            (Direction::Outbound, SocketEvent::Errored(error)) => {
                tracing::error!(%nonce, socket_id = %socket.id(), error, "outbound socket error");
                socket.link().disconnect(CLOSE_SOCKET_ERROR, REASON_SOCKET_ERROR);
            }
            (Direction::Outbound, SocketEvent::Message { kind }) => {
                tracing::trace!(%nonce, socket_id = %socket.id(), kind, "outbound socket message");
            }
        }
    }
}
