//! Socket handle: one physical connection to a peer.
//!
//! A [`Socket`] is a cheap cloneable handle over shared state. Transports
//! drive it by calling [`Socket::notify`] with typed [`SocketEvent`]s; once
//! the pool attaches a listener those events are forwarded, tagged with the
//! peer nonce, to the pool's single mutation path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use tessera_core::wire::{Frame, CLOSE_ABNORMAL};
use tessera_core::Nonce;

use crate::rpc::{PeerRpc, PendingCalls};
use crate::transport::TransportError;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who initiated the connection. Fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// A remote peer dialed us.
    Inbound,
    /// We dialed the remote peer.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl OpenState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OpenState::Connecting,
            1 => OpenState::Open,
            _ => OpenState::Closed,
        }
    }
}

/// Lifecycle events produced by a transport for one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Outbound connect and handshake completed.
    Connected,
    /// The remote end closed, or rejected the handshake, with a code.
    Disconnected { code: u16, reason: String },
    /// A frame arrived. Observability only.
    Message { kind: &'static str },
    /// Transport-level failure.
    Errored(String),
    /// The socket is gone. Always the last event.
    Closed { code: u16, reason: String },
}

/// A socket event tagged with the peer it was attached for.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub nonce: Nonce,
    pub socket: Socket,
    pub event: SocketEvent,
}

pub type EventSink = mpsc::UnboundedSender<PoolEvent>;

/// Transport-specific half of a socket.
pub trait Link: Send + Sync {
    /// Queue a frame for delivery.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Graceful close: send a close frame with `code`/`reason`, then hang up.
    fn disconnect(&self, code: u16, reason: &str);

    /// Hard close. Returns `false` if this link has no hard-destroy path.
    fn destroy(&self, code: u16, reason: &str) -> bool {
        let _ = (code, reason);
        false
    }
}

struct Listener {
    nonce: Nonce,
    sink: EventSink,
}

struct Inner {
    id: SocketId,
    direction: Direction,
    state: AtomicU8,
    failed: AtomicBool,
    torn_down: AtomicBool,
    link: Arc<dyn Link>,
    pending: PendingCalls,
    rpc: OnceLock<PeerRpc>,
    listener: Mutex<Option<Listener>>,
}

#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl Socket {
    pub fn new(direction: Direction, state: OpenState, link: Arc<dyn Link>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: SocketId::next(),
                direction,
                state: AtomicU8::new(state as u8),
                failed: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                link,
                pending: PendingCalls::default(),
                rpc: OnceLock::new(),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> OpenState {
        OpenState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True once the transport reported an error or the socket closed.
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// The call/publish capability, present once upgraded.
    pub fn rpc(&self) -> Option<&PeerRpc> {
        self.inner.rpc.get()
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner.rpc.get().is_some()
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.state() == OpenState::Closed {
            return Err(TransportError::Closed);
        }
        self.inner.link.send(frame)
    }

    /// Complete an outstanding call with the peer's reply.
    pub fn resolve_reply(&self, id: u64, result: Result<Value, String>) {
        self.inner.pending.resolve(id, result);
    }

    /// Route this socket's events to `sink`, tagged with `nonce`.
    ///
    /// Replaces any previous listener. A socket that already closed
    /// delivers a synthetic `Closed` so the new owner can clean up.
    pub fn attach(&self, nonce: Nonce, sink: EventSink) {
        let Ok(mut listener) = self.inner.listener.lock() else {
            return;
        };
        // State is checked under the listener lock so a concurrent close
        // is seen either here or by `notify`.
        if self.state() == OpenState::Closed {
            let _ = sink.send(PoolEvent {
                nonce: nonce.clone(),
                socket: self.clone(),
                event: SocketEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "closed before listeners were attached".to_string(),
                },
            });
        }
        *listener = Some(Listener { nonce, sink });
    }

    /// Record a transport event and forward it to the attached listener.
    pub fn notify(&self, event: SocketEvent) {
        match &event {
            SocketEvent::Connected => {
                let _ = self.inner.state.compare_exchange(
                    OpenState::Connecting as u8,
                    OpenState::Open as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            SocketEvent::Errored(_) => {
                self.inner.failed.store(true, Ordering::Release);
            }
            SocketEvent::Closed { .. } => {
                let previous = self
                    .inner
                    .state
                    .swap(OpenState::Closed as u8, Ordering::AcqRel);
                if previous == OpenState::Closed as u8 {
                    return;
                }
                self.inner.failed.store(true, Ordering::Release);
                self.inner.pending.fail_all();
            }
            SocketEvent::Disconnected { .. } | SocketEvent::Message { .. } => {}
        }

        let target = self
            .inner
            .listener
            .lock()
            .ok()
            .and_then(|l| l.as_ref().map(|l| (l.nonce.clone(), l.sink.clone())));
        if let Some((nonce, sink)) = target {
            let _ = sink.send(PoolEvent {
                nonce,
                socket: self.clone(),
                event,
            });
        }
    }

    pub(crate) fn link(&self) -> &Arc<dyn Link> {
        &self.inner.link
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    pub(crate) fn install_rpc(&self, rpc: PeerRpc) -> bool {
        self.inner.rpc.set(rpc).is_ok()
    }

    /// Flip the torn-down flag. Returns `true` only for the first caller.
    pub(crate) fn mark_torn_down(&self) -> bool {
        !self.inner.torn_down.swap(true, Ordering::AcqRel)
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Socket {}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("direction", &self.direction())
            .field("state", &self.state())
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}
