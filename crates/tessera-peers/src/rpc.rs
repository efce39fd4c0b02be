//! RPC/Event bridge.
//!
//! Server side, [`Endpoints`] maps procedure and event names onto local
//! handlers. Client side, upgrading a socket attaches a [`PeerRpc`] that can
//! `call` any procedure and `emit` any event named in that same table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use tessera_core::wire::Frame;

use crate::socket::{Link, Socket, SocketId};
use crate::transport::TransportError;

pub type ProcedureFuture = BoxFuture<'static, Result<Value, String>>;

type Procedure = Arc<dyn Fn(Value) -> ProcedureFuture + Send + Sync>;
type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown procedure {0:?}")]
    UnknownProcedure(String),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("procedure {procedure:?} timed out after {after:?}")]
    Timeout { procedure: String, after: Duration },
    #[error("socket closed before a reply arrived")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ── Endpoints ────────────────────────────────────────────────────────────────

/// Locally implemented procedures and events.
#[derive(Clone, Default)]
pub struct Endpoints {
    rpc: HashMap<String, Procedure>,
    event: HashMap<String, EventHandler>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_rpc<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.rpc
            .insert(name.into(), Arc::new(move |data: Value| handler(data).boxed()));
    }

    pub fn register_event<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.event.insert(name.into(), Arc::new(handler));
    }

    pub fn has_rpc(&self, name: &str) -> bool {
        self.rpc.contains_key(name)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.event.contains_key(name)
    }

    /// Sorted procedure names.
    pub fn rpc_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rpc.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Sorted event names.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.event.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Start a local procedure. `None` if no such procedure is registered.
    pub fn invoke(&self, name: &str, data: Value) -> Option<ProcedureFuture> {
        self.rpc.get(name).map(|handler| handler(data))
    }

    /// Deliver an event locally. Returns `false` for unknown events.
    pub fn publish(&self, name: &str, data: Value) -> bool {
        match self.event.get(name) {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("rpc", &self.rpc_names())
            .field("event", &self.event_names())
            .finish()
    }
}

/// Handle an RPC frame received on `socket`.
///
/// Calls are answered asynchronously; replies complete pending calls;
/// events go straight to their handler. Must run inside a tokio runtime.
pub fn serve_frame(socket: &Socket, endpoints: &Arc<Endpoints>, frame: Frame) {
    match frame {
        Frame::Call {
            id,
            procedure,
            data,
        } => {
            tracing::trace!(socket_id = %socket.id(), procedure, "inbound call");
            let reply_to = socket.clone();
            match endpoints.invoke(&procedure, data) {
                Some(fut) => {
                    tokio::spawn(async move {
                        let result = fut.await;
                        if let Err(e) = reply_to.send(Frame::Reply { id, result }) {
                            tracing::debug!(error = %e, procedure, "failed to send reply");
                        }
                    });
                }
                None => {
                    let result = Err(format!("unknown procedure {procedure:?}"));
                    if let Err(e) = reply_to.send(Frame::Reply { id, result }) {
                        tracing::debug!(error = %e, "failed to send reply");
                    }
                }
            }
        }
        Frame::Reply { id, result } => socket.resolve_reply(id, result),
        Frame::Event { event, data } => {
            tracing::trace!(socket_id = %socket.id(), event, "inbound event");
            if !endpoints.publish(&event, data) {
                tracing::debug!(event, "no handler for event");
            }
        }
        other => {
            tracing::debug!(socket_id = %socket.id(), frame = ?other, "unexpected frame after handshake");
        }
    }
}

// ── Pending calls ────────────────────────────────────────────────────────────

/// Outstanding calls on one socket, keyed by call id.
#[derive(Clone, Default)]
pub struct PendingCalls {
    waiting: Arc<DashMap<u64, oneshot::Sender<Result<Value, String>>>>,
    closed: Arc<AtomicBool>,
}

impl PendingCalls {
    /// `None` once the socket has closed.
    fn register(&self, id: u64) -> Option<oneshot::Receiver<Result<Value, String>>> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        // Checked after inserting: a concurrent `fail_all` either sees the
        // waiter or has already set the flag.
        if self.closed.load(Ordering::SeqCst) {
            self.waiting.remove(&id);
            return None;
        }
        Some(rx)
    }

    fn forget(&self, id: u64) {
        self.waiting.remove(&id);
    }

    pub(crate) fn resolve(&self, id: u64, result: Result<Value, String>) {
        match self.waiting.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => tracing::trace!(id, "reply for unknown or expired call"),
        }
    }

    /// Drop every waiter; their calls fail with [`RpcError::Closed`].
    pub(crate) fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.waiting.clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

// ── Client side ──────────────────────────────────────────────────────────────

/// Call/publish capability attached to an upgraded socket.
#[derive(Clone)]
pub struct PeerRpc {
    socket_id: SocketId,
    link: Arc<dyn Link>,
    pending: PendingCalls,
    endpoints: Arc<Endpoints>,
    ack_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl PeerRpc {
    pub(crate) fn new(socket: &Socket, endpoints: Arc<Endpoints>, ack_timeout: Duration) -> Self {
        Self {
            socket_id: socket.id(),
            link: socket.link().clone(),
            pending: socket.pending().clone(),
            endpoints,
            ack_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Procedures callable on this peer.
    pub fn procedures(&self) -> Vec<&str> {
        self.endpoints.rpc_names()
    }

    /// Invoke a procedure on the peer and wait for its reply.
    pub async fn call(&self, procedure: &str, data: Value) -> Result<Value, RpcError> {
        if !self.endpoints.has_rpc(procedure) {
            return Err(RpcError::UnknownProcedure(procedure.to_string()));
        }
        tracing::trace!(socket_id = %self.socket_id, procedure, "outbound call");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Some(reply) = self.pending.register(id) else {
            return Err(RpcError::Closed);
        };
        let frame = Frame::Call {
            id,
            procedure: procedure.to_string(),
            data,
        };
        if let Err(e) = self.link.send(frame) {
            self.pending.forget(id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.ack_timeout, reply).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(remote))) => Err(RpcError::Remote(remote)),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.forget(id);
                Err(RpcError::Timeout {
                    procedure: procedure.to_string(),
                    after: self.ack_timeout,
                })
            }
        }
    }

    /// Publish an event to the peer without waiting for anything.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), RpcError> {
        if !self.endpoints.has_event(event) {
            return Err(RpcError::UnknownEvent(event.to_string()));
        }
        tracing::trace!(socket_id = %self.socket_id, event, "outbound event");
        self.link.send(Frame::Event {
            event: event.to_string(),
            data,
        })?;
        Ok(())
    }
}

impl fmt::Debug for PeerRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRpc")
            .field("socket_id", &self.socket_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}
