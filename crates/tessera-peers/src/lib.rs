//! tessera-peers: the peer connection pool.
//!
//! Keeps at most one live socket per remote node, deciding between
//! inbound and outbound connections with a nonce-derived priority that
//! both ends compute identically.

pub mod arbitration;
pub mod lifecycle;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod service;
pub mod socket;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod testing;

pub use peer::{PeerRecord, PeerSummary};
pub use pool::{PeerConnectionPool, PoolError};
pub use rpc::{Endpoints, PeerRpc, RpcError};
pub use service::{PoolHandle, PoolHandleError, PoolService};
pub use socket::{Direction, OpenState, Socket, SocketEvent, SocketId};
pub use tcp::TcpTransport;
pub use transport::{ConnectOptions, Transport, TransportError};
