//! Inbound peer listener.
//!
//! Accepts TCP connections, runs the acceptor handshake, and offers each
//! validated socket to the pool as a candidate for the dialer's nonce.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use tessera_peers::{PeerRecord, PoolHandle, TcpTransport};

pub struct PeerListener {
    listener: TcpListener,
    transport: Arc<TcpTransport>,
    pool: PoolHandle,
    shutdown: broadcast::Receiver<()>,
}

impl PeerListener {
    pub fn new(
        listener: TcpListener,
        transport: Arc<TcpTransport>,
        pool: PoolHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            transport,
            pool,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("peer listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(peer_addr = %addr, "inbound connection");
                    let transport = self.transport.clone();
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        handle_inbound(stream, transport, pool).await;
                    });
                }
            }
        }
    }
}

async fn handle_inbound(stream: TcpStream, transport: Arc<TcpTransport>, pool: PoolHandle) {
    let ip = match stream.peer_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "inbound connection has no peer address");
            return;
        }
    };

    let (headers, socket) = match transport.accept(stream).await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(%ip, error = %e, "inbound handshake failed");
            return;
        }
    };

    let nonce = headers.nonce.clone();
    let record = PeerRecord::from_headers(ip, headers).with_socket(socket);
    match pool.add_peer(record).await {
        Ok(true) => tracing::info!(%nonce, "inbound peer offered to pool"),
        Ok(false) => tracing::debug!(%nonce, "inbound peer rejected by pool"),
        Err(e) => tracing::warn!(%nonce, error = %e, "pool unavailable for inbound peer"),
    }
}
