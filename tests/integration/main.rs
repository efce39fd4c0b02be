//! Tessera integration test harness.
//!
//! Each test starts real nodes in-process, each with its own pool
//! service and TCP listener on a loopback port, and drives them through
//! their `PoolHandle`s.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use tessera_core::config::PoolConfig;
use tessera_core::{Nonce, SystemHeaders};
use tessera_peers::{
    Endpoints, OpenState, PeerRecord, PeerSummary, PoolHandle, PoolService, TcpTransport,
};

mod calls;
mod connections;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any test waits for the pools to settle.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Node {
    pub nonce: Nonce,
    pub port: u16,
    pub pool: PoolHandle,
    /// Payloads of `postBlock` events received from peers.
    pub blocks: Mutex<mpsc::UnboundedReceiver<Value>>,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl Node {
    pub async fn start(nonce: &str) -> Result<Node> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let nonce = Nonce::from(nonce);
        let headers = SystemHeaders::new(nonce.clone(), port);

        let (block_tx, blocks) = mpsc::unbounded_channel();
        let mut endpoints = Endpoints::new();
        let status = json!({ "nonce": nonce.as_str() });
        endpoints.register_rpc("status", move |_| {
            let status = status.clone();
            async move { Ok(status) }
        });
        endpoints.register_rpc("echo", |data| async move { Ok(data) });
        endpoints.register_event("postBlock", move |data| {
            let _ = block_tx.send(data);
        });
        let endpoints = Arc::new(endpoints);

        let transport = Arc::new(TcpTransport::new(
            headers.clone(),
            endpoints.clone(),
            Duration::from_secs(2),
        ));
        let (shutdown, _) = broadcast::channel(1);
        let (service, pool) = PoolService::new(
            headers,
            transport.clone(),
            endpoints,
            PoolConfig::default(),
            shutdown.subscribe(),
        );
        tokio::spawn(service.run());
        let accept_task = tokio::spawn(accept_loop(listener, transport, pool.clone()));

        Ok(Node {
            nonce,
            port,
            pool,
            blocks: Mutex::new(blocks),
            shutdown,
            accept_task,
        })
    }

    /// A record another node can dial this one with.
    pub fn record(&self) -> PeerRecord {
        PeerRecord::new(self.nonce.clone(), "127.0.0.1", self.port)
    }

    /// Wait until our entry for `peer` has an open socket.
    pub async fn wait_for_open(&self, peer: &Nonce) -> Result<PeerSummary> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(summary) = self.pool.peer(peer.clone()).await? {
                if summary.state == Some(OpenState::Open) {
                    return Ok(summary);
                }
            }
            if tokio::time::Instant::now() > deadline {
                bail!("{} never opened a socket to {}", self.nonce, peer);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `peer` is no longer in our registry.
    pub async fn wait_for_absent(&self, peer: &Nonce) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.pool.peer(peer.clone()).await?.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("{} still lists {}", self.nonce, peer);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn next_block(&self) -> Result<Value> {
        let mut blocks = self.blocks.lock().await;
        match tokio::time::timeout(WAIT, blocks.recv()).await {
            Ok(Some(block)) => Ok(block),
            Ok(None) => bail!("block channel closed"),
            Err(_) => bail!("no block received"),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, transport: Arc<TcpTransport>, pool: PoolHandle) {
    while let Ok((stream, addr)) = listener.accept().await {
        let transport = transport.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Ok((headers, socket)) = transport.accept(stream).await {
                let record = PeerRecord::from_headers(addr.ip().to_string(), headers).with_socket(socket);
                let _ = pool.add_peer(record).await;
            }
        });
    }
}

/// Start two connected nodes: `a` dials `b`.
pub async fn connected_pair() -> Result<(Node, Node)> {
    let a = Node::start("node-a").await?;
    let b = Node::start("node-b").await?;
    assert!(a.pool.add_peer(b.record()).await?);
    a.wait_for_open(&b.nonce).await?;
    b.wait_for_open(&a.nonce).await?;
    Ok((a, b))
}
