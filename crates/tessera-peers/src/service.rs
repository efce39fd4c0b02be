//! Pool service: the task that owns the [`PeerConnectionPool`].
//!
//! Commands from [`PoolHandle`]s and socket events share one loop, so
//! registry mutations never interleave.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use tessera_core::config::PoolConfig;
use tessera_core::{Nonce, SystemHeaders};

use crate::lifecycle::Lifecycle;
use crate::peer::{PeerRecord, PeerSummary};
use crate::pool::PeerConnectionPool;
use crate::rpc::{Endpoints, PeerRpc, RpcError};
use crate::socket::{PoolEvent, Socket};
use crate::transport::Transport;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug)]
enum PoolCommand {
    Add {
        record: PeerRecord,
        sender: oneshot::Sender<bool>,
    },
    Remove {
        nonce: Nonce,
        sender: oneshot::Sender<bool>,
    },
    Peer {
        nonce: Nonce,
        sender: oneshot::Sender<Option<PeerSummary>>,
    },
    Peers {
        sender: oneshot::Sender<Vec<PeerSummary>>,
    },
    Socket {
        nonce: Nonce,
        sender: oneshot::Sender<Option<Socket>>,
    },
}

#[derive(Debug, Error)]
pub enum PoolHandleError {
    #[error("pool service has stopped")]
    Stopped,
    #[error("peer {0} has no upgraded socket")]
    NotConnected(Nonce),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Cloneable front door to a running [`PoolService`].
#[derive(Clone)]
pub struct PoolHandle {
    sender: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, PoolHandleError> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(command(sender))
            .await
            .map_err(|_| PoolHandleError::Stopped)?;
        receiver.await.map_err(|_| PoolHandleError::Stopped)
    }

    pub async fn add_peer(&self, record: PeerRecord) -> Result<bool, PoolHandleError> {
        self.request(|sender| PoolCommand::Add { record, sender }).await
    }

    pub async fn remove_peer(&self, nonce: Nonce) -> Result<bool, PoolHandleError> {
        self.request(|sender| PoolCommand::Remove { nonce, sender })
            .await
    }

    pub async fn peer(&self, nonce: Nonce) -> Result<Option<PeerSummary>, PoolHandleError> {
        self.request(|sender| PoolCommand::Peer { nonce, sender }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, PoolHandleError> {
        self.request(|sender| PoolCommand::Peers { sender }).await
    }

    /// Call a procedure on a connected peer.
    ///
    /// The socket is looked up through the service; the call itself runs
    /// on the caller's task.
    pub async fn call(
        &self,
        nonce: Nonce,
        procedure: &str,
        data: Value,
    ) -> Result<Value, PoolHandleError> {
        let rpc = self.rpc_for(nonce).await?;
        Ok(rpc.call(procedure, data).await?)
    }

    /// Publish an event to a connected peer.
    pub async fn emit(&self, nonce: Nonce, event: &str, data: Value) -> Result<(), PoolHandleError> {
        let rpc = self.rpc_for(nonce).await?;
        Ok(rpc.emit(event, data)?)
    }

    async fn rpc_for(&self, nonce: Nonce) -> Result<PeerRpc, PoolHandleError> {
        let socket = self
            .request(|sender| PoolCommand::Socket {
                nonce: nonce.clone(),
                sender,
            })
            .await?;
        socket
            .as_ref()
            .and_then(Socket::rpc)
            .cloned()
            .ok_or(PoolHandleError::NotConnected(nonce))
    }
}

pub struct PoolService {
    pool: PeerConnectionPool,
    commands: mpsc::Receiver<PoolCommand>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl PoolService {
    pub fn new(
        headers: SystemHeaders,
        transport: Arc<dyn Transport>,
        endpoints: Arc<Endpoints>,
        config: PoolConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, PoolHandle) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let lifecycle = Lifecycle::new(transport, endpoints, headers.clone(), config, event_tx);
        let service = Self {
            pool: PeerConnectionPool::new(headers, lifecycle),
            commands,
            events,
            shutdown,
        };
        (service, PoolHandle { sender })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(nonce = %self.pool.nonce(), "peer pool started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(peers = self.pool.len(), "peer pool shutting down");
                    self.pool.shutdown();
                    return Ok(());
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("all pool handles dropped, stopping");
                        self.pool.shutdown();
                        return Ok(());
                    }
                },

                Some(event) = self.events.recv() => self.pool.handle_event(event),
            }
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Add { record, sender } => {
                let _ = sender.send(self.pool.add_peer(record));
            }
            PoolCommand::Remove { nonce, sender } => {
                let _ = sender.send(self.pool.remove_peer(&nonce));
            }
            PoolCommand::Peer { nonce, sender } => {
                let _ = sender.send(self.pool.get(&nonce).map(PeerRecord::summary));
            }
            PoolCommand::Peers { sender } => {
                let _ = sender.send(self.pool.summaries());
            }
            PoolCommand::Socket { nonce, sender } => {
                let socket = self.pool.get(&nonce).and_then(PeerRecord::socket).cloned();
                let _ = sender.send(socket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{Direction, OpenState, SocketEvent};
    use crate::testing::{MockLink, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    fn endpoints() -> Arc<Endpoints> {
        let mut e = Endpoints::new();
        e.register_rpc("status", |_| async { Ok(json!({})) });
        Arc::new(e)
    }

    fn start() -> (
        PoolHandle,
        Arc<MockTransport>,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let transport = Arc::new(MockTransport::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (service, handle) = PoolService::new(
            SystemHeaders::new(Nonce::from("self"), 7001),
            transport.clone(),
            endpoints(),
            PoolConfig::default(),
            shutdown_rx,
        );
        let task = tokio::spawn(service.run());
        (handle, transport, shutdown_tx, task)
    }

    #[tokio::test]
    async fn commands_are_applied_in_order() {
        let (handle, transport, _shutdown, _task) = start();
        let n1 = Nonce::from("n1");

        assert!(handle
            .add_peer(PeerRecord::new(n1.clone(), "127.0.0.1", 7002))
            .await
            .unwrap());
        assert!(!handle
            .add_peer(PeerRecord::new(Nonce::from("self"), "127.0.0.1", 7001))
            .await
            .unwrap());
        assert_eq!(transport.dial_count(), 1);

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].direction, Some(Direction::Outbound));

        assert!(handle.remove_peer(n1.clone()).await.unwrap());
        assert!(!handle.remove_peer(n1.clone()).await.unwrap());
        assert_eq!(handle.peer(n1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn socket_close_reaches_registry() {
        let (handle, _transport, _shutdown, _task) = start();
        let n1 = Nonce::from("n1");
        let socket = Socket::new(
            Direction::Inbound,
            OpenState::Open,
            Arc::new(MockLink::default()),
        );
        let record = PeerRecord::new(n1.clone(), "127.0.0.1", 7002).with_socket(socket.clone());
        assert!(handle.add_peer(record).await.unwrap());

        socket.notify(SocketEvent::Closed {
            code: 1006,
            reason: String::new(),
        });

        for _ in 0..100 {
            if handle.peer(n1.clone()).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("closed peer was never removed");
    }

    #[tokio::test]
    async fn call_to_unknown_peer_is_not_connected() {
        let (handle, _transport, _shutdown, _task) = start();
        let err = handle
            .call(Nonce::from("ghost"), "status", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolHandleError::NotConnected(n) if n == Nonce::from("ghost")));
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_service() {
        let (handle, transport, _shutdown, task) = start();
        assert!(handle
            .add_peer(PeerRecord::new(Nonce::from("n1"), "127.0.0.1", 7002))
            .await
            .unwrap());

        let second = handle.clone();
        drop(handle);
        assert!(second.peers().await.is_ok());
        drop(second);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("service kept running without handles")
            .unwrap()
            .unwrap();
        let (_, _, link) = transport.dialed().remove(0);
        assert_eq!(link.calls().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_service() {
        let (handle, transport, shutdown, task) = start();
        assert!(handle
            .add_peer(PeerRecord::new(Nonce::from("n1"), "127.0.0.1", 7002))
            .await
            .unwrap());

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();

        let (_, _, link) = transport.dialed().remove(0);
        assert_eq!(link.calls().len(), 1);
        assert!(matches!(
            handle.peers().await,
            Err(PoolHandleError::Stopped)
        ));
    }
}
