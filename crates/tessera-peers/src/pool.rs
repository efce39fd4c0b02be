//! Peer connection pool: the nonce → peer registry.
//!
//! Owns the only mutable map of peers. Every mutation (`add_peer`,
//! `remove_peer`, close-driven cleanup) goes through `&mut self`, so the
//! owner serializes them; see [`crate::service`] for the task that does.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use tessera_core::digest::{Blake3Digest, NonceDigest};
use tessera_core::wire::{CLOSE_NORMAL, REASON_DEPRECATED, REASON_REMOVED, REASON_SHUTDOWN};
use tessera_core::{Nonce, SystemHeaders};

use crate::arbitration::{self, ArbitrationError, Contest, Decision, Side, SocketSnapshot};
use crate::lifecycle::Lifecycle;
use crate::peer::{PeerRecord, PeerSummary};
use crate::socket::{PoolEvent, SocketEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),
    #[error("peer {0} is not in the pool")]
    UnknownPeer(Nonce),
}

pub struct PeerConnectionPool {
    headers: SystemHeaders,
    peers: HashMap<Nonce, PeerRecord>,
    lifecycle: Lifecycle,
    digest: Arc<dyn NonceDigest>,
}

impl PeerConnectionPool {
    pub fn new(headers: SystemHeaders, lifecycle: Lifecycle) -> Self {
        Self::with_digest(headers, lifecycle, Arc::new(Blake3Digest))
    }

    pub fn with_digest(
        headers: SystemHeaders,
        lifecycle: Lifecycle,
        digest: Arc<dyn NonceDigest>,
    ) -> Self {
        Self {
            headers,
            peers: HashMap::new(),
            lifecycle,
            digest,
        }
    }

    /// Our own nonce.
    pub fn nonce(&self) -> &Nonce {
        &self.headers.nonce
    }

    /// Arbitrate `candidate` against any existing entry and adopt the winner.
    ///
    /// Returns `false` (and logs) if the candidate was rejected.
    pub fn add_peer(&mut self, candidate: PeerRecord) -> bool {
        let nonce = candidate.nonce().clone();
        match self.try_add_peer(candidate) {
            Ok(()) => true,
            Err(PoolError::Arbitration(ArbitrationError::SelfConnection(_))) => {
                tracing::error!("node tried to connect to itself as a peer");
                false
            }
            Err(e) => {
                tracing::error!(%nonce, error = %e, "failed to connect to peer");
                false
            }
        }
    }

    pub fn try_add_peer(&mut self, candidate: PeerRecord) -> Result<(), PoolError> {
        let nonce = candidate.nonce().clone();
        let contest = Contest {
            own: &self.headers.nonce,
            peer: &nonce,
            existing: self
                .peers
                .get(&nonce)
                .and_then(PeerRecord::socket)
                .map(SocketSnapshot::of),
            candidate: candidate.socket().map(SocketSnapshot::of),
        };
        let decision = arbitration::arbitrate(&contest, self.digest.as_ref())?;
        tracing::debug!(%nonce, ?decision, "arbitrated peer connection");

        // Nothing below can fail, so the entry is swapped out in one step.
        let existing = self.peers.remove(&nonce);
        let socket_of = |side: Side| match side {
            Side::Existing => existing.as_ref().and_then(PeerRecord::socket),
            Side::Candidate => candidate.socket(),
        };

        let winner = match decision {
            Decision::Keep { keep, discard } => {
                if let Some(socket) = discard.and_then(socket_of) {
                    self.lifecycle
                        .teardown(socket, CLOSE_NORMAL, REASON_DEPRECATED);
                }
                match (keep, existing) {
                    (Side::Existing, Some(record)) => record,
                    _ => candidate,
                }
            }
            Decision::Dial { discard } => {
                for socket in discard.into_iter().filter_map(socket_of) {
                    self.lifecycle
                        .teardown(socket, CLOSE_NORMAL, REASON_DEPRECATED);
                }
                let socket = self.lifecycle.connect(&candidate);
                candidate.with_socket(socket)
            }
        };

        if let Some(socket) = winner.socket() {
            self.lifecycle.adopt(socket, &nonce);
        }
        self.peers.insert(nonce, winner);
        Ok(())
    }

    /// Tear down the peer's socket and forget the peer.
    pub fn remove_peer(&mut self, nonce: &Nonce) -> bool {
        match self.try_remove_peer(nonce) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%nonce, error = %e, "failed to remove peer from pool");
                false
            }
        }
    }

    pub fn try_remove_peer(&mut self, nonce: &Nonce) -> Result<(), PoolError> {
        let record = self
            .peers
            .remove(nonce)
            .ok_or_else(|| PoolError::UnknownPeer(nonce.clone()))?;
        if let Some(socket) = record.socket() {
            self.lifecycle.teardown(socket, CLOSE_NORMAL, REASON_REMOVED);
        }
        tracing::debug!(%nonce, "peer removed from pool");
        Ok(())
    }

    /// Apply a socket event. Close events for sockets that are no longer
    /// the peer's live socket leave the registry alone.
    pub fn handle_event(&mut self, event: PoolEvent) {
        self.lifecycle.observe(&event);
        if !matches!(event.event, SocketEvent::Closed { .. }) {
            return;
        }

        let live = self
            .peers
            .get(&event.nonce)
            .and_then(PeerRecord::socket_id);
        if live != Some(event.socket.id()) {
            tracing::trace!(
                nonce = %event.nonce,
                socket_id = %event.socket.id(),
                "close of superseded socket ignored"
            );
            return;
        }

        self.peers.remove(&event.nonce);
        tracing::debug!(nonce = %event.nonce, "peer socket closed, entry deleted");
    }

    /// Tear down every socket and empty the registry.
    pub fn shutdown(&mut self) {
        for (_, record) in self.peers.drain() {
            if let Some(socket) = record.socket() {
                self.lifecycle
                    .teardown(socket, CLOSE_NORMAL, REASON_SHUTDOWN);
            }
        }
    }

    pub fn get(&self, nonce: &Nonce) -> Option<&PeerRecord> {
        self.peers.get(nonce)
    }

    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.peers.contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn nonces(&self) -> Vec<Nonce> {
        self.peers.keys().cloned().collect()
    }

    /// Summaries of every entry, sorted by nonce.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.peers.values().map(PeerRecord::summary).collect();
        out.sort_by(|a, b| a.nonce.cmp(&b.nonce));
        out
    }
}
