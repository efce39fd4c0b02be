//! Connection arbitration.
//!
//! When two nodes dial each other at the same time each ends up with two
//! sockets for the same peer. Both sides must keep the same one without
//! talking about it. Each side hashes the two nonce concatenations; the
//! comparison comes out opposite on the two nodes, so "prefer inbound"
//! on one side and "prefer outbound" on the other pick the same socket.
//!
//! Everything here is pure: decisions depend only on the nonces and a
//! snapshot of each socket taken when the decision is made.

use std::cmp::{Ordering, Reverse};

use thiserror::Error;

use tessera_core::digest::NonceDigest;
use tessera_core::Nonce;

use crate::socket::{Direction, OpenState, Socket, SocketId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbitrationError {
    #[error("candidate nonce {0} is our own nonce")]
    SelfConnection(Nonce),
    #[error("priority digests for peer {0} collide with ours")]
    NonceCollision(Nonce),
}

/// The arbitration-relevant state of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSnapshot {
    pub id: SocketId,
    pub direction: Direction,
    pub state: OpenState,
    pub failed: bool,
}

impl SocketSnapshot {
    pub fn of(socket: &Socket) -> Self {
        Self {
            id: socket.id(),
            direction: socket.direction(),
            state: socket.state(),
            failed: socket.is_failed(),
        }
    }

    /// Outbound sockets are usable until they are known to have failed;
    /// inbound sockets only while open.
    pub fn is_usable(&self) -> bool {
        match self.direction {
            Direction::Outbound => !self.failed && self.state != OpenState::Closed,
            Direction::Inbound => self.state == OpenState::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The record currently in the registry.
    Existing,
    /// The record being added.
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Adopt the record on `keep`. Tear down the socket on `discard`, if any.
    Keep { keep: Side, discard: Option<Side> },
    /// No usable socket: dial the candidate. Sockets on `discard` are torn down.
    Dial { discard: Vec<Side> },
}

/// Inputs to one arbitration.
#[derive(Debug, Clone)]
pub struct Contest<'a> {
    pub own: &'a Nonce,
    pub peer: &'a Nonce,
    /// Socket of the registry entry for `peer`, if there is one.
    pub existing: Option<SocketSnapshot>,
    pub candidate: Option<SocketSnapshot>,
}

/// Which direction this node prefers for connections to `peer`.
///
/// `digest(peer + own) > digest(own + peer)` prefers inbound. The peer
/// evaluates the same pair with the roles swapped and prefers outbound,
/// so both keep the connection the peer initiated.
pub fn preferred_direction(
    own: &Nonce,
    peer: &Nonce,
    digest: &dyn NonceDigest,
) -> Result<Direction, ArbitrationError> {
    if own == peer {
        return Err(ArbitrationError::SelfConnection(peer.clone()));
    }
    let hash_a = digest.digest(&format!("{peer}{own}"));
    let hash_b = digest.digest(&format!("{own}{peer}"));
    match hash_a.cmp(&hash_b) {
        Ordering::Greater => Ok(Direction::Inbound),
        Ordering::Less => Ok(Direction::Outbound),
        Ordering::Equal => Err(ArbitrationError::NonceCollision(peer.clone())),
    }
}

/// Decide which socket represents the peer.
pub fn arbitrate(contest: &Contest<'_>, digest: &dyn NonceDigest) -> Result<Decision, ArbitrationError> {
    let prefer = preferred_direction(contest.own, contest.peer, digest)?;

    let existing = contest.existing;
    let candidate = contest.candidate;

    // Re-adding the socket we already hold: keep it, take the newer record.
    if let (Some(e), Some(c)) = (existing, candidate) {
        if e.id == c.id {
            return Ok(Decision::Keep {
                keep: Side::Candidate,
                discard: None,
            });
        }
    }

    let usable = |s: Option<SocketSnapshot>| s.filter(SocketSnapshot::is_usable);

    let decision = match (usable(existing), usable(candidate)) {
        (None, None) => {
            let mut discard = Vec::new();
            if existing.is_some() {
                discard.push(Side::Existing);
            }
            if candidate.is_some() {
                discard.push(Side::Candidate);
            }
            Decision::Dial { discard }
        }
        (Some(_), None) => Decision::Keep {
            keep: Side::Existing,
            discard: candidate.map(|_| Side::Candidate),
        },
        (None, Some(_)) => Decision::Keep {
            keep: Side::Candidate,
            discard: existing.map(|_| Side::Existing),
        },
        (Some(e), Some(c)) => {
            if priority(&c, prefer) > priority(&e, prefer) {
                Decision::Keep {
                    keep: Side::Candidate,
                    discard: Some(Side::Existing),
                }
            } else {
                Decision::Keep {
                    keep: Side::Existing,
                    discard: Some(Side::Candidate),
                }
            }
        }
    };
    Ok(decision)
}

/// Sort key for usable sockets: preferred direction, then fully open,
/// then lowest id.
fn priority(s: &SocketSnapshot, prefer: Direction) -> (bool, bool, Reverse<SocketId>) {
    (
        s.direction == prefer,
        s.state == OpenState::Open,
        Reverse(s.id),
    )
}
