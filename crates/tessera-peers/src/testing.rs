//! Test doubles shared by the unit tests in this crate.

use std::sync::{Arc, Mutex};

use tessera_core::digest::NonceDigest;
use tessera_core::wire::Frame;
use tessera_core::Nonce;

use crate::socket::{Direction, Link, OpenState, Socket};
use crate::transport::{ConnectOptions, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    Disconnect { code: u16, reason: String },
    Destroy { code: u16, reason: String },
}

/// Link that records what was asked of it.
#[derive(Default)]
pub(crate) struct MockLink {
    sent: Mutex<Vec<Frame>>,
    calls: Mutex<Vec<LinkCall>>,
    hard_destroy: bool,
}

impl MockLink {
    /// A link exposing a hard-destroy operation.
    pub(crate) fn destroyable() -> Self {
        Self {
            hard_destroy: true,
            ..Self::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Link for MockLink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn disconnect(&self, code: u16, reason: &str) {
        self.calls.lock().unwrap().push(LinkCall::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }

    fn destroy(&self, code: u16, reason: &str) -> bool {
        if !self.hard_destroy {
            return false;
        }
        self.calls.lock().unwrap().push(LinkCall::Destroy {
            code,
            reason: reason.to_string(),
        });
        true
    }
}

/// Transport that hands out connecting sockets over [`MockLink`]s.
#[derive(Default)]
pub(crate) struct MockTransport {
    dialed: Mutex<Vec<(ConnectOptions, Socket, Arc<MockLink>)>>,
}

impl MockTransport {
    pub(crate) fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }

    pub(crate) fn dialed(&self) -> Vec<(ConnectOptions, Socket, Arc<MockLink>)> {
        self.dialed.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn connect(&self, options: ConnectOptions) -> Socket {
        let link = Arc::new(MockLink::destroyable());
        let socket = Socket::new(Direction::Outbound, OpenState::Connecting, link.clone());
        self.dialed
            .lock()
            .unwrap()
            .push((options, socket.clone(), link));
        socket
    }
}

/// Every input hashes to the same value.
pub(crate) struct ConstDigest;

impl NonceDigest for ConstDigest {
    fn digest(&self, _input: &str) -> String {
        "0".repeat(64)
    }
}

/// Forces the priority decision of the node owning `own`.
pub(crate) struct OrderedDigest {
    own: Nonce,
    prefer: Direction,
}

impl OrderedDigest {
    pub(crate) fn preferring(own: &Nonce, prefer: Direction) -> Self {
        Self {
            own: own.clone(),
            prefer,
        }
    }
}

impl NonceDigest for OrderedDigest {
    // `digest(own + peer)` starts with our nonce; inbound preference needs
    // `digest(peer + own)` to compare greater.
    fn digest(&self, input: &str) -> String {
        let ours = input.starts_with(self.own.as_str());
        let high = match self.prefer {
            Direction::Inbound => !ours,
            Direction::Outbound => ours,
        };
        if high { "1" } else { "0" }.to_string()
    }
}
