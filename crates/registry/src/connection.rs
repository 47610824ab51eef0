//! A single live WebSocket connection (§4.3).

use crate::outbound_queue::OutboundQueue;
use racetype_common::Identity;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Active,
    Closing,
}

/// One authenticated socket. Owns its [`OutboundQueue`]; everything else
/// about the connection (identity, liveness) is read concurrently by the
/// router and the housekeeping sweep.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub remote_addr: Option<SocketAddr>,
    pub created_at_ms: i64,
    last_activity_ms: AtomicI64,
    closing: AtomicBool,
    pub outbound: Arc<OutboundQueue>,
}

impl Connection {
    pub fn new(
        identity: Identity,
        remote_addr: Option<SocketAddr>,
        outbound: Arc<OutboundQueue>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            remote_addr,
            created_at_ms: now_ms,
            last_activity_ms: AtomicI64::new(now_ms),
            closing: AtomicBool::new(false),
            outbound,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.closing.load(Ordering::Relaxed) {
            ConnectionStatus::Closing
        } else {
            ConnectionStatus::Active
        }
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.last_activity_ms()).max(0)
    }
}
