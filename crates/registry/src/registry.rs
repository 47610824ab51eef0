//! The Connection Registry (§4.3): process-wide tracking of live sockets,
//! indexed both by connection and by identity.

use crate::connection::{Connection, ConnectionId};
use papaya::HashMap as ConcurrentMap;
use racetype_common::IdentityId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct ConnectionRegistry {
    connections: ConcurrentMap<ConnectionId, Arc<Connection>>,
    by_identity: ConcurrentMap<IdentityId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: ConcurrentMap::new(),
            by_identity: ConcurrentMap::new(),
        }
    }

    /// Register a newly-authenticated connection. Returns the number of
    /// connections now open for this identity, so the caller can enforce
    /// `max_connections_per_identity` (§4.3).
    pub fn register(&self, conn: Arc<Connection>) -> usize {
        let guard = self.connections.guard();
        let id = conn.id;
        let identity = conn.identity.id;
        self.connections.insert(id, conn, &guard);

        let identity_guard = self.by_identity.guard();
        let sockets = self.by_identity.get_or_insert_with(identity, HashSet::new, &identity_guard);
        // papaya hands back a shared reference; the set itself needs its own
        // mutation path, so update-in-place via a fresh insert.
        let mut updated = sockets.clone();
        updated.insert(id);
        let count = updated.len();
        self.by_identity.insert(identity, updated, &identity_guard);
        debug!(%identity, connections = count, "connection registered");
        count
    }

    pub fn unregister(&self, id: ConnectionId) {
        let guard = self.connections.guard();
        let Some(conn) = self.connections.get(&id, &guard) else {
            return;
        };
        let identity = conn.identity.id;
        self.connections.remove(&id, &guard);

        let identity_guard = self.by_identity.guard();
        if let Some(sockets) = self.by_identity.get(&identity, &identity_guard) {
            let mut updated = sockets.clone();
            updated.remove(&id);
            if updated.is_empty() {
                self.by_identity.remove(&identity, &identity_guard);
            } else {
                self.by_identity.insert(identity, updated, &identity_guard);
            }
        }
        debug!(%identity, connection = %id.0, "connection unregistered");
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let guard = self.connections.guard();
        self.connections.get(&id, &guard).cloned()
    }

    /// All live sockets for an identity (§10.6 friend presence, §4.3 quota).
    pub fn sockets_of(&self, identity: IdentityId) -> Vec<Arc<Connection>> {
        let identity_guard = self.by_identity.guard();
        let Some(ids) = self.by_identity.get(&identity, &identity_guard) else {
            return Vec::new();
        };
        let guard = self.connections.guard();
        ids.iter().filter_map(|id| self.connections.get(id, &guard).cloned()).collect()
    }

    pub fn connection_count_for(&self, identity: IdentityId) -> usize {
        let identity_guard = self.by_identity.guard();
        self.by_identity.get(&identity, &identity_guard).map(HashSet::len).unwrap_or(0)
    }

    pub fn is_online(&self, identity: IdentityId) -> bool {
        self.connection_count_for(identity) > 0
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All connections idle longer than `idle_ms`, for the liveness sweep
    /// (§4.8 "drop connections idle beyond the ping/pong timeout").
    pub fn idle_connections(&self, now_ms: i64, idle_ms: i64) -> Vec<Arc<Connection>> {
        let guard = self.connections.guard();
        self.connections
            .iter(&guard)
            .filter(|(_, conn)| conn.idle_ms(now_ms) >= idle_ms)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
