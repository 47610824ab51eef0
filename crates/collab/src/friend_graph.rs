//! `FriendGraph`: read-only social-graph lookup behind `friends:update_status`
//! fan-out (§6, §10.6).

use crate::error::CollabError;
use async_trait::async_trait;
use racetype_common::identity::IdentityId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[async_trait]
pub trait FriendGraph: Send + Sync {
    /// The identity's friend set. The core never writes through this
    /// trait and may hold a snapshot across a single status fan-out.
    async fn friends_of(&self, identity: IdentityId) -> Result<HashSet<IdentityId>, CollabError>;
}

/// A symmetric in-memory graph for the default binary and integration
/// tests.
pub struct StaticFriendGraph {
    edges: Mutex<HashMap<IdentityId, HashSet<IdentityId>>>,
}

impl StaticFriendGraph {
    pub fn new() -> Self {
        Self { edges: Mutex::new(HashMap::new()) }
    }

    pub fn befriend(&self, a: IdentityId, b: IdentityId) {
        #[allow(clippy::unwrap_used)]
        let mut edges = self.edges.lock().unwrap();
        edges.entry(a).or_default().insert(b);
        edges.entry(b).or_default().insert(a);
    }
}

impl Default for StaticFriendGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FriendGraph for StaticFriendGraph {
    async fn friends_of(&self, identity: IdentityId) -> Result<HashSet<IdentityId>, CollabError> {
        #[allow(clippy::unwrap_used)]
        Ok(self.edges.lock().unwrap().get(&identity).cloned().unwrap_or_default())
    }
}
