//! The Session Router (§4.1): the single point every inbound event and
//! every connection lifecycle transition passes through. Ties the
//! Authentication Gate, Rate Governor, Connection Registry, Room Fabric,
//! and the two session engines together; owns nothing about the wire
//! transport itself (see `ws` for that).

use crate::auth::AuthGate;
use papaya::HashMap as ConcurrentMap;
use racetype_collab::{FriendGraph, TokenVerifier};
use racetype_common::error::{CoreError, ErrorKind};
use racetype_common::event::{FriendPresencePayload, InboundEvent, OutboundEvent, OutboundMessage, PresenceStatus, RateClass};
use racetype_common::identity::{Identity, IdentityId};
use racetype_common::room::RoomName;
use racetype_common::RuntimeConfig;
use racetype_governor::RateGovernor;
use racetype_race_engine::RaceEngine;
use racetype_registry::{Connection, ConnectionId, ConnectionRegistry, OutboundQueue, RoomFabric};
use racetype_test_engine::TestEngine;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// §4.2's "connection" class is budgeted per remote address, but the
/// Rate Governor's bucket key is `(identity, class)`. Before a socket is
/// authenticated there is no identity yet, so the handshake borrows the
/// same bucket space under a deterministic pseudo-identity derived from
/// the address: stable across retries from the same peer, independent
/// of any real identity's buckets.
fn handshake_bucket_identity(addr: SocketAddr) -> IdentityId {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    addr.ip().hash(&mut hasher);
    let hashed = hasher.finish() as u128;
    IdentityId(Uuid::from_u128(hashed))
}

pub struct SessionRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomFabric>,
    governor: Arc<RateGovernor>,
    test_engine: Arc<TestEngine>,
    race_engine: Arc<RaceEngine>,
    friend_graph: Arc<dyn FriendGraph>,
    auth: AuthGate,
    config: RuntimeConfig,
    // A connection subscribes to at most one test and one race room at a
    // time; tracked here (rather than on `Connection` itself) so the
    // registry crate stays ignorant of engine-specific state.
    active_test: ConcurrentMap<ConnectionId, Uuid>,
    active_race: ConcurrentMap<ConnectionId, String>,
}

impl SessionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomFabric>,
        governor: Arc<RateGovernor>,
        test_engine: Arc<TestEngine>,
        race_engine: Arc<RaceEngine>,
        token_verifier: Arc<dyn TokenVerifier>,
        friend_graph: Arc<dyn FriendGraph>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            rooms,
            governor,
            test_engine,
            race_engine,
            friend_graph,
            auth: AuthGate::new(token_verifier),
            config,
            active_test: ConcurrentMap::new(),
            active_race: ConcurrentMap::new(),
        }
    }

    fn publish(&self, room: &RoomName, msg: OutboundMessage, now_ms: i64) {
        let registry = Arc::clone(&self.registry);
        let lookup = move |id: ConnectionId| registry.get(id).map(|c| Arc::clone(&c.outbound));
        for id in self.rooms.publish(room, msg, &lookup, now_ms) {
            if let Some(conn) = self.registry.get(id) {
                conn.mark_closing();
                warn!(connection = %id.0, "slow consumer promoted to close on user room");
            }
        }
    }

    /// §4.1 handshake: authenticate, enforce the per-identity connection
    /// cap, register, subscribe to the identity's own room, and announce
    /// presence to any online friends.
    #[instrument(skip(self, bearer))]
    pub async fn connect(
        &self,
        bearer: Option<String>,
        remote_addr: Option<SocketAddr>,
        now_ms: i64,
    ) -> Result<Arc<Connection>, CoreError> {
        if let Some(addr) = remote_addr {
            let check = self.governor.check(handshake_bucket_identity(addr), RateClass::Connection);
            if !check.allowed {
                return Err(CoreError::rate_limited(check.retry_after_ms));
            }
        }

        let identity = self.auth.authenticate(bearer).await?;

        if self.registry.connection_count_for(identity.id) >= self.config.max_connections_per_identity as usize {
            return Err(CoreError::new(ErrorKind::TooManyConnections, "too many connections for this identity"));
        }

        let outbound = Arc::new(OutboundQueue::new(self.config.send_queue_max_messages, self.config.send_queue_max_bytes));
        let conn = Arc::new(Connection::new(identity.clone(), remote_addr, outbound, now_ms));
        self.registry.register(Arc::clone(&conn));
        self.rooms.subscribe(RoomName::user(identity.id), conn.id, now_ms);

        self.announce_presence(&identity, true, now_ms).await;

        Ok(conn)
    }

    /// Disconnect cleanup: leave any active test/race (freezing race
    /// progress per §5), unsubscribe from the identity's own room,
    /// unregister, and announce offline if this was the last socket.
    pub async fn disconnect(&self, conn: &Arc<Connection>, now_ms: i64) {
        let guard = self.active_test.guard();
        if let Some(test_id) = self.active_test.get(&conn.id, &guard).copied() {
            let _ = self.test_engine.leave(test_id, conn.identity.id, conn.id);
        }
        self.active_test.remove(&conn.id, &guard);
        drop(guard);

        let guard = self.active_race.guard();
        if let Some(race_id) = self.active_race.get(&conn.id, &guard).cloned() {
            let _ = self.race_engine.leave(&race_id, conn.identity.id, conn.id, now_ms);
        }
        self.active_race.remove(&conn.id, &guard);
        drop(guard);

        self.rooms.unsubscribe(&RoomName::user(conn.identity.id), conn.id);
        self.registry.unregister(conn.id);

        if !self.registry.is_online(conn.identity.id) {
            self.announce_presence(&conn.identity, false, now_ms).await;
        }
    }

    async fn announce_presence(&self, identity: &Identity, online: bool, now_ms: i64) {
        let Ok(friends) = self.friend_graph.friends_of(identity.id).await else {
            return;
        };
        let payload = FriendPresencePayload { identity_id: identity.id.to_string(), display_name: identity.display_name.clone() };
        let event = if online { OutboundEvent::FriendOnline(payload) } else { OutboundEvent::FriendOffline(payload) };
        for friend in friends {
            if self.registry.is_online(friend) {
                self.publish(&RoomName::user(friend), OutboundMessage::at(now_ms, event.clone()), now_ms);
            }
        }
    }

    fn reject(&self, conn: &Connection, err: CoreError, now_ms: i64) {
        warn!(connection = %conn.id.0, kind = err.kind.as_str(), "rejecting inbound event");
        conn.outbound.push(OutboundMessage::error_at(now_ms, err));
    }

    /// Decode, rate-check, authorize, and route one inbound text frame.
    /// Every failure path is local to `conn` (§7): nothing here changes
    /// engine state on a rejected event.
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str, now_ms: i64) {
        conn.touch(now_ms);

        let event: InboundEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                self.reject(conn, CoreError::new(ErrorKind::ValidationError, format!("malformed event: {err}")), now_ms);
                return;
            }
        };

        if matches!(event, InboundEvent::Ping) {
            conn.outbound.push(OutboundMessage::at(now_ms, OutboundEvent::Pong));
            return;
        }

        let check = self.governor.check(conn.identity.id, event.rate_class());
        if !check.allowed {
            self.reject(conn, CoreError::rate_limited(check.retry_after_ms), now_ms);
            return;
        }

        if let Err(err) = self.authorize(conn, &event) {
            self.reject(conn, err, now_ms);
            return;
        }

        if let Err(err) = self.route(conn, event, now_ms).await {
            self.reject(conn, err, now_ms);
        }
    }

    /// Role capability checks that belong to the Router rather than an
    /// engine (§4.8, §10.6): guests may type-test but never race.
    fn authorize(&self, conn: &Connection, event: &InboundEvent) -> Result<(), CoreError> {
        let race_entry = matches!(event, InboundEvent::RaceCreate(_) | InboundEvent::RaceJoin(_));
        if race_entry && !conn.identity.role.can_join_race() {
            return Err(CoreError::new(ErrorKind::AuthForbidden, "guests may not create or join races"));
        }
        Ok(())
    }

    async fn route(&self, conn: &Arc<Connection>, event: InboundEvent, now_ms: i64) -> Result<(), CoreError> {
        match event {
            InboundEvent::TestStart(payload) => {
                let test_id = self.test_engine.start(conn.identity.clone(), conn.id, payload, now_ms).await?;
                self.active_test.pin().insert(conn.id, test_id);
                Ok(())
            }
            InboundEvent::TestKeystroke(payload) => {
                if let Some((test_id, owner)) = self.test_engine.keystroke(conn.identity.id, payload, now_ms)? {
                    self.test_engine.complete(test_id, owner, None, now_ms).await?;
                }
                Ok(())
            }
            InboundEvent::TestCompleted(payload) => {
                let test_id = payload.test_id;
                self.test_engine.complete(test_id, conn.identity.id, Some(payload), now_ms).await
            }
            InboundEvent::TestLeave(payload) => {
                self.test_engine.leave(payload.test_id, conn.identity.id, conn.id)?;
                self.active_test.pin().remove(&conn.id);
                Ok(())
            }
            InboundEvent::RaceCreate(payload) => {
                let race_id = self.race_engine.create(conn.identity.clone(), conn.id, payload, now_ms)?;
                self.active_race.pin().insert(conn.id, race_id);
                Ok(())
            }
            InboundEvent::RaceJoin(payload) => {
                let crossed = self.race_engine.join(&payload.race_id, conn.identity.clone(), conn.id, now_ms)?;
                self.active_race.pin().insert(conn.id, payload.race_id.clone());
                if crossed {
                    let engine = Arc::clone(&self.race_engine);
                    let race_id = payload.race_id;
                    tokio::spawn(async move {
                        engine.run_countdown(race_id, now_ms).await;
                    });
                }
                Ok(())
            }
            InboundEvent::RaceLeave(payload) => {
                self.race_engine.leave(&payload.race_id, conn.identity.id, conn.id, now_ms)?;
                self.active_race.pin().remove(&conn.id);
                Ok(())
            }
            InboundEvent::RaceProgress(payload) => {
                let race_id = payload.race_id.clone();
                let all_finished = self.race_engine.progress(&race_id, conn.identity.id, payload, now_ms)?;
                if all_finished {
                    self.race_engine.complete(&race_id, now_ms).await?;
                }
                Ok(())
            }
            InboundEvent::RaceFinish(payload) => self.race_engine.finish(&payload.race_id, conn.identity.id, payload, now_ms),
            InboundEvent::RaceMessage(payload) => self.race_engine.message(&payload.race_id, &conn.identity, payload, now_ms),
            InboundEvent::FriendsUpdateStatus(payload) => {
                let online = !matches!(payload.status, PresenceStatus::Invisible);
                self.announce_presence(&conn.identity, online, now_ms).await;
                Ok(())
            }
            InboundEvent::Ping => unreachable!("ping is handled before rate-checking or routing"),
        }
    }

    /// §5 Eviction: drive every engine's sweep plus the registry's
    /// liveness scan, from the same housekeeping beat.
    pub fn sweep(&self, now_ms: i64) {
        self.test_engine.sweep(now_ms);
        self.race_engine.sweep(now_ms);
        self.governor.sweep();
        self.rooms.reclaim_empty(now_ms, self.config.room_empty_grace_ms as i64);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetype_collab::{InMemoryResultSink, StaticFriendGraph, StaticTokenVerifier, StaticWordSource};
    use racetype_common::identity::{IdentityId, Role};
    use racetype_race_engine::RaceEngine;
    use racetype_test_engine::TestEngine;

    /// Builds a router over a caller-supplied verifier and config, so
    /// individual tests can seed identities and override caps without
    /// repeating the whole engine wiring each time.
    fn router_with(verifier: StaticTokenVerifier, config: RuntimeConfig) -> Arc<SessionRouter> {
        let rooms = Arc::new(RoomFabric::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let word_source = Arc::new(StaticWordSource::new());
        let result_sink = Arc::new(InMemoryResultSink::new());
        let test_engine = Arc::new(TestEngine::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            Arc::clone(&word_source) as _,
            Arc::clone(&result_sink) as _,
            config.clone(),
        ));
        let race_engine = Arc::new(RaceEngine::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            word_source as _,
            result_sink as _,
            config.clone(),
        ));
        Arc::new(SessionRouter::new(
            registry,
            rooms,
            Arc::new(RateGovernor::new(config.rate_governor.clone())),
            test_engine,
            race_engine,
            Arc::new(verifier) as _,
            Arc::new(StaticFriendGraph::new()),
            config,
        ))
    }

    fn router() -> Arc<SessionRouter> {
        router_with(StaticTokenVerifier::new(), RuntimeConfig::default())
    }

    #[tokio::test]
    async fn unauthenticated_handshake_is_rejected() {
        let router = router();
        let err = router.connect(None, None, 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthRequired);
    }

    #[tokio::test]
    async fn too_many_connections_for_one_identity_is_rejected() {
        let who = Identity { id: IdentityId(Uuid::new_v4()), display_name: "ada".into(), role: Role::Member, avatar: None };
        let verifier = StaticTokenVerifier::new().with_identity("tok", who);
        let mut config = RuntimeConfig::default();
        config.max_connections_per_identity = 1;
        let router = router_with(verifier, config);

        let _first = router.connect(Some("tok".to_string()), None, 0).await.unwrap();
        let err = router.connect(Some("tok".to_string()), None, 1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooManyConnections);
    }

    #[tokio::test]
    async fn handshake_connection_rate_limit_is_keyed_by_remote_address() {
        let who = Identity { id: IdentityId(Uuid::new_v4()), display_name: "ada".into(), role: Role::Member, avatar: None };
        let verifier = StaticTokenVerifier::new().with_identity("tok", who);
        let mut config = RuntimeConfig::default();
        config.rate_governor.connection.capacity = 1;
        config.rate_governor.connection.refill_tokens = 1;
        config.rate_governor.connection.refill_interval_ms = 60_000;
        let router = router_with(verifier, config);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let _first = router.connect(Some("tok".to_string()), Some(addr), 0).await.unwrap();
        let err = router.connect(Some("tok".to_string()), Some(addr), 1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn guest_cannot_create_a_race() {
        let guest = Identity::guest(IdentityId(Uuid::new_v4()), "ghost");
        let verifier = StaticTokenVerifier::new().with_identity("guest-tok", guest);
        let router = router_with(verifier, RuntimeConfig::default());

        let conn = router.connect(Some("guest-tok".to_string()), None, 0).await.unwrap();
        let create = r#"{"type":"race:create","payload":{"name":"sprint","mode":"words","duration":null,"wordCount":20,"maxPlayers":4,"wordListId":null,"isPrivate":false}}"#;
        router.handle_text(&conn, create, 1).await;
        let drained = conn.outbound.drain();
        assert_eq!(drained.len(), 1);
        let OutboundEvent::Error(ref payload) = drained[0].event else { panic!("expected an error event") };
        assert_eq!(payload.code, ErrorKind::AuthForbidden.code());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_and_never_rate_limited() {
        let who = Identity { id: IdentityId(Uuid::new_v4()), display_name: "a".into(), role: Role::Member, avatar: None };
        let verifier = StaticTokenVerifier::new().with_identity("tok", who);
        let router = router_with(verifier, RuntimeConfig::default());

        let conn = router.connect(Some("tok".to_string()), None, 0).await.unwrap();
        router.handle_text(&conn, r#"{"type":"ping"}"#, 1).await;
        let drained = conn.outbound.drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0].event, OutboundEvent::Pong));
    }
}
