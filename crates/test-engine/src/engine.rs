//! The Test Session Engine (§4.5): owns session lifecycle, keystroke
//! ingestion, and completion/result-sink handoff.

use crate::session::{TestLimit, TestSession, TestStatus};
use papaya::HashMap as ConcurrentMap;
use racetype_collab::{ResultSink, SessionResult, TestResult as SinkTestResult, WordRequest, WordSource};
use racetype_common::error::{CoreError, ErrorKind};
use racetype_common::event::{
    MetricSnapshotWire, OutboundEvent, OutboundMessage, TestCompletedPayload, TestJoinedPayload, TestKeystrokePayload,
    TestMode, TestResultPayload, TestStartPayload, TestStatsUpdatePayload,
};
use racetype_common::identity::{Identity, IdentityId};
use racetype_common::room::RoomName;
use racetype_common::{ReferenceText, RuntimeConfig};
use racetype_metrics::keystroke::{KeyEvent, Keystroke};
use racetype_registry::{ConnectionId, ConnectionRegistry, RoomFabric};
use std::sync::{Arc, Mutex};
use tracing::{instrument, warn};
use uuid::Uuid;

type SessionHandle = Arc<Mutex<TestSession>>;

/// §4.5 Completion: "schedule engine eviction after 30 s".
const COMPLETION_EVICTION_GRACE_MS: i64 = 30_000;

pub struct TestEngine {
    sessions: ConcurrentMap<Uuid, SessionHandle>,
    rooms: Arc<RoomFabric>,
    registry: Arc<ConnectionRegistry>,
    word_source: Arc<dyn WordSource>,
    result_sink: Arc<dyn ResultSink>,
    config: RuntimeConfig,
}

/// Rejects any wire `key` whose logical length isn't one: a literal
/// character, or the single deletion gesture represented by an ASCII
/// backspace control character (see `racetype_metrics::keystroke` for the
/// reconciliation between rule 2's length check and the metrics formulas'
/// references to deletions in the log).
fn parse_key(raw: &str) -> Result<KeyEvent, CoreError> {
    let mut chars = raw.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(CoreError::new(ErrorKind::ValidationError, "key must be a single character"));
    };
    Ok(if c == '\u{8}' { KeyEvent::Backspace } else { KeyEvent::Char(c) })
}

impl TestEngine {
    pub fn new(
        rooms: Arc<RoomFabric>,
        registry: Arc<ConnectionRegistry>,
        word_source: Arc<dyn WordSource>,
        result_sink: Arc<dyn ResultSink>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            sessions: ConcurrentMap::new(),
            rooms,
            registry,
            word_source,
            result_sink,
            config,
        }
    }

    fn publish(&self, room: &RoomName, msg: OutboundMessage, now_ms: i64) {
        let registry = Arc::clone(&self.registry);
        let lookup = move |id: ConnectionId| registry.get(id).map(|c| Arc::clone(&c.outbound));
        for id in self.rooms.publish(room, msg, &lookup, now_ms) {
            if let Some(conn) = self.registry.get(id) {
                conn.mark_closing();
                warn!(connection = %id.0, "slow consumer promoted to close on test room");
            }
        }
    }

    #[instrument(skip(self, owner, payload))]
    pub async fn start(
        &self,
        owner: Identity,
        connection_id: ConnectionId,
        payload: TestStartPayload,
        now_ms: i64,
    ) -> Result<Uuid, CoreError> {
        let (limit, count) = match payload.mode {
            TestMode::Time => {
                let duration = payload
                    .duration
                    .filter(|d| *d > 0)
                    .ok_or_else(|| CoreError::new(ErrorKind::ValidationError, "duration is required for mode=time"))?;
                (TestLimit::Duration(duration as u64 * 1000), 500)
            }
            TestMode::Words => {
                let word_count = payload
                    .word_count
                    .filter(|w| *w > 0)
                    .ok_or_else(|| CoreError::new(ErrorKind::ValidationError, "wordCount is required for mode=words"))?;
                (TestLimit::WordCount(word_count), word_count as usize)
            }
        };

        let tokens = self
            .word_source
            .fetch(WordRequest {
                list_id: payload.word_list_id,
                language: payload.language.unwrap_or_else(|| "en".to_string()),
                count,
                mode: payload.mode.into(),
            })
            .await
            .map_err(CoreError::from)?;

        let reference = ReferenceText::new(tokens, " ");
        let id = Uuid::new_v4();
        let session = TestSession::new(id, owner.clone(), payload.mode, limit, reference.clone(), now_ms);

        let guard = self.sessions.guard();
        self.sessions.insert(id, Arc::new(Mutex::new(session)), &guard);
        drop(guard);

        let room = RoomName::test(id);
        self.rooms.subscribe(room.clone(), connection_id, now_ms);
        self.publish(
            &room,
            OutboundMessage::at(now_ms, OutboundEvent::TestJoined(TestJoinedPayload {
                test_id: id,
                mode: payload.mode,
                reference_text: reference.to_wire(),
            })),
            now_ms,
        );

        Ok(id)
    }

    fn get(&self, test_id: Uuid) -> Option<SessionHandle> {
        let guard = self.sessions.guard();
        self.sessions.get(&test_id, &guard).cloned()
    }

    /// Ingest one accepted keystroke (§4.5 rules 1-5). Returns `Some(..)`
    /// with the session's terminal state when this keystroke also
    /// completed the session, so the caller can drive the completion
    /// handoff.
    #[instrument(skip(self, payload))]
    pub fn keystroke(
        &self,
        owner: IdentityId,
        payload: TestKeystrokePayload,
        now_ms: i64,
    ) -> Result<Option<(Uuid, IdentityId)>, CoreError> {
        let session = self
            .get(payload.test_id)
            .ok_or_else(|| CoreError::new(ErrorKind::TestNotFound, "test session not found"))?;

        let key = parse_key(&payload.key)?;

        let (snapshot, room, done) = {
            #[allow(clippy::unwrap_used)]
            let mut session = session.lock().unwrap();
            if session.owner.id != owner {
                return Err(CoreError::new(ErrorKind::AuthForbidden, "not the owner of this test session"));
            }
            match session.status {
                TestStatus::Expired => return Err(CoreError::new(ErrorKind::TestExpired, "test session expired")),
                TestStatus::Completed => return Err(CoreError::new(ErrorKind::TestCompleted, "test already completed")),
                TestStatus::Created => {
                    session.started_at_ms = Some(now_ms);
                    session.status = TestStatus::Running;
                }
                TestStatus::Running => {}
            }

            // Server-truth correctness (§4.5 rule 3): the client's
            // `correct` claim is advisory and is intentionally discarded
            // here rather than reconciled against a tolerance window,
            // since the reference text gives an exact answer.
            let correct = match key {
                KeyEvent::Char(c) => session.reference.char_at(payload.position as usize) == Some(c),
                KeyEvent::Backspace => false,
            };

            session.log.push(Keystroke {
                timestamp_ms: payload.timestamp,
                key,
                correct,
                position: payload.position,
            });
            racetype_metrics::downsample(&mut session.log, self.config.keystroke_log_cap as usize);

            let elapsed = session.elapsed_ms(now_ms);
            let snapshot =
                racetype_metrics::compute(&session.log, elapsed, self.config.max_wpm_plausibility_ceiling);
            let done = session.limit_reached(now_ms, snapshot.position);

            (snapshot, RoomName::test(session.id), done)
        };

        self.publish(
            &room,
            OutboundMessage::at(now_ms, OutboundEvent::TestStatsUpdate(TestStatsUpdatePayload {
                test_id: payload.test_id,
                snapshot: MetricSnapshotWire::from(snapshot),
            })),
            now_ms,
        );

        Ok(done.then_some((payload.test_id, owner)))
    }

    /// Complete a session either because the owner submitted
    /// `test:completed` or because ingestion hit a limit (§4.5
    /// Completion).
    #[instrument(skip(self, _payload))]
    pub async fn complete(
        &self,
        test_id: Uuid,
        owner: IdentityId,
        _payload: Option<TestCompletedPayload>,
        now_ms: i64,
    ) -> Result<(), CoreError> {
        let session = self
            .get(test_id)
            .ok_or_else(|| CoreError::new(ErrorKind::TestNotFound, "test session not found"))?;

        let snapshot = {
            #[allow(clippy::unwrap_used)]
            let mut session = session.lock().unwrap();
            if session.owner.id != owner {
                return Err(CoreError::new(ErrorKind::AuthForbidden, "not the owner of this test session"));
            }
            match session.status {
                TestStatus::Expired => return Err(CoreError::new(ErrorKind::TestExpired, "test session expired")),
                TestStatus::Completed => return Err(CoreError::new(ErrorKind::TestCompleted, "test already completed")),
                _ => {}
            }
            let elapsed = session.elapsed_ms(now_ms);
            let snapshot =
                racetype_metrics::compute(&session.log, elapsed, self.config.max_wpm_plausibility_ceiling);
            session.status = TestStatus::Completed;
            session.completed_at_ms = Some(now_ms);
            snapshot
        };

        let sink_result = racetype_collab::record_with_retry(
            self.result_sink.as_ref(),
            SessionResult::Test(SinkTestResult { test_id, identity: owner, snapshot }),
        )
        .await;
        let unsunk = if let Err(err) = sink_result {
            warn!(%err, %test_id, retries_exhausted = true, "result sink permanently failed at test completion, marking unsunk");
            true
        } else {
            false
        };

        let result_payload = TestResultPayload { test_id, snapshot: MetricSnapshotWire::from(snapshot), unsunk };
        let test_room = RoomName::test(test_id);
        let owner_room = RoomName::user(owner);
        self.publish(&test_room, OutboundMessage::at(now_ms, OutboundEvent::TestResult(result_payload.clone())), now_ms);
        self.publish(&owner_room, OutboundMessage::at(now_ms, OutboundEvent::TestResult(result_payload)), now_ms);

        Ok(())
    }

    pub fn leave(&self, test_id: Uuid, owner: IdentityId, connection_id: ConnectionId) -> Result<(), CoreError> {
        let session = self
            .get(test_id)
            .ok_or_else(|| CoreError::new(ErrorKind::TestNotFound, "test session not found"))?;
        {
            #[allow(clippy::unwrap_used)]
            let session = session.lock().unwrap();
            if session.owner.id != owner {
                return Err(CoreError::new(ErrorKind::AuthForbidden, "not the owner of this test session"));
            }
        }
        self.rooms.unsubscribe(&RoomName::test(test_id), connection_id);
        Ok(())
    }

    /// Housekeeping sweep (§5 "Eviction"): expire stale `created`/`running`
    /// sessions past TTL, and drop `completed`/`expired` sessions past the
    /// post-terminal grace period.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let guard = self.sessions.guard();
        let mut expired = Vec::new();
        let mut evicted = Vec::new();
        for (id, session) in self.sessions.iter(&guard) {
            #[allow(clippy::unwrap_used)]
            let mut session = session.lock().unwrap();
            if session.is_stale(now_ms, self.config.test_session_ttl_ms as i64) {
                session.status = TestStatus::Expired;
                session.completed_at_ms = Some(now_ms);
                expired.push(*id);
            } else if session.is_evictable(now_ms, COMPLETION_EVICTION_GRACE_MS) {
                evicted.push(*id);
            }
        }
        let count = evicted.len();
        for id in &evicted {
            self.sessions.remove(id, &guard);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "test sessions expired by TTL");
        }
        count
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
