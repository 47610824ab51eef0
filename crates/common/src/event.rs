//! Wire event schema (§6).
//!
//! Every inbound event is a tagged variant with a strict schema: unknown
//! fields are ignored (serde's default), missing required fields fail
//! deserialization and the Router turns that into `VALIDATION_ERROR`
//! (§9 "Duck-typed JSON payloads" redesign flag — this is the fix).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    Time,
    Words,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceMode {
    Time,
    Words,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Invisible,
}

/// Rate-limit class a given inbound event belongs to (§4.2 table).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateClass {
    Connection,
    Keystroke,
    RaceProgress,
    Chat,
    General,
}

// ---- Inbound payloads --------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct TestStartPayload {
    pub mode: TestMode,
    pub duration: Option<u32>,
    #[serde(rename = "wordCount")]
    pub word_count: Option<u32>,
    #[serde(rename = "wordListId")]
    pub word_list_id: Option<String>,
    pub language: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TestKeystrokePayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
    pub timestamp: u64,
    pub key: String,
    pub correct: bool,
    pub position: u32,
    #[serde(rename = "currentText")]
    pub current_text: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FinalStats {
    pub wpm: f64,
    pub accuracy: f64,
    pub consistency: Option<f64>,
    pub errors: u32,
    #[serde(rename = "timeElapsed")]
    pub time_elapsed: Option<u64>,
    #[serde(rename = "finishTime")]
    pub finish_time: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TestCompletedPayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
    #[serde(rename = "finalStats")]
    pub final_stats: FinalStats,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TestLeavePayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceCreatePayload {
    pub name: String,
    pub mode: RaceMode,
    pub duration: Option<u32>,
    #[serde(rename = "wordCount")]
    pub word_count: Option<u32>,
    #[serde(rename = "maxPlayers")]
    pub max_players: u32,
    #[serde(rename = "wordListId")]
    pub word_list_id: Option<String>,
    #[serde(rename = "isPrivate")]
    pub is_private: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceJoinPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceLeavePayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceProgressPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub position: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    #[serde(rename = "isFinished")]
    pub is_finished: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceFinishPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "finalStats")]
    pub final_stats: FinalStats,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RaceMessagePayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FriendsUpdateStatusPayload {
    pub status: PresenceStatus,
    pub activity: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundEvent {
    #[serde(rename = "test:start")]
    TestStart(TestStartPayload),
    #[serde(rename = "test:keystroke")]
    TestKeystroke(TestKeystrokePayload),
    #[serde(rename = "test:completed")]
    TestCompleted(TestCompletedPayload),
    #[serde(rename = "test:leave")]
    TestLeave(TestLeavePayload),
    #[serde(rename = "race:create")]
    RaceCreate(RaceCreatePayload),
    #[serde(rename = "race:join")]
    RaceJoin(RaceJoinPayload),
    #[serde(rename = "race:leave")]
    RaceLeave(RaceLeavePayload),
    #[serde(rename = "race:progress")]
    RaceProgress(RaceProgressPayload),
    #[serde(rename = "race:finish")]
    RaceFinish(RaceFinishPayload),
    #[serde(rename = "race:message")]
    RaceMessage(RaceMessagePayload),
    #[serde(rename = "friends:update_status")]
    FriendsUpdateStatus(FriendsUpdateStatusPayload),
    #[serde(rename = "ping")]
    Ping,
}

impl InboundEvent {
    /// The rate-limit class this event is charged against (§4.2).
    pub fn rate_class(&self) -> RateClass {
        match self {
            InboundEvent::TestKeystroke(_) => RateClass::Keystroke,
            InboundEvent::RaceProgress(_) => RateClass::RaceProgress,
            InboundEvent::RaceMessage(_) => RateClass::Chat,
            _ => RateClass::General,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::TestStart(_) => "test:start",
            InboundEvent::TestKeystroke(_) => "test:keystroke",
            InboundEvent::TestCompleted(_) => "test:completed",
            InboundEvent::TestLeave(_) => "test:leave",
            InboundEvent::RaceCreate(_) => "race:create",
            InboundEvent::RaceJoin(_) => "race:join",
            InboundEvent::RaceLeave(_) => "race:leave",
            InboundEvent::RaceProgress(_) => "race:progress",
            InboundEvent::RaceFinish(_) => "race:finish",
            InboundEvent::RaceMessage(_) => "race:message",
            InboundEvent::FriendsUpdateStatus(_) => "friends:update_status",
            InboundEvent::Ping => "ping",
        }
    }
}

// ---- Outbound payloads -------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct ReferenceTextWire {
    pub tokens: Vec<String>,
    pub text: String,
    pub char_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestJoinedPayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
    pub mode: TestMode,
    #[serde(rename = "referenceText")]
    pub reference_text: ReferenceTextWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricSnapshotWire {
    pub wpm: u32,
    #[serde(rename = "rawWpm")]
    pub raw_wpm: u32,
    pub accuracy: u32,
    pub consistency: u32,
    pub errors: u32,
    #[serde(rename = "correctChars")]
    pub correct_chars: u32,
    #[serde(rename = "incorrectChars")]
    pub incorrect_chars: u32,
    pub position: u32,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestStatsUpdatePayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
    #[serde(flatten)]
    pub snapshot: MetricSnapshotWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestResultPayload {
    #[serde(rename = "testId")]
    pub test_id: Uuid,
    #[serde(flatten)]
    pub snapshot: MetricSnapshotWire,
    pub unsunk: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceCreatedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "roomCode")]
    pub room_code: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlayerProgressWire {
    #[serde(rename = "identityId")]
    pub identity_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub position: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    pub finished: bool,
    #[serde(rename = "finishTime")]
    pub finish_time: Option<u64>,
    pub rank: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceJoinedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub roster: Vec<PlayerProgressWire>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RacePlayerJoinedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub player: PlayerProgressWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct RacePlayerLeftPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "identityId")]
    pub identity_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceStartPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "countdownMs")]
    pub countdown_ms: u64,
    #[serde(rename = "referenceText")]
    pub reference_text: ReferenceTextWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceCountdownPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "secondsRemaining")]
    pub seconds_remaining: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceBeginPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceProgressUpdatePayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub roster: Vec<PlayerProgressWire>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RacePlayerFinishedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub player: PlayerProgressWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceCompletedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    pub rankings: Vec<PlayerProgressWire>,
    pub winner: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaceMessageReceivedPayload {
    #[serde(rename = "raceId")]
    pub race_id: String,
    #[serde(rename = "identityId")]
    pub identity_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct FriendPresencePayload {
    #[serde(rename = "identityId")]
    pub identity_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundEvent {
    #[serde(rename = "test:joined")]
    TestJoined(TestJoinedPayload),
    #[serde(rename = "test:stats_update")]
    TestStatsUpdate(TestStatsUpdatePayload),
    #[serde(rename = "test:result")]
    TestResult(TestResultPayload),
    #[serde(rename = "race:created")]
    RaceCreated(RaceCreatedPayload),
    #[serde(rename = "race:joined")]
    RaceJoined(RaceJoinedPayload),
    #[serde(rename = "race:player_joined")]
    RacePlayerJoined(RacePlayerJoinedPayload),
    #[serde(rename = "race:player_left")]
    RacePlayerLeft(RacePlayerLeftPayload),
    #[serde(rename = "race:start")]
    RaceStart(RaceStartPayload),
    #[serde(rename = "race:countdown")]
    RaceCountdown(RaceCountdownPayload),
    #[serde(rename = "race:begin")]
    RaceBegin(RaceBeginPayload),
    #[serde(rename = "race:progress_update")]
    RaceProgressUpdate(RaceProgressUpdatePayload),
    #[serde(rename = "race:player_finished")]
    RacePlayerFinished(RacePlayerFinishedPayload),
    #[serde(rename = "race:completed")]
    RaceCompleted(RaceCompletedPayload),
    #[serde(rename = "race:message_received")]
    RaceMessageReceived(RaceMessageReceivedPayload),
    #[serde(rename = "friend:online")]
    FriendOnline(FriendPresencePayload),
    #[serde(rename = "friend:offline")]
    FriendOffline(FriendPresencePayload),
    #[serde(rename = "pong")]
    Pong,
    /// Local, connection-scoped error response (§6, §7). Never published to
    /// a room; the Router pushes this straight onto the originating
    /// connection's queue.
    #[serde(rename = "error")]
    Error(crate::error::ErrorPayload),
}

impl OutboundEvent {
    /// Critical messages are never dropped by backpressure (§5); instead
    /// the subscriber is promoted straight to close.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            OutboundEvent::TestResult(_) | OutboundEvent::RaceCompleted(_)
        )
    }
}

/// The envelope every outbound message is wrapped in before it hits the
/// wire: `type`, `payload`, and a server `timestamp` (§4.1).
#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub event: OutboundEvent,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Every engine API threads `now_ms` in explicitly (see
    /// `racetype_common::time`); the envelope timestamp is derived from
    /// that same value rather than reading the clock a second time here.
    pub fn at(now_ms: i64, event: OutboundEvent) -> Self {
        Self {
            event,
            timestamp: DateTime::from_timestamp_millis(now_ms).unwrap_or_default(),
        }
    }

    /// Wrap a rejected event's error for the originating connection,
    /// stamped with the caller's `now_ms` rather than `CoreError`'s own
    /// clock read.
    pub fn error_at(now_ms: i64, err: crate::error::CoreError) -> Self {
        let envelope: crate::error::ErrorEnvelope = err.into();
        OutboundMessage::at(now_ms, OutboundEvent::Error(envelope.payload))
    }

    pub fn is_critical(&self) -> bool {
        self.event.is_critical()
    }
}
