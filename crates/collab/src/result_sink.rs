//! `ResultSink`: durable persistence of completed sessions (§4.5, §4.6,
//! §6, §8 idempotence law).

use crate::error::CollabError;
use async_trait::async_trait;
use papaya::HashMap as ConcurrentMap;
use racetype_common::identity::IdentityId;
use racetype_metrics::MetricSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Backoff schedule for a failed sink write (§4.5/§8 scenario 6).
const RETRY_BACKOFF_MS: [u64; 3] = [1_000, 2_000, 4_000];

#[derive(Clone, Debug)]
pub struct TestResult {
    pub test_id: Uuid,
    pub identity: IdentityId,
    pub snapshot: MetricSnapshot,
}

#[derive(Clone, Debug)]
pub struct RaceResult {
    pub race_id: String,
    pub identity: IdentityId,
    pub snapshot: MetricSnapshot,
    pub rank: u32,
}

#[derive(Clone, Debug)]
pub enum SessionResult {
    Test(TestResult),
    Race(RaceResult),
}

impl SessionResult {
    /// The key the sink must deduplicate on (§8: "idempotent on
    /// (session_id, identity_id)").
    pub fn dedupe_key(&self) -> (String, IdentityId) {
        match self {
            SessionResult::Test(r) => (r.test_id.to_string(), r.identity),
            SessionResult::Race(r) => (r.race_id.clone(), r.identity),
        }
    }
}

/// Record a terminal session outcome, retrying a failed write at 1 s,
/// 2 s, then 4 s before giving up (§4.5/§8 scenario 6). A failure on the
/// final attempt is logged with a field the single-attempt retry
/// warnings don't carry, so a "sink is down" run is distinguishable in
/// the logs from one transient blip.
pub async fn record_with_retry(sink: &dyn ResultSink, result: SessionResult) -> Result<(), CollabError> {
    let key = result.dedupe_key();
    let mut last_err = match sink.record(result.clone()).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    for (attempt, backoff_ms) in RETRY_BACKOFF_MS.iter().enumerate() {
        warn!(%last_err, ?key, attempt = attempt + 1, backoff_ms, "result sink write failed, retrying");
        tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
        match sink.record(result.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => last_err = err,
        }
    }

    warn!(%last_err, ?key, attempts_exhausted = RETRY_BACKOFF_MS.len() + 1, "result sink write permanently failed, dropping result");
    Err(last_err)
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Record a terminal session outcome. The engine enqueues this
    /// exactly once per terminal transition (§8); the sink itself must
    /// still tolerate a duplicate call with the same dedupe key and
    /// produce at most one durable record.
    async fn record(&self, result: SessionResult) -> Result<(), CollabError>;
}

/// An in-memory sink for the default binary and integration tests: keeps
/// a count of durable records per dedupe key so duplicate calls are
/// observably no-ops.
pub struct InMemoryResultSink {
    records: ConcurrentMap<(String, IdentityId), ()>,
    accepted: AtomicU64,
    duplicates: AtomicU64,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self {
            records: ConcurrentMap::new(),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryResultSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn record(&self, result: SessionResult) -> Result<(), CollabError> {
        let guard = self.records.guard();
        let key = result.dedupe_key();
        if self.records.get(&key, &guard).is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.records.insert(key, (), &guard);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricSnapshot {
        MetricSnapshot::default()
    }

    #[tokio::test]
    async fn duplicate_record_for_the_same_key_is_a_no_op() {
        let sink = InMemoryResultSink::new();
        let identity = IdentityId(Uuid::new_v4());
        let test_id = Uuid::new_v4();

        let result = SessionResult::Test(TestResult { test_id, identity, snapshot: snapshot() });
        sink.record(result.clone()).await.unwrap();
        sink.record(result).await.unwrap();

        assert_eq!(sink.accepted_count(), 1);
        assert_eq!(sink.duplicate_count(), 1);
    }
}
