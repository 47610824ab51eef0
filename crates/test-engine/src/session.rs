//! The Test Session entity and its lifecycle (§4.5).

use racetype_common::event::TestMode;
use racetype_common::identity::Identity;
use racetype_common::reference_text::ReferenceText;
use racetype_metrics::Keystroke;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestStatus {
    Created,
    Running,
    Completed,
    Expired,
}

#[derive(Clone, Copy, Debug)]
pub enum TestLimit {
    Duration(u64),
    WordCount(u32),
}

pub struct TestSession {
    pub id: Uuid,
    pub owner: Identity,
    pub mode: TestMode,
    pub limit: TestLimit,
    pub reference: ReferenceText,
    pub log: Vec<Keystroke>,
    pub status: TestStatus,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl TestSession {
    pub fn new(id: Uuid, owner: Identity, mode: TestMode, limit: TestLimit, reference: ReferenceText, now_ms: i64) -> Self {
        Self {
            id,
            owner,
            mode,
            limit,
            reference,
            log: Vec::new(),
            status: TestStatus::Created,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    /// Milliseconds since `started_at`, or 0 before the first accepted
    /// keystroke (§4.7 `elapsed_ms`).
    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        match self.started_at_ms {
            Some(started) => (now_ms - started).max(0) as u64,
            None => 0,
        }
    }

    /// Whether the time or word-count limit has been reached, given the
    /// furthest judged position (§4.5 lifecycle rule b/c).
    pub fn limit_reached(&self, now_ms: i64, furthest_position: u32) -> bool {
        match self.limit {
            TestLimit::Duration(limit_ms) => self.elapsed_ms(now_ms) >= limit_ms,
            TestLimit::WordCount(_) => furthest_position + 1 >= self.reference.char_count() as u32,
        }
    }

    pub fn is_stale(&self, now_ms: i64, ttl_ms: i64) -> bool {
        matches!(self.status, TestStatus::Created | TestStatus::Running) && now_ms - self.created_at_ms >= ttl_ms
    }

    pub fn is_evictable(&self, now_ms: i64, grace_ms: i64) -> bool {
        matches!(self.status, TestStatus::Completed | TestStatus::Expired)
            && self.completed_at_ms.is_some_and(|at| now_ms - at >= grace_ms)
    }
}
