//! The Race entity and its lifecycle state machine (§4.6, §3).

use racetype_common::event::RaceMode;
use racetype_common::identity::{Identity, IdentityId};
use racetype_common::reference_text::ReferenceText;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaceStatus {
    Waiting,
    Countdown,
    Active,
    Completed,
    Cancelled,
}

impl RaceStatus {
    /// Whether `next` is a legal transition from this status (§4.6: "an
    /// attempt to regress is a fatal engine bug").
    pub fn can_transition_to(self, next: RaceStatus) -> bool {
        matches!(
            (self, next),
            (RaceStatus::Waiting, RaceStatus::Countdown)
                | (RaceStatus::Waiting, RaceStatus::Cancelled)
                | (RaceStatus::Countdown, RaceStatus::Active)
                | (RaceStatus::Countdown, RaceStatus::Waiting)
                | (RaceStatus::Countdown, RaceStatus::Cancelled)
                | (RaceStatus::Active, RaceStatus::Completed)
                | (RaceStatus::Active, RaceStatus::Cancelled)
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub enum RaceLimit {
    Duration(u64),
    WordCount(u32),
}

#[derive(Clone, Debug)]
pub struct PlayerProgress {
    pub identity: Identity,
    pub position: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    pub finished: bool,
    pub finish_time: Option<u64>,
    pub rank: Option<u32>,
}

impl PlayerProgress {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            position: 0,
            wpm: 0.0,
            accuracy: 0.0,
            errors: 0,
            finished: false,
            finish_time: None,
            rank: None,
        }
    }
}

pub struct Race {
    pub id: String,
    pub name: String,
    pub mode: RaceMode,
    pub limit: RaceLimit,
    pub max_players: u32,
    pub min_players: u32,
    pub is_private: bool,
    pub word_list_id: Option<String>,
    pub roster: Vec<PlayerProgress>,
    pub status: RaceStatus,
    pub reference: Option<ReferenceText>,
    pub created_at_ms: i64,
    pub countdown_started_at_ms: Option<i64>,
    pub started_at_ms: Option<i64>,
    pub first_finisher_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub allow_spectators: bool,
}

impl Race {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        mode: RaceMode,
        limit: RaceLimit,
        max_players: u32,
        min_players: u32,
        is_private: bool,
        word_list_id: Option<String>,
        owner: Identity,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            name,
            mode,
            limit,
            max_players,
            min_players,
            is_private,
            word_list_id,
            roster: vec![PlayerProgress::new(owner)],
            status: RaceStatus::Waiting,
            reference: None,
            created_at_ms: now_ms,
            countdown_started_at_ms: None,
            started_at_ms: None,
            first_finisher_at_ms: None,
            completed_at_ms: None,
            allow_spectators: true,
        }
    }

    pub fn player(&self, identity: IdentityId) -> Option<&PlayerProgress> {
        self.roster.iter().find(|p| p.identity.id == identity)
    }

    pub fn player_mut(&mut self, identity: IdentityId) -> Option<&mut PlayerProgress> {
        self.roster.iter_mut().find(|p| p.identity.id == identity)
    }

    pub fn next_rank(&self) -> u32 {
        self.roster.iter().filter_map(|p| p.rank).max().map_or(1, |r| r + 1)
    }

    /// Recompute ranks for every finished player, breaking ties per §8's
    /// `(finish_time, wpm desc, errors asc, identity id asc)` ordering.
    /// Called whenever a finish is recorded rather than assigning a rank
    /// eagerly in arrival order, so two players who finish in the same
    /// tick are still ordered by the documented tie-break and not by
    /// which `progress`/`finish` call happened to be processed first.
    /// Players who haven't finished keep no rank.
    pub fn assign_ranks(&mut self) {
        let mut finished: Vec<usize> =
            self.roster.iter().enumerate().filter(|(_, p)| p.finished).map(|(i, _)| i).collect();
        finished.sort_by(|&a, &b| {
            let pa = &self.roster[a];
            let pb = &self.roster[b];
            pa.finish_time
                .cmp(&pb.finish_time)
                .then_with(|| pb.wpm.partial_cmp(&pa.wpm).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| pa.errors.cmp(&pb.errors))
                .then_with(|| pa.identity.id.0.cmp(&pb.identity.id.0))
        });
        for (offset, idx) in finished.into_iter().enumerate() {
            self.roster[idx].rank = Some(offset as u32 + 1);
        }
    }

    pub fn all_finished(&self) -> bool {
        !self.roster.is_empty() && self.roster.iter().all(|p| p.finished)
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        self.started_at_ms.map_or(0, |started| (now_ms - started).max(0) as u64)
    }

    pub fn is_stale(&self, now_ms: i64, ttl_ms: i64) -> bool {
        !matches!(self.status, RaceStatus::Completed | RaceStatus::Cancelled) && now_ms - self.created_at_ms >= ttl_ms
    }

    pub fn is_evictable(&self, now_ms: i64, grace_ms: i64) -> bool {
        matches!(self.status, RaceStatus::Completed | RaceStatus::Cancelled)
            && self.completed_at_ms.is_some_and(|at| now_ms - at >= grace_ms)
    }
}
