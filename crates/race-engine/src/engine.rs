//! The Race Engine (§4.6): multiplayer lifecycle, countdown clock,
//! progress ingestion, ranking, chat.

use crate::race::{PlayerProgress, Race, RaceLimit, RaceStatus};
use papaya::HashMap as ConcurrentMap;
use racetype_collab::{RaceResult as SinkRaceResult, ResultSink, SessionResult, WordRequest, WordSource};
use racetype_common::error::{CoreError, ErrorKind};
use racetype_common::event::{
    OutboundEvent, OutboundMessage, PlayerProgressWire, RaceBeginPayload, RaceCompletedPayload, RaceCountdownPayload,
    RaceCreatePayload, RaceCreatedPayload, RaceFinishPayload, RaceJoinedPayload, RaceMessagePayload,
    RaceMessageReceivedPayload, RacePlayerFinishedPayload, RacePlayerJoinedPayload, RacePlayerLeftPayload,
    RaceProgressPayload, RaceProgressUpdatePayload, RaceStartPayload,
};
use racetype_common::identity::{Identity, IdentityId};
use racetype_common::room::RoomName;
use racetype_common::{ReferenceText, RuntimeConfig};
use racetype_registry::{ConnectionId, ConnectionRegistry, RoomFabric};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{instrument, warn};

type RaceHandle = Arc<Mutex<Race>>;

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ROOM_CODE_LEN: usize = 6;
const RESULT_EVICTION_GRACE_MS: i64 = 60_000;

fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN).map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char).collect()
}

fn to_wire(p: &PlayerProgress) -> PlayerProgressWire {
    PlayerProgressWire {
        identity_id: p.identity.id.to_string(),
        display_name: p.identity.display_name.clone(),
        position: p.position,
        wpm: p.wpm,
        accuracy: p.accuracy,
        errors: p.errors,
        finished: p.finished,
        finish_time: p.finish_time,
        rank: p.rank,
    }
}

fn roster_wire(race: &Race) -> Vec<PlayerProgressWire> {
    race.roster.iter().map(to_wire).collect()
}

pub struct RaceEngine {
    races: ConcurrentMap<String, RaceHandle>,
    rooms: Arc<RoomFabric>,
    registry: Arc<ConnectionRegistry>,
    word_source: Arc<dyn WordSource>,
    result_sink: Arc<dyn ResultSink>,
    config: RuntimeConfig,
}

impl RaceEngine {
    pub fn new(
        rooms: Arc<RoomFabric>,
        registry: Arc<ConnectionRegistry>,
        word_source: Arc<dyn WordSource>,
        result_sink: Arc<dyn ResultSink>,
        config: RuntimeConfig,
    ) -> Self {
        Self { races: ConcurrentMap::new(), rooms, registry, word_source, result_sink, config }
    }

    fn publish(&self, room: &RoomName, msg: OutboundMessage, now_ms: i64) {
        let registry = Arc::clone(&self.registry);
        let lookup = move |id: ConnectionId| registry.get(id).map(|c| Arc::clone(&c.outbound));
        for id in self.rooms.publish(room, msg, &lookup, now_ms) {
            if let Some(conn) = self.registry.get(id) {
                conn.mark_closing();
                warn!(connection = %id.0, "slow consumer promoted to close on race room");
            }
        }
    }

    fn get(&self, race_id: &str) -> Option<RaceHandle> {
        let guard = self.races.guard();
        self.races.get(race_id, &guard).cloned()
    }

    fn room(race_id: &str) -> RoomName {
        RoomName::race(race_id)
    }

    #[instrument(skip(self, owner, payload))]
    pub fn create(
        &self,
        owner: Identity,
        connection_id: ConnectionId,
        payload: RaceCreatePayload,
        now_ms: i64,
    ) -> Result<String, CoreError> {
        if payload.name.chars().count() > 50 {
            return Err(CoreError::new(ErrorKind::ValidationError, "race name must be at most 50 characters"));
        }
        if !(2..=20).contains(&payload.max_players) {
            return Err(CoreError::new(ErrorKind::ValidationError, "maxPlayers must be within 2..=20"));
        }

        let limit = match payload.mode {
            racetype_common::event::RaceMode::Time => {
                let duration = payload.duration.filter(|d| (15..=300).contains(d)).ok_or_else(|| {
                    CoreError::new(ErrorKind::ValidationError, "duration must be within 15..=300 seconds")
                })?;
                RaceLimit::Duration(duration as u64 * 1000)
            }
            racetype_common::event::RaceMode::Words => {
                let word_count = payload.word_count.filter(|w| (10..=200).contains(w)).ok_or_else(|| {
                    CoreError::new(ErrorKind::ValidationError, "wordCount must be within 10..=200")
                })?;
                RaceLimit::WordCount(word_count)
            }
        };

        let guard = self.races.guard();
        let id = loop {
            let candidate = generate_room_code();
            if self.races.get(&candidate, &guard).is_none() {
                break candidate;
            }
        };

        let race = Race::new(
            id.clone(),
            payload.name,
            payload.mode,
            limit,
            payload.max_players,
            self.config.min_players_default,
            payload.is_private,
            payload.word_list_id,
            owner,
            now_ms,
        );
        self.races.insert(id.clone(), Arc::new(Mutex::new(race)), &guard);
        drop(guard);

        self.rooms.subscribe(Self::room(&id), connection_id, now_ms);
        self.publish(
            &Self::room(&id),
            OutboundMessage::at(now_ms, OutboundEvent::RaceCreated(RaceCreatedPayload {
                race_id: id.clone(),
                room_code: id.clone(),
            })),
            now_ms,
        );

        Ok(id)
    }

    /// §4.6 Join. Returns `true` when this join crossed `min_players` and
    /// countdown should be entered by the caller (kept out of this
    /// method so the async Word Source fetch runs outside the lock, per
    /// §5's suspension-point rule).
    #[instrument(skip(self, identity))]
    pub fn join(
        &self,
        race_id: &str,
        identity: Identity,
        connection_id: ConnectionId,
        now_ms: i64,
    ) -> Result<bool, CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;

        let should_enter_countdown = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.player(identity.id).is_some() {
                return Ok(false); // §8 idempotence: duplicate join is a no-op
            }
            match race.status {
                RaceStatus::Countdown | RaceStatus::Active => {
                    return Err(CoreError::new(ErrorKind::RaceStarted, "race has already started"));
                }
                RaceStatus::Completed | RaceStatus::Cancelled => {
                    return Err(CoreError::new(ErrorKind::RaceFinished, "race has already finished"));
                }
                RaceStatus::Waiting => {}
            }
            if race.roster.len() as u32 >= race.max_players {
                return Err(CoreError::new(ErrorKind::RaceFull, "race roster is full"));
            }

            race.roster.push(PlayerProgress::new(identity.clone()));
            let crossed = race.roster.len() as u32 >= race.min_players;
            crossed
        };

        self.rooms.subscribe(Self::room(race_id), connection_id, now_ms);
        let player = {
            #[allow(clippy::unwrap_used)]
            let race = race.lock().unwrap();
            race.player(identity.id).map(to_wire)
        };
        if let Some(player) = player {
            self.publish(
                &Self::room(race_id),
                OutboundMessage::at(now_ms, OutboundEvent::RacePlayerJoined(RacePlayerJoinedPayload {
                    race_id: race_id.to_string(),
                    player,
                })),
                now_ms,
            );
        }

        Ok(should_enter_countdown)
    }

    pub fn joined_state(&self, race_id: &str) -> Result<RaceJoinedPayload, CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        Ok(RaceJoinedPayload { race_id: race_id.to_string(), roster: roster_wire(&race) })
    }

    /// §4.6 Countdown. Fetches the Reference Text (outside any lock),
    /// transitions `waiting -> countdown`, publishes `race:start`, then
    /// drives the per-second tick until `active`. Spawned as the race's
    /// single logical clock task.
    pub async fn run_countdown(self: Arc<Self>, race_id: String, now_ms: i64) {
        let Some(race) = self.get(&race_id) else { return };

        let request = {
            #[allow(clippy::unwrap_used)]
            let race = race.lock().unwrap();
            WordRequest {
                list_id: race.word_list_id.clone(),
                language: "en".to_string(),
                count: match race.limit {
                    RaceLimit::WordCount(n) => n as usize,
                    RaceLimit::Duration(_) => 500,
                },
                mode: race.mode.into(),
            }
        };

        let tokens = match self.word_source.fetch(request).await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(%err, race_id, "word source failed entering countdown, cancelling race");
                #[allow(clippy::unwrap_used)]
                let mut race = race.lock().unwrap();
                race.status = RaceStatus::Cancelled;
                race.completed_at_ms = Some(now_ms);
                return;
            }
        };
        let reference = ReferenceText::new(tokens, " ");

        let countdown_ms = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.status != RaceStatus::Waiting {
                return;
            }
            race.reference = Some(reference.clone());
            race.status = RaceStatus::Countdown;
            race.countdown_started_at_ms = Some(now_ms);
            self.config.countdown_duration_ms
        };

        self.publish(
            &Self::room(&race_id),
            OutboundMessage::at(now_ms, OutboundEvent::RaceStart(RaceStartPayload {
                race_id: race_id.clone(),
                countdown_ms,
                reference_text: reference.to_wire(),
            })),
            now_ms,
        );

        let total_seconds = countdown_ms.div_ceil(1000);
        for remaining in (1..=total_seconds).rev() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            #[allow(clippy::unwrap_used)]
            let still_counting = race.lock().unwrap().status == RaceStatus::Countdown;
            if !still_counting {
                return;
            }
            self.publish(
                &Self::room(&race_id),
                OutboundMessage::at(now_ms, OutboundEvent::RaceCountdown(RaceCountdownPayload {
                    race_id: race_id.clone(),
                    seconds_remaining: remaining as u32,
                })),
                now_ms,
            );
        }

        let tick = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.status != RaceStatus::Countdown {
                return;
            }
            race.status = RaceStatus::Active;
            race.started_at_ms = Some(now_ms + countdown_ms as i64);
            now_ms + countdown_ms as i64
        };
        self.publish(
            &Self::room(&race_id),
            OutboundMessage::at(tick, OutboundEvent::RaceBegin(RaceBeginPayload { race_id: race_id.clone() })),
            tick,
        );

        if let RaceLimit::Duration(duration_ms) = {
            #[allow(clippy::unwrap_used)]
            race.lock().unwrap().limit
        } {
            let engine = Arc::clone(&self);
            let race_id = race_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                let now = tick + duration_ms as i64;
                let _ = engine.complete(&race_id, now).await;
            });
        }
    }

    /// `race:leave` or disconnect while waiting/countdown; a roster drop
    /// to zero cancels the race (§4.6).
    pub fn leave(&self, race_id: &str, identity: IdentityId, connection_id: ConnectionId, now_ms: i64) -> Result<(), CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;
        let became_empty = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.player(identity).is_none() {
                return Err(CoreError::new(ErrorKind::NotInRace, "not a participant in this race"));
            }
            if matches!(race.status, RaceStatus::Active) {
                // §5: a disconnect/leave mid-race freezes progress rather
                // than removing the player; nothing to do here but let
                // the room subscription drop below.
            } else {
                race.roster.retain(|p| p.identity.id != identity);
            }
            let empty = matches!(race.status, RaceStatus::Waiting | RaceStatus::Countdown) && race.roster.is_empty();
            // §9: a roster drop below min_players during the countdown
            // aborts it back to Waiting rather than letting the race
            // start short-handed; the running countdown task notices the
            // status change on its next tick and stops itself.
            let downgrade = !empty
                && race.status == RaceStatus::Countdown
                && (race.roster.len() as u32) < race.min_players
                && race.status.can_transition_to(RaceStatus::Waiting);
            if downgrade {
                race.status = RaceStatus::Waiting;
                race.countdown_started_at_ms = None;
            }
            let _ = downgrade;
            empty
        };

        self.rooms.unsubscribe(&Self::room(race_id), connection_id);
        self.publish(
            &Self::room(race_id),
            OutboundMessage::at(now_ms, OutboundEvent::RacePlayerLeft(RacePlayerLeftPayload {
                race_id: race_id.to_string(),
                identity_id: identity.to_string(),
            })),
            now_ms,
        );

        if became_empty {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Cancelled;
            race.completed_at_ms = Some(now_ms);
        }
        Ok(())
    }

    /// §4.6 Progress ingestion. Returns whether this update completed
    /// the race outright (all finished) so the caller can drive
    /// completion; grace-window timers for the words-mode first finisher
    /// are spawned here directly.
    #[instrument(skip(self, payload))]
    pub fn progress(
        self: &Arc<Self>,
        race_id: &str,
        identity: IdentityId,
        payload: RaceProgressPayload,
        now_ms: i64,
    ) -> Result<bool, CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;

        let (room, all_finished, should_start_grace) = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.player(identity).is_none() {
                return Err(CoreError::new(ErrorKind::NotInRace, "not a participant in this race"));
            }
            match race.status {
                RaceStatus::Active => {}
                RaceStatus::Completed | RaceStatus::Cancelled => {
                    return Err(CoreError::new(ErrorKind::RaceFinished, "race has already finished"));
                }
                RaceStatus::Waiting | RaceStatus::Countdown => {
                    return Err(CoreError::new(ErrorKind::ValidationError, "race has not started yet"));
                }
            }

            let just_finished = {
                let player = race.player_mut(identity).expect("checked above");
                player.position = payload.position;
                player.wpm = payload.wpm.min(self.config.max_wpm_plausibility_ceiling as f64);
                player.accuracy = payload.accuracy.min(100.0);
                player.errors = payload.errors;
                let became_finished = payload.is_finished && !player.finished;
                if became_finished {
                    player.finished = true;
                    player.finish_time = Some(now_ms as u64);
                }
                became_finished
            };
            // Ranks for every finisher are recomputed together rather than
            // assigned to this one player in call-arrival order, so ties
            // within the same finish_time are broken by the documented
            // (wpm desc, errors asc, identity id asc) order (§8).
            if just_finished {
                race.assign_ranks();
            }

            let should_start_grace =
                just_finished && race.mode == racetype_common::event::RaceMode::Words && race.first_finisher_at_ms.is_none();
            if should_start_grace {
                race.first_finisher_at_ms = Some(now_ms);
            }

            (Self::room(race_id), race.all_finished(), should_start_grace)
        };

        self.publish(
            &room,
            OutboundMessage::at(now_ms, OutboundEvent::RaceProgressUpdate(RaceProgressUpdatePayload {
                race_id: race_id.to_string(),
                roster: {
                    #[allow(clippy::unwrap_used)]
                    let race = race.lock().unwrap();
                    roster_wire(&race)
                },
            })),
            now_ms,
        );

        if should_start_grace && !all_finished {
            let remaining_ms = {
                #[allow(clippy::unwrap_used)]
                let race = race.lock().unwrap();
                match race.limit {
                    RaceLimit::Duration(duration_ms) => duration_ms.saturating_sub(race.elapsed_ms(now_ms)),
                    RaceLimit::WordCount(_) => self.config.grace_window_cap_ms,
                }
            };
            let grace_ms = remaining_ms.min(self.config.grace_window_cap_ms);
            let engine = Arc::clone(self);
            let race_id = race_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(grace_ms)).await;
                let now = now_ms + grace_ms as i64;
                let _ = engine.complete(&race_id, now).await;
            });
        }

        Ok(all_finished)
    }

    /// `race:finish`: the authoritative final-stats submission cross-
    /// checked and clamped to the plausibility ceiling (§4.6 "Server-truth
    /// note for races").
    pub fn finish(&self, race_id: &str, identity: IdentityId, payload: RaceFinishPayload, now_ms: i64) -> Result<(), CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;
        #[allow(clippy::unwrap_used)]
        let mut race = race.lock().unwrap();
        let player = race.player_mut(identity).ok_or_else(|| CoreError::new(ErrorKind::NotInRace, "not a participant in this race"))?;
        player.wpm = payload.final_stats.wpm.min(self.config.max_wpm_plausibility_ceiling as f64);
        player.accuracy = payload.final_stats.accuracy.min(100.0);
        player.errors = payload.final_stats.errors;
        let became_finished = !player.finished;
        if became_finished {
            player.finished = true;
            player.finish_time = payload.final_stats.finish_time.or(Some(now_ms as u64));
        }
        // Ranks for every finisher are recomputed together (§8 tie-break),
        // matching `progress()`'s ranking discipline.
        if became_finished {
            race.assign_ranks();
        }
        Ok(())
    }

    pub fn message(&self, race_id: &str, identity: &Identity, payload: RaceMessagePayload, now_ms: i64) -> Result<(), CoreError> {
        if payload.message.chars().count() > 200 {
            return Err(CoreError::new(ErrorKind::ValidationError, "message must be at most 200 characters"));
        }
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;
        {
            #[allow(clippy::unwrap_used)]
            let race = race.lock().unwrap();
            if race.player(identity.id).is_none() {
                return Err(CoreError::new(ErrorKind::NotInRace, "not a participant in this race"));
            }
        }
        self.publish(
            &Self::room(race_id),
            OutboundMessage::at(now_ms, OutboundEvent::RaceMessageReceived(RaceMessageReceivedPayload {
                race_id: race_id.to_string(),
                identity_id: identity.id.to_string(),
                display_name: identity.display_name.clone(),
                message: payload.message,
            })),
            now_ms,
        );
        Ok(())
    }

    /// §4.6 Completion: rank, publish `race:completed`, forward every
    /// player's record to the Result Sink. Idempotent: a race already in
    /// a terminal status is a no-op.
    #[instrument(skip(self))]
    pub async fn complete(&self, race_id: &str, now_ms: i64) -> Result<(), CoreError> {
        let race = self.get(race_id).ok_or_else(|| CoreError::new(ErrorKind::RaceNotFound, "race not found"))?;

        let (rankings, winner) = {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if matches!(race.status, RaceStatus::Completed | RaceStatus::Cancelled) {
                return Ok(());
            }
            if !race.status.can_transition_to(RaceStatus::Completed) {
                debug_assert!(false, "illegal race transition to Completed from {:?}", race.status);
                return Err(CoreError::new(ErrorKind::ServerError, "illegal race state transition"));
            }

            let next_rank_start = race.next_rank();
            let mut unranked: Vec<usize> = race
                .roster
                .iter()
                .enumerate()
                .filter(|(_, p)| p.rank.is_none())
                .map(|(i, _)| i)
                .collect();
            unranked.sort_by(|&a, &b| {
                let pa = &race.roster[a];
                let pb = &race.roster[b];
                pb.wpm
                    .partial_cmp(&pa.wpm)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(pa.errors.cmp(&pb.errors))
                    .then(pa.identity.id.0.cmp(&pb.identity.id.0))
            });
            for (offset, idx) in unranked.into_iter().enumerate() {
                race.roster[idx].rank = Some(next_rank_start + offset as u32);
            }

            race.status = RaceStatus::Completed;
            race.completed_at_ms = Some(now_ms);

            let winner = race.roster.iter().find(|p| p.rank == Some(1)).map(|p| p.identity.id.to_string());
            (roster_wire(&race), winner)
        };

        #[allow(clippy::unwrap_used)]
        let players: Vec<_> = {
            let race = race.lock().unwrap();
            race.roster.iter().map(|p| (p.identity.id, p.wpm, p.accuracy, p.errors, p.rank.unwrap_or(0))).collect()
        };
        for (identity, wpm, accuracy, errors, rank) in players {
            let snapshot = racetype_metrics::MetricSnapshot {
                wpm: wpm.round() as u32,
                raw_wpm: wpm.round() as u32,
                accuracy: accuracy.round() as u32,
                consistency: 0,
                errors,
                correct_chars: 0,
                incorrect_chars: errors,
                position: 0,
                elapsed_ms: race.lock().map(|r| r.elapsed_ms(now_ms)).unwrap_or(0),
            };
            if let Err(err) = racetype_collab::record_with_retry(
                self.result_sink.as_ref(),
                SessionResult::Race(SinkRaceResult { race_id: race_id.to_string(), identity, snapshot, rank }),
            )
            .await
            {
                warn!(%err, race_id, retries_exhausted = true, "result sink permanently failed recording race result, dropping");
            }
        }

        self.publish(
            &Self::room(race_id),
            OutboundMessage::at(now_ms, OutboundEvent::RaceCompleted(RaceCompletedPayload {
                race_id: race_id.to_string(),
                rankings,
                winner,
            })),
            now_ms,
        );
        Ok(())
    }

    /// Housekeeping sweep (§5): cancel non-terminal races past TTL, evict
    /// terminal races past the post-completion grace period.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let guard = self.races.guard();
        let mut evicted = Vec::new();
        for (id, race) in self.races.iter(&guard) {
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            if race.is_stale(now_ms, self.config.race_waiting_ttl_ms as i64) {
                race.status = RaceStatus::Cancelled;
                race.completed_at_ms = Some(now_ms);
            } else if race.is_evictable(now_ms, RESULT_EVICTION_GRACE_MS) {
                evicted.push(id.clone());
            }
        }
        let count = evicted.len();
        for id in &evicted {
            self.races.remove(id, &guard);
        }
        count
    }

    /// Notify a player's progress entry that their publishing connection
    /// finally finished emitting an explicit `race:player_finished` fan-
    /// out (the spec names this outbound event distinctly from the
    /// roster-wide `race:progress_update`, for UIs that want a discrete
    /// "someone just crossed the line" toast).
    pub fn announce_finisher(&self, race_id: &str, identity: IdentityId, now_ms: i64) {
        let Some(race) = self.get(race_id) else { return };
        #[allow(clippy::unwrap_used)]
        let player = { race.lock().unwrap().player(identity).map(to_wire) };
        if let Some(player) = player {
            self.publish(
                &Self::room(race_id),
                OutboundMessage::at(now_ms, OutboundEvent::RacePlayerFinished(RacePlayerFinishedPayload {
                    race_id: race_id.to_string(),
                    player,
                })),
                now_ms,
            );
        }
    }

    #[cfg(test)]
    fn race_count(&self) -> usize {
        self.races.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetype_collab::{InMemoryResultSink, StaticWordSource};
    use racetype_common::event::RaceMode;
    use racetype_common::identity::Role;
    use racetype_registry::{Connection, OutboundQueue};
    use uuid::Uuid;

    fn identity(name: &str) -> Identity {
        Identity { id: IdentityId(Uuid::new_v4()), display_name: name.to_string(), role: Role::Member, avatar: None }
    }

    fn harness() -> (Arc<RaceEngine>, Arc<ConnectionRegistry>) {
        let rooms = Arc::new(RoomFabric::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(RaceEngine::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            Arc::new(StaticWordSource::new()),
            Arc::new(InMemoryResultSink::new()),
            RuntimeConfig::default(),
        ));
        (engine, registry)
    }

    fn register(registry: &ConnectionRegistry, who: Identity) -> ConnectionId {
        let conn = Arc::new(Connection::new(who, None, Arc::new(OutboundQueue::new(256, 1_048_576)), 0));
        let id = conn.id;
        registry.register(conn);
        id
    }

    fn words_payload(name: &str, max_players: u32) -> RaceCreatePayload {
        RaceCreatePayload {
            name: name.to_string(),
            mode: RaceMode::Words,
            duration: None,
            word_count: Some(20),
            max_players,
            word_list_id: None,
            is_private: false,
        }
    }

    #[test]
    fn create_registers_owner_and_emits_race_created() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let conn = register(&registry, owner.clone());

        let race_id = engine.create(owner, conn, words_payload("sprint", 4), 0).unwrap();
        assert_eq!(engine.race_count(), 1);

        let state = engine.joined_state(&race_id).unwrap();
        assert_eq!(state.roster.len(), 1);
    }

    #[test]
    fn create_rejects_name_over_fifty_chars() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let conn = register(&registry, owner.clone());
        let long_name = "x".repeat(51);
        let err = engine.create(owner, conn, words_payload(&long_name, 4), 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn duplicate_join_is_a_no_op() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), conn, words_payload("sprint", 4), 0).unwrap();

        let joined_again = engine.join(&race_id, owner, conn, 0).unwrap();
        assert!(!joined_again); // §8: duplicate join is a no-op, no countdown trigger
        assert_eq!(engine.joined_state(&race_id).unwrap().roster.len(), 1);
    }

    #[test]
    fn join_rejects_when_roster_is_full() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner, owner_conn, words_payload("sprint", 2), 0).unwrap();

        let second = identity("bob");
        let second_conn = register(&registry, second.clone());
        engine.join(&race_id, second, second_conn, 0).unwrap();

        let third = identity("cleo");
        let third_conn = register(&registry, third.clone());
        let err = engine.join(&race_id, third, third_conn, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RaceFull);
    }

    #[test]
    fn join_crosses_min_players_threshold_and_signals_countdown() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner, owner_conn, words_payload("sprint", 4), 0).unwrap();

        let second = identity("bob");
        let second_conn = register(&registry, second.clone());
        let crossed = engine.join(&race_id, second, second_conn, 0).unwrap();
        assert!(crossed); // roster hit min_players (2), caller should start countdown
    }

    #[test]
    fn leave_during_countdown_below_min_players_downgrades_to_waiting() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        let second = identity("bob");
        let second_conn = register(&registry, second.clone());
        let crossed = engine.join(&race_id, second.clone(), second_conn, 0).unwrap();
        assert!(crossed);

        {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Countdown;
            race.countdown_started_at_ms = Some(0);
        }

        engine.leave(&race_id, second.id, second_conn, 10).unwrap();

        let race = engine.get(&race_id).unwrap();
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        assert_eq!(race.status, RaceStatus::Waiting);
        assert!(race.countdown_started_at_ms.is_none());
        assert_eq!(race.roster.len(), 1);
    }

    #[test]
    fn leave_while_waiting_shrinks_roster_and_empty_roster_cancels() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        engine.leave(&race_id, owner.id, owner_conn, 0).unwrap();

        let race = engine.get(&race_id).unwrap();
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        assert_eq!(race.status, RaceStatus::Cancelled);
    }

    #[tokio::test]
    async fn progress_is_rejected_before_the_race_is_active() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        let payload = RaceProgressPayload { race_id: race_id.clone(), position: 5, wpm: 40.0, accuracy: 100.0, errors: 0, is_finished: false };
        let err = engine.progress(&race_id, owner.id, payload, 100).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn progress_clamps_wpm_to_the_plausibility_ceiling() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();
        {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Active;
            race.started_at_ms = Some(0);
        }

        let payload =
            RaceProgressPayload { race_id: race_id.clone(), position: 5, wpm: 9_001.0, accuracy: 250.0, errors: 0, is_finished: false };
        engine.progress(&race_id, owner.id, payload, 100).unwrap();

        let race = engine.get(&race_id).unwrap();
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        let player = race.player(owner.id).unwrap();
        assert_eq!(player.wpm, 300.0);
        assert_eq!(player.accuracy, 100.0);
    }

    #[tokio::test]
    async fn simultaneous_finishers_are_ranked_by_wpm_then_errors_not_call_order() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        let second = identity("bob");
        let second_conn = register(&registry, second.clone());
        engine.join(&race_id, second.clone(), second_conn, 0).unwrap();
        {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Active;
            race.started_at_ms = Some(0);
        }

        // Both players finish at the exact same `now_ms`; the slower
        // caller ("ada") is processed first but must still rank behind
        // the faster one ("bob") since ties break on wpm, not arrival.
        let ada_payload =
            RaceProgressPayload { race_id: race_id.clone(), position: 100, wpm: 40.0, accuracy: 100.0, errors: 2, is_finished: true };
        let bob_payload =
            RaceProgressPayload { race_id: race_id.clone(), position: 100, wpm: 80.0, accuracy: 100.0, errors: 0, is_finished: true };
        engine.progress(&race_id, owner.id, ada_payload, 5_000).unwrap();
        engine.progress(&race_id, second.id, bob_payload, 5_000).unwrap();

        let race = engine.get(&race_id).unwrap();
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        assert_eq!(race.player(second.id).unwrap().rank, Some(1));
        assert_eq!(race.player(owner.id).unwrap().rank, Some(2));
    }

    #[tokio::test]
    async fn completion_assigns_a_rank_permutation() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        let second = identity("bob");
        let second_conn = register(&registry, second.clone());
        engine.join(&race_id, second.clone(), second_conn, 0).unwrap();
        {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Active;
            race.started_at_ms = Some(0);
        }

        engine.complete(&race_id, 10_000).await.unwrap();

        let race = engine.get(&race_id).unwrap();
        #[allow(clippy::unwrap_used)]
        let race = race.lock().unwrap();
        assert_eq!(race.status, RaceStatus::Completed);
        let mut ranks: Vec<u32> = race.roster.iter().filter_map(|p| p.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2]);
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();
        {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let mut race = race.lock().unwrap();
            race.status = RaceStatus::Active;
            race.started_at_ms = Some(0);
        }

        engine.complete(&race_id, 10_000).await.unwrap();
        engine.complete(&race_id, 20_000).await.unwrap(); // no-op, already terminal

        let sink_accepted = {
            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            race.lock().unwrap().completed_at_ms
        };
        assert_eq!(sink_accepted, Some(10_000));
    }

    #[test]
    fn message_is_rejected_when_caller_is_not_in_the_roster() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner, owner_conn, words_payload("sprint", 4), 0).unwrap();

        let stranger = identity("mallory");
        let err = engine
            .message(&race_id, &stranger, RaceMessagePayload { race_id: race_id.clone(), message: "hi".to_string() }, 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInRace);
    }

    #[test]
    fn message_over_two_hundred_chars_is_rejected() {
        let (engine, registry) = harness();
        let owner = identity("ada");
        let owner_conn = register(&registry, owner.clone());
        let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 4), 0).unwrap();

        let too_long = "a".repeat(201);
        let err = engine
            .message(&race_id, &owner, RaceMessagePayload { race_id: race_id.clone(), message: too_long }, 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn sweep_cancels_waiting_races_past_ttl() {
        let (engine, registry) = harness();
        let mut config = RuntimeConfig::default();
        config.race_waiting_ttl_ms = 1_000;
        let rooms = Arc::new(RoomFabric::new());
        let registry2 = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(RaceEngine::new(
            rooms,
            Arc::clone(&registry2),
            Arc::new(StaticWordSource::new()),
            Arc::new(InMemoryResultSink::new()),
            config,
        ));
        let owner = identity("ada");
        let conn = register(&registry2, owner.clone());
        let race_id = engine.create(owner, conn, words_payload("sprint", 4), 0).unwrap();

        engine.sweep(500);
        assert_eq!(engine.get(&race_id).unwrap().lock().unwrap().status, RaceStatus::Waiting);
        engine.sweep(2_000);
        assert_eq!(engine.get(&race_id).unwrap().lock().unwrap().status, RaceStatus::Cancelled);
        let _ = registry;
    }

    proptest::proptest! {
        /// §8: "for every Race, ranks form a permutation of 1..|roster| on
        /// completion", for arbitrary roster sizes and wpm/error spreads.
        #[test]
        fn completion_ranks_are_always_a_permutation(
            wpms in proptest::collection::vec(0.0f64..400.0, 2..12),
            errors in proptest::collection::vec(0u32..50, 2..12),
        ) {
            let n = wpms.len().min(errors.len());
            let (engine, registry) = harness();
            let owner = identity("p0");
            let owner_conn = register(&registry, owner.clone());
            let race_id = engine.create(owner.clone(), owner_conn, words_payload("sprint", 20), 0).unwrap();
            for i in 1..n {
                let who = identity(&format!("p{i}"));
                let conn = register(&registry, who.clone());
                engine.join(&race_id, who, conn, 0).unwrap();
            }

            {
                let race = engine.get(&race_id).unwrap();
                #[allow(clippy::unwrap_used)]
                let mut race = race.lock().unwrap();
                race.status = RaceStatus::Active;
                race.started_at_ms = Some(0);
                for (player, (wpm, errs)) in race.roster.iter_mut().zip(wpms.iter().zip(errors.iter())) {
                    player.wpm = *wpm;
                    player.errors = *errs;
                }
            }

            #[allow(clippy::unwrap_used)]
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(engine.complete(&race_id, 60_000)).unwrap();

            let race = engine.get(&race_id).unwrap();
            #[allow(clippy::unwrap_used)]
            let race = race.lock().unwrap();
            let mut ranks: Vec<u32> = race.roster.iter().filter_map(|p| p.rank).collect();
            ranks.sort_unstable();
            let expected: Vec<u32> = (1..=n as u32).collect();
            proptest::prop_assert_eq!(ranks, expected);
        }
    }
}
