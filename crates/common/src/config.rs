//! Runtime configuration (§6 "Configuration (recognized options)").
//!
//! Loaded by `racetype-server` via a layered `figment` provider (defaults,
//! then an optional file, then environment overrides) the way the teacher's
//! daemon layers its `Args`/config-file/CLI precedence. This crate only
//! owns the shape and the defaults; the loading itself lives in the binary
//! so this crate stays free of I/O.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One rate-limit class from the Rate Governor's table (§4.2).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateClassConfig {
    /// Bucket capacity (max tokens held).
    pub capacity: u32,
    /// Tokens added per `refill_interval_ms`.
    pub refill_tokens: u32,
    pub refill_interval_ms: u64,
}

impl RateClassConfig {
    pub const fn new(capacity: u32, refill_tokens: u32, refill_interval_ms: u64) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_interval_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateGovernorConfig {
    pub connection: RateClassConfig,
    pub keystroke: RateClassConfig,
    pub race_progress: RateClassConfig,
    pub chat: RateClassConfig,
    pub general: RateClassConfig,
    /// Buckets idle longer than this are evicted by the sweep (§4.2).
    pub bucket_idle_ttl_ms: u64,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        Self {
            connection: RateClassConfig::new(10, 1, 6_000),
            keystroke: RateClassConfig::new(20, 20, 1_000),
            race_progress: RateClassConfig::new(10, 10, 1_000),
            chat: RateClassConfig::new(5, 1, 12_000),
            general: RateClassConfig::new(100, 1, 6_000),
            bucket_idle_ttl_ms: 600_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_connections_per_identity: u32,
    pub countdown_duration_ms: u64,
    pub test_session_ttl_ms: u64,
    pub race_waiting_ttl_ms: u64,
    pub keystroke_log_cap: usize,
    pub stats_broadcast_min_interval_ms: u64,
    pub max_wpm_plausibility_ceiling: u32,
    pub send_queue_max_messages: usize,
    pub send_queue_max_bytes: usize,
    /// Min players required before countdown starts (§3 Race entity).
    pub min_players_default: u32,
    /// How long a words-mode race waits for stragglers after the first
    /// finisher, capped at this value (§4.6 grace window).
    pub grace_window_cap_ms: u64,
    /// How often the housekeeping sweep runs (§5 Eviction).
    pub housekeeping_interval_ms: u64,
    /// Grace period a room survives empty before reclamation (§4.4).
    pub room_empty_grace_ms: u64,
    pub rate_governor: RateGovernorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 5,
            countdown_duration_ms: 5_000,
            test_session_ttl_ms: 600_000,
            race_waiting_ttl_ms: 3_600_000,
            keystroke_log_cap: 10_000,
            stats_broadcast_min_interval_ms: 100,
            max_wpm_plausibility_ceiling: 300,
            send_queue_max_messages: 256,
            send_queue_max_bytes: 1_048_576,
            min_players_default: 2,
            grace_window_cap_ms: 30_000,
            housekeeping_interval_ms: 60_000,
            room_empty_grace_ms: 30_000,
            rate_governor: RateGovernorConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn countdown_duration(&self) -> Duration {
        Duration::from_millis(self.countdown_duration_ms)
    }

    pub fn test_session_ttl(&self) -> Duration {
        Duration::from_millis(self.test_session_ttl_ms)
    }

    pub fn race_waiting_ttl(&self) -> Duration {
        Duration::from_millis(self.race_waiting_ttl_ms)
    }

    /// Validate the bounds §4.6 requires (`countdown_duration_ms` in
    /// 3000..10000). Called once at startup; a violated bound is a
    /// configuration error, not a runtime one.
    pub fn validate(&self) -> Result<(), String> {
        if !(3_000..=10_000).contains(&self.countdown_duration_ms) {
            return Err(format!(
                "countdown_duration_ms must be within 3000..=10000, got {}",
                self.countdown_duration_ms
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_satisfies_its_own_bounds() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn countdown_out_of_bounds_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.countdown_duration_ms = 1_000;
        assert!(cfg.validate().is_err());
    }
}
