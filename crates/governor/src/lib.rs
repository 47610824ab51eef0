//! The Rate Governor (§4.2): a uniform token-bucket limiter keyed by
//! `(identity, event class)`. Separate buckets per class so keystrokes
//! (which dwarf all other traffic) can never starve chat or progress
//! decisions, and vice versa.

mod bucket;

use bucket::TokenBucket;
use papaya::HashMap as ConcurrentMap;
use racetype_common::event::RateClass;
use racetype_common::{config::RateGovernorConfig, IdentityId};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub use bucket::CheckResult;

type BucketKey = (IdentityId, RateClass);

pub struct RateGovernor {
    config: RateGovernorConfig,
    buckets: ConcurrentMap<BucketKey, Arc<Mutex<TokenBucket>>>,
}

impl RateGovernor {
    pub fn new(config: RateGovernorConfig) -> Self {
        Self {
            config,
            buckets: ConcurrentMap::new(),
        }
    }

    fn class_config(&self, class: RateClass) -> racetype_common::config::RateClassConfig {
        match class {
            RateClass::Connection => self.config.connection,
            RateClass::Keystroke => self.config.keystroke,
            RateClass::RaceProgress => self.config.race_progress,
            RateClass::Chat => self.config.chat,
            RateClass::General => self.config.general,
        }
    }

    fn bucket_for(&self, key: BucketKey, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let guard = self.buckets.guard();
        let class_config = self.class_config(key.1);
        let bucket = self
            .buckets
            .get_or_insert_with(key, || Arc::new(Mutex::new(TokenBucket::new(class_config, now))), &guard);
        Arc::clone(bucket)
    }

    /// `check(key, class) -> {allowed, remaining, retry-after-ms}` (§4.2).
    pub fn check(&self, identity: IdentityId, class: RateClass) -> CheckResult {
        let now = Instant::now();
        let bucket = self.bucket_for((identity, class), now);
        #[allow(clippy::unwrap_used)]
        let mut guard = bucket.lock().unwrap();
        let result = guard.check(now);
        trace!(?identity, ?class, allowed = result.allowed, "rate governor check");
        result
    }

    /// Periodic sweep: evict buckets idle longer than
    /// `bucket_idle_ttl_ms` (§4.2). Intended to run from the same
    /// housekeeping task as engine eviction (§5).
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = Duration::from_millis(self.config.bucket_idle_ttl_ms);
        let guard = self.buckets.guard();
        let mut stale = Vec::new();
        for (key, bucket) in self.buckets.iter(&guard) {
            #[allow(clippy::unwrap_used)]
            let idle = bucket.lock().unwrap().idle_for(now, ttl);
            if idle {
                stale.push(*key);
            }
        }
        for key in &stale {
            self.buckets.remove(key, &guard);
        }
        if !stale.is_empty() {
            debug!(evicted = stale.len(), "rate governor bucket sweep");
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetype_common::config::RateGovernorConfig;
    use uuid::Uuid;

    fn identity() -> IdentityId {
        IdentityId(Uuid::new_v4())
    }

    #[test]
    fn separate_classes_have_independent_budgets() {
        let gov = RateGovernor::new(RateGovernorConfig::default());
        let who = identity();
        for _ in 0..20 {
            assert!(gov.check(who, RateClass::Keystroke).allowed);
        }
        assert!(!gov.check(who, RateClass::Keystroke).allowed);
        // chat budget is untouched by keystroke exhaustion
        assert!(gov.check(who, RateClass::Chat).allowed);
    }

    #[test]
    fn separate_identities_have_independent_buckets() {
        let gov = RateGovernor::new(RateGovernorConfig::default());
        let a = identity();
        let b = identity();
        for _ in 0..5 {
            assert!(gov.check(a, RateClass::Chat).allowed);
        }
        assert!(!gov.check(a, RateClass::Chat).allowed);
        assert!(gov.check(b, RateClass::Chat).allowed);
    }

    #[test]
    fn denial_carries_a_positive_retry_after() {
        let gov = RateGovernor::new(RateGovernorConfig::default());
        let who = identity();
        for _ in 0..5 {
            gov.check(who, RateClass::Chat);
        }
        let result = gov.check(who, RateClass::Chat);
        assert!(!result.allowed);
        assert!(result.retry_after_ms > 0);
    }

    #[test]
    fn sweep_evicts_nothing_when_bucket_is_fresh() {
        let gov = RateGovernor::new(RateGovernorConfig::default());
        gov.check(identity(), RateClass::General);
        gov.sweep();
        assert_eq!(gov.bucket_count(), 1);
    }
}
