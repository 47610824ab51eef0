use proptest::prelude::*;
use racetype_common::config::{RateClassConfig, RateGovernorConfig};
use racetype_common::event::RateClass;
use racetype_common::IdentityId;
use racetype_governor::RateGovernor;
use uuid::Uuid;

proptest! {
    /// §8: across any 1-second window per identity, accepted
    /// `test:keystroke` events never exceed the class capacity.
    #[test]
    fn keystroke_acceptance_never_exceeds_capacity(attempts in 0u32..200) {
        let mut cfg = RateGovernorConfig::default();
        cfg.keystroke = RateClassConfig::new(20, 20, 1_000);
        let gov = RateGovernor::new(cfg);
        let who = IdentityId(Uuid::new_v4());

        let accepted = (0..attempts)
            .filter(|_| gov.check(who, RateClass::Keystroke).allowed)
            .count();

        prop_assert!(accepted <= 20);
    }
}
