//! Millisecond wall-clock helper shared by the transport and housekeeping
//! loops. Every engine API takes `now_ms` as an explicit argument so the
//! engines themselves stay deterministic and testable; this is the one
//! place that actually reads the clock.

use chrono::Utc;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
