//! The append-only log a Test Session or Race keystroke stream is judged
//! from (§3 Keystroke, §4.5 rule 4 on capping/downsampling).

use serde::{Deserialize, Serialize};

/// A single accepted input event. Rule 2 (§4.5) rejects any key whose
/// *logical* length isn't one: a literal character, or the single
/// deletion gesture. Multi-codepoint composed input (e.g. IME output) is
/// excluded at the event level, same as the spec's aside about
/// backspace/space being "compiled text deltas, not special events" for
/// the purposes of the reference-text comparison — but a deletion still
/// needs to exist in the log for the consistency/accuracy accounting the
/// metrics formulas describe ("k is not a deletion"). See DESIGN.md for
/// this reconciliation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KeyEvent {
    Char(char),
    Backspace,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Keystroke {
    /// Milliseconds since the session's `started_at`.
    pub timestamp_ms: u64,
    pub key: KeyEvent,
    /// Server-truth correctness (§4.5 rule 3); always `false` for a
    /// deletion, which has no reference-text character to compare against.
    pub correct: bool,
    pub position: u32,
}

impl Keystroke {
    pub fn is_deletion(&self) -> bool {
        matches!(self.key, KeyEvent::Backspace)
    }
}

/// Downsample a keystroke log to `cap` entries by dropping every other
/// entry, repeatedly, until it fits — "keep every other" per §4.5 rule 4,
/// which preserves the log's time-distribution shape rather than just
/// truncating the tail (truncation would bias consistency toward the
/// session's opening pace).
pub fn downsample(log: &mut Vec<Keystroke>, cap: usize) {
    while log.len() > cap {
        let mut kept = Vec::with_capacity(log.len() / 2 + 1);
        for (i, k) in log.iter().enumerate() {
            if i % 2 == 0 {
                kept.push(*k);
            }
        }
        *log = kept;
    }
}
