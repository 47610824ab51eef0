//! Pure functions computing the Metric Snapshot (§4.7) from a keystroke log.
//! Nothing here touches a clock or a session; `elapsed_ms` is always passed
//! in so these are trivially property-testable.

use crate::keystroke::Keystroke;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub wpm: u32,
    pub raw_wpm: u32,
    pub accuracy: u32,
    pub consistency: u32,
    pub errors: u32,
    pub correct_chars: u32,
    pub incorrect_chars: u32,
    pub position: u32,
    pub elapsed_ms: u64,
}

/// One "word" is five characters, standard (glossary).
const CHARS_PER_WORD: f64 = 5.0;

fn minutes(elapsed_ms: u64) -> f64 {
    elapsed_ms as f64 / 60_000.0
}

/// `round((correct / 5) / elapsed_minutes)`, 0 when `elapsed_ms == 0`.
pub fn wpm(correct: u32, elapsed_ms: u64) -> u32 {
    if elapsed_ms == 0 {
        return 0;
    }
    ((correct as f64 / CHARS_PER_WORD) / minutes(elapsed_ms)).round() as u32
}

/// Same formula using total characters (correct + incorrect).
pub fn raw_wpm(total_chars: u32, elapsed_ms: u64) -> u32 {
    wpm(total_chars, elapsed_ms)
}

/// `100` when `total_chars == 0`, else `round(100 * correct / total_chars)`.
pub fn accuracy(correct: u32, total_chars: u32) -> u32 {
    if total_chars == 0 {
        return 100;
    }
    ((100.0 * correct as f64) / total_chars as f64).round() as u32
}

/// Count non-deletion correct/incorrect keystrokes in the log, and the
/// furthest typed position (used for `mode=words` completion and the
/// snapshot's `position` field).
fn tally(log: &[Keystroke]) -> (u32, u32, u32) {
    let mut correct = 0u32;
    let mut incorrect = 0u32;
    let mut position = 0u32;
    for k in log {
        if k.is_deletion() {
            continue;
        }
        if k.correct {
            correct += 1;
        } else {
            incorrect += 1;
        }
        position = position.max(k.position);
    }
    (correct, incorrect, position)
}

/// Build the full snapshot for a keystroke log at a given elapsed time,
/// capped to `wpm_ceiling` (§6 `max_wpm_plausibility_ceiling`) since the
/// published value must never exceed the physically plausible ceiling
/// (§8 "WPM ceiling").
pub fn compute(log: &[Keystroke], elapsed_ms: u64, wpm_ceiling: u32) -> MetricSnapshot {
    let (correct, incorrect, position) = tally(log);
    let total_chars = correct + incorrect;

    MetricSnapshot {
        wpm: wpm(correct, elapsed_ms).min(wpm_ceiling),
        raw_wpm: raw_wpm(total_chars, elapsed_ms).min(wpm_ceiling),
        accuracy: accuracy(correct, total_chars).min(100),
        consistency: crate::consistency::compute(log),
        errors: incorrect,
        correct_chars: correct,
        incorrect_chars: incorrect,
        position,
        elapsed_ms,
    }
}

impl From<MetricSnapshot> for racetype_common::event::MetricSnapshotWire {
    fn from(s: MetricSnapshot) -> Self {
        Self {
            wpm: s.wpm,
            raw_wpm: s.raw_wpm,
            accuracy: s.accuracy,
            consistency: s.consistency,
            errors: s.errors,
            correct_chars: s.correct_chars,
            incorrect_chars: s.incorrect_chars,
            position: s.position,
            elapsed_ms: s.elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystroke::KeyEvent;

    fn correct_stroke(ts: u64, pos: u32) -> Keystroke {
        Keystroke {
            timestamp_ms: ts,
            key: KeyEvent::Char('a'),
            correct: true,
            position: pos,
        }
    }

    fn incorrect_stroke(ts: u64, pos: u32) -> Keystroke {
        Keystroke {
            timestamp_ms: ts,
            key: KeyEvent::Char('x'),
            correct: false,
            position: pos,
        }
    }

    #[test]
    fn scenario_one_fifteen_second_time_test() {
        // §8 scenario 1: 60 correct keystrokes over 15000ms -> wpm 48.
        let log: Vec<Keystroke> = (0..60).map(|i| correct_stroke(i * 100, i as u32)).collect();
        let snap = compute(&log, 15_000, 300);
        assert_eq!(snap.wpm, 48);
        assert_eq!(snap.accuracy, 100);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn wpm_is_zero_at_zero_elapsed() {
        assert_eq!(wpm(5, 0), 0);
    }

    #[test]
    fn accuracy_is_100_with_no_typed_chars() {
        assert_eq!(accuracy(0, 0), 100);
    }

    #[test]
    fn accuracy_clamped_to_0_100() {
        let snap = compute(&[incorrect_stroke(0, 0), incorrect_stroke(100, 1)], 1000, 300);
        assert_eq!(snap.accuracy, 0);
    }

    #[test]
    fn deletions_are_excluded_from_correct_and_incorrect_tallies() {
        let log = vec![
            correct_stroke(0, 0),
            Keystroke {
                timestamp_ms: 50,
                key: KeyEvent::Backspace,
                correct: false,
                position: 0,
            },
            correct_stroke(100, 0),
        ];
        let snap = compute(&log, 1_000, 300);
        assert_eq!(snap.correct_chars, 2);
        assert_eq!(snap.incorrect_chars, 0);
    }

    #[test]
    fn wpm_never_exceeds_configured_ceiling() {
        // an implausibly fast burst should still clamp
        let log: Vec<Keystroke> = (0..1000).map(|i| correct_stroke(i, i as u32)).collect();
        let snap = compute(&log, 100, 300);
        assert!(snap.wpm <= 300);
    }
}
