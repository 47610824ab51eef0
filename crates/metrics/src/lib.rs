//! The metrics pipeline (§4.7): everything published to a client is
//! recomputed server-side from the keystroke log and the reference text,
//! never sourced from client-supplied totals (§3 invariant).

pub mod consistency;
pub mod keystroke;
pub mod snapshot;

pub use keystroke::{downsample, KeyEvent, Keystroke};
pub use snapshot::{accuracy, compute, raw_wpm, wpm, MetricSnapshot};
