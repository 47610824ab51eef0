//! The Race Engine (§4.6): multiplayer race lifecycle, countdown clock,
//! progress ingestion, ranking, and chat. Composes with the Room Fabric
//! (`racetype-registry`) for fan-out the way the Test Session Engine does.

mod engine;
mod race;

pub use engine::RaceEngine;
pub use race::{PlayerProgress, Race, RaceLimit, RaceStatus};
