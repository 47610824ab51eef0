//! Shared types for the racetype real-time engine: identity, the wire event
//! schema, the error taxonomy, runtime configuration, and the reference-text
//! value type. Kept dependency-light and free of I/O so every other crate
//! can depend on it without pulling in tokio/axum.

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod reference_text;
pub mod room;
pub mod time;

pub use config::RuntimeConfig;
pub use error::{CoreError, ErrorEnvelope, ErrorKind};
pub use identity::{Identity, IdentityId, Role};
pub use reference_text::ReferenceText;
pub use room::RoomName;
pub use time::now_ms;
