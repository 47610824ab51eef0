//! The Session Router crate (§4.1, §4.8): the Authentication Gate, the
//! dispatch table tying every inbound event to its engine, and the
//! websocket transport that carries both.

pub mod auth;
pub mod dispatch;
pub mod ws;

pub use auth::{bearer_from_headers, AuthGate};
pub use dispatch::SessionRouter;
pub use ws::{ws_upgrade_handler, RouterState};
