//! Connection Registry and Room Fabric (§4.3, §4.4): process-wide
//! connection bookkeeping and the topic pub/sub layer the engines publish
//! state changes through.

mod connection;
mod outbound_queue;
mod registry;
mod room;

pub use connection::{Connection, ConnectionId, ConnectionStatus};
pub use outbound_queue::{OutboundQueue, PushOutcome};
pub use registry::ConnectionRegistry;
pub use room::{QueueLookup, RoomFabric};
