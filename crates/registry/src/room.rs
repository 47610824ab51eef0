//! The Room Fabric (§4.4): named topic pub/sub with per-room FIFO publish
//! ordering and lazy room creation/reclamation.

use crate::connection::ConnectionId;
use crate::outbound_queue::{OutboundQueue, PushOutcome};
use papaya::HashMap as ConcurrentMap;
use racetype_common::event::OutboundMessage;
use racetype_common::room::RoomName;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// A topic: a set of subscriber connection ids plus a publish lock that
/// serializes `publish()` calls so messages reach every subscriber's
/// queue in the same order they were published (§4.4 FIFO guarantee).
struct Room {
    subscribers: Mutex<HashSet<ConnectionId>>,
    publish_lock: Mutex<()>,
    last_activity_ms: AtomicI64,
}

impl Room {
    fn new(now_ms: i64) -> Self {
        Self {
            subscribers: Mutex::new(HashSet::new()),
            publish_lock: Mutex::new(()),
            last_activity_ms: AtomicI64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: i64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// A subscriber's queue handle, resolved by the caller so the fabric never
/// needs to know about the Connection Registry directly.
pub type QueueLookup<'a> = dyn Fn(ConnectionId) -> Option<Arc<OutboundQueue>> + 'a;

pub struct RoomFabric {
    rooms: ConcurrentMap<RoomName, Arc<Room>>,
}

impl RoomFabric {
    pub fn new() -> Self {
        Self { rooms: ConcurrentMap::new() }
    }

    /// Subscribe `conn` to `room`, creating it lazily if this is the first
    /// subscriber (§4.4).
    pub fn subscribe(&self, room: RoomName, conn: ConnectionId, now_ms: i64) {
        let guard = self.rooms.guard();
        let entry = self.rooms.get_or_insert_with(room, || Arc::new(Room::new(now_ms)), &guard);
        entry.touch(now_ms);
        #[allow(clippy::unwrap_used)]
        entry.subscribers.lock().unwrap().insert(conn);
    }

    pub fn unsubscribe(&self, room: &RoomName, conn: ConnectionId) {
        let guard = self.rooms.guard();
        if let Some(entry) = self.rooms.get(room, &guard) {
            #[allow(clippy::unwrap_used)]
            entry.subscribers.lock().unwrap().remove(&conn);
        }
    }

    /// Publish `msg` to every subscriber of `room`, in order, via the
    /// room's publish lock. Returns the connections whose outbound queue
    /// signaled `PromoteClose` so the router can close them (§5).
    pub fn publish(&self, room: &RoomName, msg: OutboundMessage, lookup: &QueueLookup<'_>, now_ms: i64) -> Vec<ConnectionId> {
        let guard = self.rooms.guard();
        let Some(entry) = self.rooms.get(room, &guard) else {
            return Vec::new();
        };
        entry.touch(now_ms);

        #[allow(clippy::unwrap_used)]
        let _publish_guard = entry.publish_lock.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let subscribers: Vec<ConnectionId> = entry.subscribers.lock().unwrap().iter().copied().collect();

        let mut to_close = Vec::new();
        for conn in subscribers {
            let Some(queue) = lookup(conn) else { continue };
            if matches!(queue.push(msg.clone()), PushOutcome::PromoteClose) {
                to_close.push(conn);
            }
        }
        trace!(room = room.as_str(), "published to room");
        to_close
    }

    pub fn subscriber_count(&self, room: &RoomName) -> usize {
        let guard = self.rooms.guard();
        #[allow(clippy::unwrap_used)]
        self.rooms.get(room, &guard).map(|r| r.subscribers.lock().unwrap().len()).unwrap_or(0)
    }

    /// Reclaim rooms with no subscribers that have been idle past
    /// `grace_ms` (§4.4: rooms are reclaimed, not deleted on last-leave, so
    /// a rejoin within the grace window doesn't lose FIFO ordering).
    pub fn reclaim_empty(&self, now_ms: i64, grace_ms: i64) {
        let guard = self.rooms.guard();
        let mut stale = Vec::new();
        for (name, room) in self.rooms.iter(&guard) {
            #[allow(clippy::unwrap_used)]
            let empty = room.subscribers.lock().unwrap().is_empty();
            let idle = now_ms - room.last_activity_ms.load(Ordering::Relaxed) >= grace_ms;
            if empty && idle {
                stale.push(name.clone());
            }
        }
        for name in &stale {
            self.rooms.remove(name, &guard);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetype_common::event::{MetricSnapshotWire, OutboundEvent, TestStatsUpdatePayload};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn message() -> OutboundMessage {
        OutboundMessage::at(0, OutboundEvent::TestStatsUpdate(TestStatsUpdatePayload {
            test_id: Uuid::new_v4(),
            snapshot: MetricSnapshotWire {
                wpm: 0,
                raw_wpm: 0,
                accuracy: 100,
                consistency: 0,
                errors: 0,
                correct_chars: 0,
                incorrect_chars: 0,
                position: 0,
                elapsed_ms: 0,
            },
        }))
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let fabric = RoomFabric::new();
        let room = RoomName::race("abc123");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        fabric.subscribe(room.clone(), a, 0);
        fabric.subscribe(room.clone(), b, 0);

        let mut queues = HashMap::new();
        queues.insert(a, Arc::new(OutboundQueue::new(8, 1_048_576)));
        queues.insert(b, Arc::new(OutboundQueue::new(8, 1_048_576)));

        let lookup = |id: ConnectionId| queues.get(&id).cloned();
        let closed = fabric.publish(&room, message(), &lookup, 0);

        assert!(closed.is_empty());
        assert_eq!(queues[&a].len(), 1);
        assert_eq!(queues[&b].len(), 1);
    }

    #[test]
    fn unsubscribe_stops_further_delivery() {
        let fabric = RoomFabric::new();
        let room = RoomName::race("abc123");
        let a = ConnectionId::new();
        fabric.subscribe(room.clone(), a, 0);
        fabric.unsubscribe(&room, a);

        let queue = Arc::new(OutboundQueue::new(8, 1_048_576));
        let queues: HashMap<ConnectionId, Arc<OutboundQueue>> = [(a, Arc::clone(&queue))].into();
        let lookup = |id: ConnectionId| queues.get(&id).cloned();
        fabric.publish(&room, message(), &lookup, 0);

        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn reclaim_empty_removes_only_idle_empty_rooms() {
        let fabric = RoomFabric::new();
        let empty_room = RoomName::race("empty");
        let active_room = RoomName::race("active");
        let a = ConnectionId::new();
        fabric.subscribe(empty_room.clone(), a, 0);
        fabric.unsubscribe(&empty_room, a);
        fabric.subscribe(active_room.clone(), a, 0);

        fabric.reclaim_empty(100_000, 30_000);

        assert_eq!(fabric.subscriber_count(&empty_room), 0);
        assert_eq!(fabric.room_count(), 1);
    }
}
