//! Per-connection bounded outbound queue (§5 "Backpressure").

use racetype_common::event::OutboundMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const SLOW_CONSUMER_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Eq, PartialEq)]
pub enum PushOutcome {
    /// Queued normally, no eviction needed.
    Queued,
    /// A non-critical message was evicted to make room; the connection is
    /// still open but has accrued one "drop" toward the slow-consumer limit.
    DroppedOldest,
    /// Either the queue is saturated with undroppable (critical) messages,
    /// or this is the second drop within the 10s window: the subscriber
    /// must be closed with `SLOW_CONSUMER`. The pushed message is not
    /// queued in this case.
    PromoteClose,
}

struct Inner {
    queue: VecDeque<OutboundMessage>,
    bytes: usize,
    drop_times: VecDeque<Instant>,
}

/// A bounded mailbox for one connection: `max_messages` entries or
/// `max_bytes` total serialized size, whichever is lower (§5).
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_messages: usize,
    max_bytes: usize,
    len: AtomicUsize,
}

impl OutboundQueue {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
                drop_times: VecDeque::new(),
            }),
            notify: Notify::new(),
            max_messages,
            max_bytes,
            len: AtomicUsize::new(0),
        }
    }

    fn message_size(msg: &OutboundMessage) -> usize {
        serde_json::to_vec(msg).map(|bytes| bytes.len()).unwrap_or(0)
    }

    fn prune_drop_window(drop_times: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = drop_times.front() {
            if now.duration_since(*front) > SLOW_CONSUMER_WINDOW {
                drop_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Enqueue `msg`, applying the overflow policy in §5.
    pub fn push(&self, msg: OutboundMessage) -> PushOutcome {
        let size = Self::message_size(&msg);
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();

        let fits = inner.queue.len() + 1 <= self.max_messages && inner.bytes + size <= self.max_bytes;

        let outcome = if fits {
            PushOutcome::Queued
        } else {
            match inner.queue.iter().position(|m| !m.is_critical()) {
                Some(evict_at) => {
                    #[allow(clippy::unwrap_used)]
                    let evicted = inner.queue.remove(evict_at).unwrap();
                    inner.bytes = inner.bytes.saturating_sub(Self::message_size(&evicted));

                    let now = Instant::now();
                    inner.drop_times.push_back(now);
                    Self::prune_drop_window(&mut inner.drop_times, now);

                    if inner.drop_times.len() >= 2 {
                        PushOutcome::PromoteClose
                    } else {
                        PushOutcome::DroppedOldest
                    }
                }
                // The queue is saturated with critical messages: there is
                // nothing safe to evict, so the bound can only be honored
                // by closing the subscriber.
                None => PushOutcome::PromoteClose,
            }
        };

        let queued = match outcome {
            PushOutcome::PromoteClose => inner.queue.len() + 1 <= self.max_messages,
            _ => true,
        };

        if queued {
            inner.queue.push_back(msg);
            inner.bytes += size;
            self.len.store(inner.queue.len(), Ordering::Relaxed);
            drop(inner);
            self.notify.notify_one();
        }

        outcome
    }

    /// Drain everything currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        inner.bytes = 0;
        self.len.store(0, Ordering::Relaxed);
        inner.queue.drain(..).collect()
    }

    pub async fn wait_for_message(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetype_common::event::{MetricSnapshotWire, OutboundEvent, TestStatsUpdatePayload};
    use uuid::Uuid;

    fn snapshot() -> MetricSnapshotWire {
        MetricSnapshotWire {
            wpm: 0,
            raw_wpm: 0,
            accuracy: 100,
            consistency: 0,
            errors: 0,
            correct_chars: 0,
            incorrect_chars: 0,
            position: 0,
            elapsed_ms: 0,
        }
    }

    fn filler_message() -> OutboundMessage {
        OutboundMessage::at(0, OutboundEvent::TestStatsUpdate(TestStatsUpdatePayload {
            test_id: Uuid::new_v4(),
            snapshot: snapshot(),
        }))
    }

    fn critical_message() -> OutboundMessage {
        OutboundMessage::at(0, OutboundEvent::TestResult(
            racetype_common::event::TestResultPayload {
                test_id: Uuid::new_v4(),
                snapshot: snapshot(),
                unsunk: false,
            },
        ))
    }

    #[test]
    fn queues_under_the_limit() {
        let q = OutboundQueue::new(4, 1_000_000);
        assert_eq!(q.push(filler_message()), PushOutcome::Queued);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest_non_critical() {
        let q = OutboundQueue::new(2, 1_000_000);
        assert_eq!(q.push(filler_message()), PushOutcome::Queued);
        assert_eq!(q.push(filler_message()), PushOutcome::Queued);
        assert_eq!(q.push(filler_message()), PushOutcome::DroppedOldest);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn two_drops_within_window_promotes_close() {
        let q = OutboundQueue::new(1, 1_000_000);
        assert_eq!(q.push(filler_message()), PushOutcome::Queued);
        assert_eq!(q.push(filler_message()), PushOutcome::DroppedOldest);
        assert_eq!(q.push(filler_message()), PushOutcome::PromoteClose);
    }

    #[test]
    fn critical_push_evicts_non_critical_instead_of_being_dropped() {
        let q = OutboundQueue::new(1, 1_000_000);
        assert_eq!(q.push(filler_message()), PushOutcome::Queued);
        assert_eq!(q.push(critical_message()), PushOutcome::DroppedOldest);
        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_critical());
    }

    #[test]
    fn queue_saturated_with_critical_messages_promotes_close() {
        let q = OutboundQueue::new(1, 1_000_000);
        assert_eq!(q.push(critical_message()), PushOutcome::Queued);
        assert_eq!(q.push(critical_message()), PushOutcome::PromoteClose);
    }
}
