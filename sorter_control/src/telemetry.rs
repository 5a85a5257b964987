//! In-process telemetry bus.
//!
//! Topic-filtered fan-out with one bounded buffer per subscriber and a
//! per-subscriber drop policy. Publication never blocks: a full buffer
//! either sheds its oldest entry (WebSocket-style broadcasters) or the
//! incoming one (coalescing batch writers). Per-topic order is preserved
//! per publisher; dropped counts stay observable.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use sorter_common::event::{TelemetryEvent, Topic};

/// What to shed when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Shed the oldest buffered event (keep the freshest view).
    DropOldest,
    /// Shed the incoming event (keep the contiguous prefix).
    DropNewest,
}

#[derive(Debug)]
struct SubscriberBuffer {
    queue: std::collections::VecDeque<TelemetryEvent>,
    capacity: usize,
    policy: DropPolicy,
    dropped: u64,
    closed: bool,
}

struct SubscriberShared {
    buffer: Mutex<SubscriberBuffer>,
    available: Condvar,
    topics: Vec<Topic>,
}

/// Receiving side of a subscription. Dropping it detaches from the bus.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<TelemetryEvent> {
        self.shared.buffer.lock().queue.pop_front()
    }

    /// Blocking receive with a real-time timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TelemetryEvent> {
        let mut buffer = self.shared.buffer.lock();
        if let Some(event) = buffer.queue.pop_front() {
            return Some(event);
        }
        self.shared.available.wait_for(&mut buffer, timeout);
        buffer.queue.pop_front()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        self.shared.buffer.lock().queue.drain(..).collect()
    }

    /// Events shed by the drop policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.buffer.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.shared.buffer.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.buffer.lock().queue.is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.buffer.lock().closed = true;
    }
}

/// The bus. Cheap to clone a handle via `Arc`.
pub struct TelemetryBus {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to a set of topics (empty = all topics).
    pub fn subscribe(
        &self,
        topics: &[Topic],
        capacity: usize,
        policy: DropPolicy,
    ) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            buffer: Mutex::new(SubscriberBuffer {
                queue: std::collections::VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                policy,
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            topics: topics.to_vec(),
        });
        self.subscribers.lock().push(Arc::clone(&shared));
        Subscription { shared }
    }

    /// Publish to every live subscriber of the event's topic. Never
    /// blocks on a slow consumer.
    pub fn publish(&self, event: TelemetryEvent) {
        let topic = Topic::of(&event);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|shared| {
            let mut buffer = shared.buffer.lock();
            if buffer.closed {
                return false;
            }
            if !shared.topics.is_empty() && !shared.topics.contains(&topic) {
                return true;
            }
            if buffer.queue.len() == buffer.capacity {
                match buffer.policy {
                    DropPolicy::DropOldest => {
                        buffer.queue.pop_front();
                        buffer.dropped += 1;
                    }
                    DropPolicy::DropNewest => {
                        buffer.dropped += 1;
                        return true;
                    }
                }
            }
            buffer.queue.push_back(event.clone());
            drop(buffer);
            shared.available.notify_one();
            true
        });
        trace!(topic = topic.as_str(), "published");
    }

    /// Live subscriber count (for diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}
