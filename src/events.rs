//! Change event queue.
//!
//! Hosts publish change notifications here; the invalidation controller
//! drains them in batches and turns each one into a purge request.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::lock::mutex_lock;

const SOURCE: &str = "events";

const METRIC_QUEUE_DEPTH: &str = "razzo_event_queue_depth";

/// Monotonic epoch for ordering events within this process.
///
/// Used to decide which event is latest when several arrive for the same
/// content unit.
pub type Epoch = u64;

/// A single change notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: ChangeKind,
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// What changed on the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A content unit (post, page) was created, updated, or deleted.
    ContentUnitChanged { unit_id: u64 },
    /// A single URL's output is stale.
    UrlChanged { url: String },
    /// Site-wide settings changed; everything is stale.
    SiteSettingsChanged,
}

/// In-memory FIFO of pending change events.
///
/// A mutex-guarded deque is enough here: publishers are host write paths
/// and the single drain loop, so contention stays low.
pub struct EventQueue {
    queue: Mutex<VecDeque<ChangeEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue a change notification.
    pub fn publish(&self, kind: ChangeKind) {
        let epoch = self.next_epoch();
        let event = ChangeEvent::new(kind.clone(), epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?kind,
            "Change event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        queue.push_back(event);
        gauge!(METRIC_QUEUE_DEPTH).set(queue.len() as f64);
    }

    /// Dequeue up to `limit` events, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<ChangeEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained: Vec<ChangeEvent> = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_DEPTH).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_are_strictly_increasing() {
        let queue = EventQueue::new();
        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        let e3 = queue.next_epoch();
        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn publish_and_drain_preserve_fifo_order() {
        let queue = EventQueue::new();
        queue.publish(ChangeKind::SiteSettingsChanged);
        queue.publish(ChangeKind::ContentUnitChanged { unit_id: 7 });
        queue.publish(ChangeKind::UrlChanged {
            url: "/blog/".to_string(),
        });

        assert_eq!(queue.len(), 3);

        let drained = queue.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(drained[0].kind, ChangeKind::SiteSettingsChanged);
        assert_eq!(
            drained[1].kind,
            ChangeKind::ContentUnitChanged { unit_id: 7 }
        );
    }

    #[test]
    fn drain_beyond_len_empties_the_queue() {
        let queue = EventQueue::new();
        queue.publish(ChangeKind::SiteSettingsChanged);
        let drained = queue.drain(10);
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
    }
}
