//! Durable pending queue for undelivered location events.
//!
//! While the realtime channel is down, accepted location events are parked
//! here and flushed later: by the background agent's opportunistic sends or
//! by the foreground tracker when the app resumes. The queue is bounded with
//! oldest-first eviction so prolonged disconnection degrades by losing the
//! oldest history instead of growing storage without limit.
//!
//! All mutations go through a single internal lock and a load-modify-store
//! cycle against the key-value store, whose per-key writes are atomic. That
//! keeps background enqueues and foreground drains from double-sending or
//! losing entries.

use std::sync::{Arc, Mutex};

use crate::model::{LocationEvent, PendingQueueEntry};
use crate::storage::{keys, KeyValueStore, KeyValueStoreExt, StorageError};

/// Default maximum number of queued entries.
pub const DEFAULT_QUEUE_CAP: usize = 50;

/// Bounded FIFO of undelivered location events over durable storage.
pub struct PendingQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    cap: usize,
    // Serializes enqueue/drain within this process; across processes the
    // OS never runs the foreground and background producers concurrently.
    lock: Mutex<()>,
}

impl PendingQueue {
    /// Create a queue with the default storage key and capacity.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_capacity(store, DEFAULT_QUEUE_CAP)
    }

    /// Create a queue with a custom capacity.
    pub fn with_capacity(store: Arc<dyn KeyValueStore>, cap: usize) -> Self {
        Self {
            store,
            key: keys::PENDING_EVENTS.to_string(),
            cap,
            lock: Mutex::new(()),
        }
    }

    fn read_entries(&self) -> Result<Vec<PendingQueueEntry>, StorageError> {
        Ok(self.store.load_value(&self.key)?.unwrap_or_default())
    }

    fn write_entries(&self, entries: &[PendingQueueEntry]) -> Result<(), StorageError> {
        self.store.save_value(&self.key, &entries)
    }

    /// Append an event, evicting the oldest entries past the capacity.
    ///
    /// Returns the queue length after the append. Eviction is deliberate
    /// lossy degradation under prolonged disconnection, not an error.
    pub fn enqueue(&self, event: LocationEvent, now_ms: i64) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().unwrap();

        let mut entries = self.read_entries()?;
        entries.push(PendingQueueEntry {
            event,
            enqueued_at_epoch_ms: now_ms,
        });

        if entries.len() > self.cap {
            let evicted = entries.len() - self.cap;
            entries.drain(..evicted);
            tracing::warn!(evicted, cap = self.cap, "pending queue full, dropped oldest entries");
        }

        self.write_entries(&entries)?;
        Ok(entries.len())
    }

    /// Snapshot of all queued entries in FIFO order.
    pub fn peek_all(&self) -> Result<Vec<PendingQueueEntry>, StorageError> {
        let _guard = self.lock.lock().unwrap();
        self.read_entries()
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.peek_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.peek_all()?.is_empty())
    }

    /// Remove every queued entry.
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap();
        self.store.delete(&self.key)
    }

    /// Flush entries through `send` in enqueue order.
    ///
    /// `send` returns whether the entry was delivered; the walk stops at the
    /// first failure so ordering is preserved across attempts. Exactly the
    /// consumed prefix is removed and returned; the remainder stays queued
    /// for the next drain. Draining an empty queue is a no-op that returns
    /// no entries.
    pub fn drain_with<F>(&self, mut send: F) -> Result<Vec<PendingQueueEntry>, StorageError>
    where
        F: FnMut(&LocationEvent) -> bool,
    {
        let _guard = self.lock.lock().unwrap();

        let entries = self.read_entries()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut sent = 0;
        for entry in &entries {
            if send(&entry.event) {
                sent += 1;
            } else {
                break;
            }
        }

        if sent == 0 {
            return Ok(Vec::new());
        }

        let remaining: Vec<PendingQueueEntry> = entries[sent..].to_vec();
        self.write_entries(&remaining)?;

        tracing::debug!(sent, remaining = remaining.len(), "drained pending queue");
        Ok(entries[..sent].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocationSample, VehicleStatus};
    use crate::storage::MemoryKeyValueStore;
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000_000;

    fn event(n: i64) -> LocationEvent {
        LocationEvent::new(
            "vehicle-1",
            LocationSample {
                latitude: 52.0,
                longitude: 5.0,
                accuracy_meters: 10.0,
                speed_mps: None,
                heading_deg: None,
                sampled_at_epoch_ms: T0 + n,
            },
            VehicleStatus::Online,
            T0 + n,
        )
    }

    fn queue_with_cap(cap: usize) -> PendingQueue {
        PendingQueue::with_capacity(Arc::new(MemoryKeyValueStore::new()), cap)
    }

    #[test]
    fn test_enqueue_and_peek_fifo_order() {
        let queue = queue_with_cap(10);

        queue.enqueue(event(0), T0).unwrap();
        queue.enqueue(event(1), T0 + 1).unwrap();
        queue.enqueue(event(2), T0 + 2).unwrap();

        let entries = queue.peek_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event, event(0));
        assert_eq!(entries[2].event, event(2));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let queue = queue_with_cap(50);

        for n in 0..60 {
            queue.enqueue(event(n), T0 + n).unwrap();
        }

        let entries = queue.peek_all().unwrap();
        assert_eq!(entries.len(), 50);
        // The first ten were evicted; the survivors start at event 10.
        assert_eq!(entries[0].event, event(10));
        assert_eq!(entries[49].event, event(59));
    }

    #[test]
    fn test_drain_empty_queue_is_noop() {
        let queue = queue_with_cap(10);

        let consumed = queue.drain_with(|_| true).unwrap();
        assert!(consumed.is_empty());

        // Replaying on an already-empty queue stays a no-op.
        let consumed = queue.drain_with(|_| true).unwrap();
        assert!(consumed.is_empty());
    }

    #[test]
    fn test_drain_full_success_empties_queue() {
        let queue = queue_with_cap(10);
        for n in 0..3 {
            queue.enqueue(event(n), T0 + n).unwrap();
        }

        let mut order = Vec::new();
        let consumed = queue
            .drain_with(|e| {
                order.push(e.emitted_at_epoch_ms);
                true
            })
            .unwrap();

        assert_eq!(consumed.len(), 3);
        assert_eq!(order, vec![T0, T0 + 1, T0 + 2]);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_drain_partial_failure_keeps_tail() {
        let queue = queue_with_cap(10);
        for n in 0..5 {
            queue.enqueue(event(n), T0 + n).unwrap();
        }

        // Only the first two sends succeed.
        let mut attempts = 0;
        let consumed = queue
            .drain_with(|_| {
                attempts += 1;
                attempts <= 2
            })
            .unwrap();

        assert_eq!(consumed.len(), 2);
        // The walk stops at the first failure: entries after it are untouched.
        assert_eq!(attempts, 3);

        let remaining = queue.peek_all().unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].event, event(2));

        // A later drain picks up exactly where the last one stopped.
        let consumed = queue.drain_with(|_| true).unwrap();
        assert_eq!(consumed.len(), 3);
        assert_eq!(consumed[0].event, event(2));
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_drain_single_entry_removal() {
        let queue = queue_with_cap(10);
        queue.enqueue(event(0), T0).unwrap();
        queue.enqueue(event(1), T0 + 1).unwrap();

        // Only the head entry goes through.
        let mut first = true;
        let consumed = queue
            .drain_with(|_| std::mem::replace(&mut first, false))
            .unwrap();

        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].event, event(0));

        let remaining = queue.peek_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event, event(1));
    }

    #[test]
    fn test_clear() {
        let queue = queue_with_cap(10);
        queue.enqueue(event(0), T0).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_queue_survives_store_reuse() {
        // Two queue handles over the same store see the same entries, the
        // way a background invocation and a later foreground drain do.
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());

        let writer = PendingQueue::new(store.clone());
        writer.enqueue(event(0), T0).unwrap();
        writer.enqueue(event(1), T0 + 1).unwrap();

        let reader = PendingQueue::new(store);
        let entries = reader.peek_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, event(0));
    }
}
