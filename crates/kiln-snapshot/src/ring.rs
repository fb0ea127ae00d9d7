//! Bounded mapper→reducer handoff ring.
//!
//! Mappers block when the ring is full (backpressure against a slow
//! reducer); the reducer polls with a short timeout so it can interleave
//! end-of-input and cancellation checks. All waits are bounded.

use kiln_error::{KilnError, Result};
use kiln_types::LogRecord;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const FULL_WAIT: Duration = Duration::from_millis(10);

/// One batch of mapped records bound for a single reducer.
pub type RecordBatch = Vec<LogRecord>;

pub struct BatchRing {
    capacity: usize,
    queue: Mutex<VecDeque<RecordBatch>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl BatchRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Push a batch, blocking while the ring is full.
    ///
    /// Returns `Cancelled` if `cancelled` flips while waiting, so a stuck
    /// reducer cannot wedge its mappers past a cancellation.
    pub fn push(&self, batch: RecordBatch, cancelled: &AtomicBool) -> Result<()> {
        let mut queue = self.queue.lock();
        while queue.len() >= self.capacity {
            if cancelled.load(Ordering::Acquire) {
                return Err(KilnError::Cancelled);
            }
            self.not_full.wait_for(&mut queue, FULL_WAIT);
        }
        queue.push_back(batch);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop one batch, waiting up to `timeout` when the ring is empty.
    ///
    /// `None` after the timeout; the caller decides whether input is truly
    /// exhausted (all mappers done) or just slow.
    pub fn pop(&self, timeout: Duration) -> Option<RecordBatch> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.not_empty.wait_for(&mut queue, timeout);
        }
        let batch = queue.pop_front();
        if batch.is_some() {
            drop(queue);
            self.not_full.notify_one();
        }
        batch
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{Epoch, Ordinal, RecordKey, RecordKind, StorageId};
    use std::sync::Arc;
    use std::thread;

    fn batch(tag: u64) -> RecordBatch {
        vec![LogRecord {
            storage_id: StorageId(1),
            key: RecordKey(tag),
            ordinal: Ordinal(tag),
            epoch: Epoch(1),
            kind: RecordKind::Overwrite,
            payload: Vec::new(),
        }]
    }

    #[test]
    fn push_pop_preserves_fifo() {
        let ring = BatchRing::new(4);
        let cancelled = AtomicBool::new(false);
        for tag in 0..3 {
            ring.push(batch(tag), &cancelled).unwrap();
        }
        for tag in 0..3 {
            let got = ring.pop(Duration::from_millis(1)).unwrap();
            assert_eq!(got[0].key, RecordKey(tag));
        }
        assert!(ring.pop(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn full_ring_blocks_until_drained() {
        let ring = Arc::new(BatchRing::new(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        ring.push(batch(0), &cancelled).unwrap();

        let producer = {
            let ring = Arc::clone(&ring);
            let cancelled = Arc::clone(&cancelled);
            thread::spawn(move || ring.push(batch(1), &cancelled))
        };
        // give the producer a moment to hit the full ring
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        assert!(ring.pop(Duration::from_millis(10)).is_some());
        producer.join().unwrap().unwrap();
        assert_eq!(ring.pop(Duration::from_millis(10)).unwrap()[0].key, RecordKey(1));
    }

    #[test]
    fn cancellation_unblocks_producer() {
        let ring = Arc::new(BatchRing::new(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        ring.push(batch(0), &cancelled).unwrap();

        let producer = {
            let ring = Arc::clone(&ring);
            let cancelled = Arc::clone(&cancelled);
            thread::spawn(move || ring.push(batch(1), &cancelled))
        };
        thread::sleep(Duration::from_millis(20));
        cancelled.store(true, Ordering::Release);
        let err = producer.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}
