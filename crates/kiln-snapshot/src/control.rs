//! Process-wide snapshot control block.
//!
//! One `SnapshotControlBlock` exists per engine. It is a single value that
//! owns its synchronization primitives: every mutable field is either an
//! atomic with the ordering documented at its use sites or sits behind the
//! paired mutex of a wakeup channel. The master daemon, child daemons and
//! `trigger_snapshot_immediate` callers all coordinate through it.

use crate::ring::BatchRing;
use crate::Snapshot;
use kiln_types::{NodeId, SnapshotId, SnapshotPagePointer, StorageId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

// ── Wakeup channels ─────────────────────────────────────────────────────────

/// Mutex/condvar pair for bounded timed waits.
///
/// Waiters always use a timeout so stop requests are observed within one
/// wait interval even if a signal is missed.
#[derive(Debug, Default)]
pub struct WakeupChannel {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WakeupChannel {
    /// Block until signalled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.mutex.lock();
        self.cond.wait_for(&mut guard, timeout);
    }

    pub fn signal(&self) {
        let _guard = self.mutex.lock();
        self.cond.notify_one();
    }

    pub fn broadcast(&self) {
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }
}

// ── Per-run shared state ────────────────────────────────────────────────────

/// Shared state of one snapshot run, published by the gleaner and picked up
/// by every child daemon.
pub struct SnapshotRun {
    pub snapshot: Snapshot,
    /// One inbox per node; mappers push, the node's reducer drains.
    rings: Vec<Arc<BatchRing>>,
    /// Mappers that have not finished shipping yet. Reducers drain their
    /// ring until this reaches zero and the ring is empty.
    active_mappers: AtomicU32,
    /// New root pointer per storage, tagged with the contributing node.
    results: Mutex<BTreeMap<StorageId, (NodeId, SnapshotPagePointer)>>,
}

impl SnapshotRun {
    #[must_use]
    pub fn new(snapshot: Snapshot, node_count: u16, mapper_count: u32, ring_capacity: usize) -> Self {
        Self {
            snapshot,
            rings: (0..node_count)
                .map(|_| Arc::new(BatchRing::new(ring_capacity)))
                .collect(),
            active_mappers: AtomicU32::new(mapper_count),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn ring(&self, node: NodeId) -> Arc<BatchRing> {
        Arc::clone(&self.rings[node.0 as usize])
    }

    /// Called once by every mapper when it stops shipping, success or not.
    pub fn mapper_finished(&self) {
        self.active_mappers.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn mappers_active(&self) -> bool {
        self.active_mappers.load(Ordering::Acquire) != 0
    }

    pub fn publish_root(&self, storage: StorageId, node: NodeId, root: SnapshotPagePointer) {
        self.results.lock().insert(storage, (node, root));
    }

    #[must_use]
    pub fn take_results(&self) -> BTreeMap<StorageId, (NodeId, SnapshotPagePointer)> {
        std::mem::take(&mut *self.results.lock())
    }
}

// ── Gleaner sub-block ───────────────────────────────────────────────────────

/// Coordination state of the currently gleaning run, if any.
pub struct GleanerControl {
    /// Id of the run children should be working on; 0 when idle.
    cur_snapshot_id: AtomicU32,
    run: Mutex<Option<Arc<SnapshotRun>>>,
    /// Cooperative cancellation flag, polled at work-unit boundaries.
    cancelled: Arc<AtomicBool>,
    /// Workers (mappers + reducers) that finished this run.
    completed_count: AtomicU32,
    /// Total workers expected per run, fixed at engine init.
    all_count: AtomicU32,
    /// First worker error of the run, for the abort log line.
    first_error: Mutex<Option<String>>,
}

impl GleanerControl {
    fn new() -> Self {
        Self {
            cur_snapshot_id: AtomicU32::new(0),
            run: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
            completed_count: AtomicU32::new(0),
            all_count: AtomicU32::new(0),
            first_error: Mutex::new(None),
        }
    }

    pub fn set_all_count(&self, all_count: u32) {
        self.all_count.store(all_count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn all_count(&self) -> u32 {
        self.all_count.load(Ordering::Relaxed)
    }

    /// Publish a new run and reset per-run state. Release-ordered store of
    /// the id is the signal children poll for.
    pub fn publish_run(&self, run: Arc<SnapshotRun>) {
        let id = run.snapshot.id;
        *self.first_error.lock() = None;
        self.completed_count.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Release);
        *self.run.lock() = Some(run);
        self.cur_snapshot_id.store(id.0, Ordering::Release);
    }

    /// Retire the current run (idempotent).
    pub fn clear_run(&self) {
        self.cur_snapshot_id.store(0, Ordering::Release);
        *self.run.lock() = None;
    }

    /// Id the children should work on; null when idle.
    #[must_use]
    pub fn cur_snapshot_id(&self) -> SnapshotId {
        SnapshotId(self.cur_snapshot_id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_gleaning(&self) -> bool {
        !self.cur_snapshot_id().is_null()
    }

    #[must_use]
    pub fn current_run(&self) -> Option<Arc<SnapshotRun>> {
        self.run.lock().clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Shared handle to the cancellation flag, for composer call sites.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Record a worker failure: remembers the first error and cancels the
    /// rest of the run.
    pub fn record_worker_error(&self, error: &kiln_error::KilnError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(error.to_string());
        }
        drop(first);
        self.cancel();
    }

    #[must_use]
    pub fn take_first_error(&self) -> Option<String> {
        self.first_error.lock().take()
    }

    /// Called exactly once per worker per run, after success or failure.
    pub fn mark_worker_completed(&self) {
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn completed_count(&self) -> u32 {
        self.completed_count.load(Ordering::Acquire)
    }
}

// ── Control block ───────────────────────────────────────────────────────────

/// Process-wide coordination state of the snapshot subsystem.
pub struct SnapshotControlBlock {
    /// Epoch of the latest published snapshot (0 = none yet). Published
    /// with Release under the `snapshot_taken` channel's broadcast.
    snapshot_epoch: AtomicU32,
    previous_snapshot_id: AtomicU32,
    immediate_snapshot_requested: AtomicBool,
    stop_requested: AtomicBool,
    /// Set by the engine once every module is initialized; the master
    /// daemon spin-waits on it with acquire loads before its first run.
    engine_initialized: AtomicBool,
    pub gleaner: GleanerControl,
    /// Wakes the master daemon out of its interval sleep.
    pub snapshot_wakeup: WakeupChannel,
    /// Wakes child daemons when a run is published.
    pub snapshot_children_wakeup: WakeupChannel,
    /// Broadcast after a snapshot is fully published.
    pub snapshot_taken: WakeupChannel,
}

impl SnapshotControlBlock {
    #[must_use]
    pub fn new(latest_id: SnapshotId, latest_epoch: kiln_types::Epoch) -> Self {
        Self {
            snapshot_epoch: AtomicU32::new(latest_epoch.0),
            previous_snapshot_id: AtomicU32::new(latest_id.0),
            immediate_snapshot_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            engine_initialized: AtomicBool::new(false),
            gleaner: GleanerControl::new(),
            snapshot_wakeup: WakeupChannel::default(),
            snapshot_children_wakeup: WakeupChannel::default(),
            snapshot_taken: WakeupChannel::default(),
        }
    }

    #[must_use]
    pub fn snapshot_epoch(&self) -> kiln_types::Epoch {
        kiln_types::Epoch(self.snapshot_epoch.load(Ordering::Acquire))
    }

    pub fn set_snapshot_epoch(&self, epoch: kiln_types::Epoch) {
        self.snapshot_epoch.store(epoch.0, Ordering::Release);
    }

    #[must_use]
    pub fn previous_snapshot_id(&self) -> SnapshotId {
        SnapshotId(self.previous_snapshot_id.load(Ordering::Acquire))
    }

    pub fn set_previous_snapshot_id(&self, id: SnapshotId) {
        self.previous_snapshot_id.store(id.0, Ordering::Release);
    }

    pub fn request_immediate_snapshot(&self) {
        self.immediate_snapshot_requested.store(true, Ordering::Release);
    }

    /// Consume a pending immediate request, if any.
    #[must_use]
    pub fn take_immediate_request(&self) -> bool {
        self.immediate_snapshot_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn mark_engine_initialized(&self) {
        self.engine_initialized.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_engine_initialized(&self) -> bool {
        self.engine_initialized.load(Ordering::Acquire)
    }
}
