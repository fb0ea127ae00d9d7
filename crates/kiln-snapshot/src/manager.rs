//! Long-lived snapshot daemons and the pause-and-swap protocol.
//!
//! The master daemon decides when to snapshot (durable epoch moved,
//! immediate request, or interval elapsed) and drives one run through
//! glean → metadata → savepoint → replace-pointers → publish. One child
//! daemon per node launches that node's mapper and reducer threads when a
//! run is published. All daemons sleep on wakeup channels with 100 ms
//! timeouts so stop requests are observed promptly.

use crate::control::{SnapshotControlBlock, SnapshotRun};
use crate::gleaner::{LogGleaner, RunContext};
use crate::mapper::LogMapper;
use crate::metadata::SnapshotMetadata;
use crate::reducer::LogReducer;
use crate::writer::SnapshotFileSet;
use crate::{LogManager, SavepointManager, Snapshot, SnapshotConfig, XctManager};
use kiln_error::{KilnError, Result};
use kiln_pool::{PagePool, PagePoolOffsetChunk};
use kiln_storage::{ReplacePointersArgs, StorageManager};
use kiln_types::{Epoch, LoggerId, NodeId, SnapshotId, SnapshotPagePointer, StorageId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DAEMON_WAIT: Duration = Duration::from_millis(100);
const TRIGGER_WAIT: Duration = Duration::from_millis(10);
/// Pause window letting in-flight transactions finish before pointers move.
const XCT_DRAIN: Duration = Duration::from_millis(100);

/// Collaborators the snapshot subsystem depends on.
pub struct SnapshotDeps {
    pub log: Arc<dyn LogManager>,
    pub savepoint: Arc<dyn SavepointManager>,
    pub storages: Arc<dyn StorageManager>,
    pub xct: Arc<dyn XctManager>,
    /// Volatile pools indexed by node id; dropped pages return here.
    pub pools: Vec<Arc<PagePool>>,
}

/// The snapshot subsystem's public face and daemon owner.
pub struct SnapshotManager {
    config: SnapshotConfig,
    control: Arc<SnapshotControlBlock>,
    log: Arc<dyn LogManager>,
    savepoint: Arc<dyn SavepointManager>,
    storages: Arc<dyn StorageManager>,
    xct: Arc<dyn XctManager>,
    pools: Vec<Arc<PagePool>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SnapshotManager {
    /// Validate configuration, check collaborator readiness, and seed the
    /// control block from the savepoint. Daemons start with `start()`.
    pub fn new(config: SnapshotConfig, deps: SnapshotDeps) -> Result<Arc<Self>> {
        let config = config.validate()?;
        if deps.pools.len() != usize::from(config.node_count) {
            return Err(KilnError::Config(format!(
                "{} pools for {} nodes",
                deps.pools.len(),
                config.node_count
            )));
        }
        if !deps.log.is_ready() {
            return Err(KilnError::DependencyNotReady("log manager at init"));
        }
        if !deps.savepoint.is_ready() {
            return Err(KilnError::DependencyNotReady("savepoint manager at init"));
        }
        if !deps.storages.is_ready() {
            return Err(KilnError::DependencyNotReady("storage manager at init"));
        }

        let latest_id = deps.savepoint.latest_snapshot_id();
        let latest_epoch = deps.savepoint.latest_snapshot_epoch();
        info!(
            target: "kiln::snapshot::manager",
            event = "manager_init",
            latest_snapshot_id = latest_id.0,
            latest_snapshot_epoch = latest_epoch.0,
            nodes = config.node_count,
            workers_per_run = config.worker_count()
        );
        let control = Arc::new(SnapshotControlBlock::new(latest_id, latest_epoch));
        control.gleaner.set_all_count(config.worker_count());

        Ok(Arc::new(Self {
            config,
            control,
            log: deps.log,
            savepoint: deps.savepoint,
            storages: deps.storages,
            xct: deps.xct,
            pools: deps.pools,
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// Shared control surface: epochs, stop/cancel flags, wakeup channels.
    #[must_use]
    pub fn control(&self) -> &SnapshotControlBlock {
        &self.control
    }

    #[must_use]
    pub fn snapshot_epoch(&self) -> Epoch {
        self.control.snapshot_epoch()
    }

    #[must_use]
    pub fn previous_snapshot_id(&self) -> SnapshotId {
        self.control.previous_snapshot_id()
    }

    /// Free-page counters of one node's volatile pool.
    #[must_use]
    pub fn pool_stat(&self, node: NodeId) -> Option<kiln_pool::PoolStat> {
        self.pools.get(usize::from(node.0)).map(|pool| pool.stat())
    }

    /// Launch the master daemon and one child daemon per node.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(KilnError::Inconsistent(
                "snapshot daemons already started".to_owned(),
            ));
        }

        let master = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("kiln-snap-master".to_owned())
                .spawn(move || master.handle_snapshot())?,
        );
        for node in 0..self.config.node_count {
            let child = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name(format!("kiln-snap-child-{node}"))
                    .spawn(move || child.handle_snapshot_child(NodeId(node)))?,
            );
        }
        Ok(())
    }

    /// Stop and join every daemon. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.control.request_stop();
        self.control.gleaner.cancel();
        self.control.snapshot_wakeup.broadcast();
        self.control.snapshot_children_wakeup.broadcast();
        self.control.snapshot_taken.broadcast();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
        if !self.log.is_ready() {
            return Err(KilnError::DependencyNotReady("log manager at uninit"));
        }
        Ok(())
    }

    /// Ask for a snapshot now. With `wait_completion`, blocks until the
    /// snapshot epoch advances (or stop is requested).
    pub fn trigger_snapshot_immediate(&self, wait_completion: bool) {
        let before = self.control.snapshot_epoch();
        let durable = self.log.durable_global_epoch();
        info!(
            target: "kiln::snapshot::manager",
            event = "immediate_snapshot_requested",
            wait_completion,
            snapshot_epoch = before.0,
            durable_epoch = durable.0
        );
        if before.is_valid() && before == durable {
            debug!(
                target: "kiln::snapshot::manager",
                event = "snapshot_already_latest",
                durable_epoch = durable.0
            );
            return;
        }

        while before == self.control.snapshot_epoch() && !self.control.is_stop_requested() {
            self.control.request_immediate_snapshot();
            self.control.snapshot_wakeup.signal();
            if !wait_completion {
                break;
            }
            self.control.snapshot_taken.wait_timeout(TRIGGER_WAIT);
        }
    }

    // ── Master daemon ───────────────────────────────────────────────────

    fn handle_snapshot(&self) {
        info!(target: "kiln::snapshot::manager", event = "master_daemon_started");
        // Snapshotting cannot start until the rest of the engine is up.
        // The intentional startup spin; acquire loads pair with the
        // engine's release store of the initialized flag.
        while !self.control.is_stop_requested() && !self.control.is_engine_initialized() {
            std::hint::spin_loop();
        }

        let mut previous_snapshot_time = Instant::now();
        let interval = Duration::from_millis(self.config.snapshot_interval_milliseconds);
        while !self.control.is_stop_requested() {
            self.control.snapshot_wakeup.wait_timeout(DAEMON_WAIT);
            if self.control.is_stop_requested() {
                break;
            }

            let durable_epoch = self.log.durable_global_epoch();
            let previous_epoch = self.control.snapshot_epoch();
            let mut triggered = false;
            if !durable_epoch.is_valid() {
                debug!(
                    target: "kiln::snapshot::manager",
                    event = "no_durable_epoch_yet"
                );
            } else if previous_epoch.is_valid() && previous_epoch == durable_epoch {
                debug!(
                    target: "kiln::snapshot::manager",
                    event = "snapshot_already_latest",
                    durable_epoch = durable_epoch.0
                );
            } else if self.control.take_immediate_request() {
                triggered = true;
                info!(
                    target: "kiln::snapshot::manager",
                    event = "snapshot_trigger",
                    reason = "immediate_request"
                );
            } else if previous_snapshot_time.elapsed() >= interval {
                triggered = true;
                info!(
                    target: "kiln::snapshot::manager",
                    event = "snapshot_trigger",
                    reason = "interval_elapsed"
                );
            }

            if !triggered {
                continue;
            }
            match self.handle_snapshot_triggered(durable_epoch) {
                Ok(()) => previous_snapshot_time = Instant::now(),
                Err(e) if e.is_cancelled() => warn!(
                    target: "kiln::snapshot::manager",
                    event = "snapshot_run_cancelled"
                ),
                Err(e) if e.is_fatal() => {
                    // Continuing could corrupt durable state; stop the
                    // engine instead of retrying.
                    error!(
                        target: "kiln::snapshot::manager",
                        event = "snapshot_run_fatal",
                        error = %e
                    );
                    self.control.request_stop();
                }
                Err(e) => error!(
                    target: "kiln::snapshot::manager",
                    event = "snapshot_run_failed",
                    error = %e
                ),
            }
        }
        info!(target: "kiln::snapshot::manager", event = "master_daemon_ended");
    }

    fn handle_snapshot_triggered(&self, durable_epoch: Epoch) -> Result<()> {
        let previous_epoch = self.control.snapshot_epoch();
        if !durable_epoch.is_valid()
            || (previous_epoch.is_valid() && durable_epoch <= previous_epoch)
        {
            return Err(KilnError::Inconsistent(format!(
                "durable epoch {durable_epoch} does not advance past snapshot epoch {previous_epoch}"
            )));
        }

        let previous_id = self.control.previous_snapshot_id();
        let id = if previous_id.is_null() {
            SnapshotId(1)
        } else {
            previous_id.increment()
        };
        let snapshot = Snapshot {
            id,
            base_epoch: previous_epoch.is_valid().then_some(previous_epoch),
            valid_until_epoch: durable_epoch,
            max_storage_id: self.storages.largest_storage_id(),
        };
        info!(
            target: "kiln::snapshot::manager",
            event = "snapshot_started",
            snapshot = id.0,
            base_epoch = previous_epoch.0,
            valid_until_epoch = durable_epoch.0,
            max_storage_id = snapshot.max_storage_id.0
        );

        let new_roots = self.glean_logs(snapshot)?;
        self.snapshot_metadata(&snapshot, &new_roots)?;
        self.snapshot_savepoint(&snapshot)?;
        self.replace_pointers(&snapshot, &new_roots)?;

        // Publish: everything durable and installed. The broadcast after
        // the release store is the happens-before edge for readers.
        self.control.set_previous_snapshot_id(id);
        self.control.set_snapshot_epoch(snapshot.valid_until_epoch);
        self.control.snapshot_taken.broadcast();
        info!(
            target: "kiln::snapshot::manager",
            event = "snapshot_taken",
            snapshot = id.0,
            snapshot_epoch = snapshot.valid_until_epoch.0
        );
        Ok(())
    }

    fn glean_logs(
        &self,
        snapshot: Snapshot,
    ) -> Result<BTreeMap<StorageId, SnapshotPagePointer>> {
        let gleaner = LogGleaner::new(Arc::clone(&self.control), self.config.clone());
        gleaner.execute(snapshot)
    }

    fn snapshot_metadata(
        &self,
        snapshot: &Snapshot,
        new_roots: &BTreeMap<StorageId, SnapshotPagePointer>,
    ) -> Result<()> {
        let storages = self.storages.clone_all_storage_metadata();
        let metadata = SnapshotMetadata::assemble(snapshot, storages, new_roots)?;
        metadata.save_to_file(&self.config)
    }

    /// Coerce any error from the savepoint or pointer-swap steps into a
    /// fatal kind. Past those steps there is no retry: disk and memory are
    /// out of step no matter what originally went wrong.
    fn coerce_fatal(step: &'static str, error: KilnError) -> KilnError {
        if error.is_fatal() {
            error
        } else {
            KilnError::Inconsistent(format!("{step} failed: {error}"))
        }
    }

    fn snapshot_savepoint(&self, snapshot: &Snapshot) -> Result<()> {
        // The savepoint is the source of truth for recovery; even a plain
        // I/O failure here must not be retried as a fresh run.
        self.savepoint
            .take_savepoint_after_snapshot(snapshot.id, snapshot.valid_until_epoch)
            .map_err(|e| Self::coerce_fatal("savepoint update", e))?;
        if self.savepoint.latest_snapshot_id() != snapshot.id
            || self.savepoint.latest_snapshot_epoch() != snapshot.valid_until_epoch
        {
            return Err(KilnError::Inconsistent(
                "savepoint does not reflect the snapshot it just recorded".to_owned(),
            ));
        }
        Ok(())
    }

    /// Pause transactions, swing pointers storage by storage, resume, and
    /// flush dropped pages to their pools.
    fn replace_pointers(
        &self,
        snapshot: &Snapshot,
        new_roots: &BTreeMap<StorageId, SnapshotPagePointer>,
    ) -> Result<()> {
        let node_count = usize::from(self.config.node_count);
        let mut dropped_chunks: Vec<PagePoolOffsetChunk> =
            (0..node_count).map(|_| PagePoolOffsetChunk::new()).collect();
        let fileset = SnapshotFileSet::new(self.config.clone());
        let cancel = self.control.gleaner.cancel_flag();

        self.xct.pause_accepting_xct();
        thread::sleep(XCT_DRAIN);
        info!(
            target: "kiln::snapshot::manager",
            event = "xct_paused_for_pointer_swap",
            snapshot = snapshot.id.0
        );

        let started = Instant::now();
        let mut result = Ok(());
        let mut installed_total = 0_u64;
        let mut dropped_total = 0_u64;
        for (&storage_id, &new_root) in new_roots {
            let Some(composer) = self.storages.composer_for(storage_id) else {
                result = Err(KilnError::Inconsistent(format!(
                    "no composer for storage {storage_id} during pointer replacement"
                )));
                break;
            };
            match composer.replace_pointers(ReplacePointersArgs {
                valid_until_epoch: snapshot.valid_until_epoch,
                source: &fileset,
                new_root,
                dropped_chunks: &mut dropped_chunks,
                pools: &self.pools,
                cancelled: &cancel,
            }) {
                Ok(report) => {
                    installed_total += report.installed;
                    dropped_total += report.dropped;
                }
                Err(e) => {
                    error!(
                        target: "kiln::snapshot::manager",
                        event = "replace_pointers_failed",
                        storage = storage_id.0,
                        error = %e
                    );
                    result = Err(e);
                    break;
                }
            }
        }
        self.xct.resume_accepting_xct();
        info!(
            target: "kiln::snapshot::manager",
            event = "pointer_swap_done",
            snapshot = snapshot.id.0,
            installed = installed_total,
            dropped = dropped_total,
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        for (node, chunk) in dropped_chunks.iter_mut().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let count = chunk.size();
            if let Err(e) = self.pools[node].release(count, chunk) {
                error!(
                    target: "kiln::snapshot::manager",
                    event = "dropped_chunk_flush_failed",
                    node,
                    error = %e
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        // A failing composer may already have swung some of its pointers,
        // and earlier storages certainly have; there is no undo, so every
        // error leaving this step is fatal.
        result.map_err(|e| Self::coerce_fatal("pointer replacement", e))
    }

    // ── Child daemons ───────────────────────────────────────────────────

    fn handle_snapshot_child(&self, node: NodeId) {
        info!(
            target: "kiln::snapshot::manager",
            event = "child_daemon_started",
            node = node.0
        );
        let mut previous_id = self.control.gleaner.cur_snapshot_id();
        while !self.control.is_stop_requested() {
            let current_id = self.control.gleaner.cur_snapshot_id();
            if current_id.is_null() || current_id == previous_id {
                self.control.snapshot_children_wakeup.wait_timeout(DAEMON_WAIT);
                continue;
            }
            let Some(run) = self.control.gleaner.current_run() else {
                previous_id = current_id;
                continue;
            };
            info!(
                target: "kiln::snapshot::manager",
                event = "child_dispatching_workers",
                node = node.0,
                snapshot = current_id.0
            );
            self.run_node_workers(node, run);
            info!(
                target: "kiln::snapshot::manager",
                event = "child_joined_workers",
                node = node.0,
                snapshot = current_id.0
            );
            previous_id = current_id;
        }
        info!(
            target: "kiln::snapshot::manager",
            event = "child_daemon_ended",
            node = node.0
        );
    }

    /// Launch this node's reducer and mappers for the published run and
    /// join them all.
    fn run_node_workers(&self, node: NodeId, run: Arc<SnapshotRun>) {
        let ctx = Arc::new(RunContext {
            control: Arc::clone(&self.control),
            run,
            log: Arc::clone(&self.log),
            storages: Arc::clone(&self.storages),
            config: self.config.clone(),
        });

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        {
            let worker_ctx = Arc::clone(&ctx);
            let spawned = thread::Builder::new()
                .name(format!("kiln-reducer-{}", node.0))
                .spawn(move || {
                    let result = LogReducer::new(node).run(&worker_ctx);
                    Self::finish_worker(&worker_ctx, "reducer", node, result);
                });
            Self::track_worker(&ctx, spawned, &mut workers);
        }
        for logger in 0..self.config.loggers_per_node {
            let worker_ctx = Arc::clone(&ctx);
            let spawned = thread::Builder::new()
                .name(format!("kiln-mapper-{}-{logger}", node.0))
                .spawn(move || {
                    let result = LogMapper::new(node, LoggerId(logger)).run(&worker_ctx);
                    worker_ctx.run.mapper_finished();
                    Self::finish_worker(&worker_ctx, "mapper", node, result);
                });
            if spawned.is_err() {
                // the reducer waits on mapper accounting; settle it
                ctx.run.mapper_finished();
            }
            Self::track_worker(&ctx, spawned, &mut workers);
        }
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn track_worker(
        ctx: &RunContext,
        spawned: std::io::Result<JoinHandle<()>>,
        workers: &mut Vec<JoinHandle<()>>,
    ) {
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                let error = KilnError::from(e);
                error!(
                    target: "kiln::snapshot::manager",
                    event = "worker_spawn_failed",
                    error = %error
                );
                ctx.control.gleaner.record_worker_error(&error);
                ctx.control.gleaner.mark_worker_completed();
            }
        }
    }

    fn finish_worker(ctx: &RunContext, role: &str, node: NodeId, result: Result<()>) {
        match result {
            Ok(()) => debug!(
                target: "kiln::snapshot::manager",
                event = "worker_finished",
                role,
                node = node.0
            ),
            Err(e) if e.is_cancelled() => debug!(
                target: "kiln::snapshot::manager",
                event = "worker_cancelled",
                role,
                node = node.0
            ),
            Err(e) => {
                error!(
                    target: "kiln::snapshot::manager",
                    event = "worker_failed",
                    role,
                    node = node.0,
                    error = %e
                );
                ctx.control.gleaner.record_worker_error(&e);
            }
        }
        ctx.control.gleaner.mark_worker_completed();
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        // Daemon threads hold their own Arcs, so by the time this runs they
        // are already gone; still cover the never-started case.
        self.control.request_stop();
        self.control.snapshot_wakeup.broadcast();
        self.control.snapshot_children_wakeup.broadcast();
    }
}
