//! Master-side coordinator of one snapshot run.
//!
//! The gleaner publishes the run into the control block, wakes the child
//! daemons, polls for completion, and harvests the per-storage root
//! pointers the reducers produced. Cancellation is cooperative: workers
//! observe the control block's flag at work-unit boundaries and still
//! report completion, so the poll loop converges either way.

use crate::control::{SnapshotControlBlock, SnapshotRun};
use crate::{LogManager, Snapshot, SnapshotConfig};
use kiln_error::{KilnError, Result};
use kiln_storage::StorageManager;
use kiln_types::{SnapshotPagePointer, StorageId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to keep waiting for worker completions after cancellation,
/// covering children that never got to dispatch their workers.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Everything a mapper or reducer thread needs for one run.
pub struct RunContext {
    pub control: Arc<SnapshotControlBlock>,
    pub run: Arc<SnapshotRun>,
    pub log: Arc<dyn LogManager>,
    pub storages: Arc<dyn StorageManager>,
    pub config: SnapshotConfig,
}

/// Lifecycle of one run, for the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GleanerPhase {
    Dispatched,
    Running,
    Completed,
    Cancelled,
}

pub struct LogGleaner {
    control: Arc<SnapshotControlBlock>,
    config: SnapshotConfig,
}

impl LogGleaner {
    #[must_use]
    pub fn new(control: Arc<SnapshotControlBlock>, config: SnapshotConfig) -> Self {
        Self { control, config }
    }

    /// Drive one run end-to-end and return the new root pointer per storage.
    pub fn execute(
        &self,
        snapshot: Snapshot,
    ) -> Result<BTreeMap<StorageId, SnapshotPagePointer>> {
        let mapper_count =
            u32::from(self.config.node_count) * u32::from(self.config.loggers_per_node);
        let run = Arc::new(SnapshotRun::new(
            snapshot,
            self.config.node_count,
            mapper_count,
            self.config.ring_capacity_batches,
        ));

        let gleaner = &self.control.gleaner;
        gleaner.publish_run(Arc::clone(&run));
        self.control.snapshot_children_wakeup.broadcast();
        let all_count = gleaner.all_count();
        let mut phase = GleanerPhase::Dispatched;
        info!(
            target: "kiln::snapshot::gleaner",
            event = "run_dispatched",
            snapshot = snapshot.id.0,
            workers = all_count,
            phase = ?phase
        );

        let mut cancel_deadline: Option<Instant> = None;
        loop {
            let completed = gleaner.completed_count();
            if completed >= all_count {
                break;
            }
            if phase == GleanerPhase::Dispatched && completed > 0 {
                phase = GleanerPhase::Running;
                debug!(
                    target: "kiln::snapshot::gleaner",
                    event = "run_progress",
                    snapshot = snapshot.id.0,
                    phase = ?phase
                );
            }
            if self.control.is_stop_requested() {
                gleaner.cancel();
            }
            if gleaner.is_cancelled() {
                let deadline = *cancel_deadline.get_or_insert_with(|| Instant::now() + CANCEL_GRACE);
                if Instant::now() >= deadline {
                    warn!(
                        target: "kiln::snapshot::gleaner",
                        event = "cancel_grace_expired",
                        snapshot = snapshot.id.0,
                        completed,
                        expected = all_count
                    );
                    break;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }

        gleaner.clear_run();

        if gleaner.is_cancelled() {
            phase = GleanerPhase::Cancelled;
            let first_error = gleaner.take_first_error();
            error!(
                target: "kiln::snapshot::gleaner",
                event = "run_cancelled",
                snapshot = snapshot.id.0,
                phase = ?phase,
                first_error = first_error.as_deref().unwrap_or("cooperative stop")
            );
            return Err(KilnError::Cancelled);
        }

        let results = run.take_results();
        let roots = Self::aggregate_roots(results)?;
        phase = GleanerPhase::Completed;
        info!(
            target: "kiln::snapshot::gleaner",
            event = "run_completed",
            snapshot = snapshot.id.0,
            phase = ?phase,
            storages_with_new_roots = roots.len()
        );
        Ok(roots)
    }

    /// Collapse per-node contributions into the final root per storage.
    ///
    /// Non-partitioned storages have exactly one contributing node, so the
    /// per-node root is final. A partitioned storage kind would compose a
    /// top-level root from per-partition roots here.
    fn aggregate_roots(
        results: BTreeMap<StorageId, (kiln_types::NodeId, SnapshotPagePointer)>,
    ) -> Result<BTreeMap<StorageId, SnapshotPagePointer>> {
        let mut roots = BTreeMap::new();
        for (storage, (node, root)) in results {
            if root.is_null() {
                return Err(KilnError::Inconsistent(format!(
                    "reducer on node {node} published a null root for storage {storage}"
                )));
            }
            roots.insert(storage, root);
        }
        Ok(roots)
    }
}
