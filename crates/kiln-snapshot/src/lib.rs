#![forbid(unsafe_code)]
//! Snapshot pipeline for the Kiln engine.
//!
//! A snapshot run is a scatter-gather over the durable redo log: per-node
//! mappers partition log records by `(storage, key)`, per-node reducers
//! merge-sort them and invoke each storage's composer to emit immutable
//! snapshot pages, and the master-side gleaner aggregates the new root
//! pointers. The long-lived `SnapshotManager` decides when to run, persists
//! metadata and the savepoint, and swings live tree pointers to the new
//! snapshot while transactions are briefly paused.
//!
//! Collaborators outside this crate (log manager, savepoint manager,
//! storage manager, transaction manager) are reached only through the
//! traits defined here and `kiln_storage::StorageManager`.

pub mod control;
pub mod gleaner;
pub mod manager;
pub mod mapper;
pub mod metadata;
pub mod reducer;
pub mod ring;
pub mod writer;

pub use control::SnapshotControlBlock;
pub use manager::{SnapshotDeps, SnapshotManager};
pub use metadata::SnapshotMetadata;
pub use writer::{SnapshotFileSet, SnapshotWriter};

use kiln_error::{KilnError, Result};
use kiln_types::{Epoch, LogRecord, LoggerId, NodeId, SnapshotId, StorageId};
use std::path::PathBuf;

/// Placeholder replaced by the node index in `folder_path_pattern`.
pub const NODE_PLACEHOLDER: &str = "$NODE$";

// ── One snapshot run ────────────────────────────────────────────────────────

/// Immutable description of one snapshot, fixed at trigger time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// The previous snapshot's `valid_until_epoch`, `None` for the first.
    pub base_epoch: Option<Epoch>,
    /// Durable global epoch captured at trigger time; everything committed
    /// up to and including it is in the snapshot.
    pub valid_until_epoch: Epoch,
    /// Largest allocated storage id at trigger time.
    pub max_storage_id: StorageId,
}

// ── Collaborator contracts ──────────────────────────────────────────────────

/// Streaming reader over one logger's durable segment, in epoch order.
pub trait LogSegmentReader: Send {
    /// Next batch of records, at most `max_records`. Empty means end of
    /// segment. Only durable, committed records are ever returned.
    fn next_batch(&mut self, max_records: usize) -> Result<Vec<LogRecord>>;
}

/// Collaborator contract of the log manager.
pub trait LogManager: Send + Sync {
    /// False until the module finished initialization (or after teardown).
    fn is_ready(&self) -> bool {
        true
    }

    /// Greatest epoch whose logs are fsynced on all loggers.
    fn durable_global_epoch(&self) -> Epoch;

    /// Open one logger's segment over `(from_exclusive, to_inclusive]`.
    fn open_segment(
        &self,
        node: NodeId,
        logger: LoggerId,
        from_exclusive: Option<Epoch>,
        to_inclusive: Epoch,
    ) -> Result<Box<dyn LogSegmentReader>>;
}

/// Collaborator contract of the savepoint manager.
///
/// The savepoint is the source of truth for recovery: a snapshot exists
/// once `take_savepoint_after_snapshot` returns.
pub trait SavepointManager: Send + Sync {
    fn is_ready(&self) -> bool {
        true
    }

    fn latest_snapshot_id(&self) -> SnapshotId;

    fn latest_snapshot_epoch(&self) -> Epoch;

    /// Atomically and durably record `(id, epoch)` as the latest snapshot.
    fn take_savepoint_after_snapshot(&self, id: SnapshotId, epoch: Epoch) -> Result<()>;
}

/// Collaborator contract of the transaction manager.
pub trait XctManager: Send + Sync {
    /// Stop admitting new transactions. In-flight ones keep running; the
    /// caller waits a drain interval before touching shared pointers.
    fn pause_accepting_xct(&self);

    fn resume_accepting_xct(&self);
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Tunables of the snapshot subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Baseline trigger period for the master daemon.
    pub snapshot_interval_milliseconds: u64,
    /// Per-node snapshot folder template; must contain `$NODE$`.
    pub folder_path_pattern: String,
    /// Folder receiving `snapshot_metadata_<id>.xml`.
    pub primary_folder_path: PathBuf,
    /// Mapper fan-out per node.
    pub loggers_per_node: u16,
    /// NUMA node count; one reducer and one child daemon each.
    pub node_count: u16,
    /// Records a mapper reads from its segment per work unit.
    pub mapper_batch_records: usize,
    /// In-memory budget of a reducer before it spills a sorted run.
    pub reducer_buffer_kb: usize,
    /// Batches a mapper→reducer ring holds before producers block.
    pub ring_capacity_batches: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_milliseconds: 60_000,
            folder_path_pattern: "snapshots/node_$NODE$".to_owned(),
            primary_folder_path: PathBuf::from("snapshots"),
            loggers_per_node: 1,
            node_count: 1,
            mapper_batch_records: 1024,
            reducer_buffer_kb: 256,
            ring_capacity_batches: 16,
        }
    }
}

impl SnapshotConfig {
    pub fn validate(self) -> Result<Self> {
        if self.node_count == 0 || self.node_count > 256 {
            return Err(KilnError::Config(
                "node_count must be in 1..=256 (pointer node width)".to_owned(),
            ));
        }
        if self.loggers_per_node == 0 {
            return Err(KilnError::Config("loggers_per_node must be > 0".to_owned()));
        }
        if !self.folder_path_pattern.contains(NODE_PLACEHOLDER) {
            return Err(KilnError::Config(format!(
                "folder_path_pattern must contain {NODE_PLACEHOLDER}"
            )));
        }
        if self.mapper_batch_records == 0
            || self.reducer_buffer_kb == 0
            || self.ring_capacity_batches == 0
        {
            return Err(KilnError::Config(
                "mapper/reducer/ring sizes must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }

    /// Snapshot folder of one node.
    #[must_use]
    pub fn node_folder(&self, node: NodeId) -> PathBuf {
        PathBuf::from(
            self.folder_path_pattern
                .replace(NODE_PLACEHOLDER, &node.0.to_string()),
        )
    }

    /// Data file holding one node's pages of one snapshot.
    #[must_use]
    pub fn data_file_path(&self, node: NodeId, id: SnapshotId) -> PathBuf {
        self.node_folder(node).join(format!("snapshot_{}.data", id.0))
    }

    /// Metadata file of one snapshot.
    #[must_use]
    pub fn metadata_file_path(&self, id: SnapshotId) -> PathBuf {
        self.primary_folder_path
            .join(format!("snapshot_metadata_{}.xml", id.0))
    }

    /// Workers participating in one run: one reducer per node plus the
    /// mapper fan-out.
    #[must_use]
    pub fn worker_count(&self) -> u32 {
        let reducers = u32::from(self.node_count);
        let mappers = reducers * u32::from(self.loggers_per_node);
        reducers + mappers
    }
}
