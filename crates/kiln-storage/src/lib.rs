#![forbid(unsafe_code)]
//! Storage metadata, volatile page trees and snapshot composers.
//!
//! A storage is a keyed collection of records with a dual-pointer page tree:
//! every child slot carries an optional volatile page (owned by a node's
//! `PagePool`) and a stable snapshot page pointer. The snapshot pipeline
//! folds sorted redo logs into new snapshot pages (`Composer::compose`) and
//! later swings the live tree's pointers to them (`Composer::
//! replace_pointers`), dropping covered volatile pages back into the pool.

pub mod composer;
pub mod layout;
pub mod manager;
pub mod overwrite;

pub use composer::{ComposeArgs, Composer, ReplacePointersArgs, ReplaceReport};
pub use manager::MemoryStorageManager;
pub use overwrite::OverwriteStorage;

use kiln_error::{KilnError, Result};
use kiln_types::{NodeId, PAGE_SIZE, PageData, RecordKey, SnapshotPagePointer, StorageId};
use serde::{Deserialize, Serialize};

// ── Snapshot page I/O seams ─────────────────────────────────────────────────

/// Destination for newly composed snapshot pages.
///
/// Pages are assigned monotonically increasing local page ids within one
/// node's snapshot file; the root page of a storage is always written last.
pub trait PageSink {
    fn node(&self) -> NodeId;

    /// Write one page and return its stable pointer.
    fn write_page(&mut self, body: &PageData) -> Result<SnapshotPagePointer>;
}

/// Read access to already-durable snapshot pages, addressed by pointer.
pub trait PageSource: Send + Sync {
    fn read_page(&self, pointer: SnapshotPagePointer, out: &mut PageData) -> Result<()>;
}

// ── Storage metadata ────────────────────────────────────────────────────────

/// Kind tag selecting the composer variant for a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Fixed-capacity keyed record store with last-writer-wins overwrites.
    Overwrite,
}

/// Durable description of one storage.
///
/// Cloned into every snapshot's metadata file; `root_snapshot_page_id` is
/// the only field the snapshot pipeline rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMeta {
    pub id: StorageId,
    pub kind: StorageKind,
    pub name: String,
    /// Number of addressable records; keys are `[0, key_capacity)`.
    pub key_capacity: u64,
    /// Fixed payload size of one record, in bytes.
    pub record_size: u16,
    /// Node owning this storage's volatile pages and snapshot partitions.
    pub home_node: NodeId,
    pub root_snapshot_page_id: SnapshotPagePointer,
}

impl StorageMeta {
    /// Records that fit in one leaf page.
    #[must_use]
    pub fn records_per_leaf(&self) -> u64 {
        ((PAGE_SIZE - layout::LEAF_HEADER_SIZE) / self.record_size as usize) as u64
    }

    /// Leaf pages needed to cover the key space.
    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.key_capacity.div_ceil(self.records_per_leaf())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.id.is_valid() {
            return Err(KilnError::Config("storage id 0 is invalid".to_owned()));
        }
        if self.record_size == 0
            || self.record_size as usize > PAGE_SIZE - layout::LEAF_HEADER_SIZE
        {
            return Err(KilnError::Config(format!(
                "record_size {} does not fit a leaf page",
                self.record_size
            )));
        }
        if self.key_capacity == 0 {
            return Err(KilnError::Config("key_capacity must be > 0".to_owned()));
        }
        if self.leaf_count() > layout::MAX_ROOT_FANOUT as u64 {
            return Err(KilnError::Config(format!(
                "key_capacity {} needs {} leaves, root page holds {}",
                self.key_capacity,
                self.leaf_count(),
                layout::MAX_ROOT_FANOUT
            )));
        }
        Ok(())
    }

    /// Leaf index owning `key`.
    #[must_use]
    pub fn leaf_of(&self, key: RecordKey) -> u64 {
        key.0 / self.records_per_leaf()
    }

    /// Record slot of `key` within its leaf.
    #[must_use]
    pub fn slot_of(&self, key: RecordKey) -> u64 {
        key.0 % self.records_per_leaf()
    }
}

// ── Partitioning ────────────────────────────────────────────────────────────

/// Per-storage function mapping keys to the node whose reducer owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// Non-partitioned storage: every key lives on one designated node.
    SingleNode { home: NodeId },
}

impl Partitioner {
    #[must_use]
    pub fn node_of(&self, _key: RecordKey) -> NodeId {
        match self {
            Self::SingleNode { home } => *home,
        }
    }
}

// ── Storage manager seam ────────────────────────────────────────────────────

/// Collaborator contract of the storage manager.
///
/// The snapshot pipeline only ever sees storages through this trait: it
/// enumerates metadata when writing a snapshot's metadata file and asks for
/// composers/partitioners per storage id.
pub trait StorageManager: Send + Sync {
    /// False until the module finished initialization (or after teardown).
    fn is_ready(&self) -> bool {
        true
    }

    /// Largest allocated storage id, 0 when no storage exists.
    fn largest_storage_id(&self) -> StorageId;

    fn clone_all_storage_metadata(&self) -> Vec<StorageMeta>;

    fn composer_for(&self, id: StorageId) -> Option<Composer>;

    fn partitioner_for(&self, id: StorageId) -> Option<Partitioner>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key_capacity: u64, record_size: u16) -> StorageMeta {
        StorageMeta {
            id: StorageId(1),
            kind: StorageKind::Overwrite,
            name: "accounts".to_owned(),
            key_capacity,
            record_size,
            home_node: NodeId(0),
            root_snapshot_page_id: SnapshotPagePointer::NULL,
        }
    }

    #[test]
    fn leaf_math_covers_key_space() {
        let m = meta(1000, 16);
        assert_eq!(m.records_per_leaf(), 255);
        assert_eq!(m.leaf_count(), 4);
        assert_eq!(m.leaf_of(RecordKey(0)), 0);
        assert_eq!(m.leaf_of(RecordKey(254)), 0);
        assert_eq!(m.leaf_of(RecordKey(255)), 1);
        assert_eq!(m.slot_of(RecordKey(256)), 1);
    }

    #[test]
    fn validate_rejects_degenerate_shapes() {
        assert!(meta(1000, 16).validate().is_ok());
        assert!(meta(0, 16).validate().is_err());
        assert!(meta(1000, 0).validate().is_err());
        // 510 leaves is the root fanout ceiling
        assert!(meta(255 * 510, 16).validate().is_ok());
        assert!(meta(255 * 510 + 1, 16).validate().is_err());
    }

    #[test]
    fn single_node_partitioner_is_constant() {
        let p = Partitioner::SingleNode { home: NodeId(3) };
        assert_eq!(p.node_of(RecordKey(0)), NodeId(3));
        assert_eq!(p.node_of(RecordKey(u64::MAX)), NodeId(3));
    }
}
