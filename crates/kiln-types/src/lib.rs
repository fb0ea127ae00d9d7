#![forbid(unsafe_code)]
//! Shared identifiers and wire-stable types for the Kiln engine.
//!
//! Everything here is either a unit-carrying newtype (to prevent mixing
//! epochs, storage ids and page offsets) or a type whose byte layout must
//! stay stable across a deployment (`SnapshotPagePointer`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed page size, in bytes, for both volatile and snapshot pages.
pub const PAGE_SIZE: usize = 4096;

/// Raw body of one page.
pub type PageData = [u8; PAGE_SIZE];

/// Returns a zeroed page body.
#[must_use]
pub fn zeroed_page() -> Box<PageData> {
    Box::new([0_u8; PAGE_SIZE])
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Epochs ──────────────────────────────────────────────────────────────────

/// Logical time unit advanced by the transaction manager.
///
/// Epoch 0 is reserved as "invalid". Epochs are treated as monotonically
/// increasing within a deployment; `next()` skips 0 on wrap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Successor epoch, skipping the reserved 0.
    #[must_use]
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

// ── Snapshot identifiers ────────────────────────────────────────────────────

/// Identifier of one published snapshot. 0 is reserved as null.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Successor id, skipping the reserved null id on wrap.
    #[must_use]
    pub fn increment(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one storage. 0 is invalid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StorageId(pub u32);

impl StorageId {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NUMA node index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node logger index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoggerId(pub u16);

/// Strictly monotonic per-logger sequence number.
///
/// Breaks ties between log records that carry the same key: the record with
/// the larger ordinal is the later write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Ordinal(pub u64);

/// Record key within one storage.
///
/// Keys are normalized to a fixed 64-bit slice so sorting and partitioning
/// are storage-agnostic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RecordKey(pub u64);

// ── Page addressing ─────────────────────────────────────────────────────────

/// Offset of a page within one node's volatile page pool, in pages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PagePoolOffset(pub u32);

const POINTER_NODE_BITS: u32 = 8;
const POINTER_LOCAL_BITS: u32 = 24;
const POINTER_LOCAL_MASK: u64 = (1 << POINTER_LOCAL_BITS) - 1;
const POINTER_NODE_MASK: u64 = (1 << POINTER_NODE_BITS) - 1;

/// Stable 64-bit address of a page inside a snapshot file.
///
/// Layout, high to low: `snapshot_id:32 | node:8 | local_page_id:24`.
/// The split is fixed for a deployment and round-trips through metadata.
/// 0 is the null pointer; valid local page ids start at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SnapshotPagePointer(pub u64);

impl SnapshotPagePointer {
    pub const NULL: Self = Self(0);

    /// Maximum number of pages addressable within one node's snapshot file.
    pub const MAX_LOCAL_PAGES: u64 = POINTER_LOCAL_MASK;

    pub fn new(snapshot_id: SnapshotId, node: NodeId, local_page_id: u64) -> Result<Self, TypeError> {
        if snapshot_id.is_null() {
            return Err(TypeError::InvalidField {
                field: "snapshot_id",
                reason: "null snapshot id in page pointer",
            });
        }
        if u64::from(node.0) > POINTER_NODE_MASK {
            return Err(TypeError::InvalidField {
                field: "node",
                reason: "node index exceeds pointer width",
            });
        }
        if local_page_id == 0 || local_page_id > POINTER_LOCAL_MASK {
            return Err(TypeError::InvalidField {
                field: "local_page_id",
                reason: "local page id out of pointer range",
            });
        }
        Ok(Self(
            (u64::from(snapshot_id.0) << (POINTER_NODE_BITS + POINTER_LOCAL_BITS))
                | (u64::from(node.0) << POINTER_LOCAL_BITS)
                | local_page_id,
        ))
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn snapshot_id(self) -> SnapshotId {
        SnapshotId((self.0 >> (POINTER_NODE_BITS + POINTER_LOCAL_BITS)) as u32)
    }

    #[must_use]
    pub fn node(self) -> NodeId {
        NodeId(((self.0 >> POINTER_LOCAL_BITS) & POINTER_NODE_MASK) as u16)
    }

    #[must_use]
    pub fn local_page_id(self) -> u64 {
        self.0 & POINTER_LOCAL_MASK
    }
}

impl fmt::Display for SnapshotPagePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(
                f,
                "snapshot-{}/node-{}/page-{}",
                self.snapshot_id(),
                self.node(),
                self.local_page_id()
            )
        }
    }
}

// ── Log records ─────────────────────────────────────────────────────────────

/// Kind of operation recorded in the redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Full-record overwrite; the payload replaces the record at `key`.
    Overwrite,
}

/// One durable redo-log record, as delivered by the log manager.
///
/// Records reaching the snapshot pipeline are already committed and durable;
/// uncommitted records are filtered by the log layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub storage_id: StorageId,
    pub key: RecordKey,
    pub ordinal: Ordinal,
    pub epoch: Epoch,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Total sort key for the reducer merge: storage, then key, then ordinal.
    #[must_use]
    pub fn sort_key(&self) -> (StorageId, RecordKey, Ordinal) {
        (self.storage_id, self.key, self.ordinal)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
