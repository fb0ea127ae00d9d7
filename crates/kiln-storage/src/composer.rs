//! Per-storage snapshot composition and pointer installation.
//!
//! `Composer` is the tagged dispatch over storage kinds: every variant
//! knows how to fold a sorted log stream into snapshot pages and how to
//! install the resulting pointers on the live tree. The storage manager is
//! the factory (`StorageManager::composer_for`).

use crate::overwrite::OverwriteStorage;
use crate::{PageSink, PageSource};
use kiln_error::Result;
use kiln_pool::{PagePool, PagePoolOffsetChunk};
use kiln_types::{Epoch, LogRecord, SnapshotPagePointer};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Inputs to `Composer::compose`, valid for one storage on one reducer.
pub struct ComposeArgs<'a> {
    /// Writer for this node's snapshot file; the root page goes in last.
    pub sink: &'a mut dyn PageSink,
    /// Reader over previous snapshots, for leaves this run does not touch.
    pub source: &'a dyn PageSource,
    /// This storage's records, fully sorted by `(key, ordinal)`.
    pub records: &'a [LogRecord],
    pub base_epoch: Option<Epoch>,
    pub valid_until_epoch: Epoch,
    /// Cooperative cancellation, polled at page boundaries.
    pub cancelled: &'a AtomicBool,
}

/// Inputs to `Composer::replace_pointers`, valid for one storage while
/// transactions are paused.
pub struct ReplacePointersArgs<'a> {
    pub valid_until_epoch: Epoch,
    /// Reader over the snapshot being installed.
    pub source: &'a dyn PageSource,
    pub new_root: SnapshotPagePointer,
    /// One chunk per node; dropped volatile pages accumulate here and are
    /// flushed to `pools` whenever a chunk fills.
    pub dropped_chunks: &'a mut [PagePoolOffsetChunk],
    /// Volatile pools indexed by node id.
    pub pools: &'a [Arc<PagePool>],
    pub cancelled: &'a AtomicBool,
}

/// Counters from one `replace_pointers` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Snapshot pointers newly installed on the live tree.
    pub installed: u64,
    /// Volatile pages dropped back into the pools.
    pub dropped: u64,
}

/// Storage-kind dispatch for the two snapshot operations.
#[derive(Clone)]
pub enum Composer {
    Overwrite(Arc<OverwriteStorage>),
}

impl Composer {
    /// Fold a sorted log stream into snapshot pages; returns the new root.
    pub fn compose(&self, args: ComposeArgs<'_>) -> Result<SnapshotPagePointer> {
        match self {
            Self::Overwrite(storage) => storage.compose(args),
        }
    }

    /// Swing live pointers to the installed snapshot and drop covered
    /// volatile pages.
    pub fn replace_pointers(&self, args: ReplacePointersArgs<'_>) -> Result<ReplaceReport> {
        match self {
            Self::Overwrite(storage) => storage.replace_pointers(args),
        }
    }
}
