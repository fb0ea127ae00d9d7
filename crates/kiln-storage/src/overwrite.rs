//! Fixed-capacity keyed record store with last-writer-wins overwrites.
//!
//! The volatile tree is two levels: an in-memory slot table (the internal
//! node) over leaf pages living in the home node's `PagePool`. Every slot
//! is a dual pointer: an optional volatile page plus a stable snapshot page
//! pointer. Reads prefer the volatile page, fall back to the snapshot page,
//! and otherwise see zeroes (records exist, zero-filled, from creation).

use crate::composer::{ComposeArgs, ReplacePointersArgs, ReplaceReport};
use crate::layout::{self, LeafHeader};
use crate::{PageSink, PageSource, StorageMeta};
use kiln_error::{KilnError, Result};
use kiln_pool::{PagePool, PagePoolOffsetChunk};
use kiln_types::{Epoch, PAGE_SIZE, PagePoolOffset, RecordKey, SnapshotPagePointer};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, Default)]
struct LeafSlot {
    volatile: Option<PagePoolOffset>,
    snapshot: SnapshotPagePointer,
}

/// One overwrite storage bound to its home node's volatile pool.
pub struct OverwriteStorage {
    meta: RwLock<StorageMeta>,
    pool: Arc<PagePool>,
    slots: Mutex<Vec<LeafSlot>>,
}

impl OverwriteStorage {
    pub fn new(meta: StorageMeta, pool: Arc<PagePool>) -> Result<Self> {
        meta.validate()?;
        let leaf_count = meta.leaf_count() as usize;
        Ok(Self {
            meta: RwLock::new(meta),
            pool,
            slots: Mutex::new(vec![LeafSlot::default(); leaf_count]),
        })
    }

    #[must_use]
    pub fn meta(&self) -> StorageMeta {
        self.meta.read().clone()
    }

    /// Number of leaf pages currently held in volatile memory.
    #[must_use]
    pub fn volatile_page_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.volatile.is_some()).count()
    }

    fn check_key(meta: &StorageMeta, key: RecordKey) -> Result<()> {
        if key.0 >= meta.key_capacity {
            return Err(KilnError::Inconsistent(format!(
                "key {} out of range for storage {} (capacity {})",
                key.0, meta.id, meta.key_capacity
            )));
        }
        Ok(())
    }

    /// Apply one committed overwrite to the volatile tree.
    ///
    /// Materializes the leaf from the latest snapshot on first touch, which
    /// needs `loader` once a snapshot exists. `NoFreePages` surfaces to the
    /// caller as backpressure.
    pub fn apply_write(
        &self,
        key: RecordKey,
        payload: &[u8],
        epoch: Epoch,
        loader: Option<&dyn PageSource>,
    ) -> Result<()> {
        let meta = self.meta.read().clone();
        Self::check_key(&meta, key)?;
        if payload.len() != meta.record_size as usize {
            return Err(KilnError::Inconsistent(format!(
                "payload of {} bytes for storage {} with record_size {}",
                payload.len(),
                meta.id,
                meta.record_size
            )));
        }

        let leaf = meta.leaf_of(key);
        let slot_index = meta.slot_of(key);
        let mut slots = self.slots.lock();
        let slot = &mut slots[leaf as usize];

        let offset = match slot.volatile {
            Some(offset) => offset,
            None => {
                let offset = self.grab_one_page()?;
                self.init_leaf_body(&meta, leaf, slot.snapshot, loader, offset)?;
                slot.volatile = Some(offset);
                trace!(
                    target: "kiln::storage",
                    event = "leaf_materialized",
                    storage = meta.id.0,
                    leaf,
                    from_snapshot = !slot.snapshot.is_null()
                );
                offset
            }
        };

        let mut body = self.pool.write_page(offset)?;
        let range = layout::record_range(meta.record_size, slot_index);
        body[range].copy_from_slice(payload);
        let mut header = layout::decode_leaf_header(&body)?;
        if epoch > header.dirty_epoch {
            header.dirty_epoch = epoch;
            layout::encode_leaf_header(&mut body, &header);
        }
        Ok(())
    }

    /// Read one record: volatile page first, then snapshot, else zeroes.
    pub fn read(
        &self,
        key: RecordKey,
        loader: Option<&dyn PageSource>,
    ) -> Result<Vec<u8>> {
        let meta = self.meta.read().clone();
        Self::check_key(&meta, key)?;
        let leaf = meta.leaf_of(key);
        let range = layout::record_range(meta.record_size, meta.slot_of(key));

        let slot = self.slots.lock()[leaf as usize];
        if let Some(offset) = slot.volatile {
            let body = self.pool.read_page(offset)?;
            return Ok(body[range].to_vec());
        }
        if !slot.snapshot.is_null() {
            let loader = loader.ok_or_else(|| {
                KilnError::Inconsistent(format!(
                    "storage {} has snapshot pages but no page source",
                    meta.id
                ))
            })?;
            let mut body = [0_u8; PAGE_SIZE];
            loader.read_page(slot.snapshot, &mut body)?;
            return Ok(body[range].to_vec());
        }
        Ok(vec![0_u8; meta.record_size as usize])
    }

    fn grab_one_page(&self) -> Result<PagePoolOffset> {
        let mut chunk = PagePoolOffsetChunk::new();
        self.pool.grab(1, &mut chunk)?;
        chunk.pop().ok_or(KilnError::NoFreePages)
    }

    fn init_leaf_body(
        &self,
        meta: &StorageMeta,
        leaf: u64,
        snapshot: SnapshotPagePointer,
        loader: Option<&dyn PageSource>,
        offset: PagePoolOffset,
    ) -> Result<()> {
        let mut body = self.pool.write_page(offset)?;
        if snapshot.is_null() {
            body.fill(0);
            layout::encode_leaf_header(&mut body, &Self::fresh_header(meta, leaf));
        } else {
            let loader = loader.ok_or_else(|| {
                KilnError::Inconsistent(format!(
                    "storage {} has snapshot pages but no page source",
                    meta.id
                ))
            })?;
            loader.read_page(snapshot, &mut body)?;
            let mut header = layout::decode_leaf_header(&body)?;
            // a fresh volatile copy starts clean; only new writes dirty it
            header.dirty_epoch = Epoch::INVALID;
            layout::encode_leaf_header(&mut body, &header);
        }
        Ok(())
    }

    fn fresh_header(meta: &StorageMeta, leaf: u64) -> LeafHeader {
        let records_per_leaf = meta.records_per_leaf();
        let first_key = leaf * records_per_leaf;
        let record_count = records_per_leaf.min(meta.key_capacity - first_key);
        LeafHeader {
            storage_id: meta.id,
            leaf_index: leaf as u32,
            dirty_epoch: Epoch::INVALID,
            record_size: meta.record_size,
            record_count: record_count as u16,
        }
    }

    // ── Snapshot operations (via Composer) ──────────────────────────────

    pub(crate) fn compose(&self, args: ComposeArgs<'_>) -> Result<SnapshotPagePointer> {
        let ComposeArgs {
            sink,
            source,
            records,
            cancelled,
            ..
        } = args;
        let meta = self.meta.read().clone();
        let leaf_count = meta.leaf_count() as usize;

        let mut pointers = if meta.root_snapshot_page_id.is_null() {
            vec![SnapshotPagePointer::NULL; leaf_count]
        } else {
            let mut body = [0_u8; PAGE_SIZE];
            source.read_page(meta.root_snapshot_page_id, &mut body)?;
            let pointers = layout::decode_root(&body, meta.id)?;
            if pointers.len() != leaf_count {
                return Err(KilnError::Inconsistent(format!(
                    "storage {} root has {} leaves, expected {leaf_count}",
                    meta.id,
                    pointers.len()
                )));
            }
            pointers
        };

        debug_assert!(
            records.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()),
            "compose input must be sorted"
        );

        let mut start = 0;
        while start < records.len() {
            if cancelled.load(Ordering::Acquire) {
                return Err(KilnError::Cancelled);
            }
            let leaf = meta.leaf_of(records[start].key);
            if leaf >= leaf_count as u64 {
                return Err(KilnError::Inconsistent(format!(
                    "log record key {} outside storage {} key space",
                    records[start].key.0, meta.id
                )));
            }
            let mut end = start + 1;
            while end < records.len() && meta.leaf_of(records[end].key) == leaf {
                end += 1;
            }
            pointers[leaf as usize] = Self::compose_leaf(
                &meta,
                leaf,
                pointers[leaf as usize],
                &records[start..end],
                sink,
                source,
            )?;
            start = end;
        }

        let mut root_body = [0_u8; PAGE_SIZE];
        layout::encode_root(&mut root_body, meta.id, &pointers)?;
        let root = sink.write_page(&root_body)?;
        trace!(
            target: "kiln::storage",
            event = "storage_composed",
            storage = meta.id.0,
            records = records.len(),
            root = %root
        );
        Ok(root)
    }

    fn compose_leaf(
        meta: &StorageMeta,
        leaf: u64,
        base: SnapshotPagePointer,
        records: &[kiln_types::LogRecord],
        sink: &mut dyn PageSink,
        source: &dyn PageSource,
    ) -> Result<SnapshotPagePointer> {
        let mut body = [0_u8; PAGE_SIZE];
        let mut header = if base.is_null() {
            Self::fresh_header(meta, leaf)
        } else {
            source.read_page(base, &mut body)?;
            let header = layout::decode_leaf_header(&body)?;
            if header.storage_id != meta.id || u64::from(header.leaf_index) != leaf {
                return Err(KilnError::Inconsistent(format!(
                    "leaf page {base} does not belong to storage {} leaf {leaf}",
                    meta.id
                )));
            }
            header
        };

        for record in records {
            if record.payload.len() != meta.record_size as usize {
                return Err(KilnError::Inconsistent(format!(
                    "log record for storage {} key {} has {} payload bytes",
                    meta.id,
                    record.key.0,
                    record.payload.len()
                )));
            }
            let range = layout::record_range(meta.record_size, meta.slot_of(record.key));
            body[range].copy_from_slice(&record.payload);
            if record.epoch > header.dirty_epoch {
                header.dirty_epoch = record.epoch;
            }
        }
        layout::encode_leaf_header(&mut body, &header);
        sink.write_page(&body)
    }

    pub(crate) fn replace_pointers(
        &self,
        args: ReplacePointersArgs<'_>,
    ) -> Result<ReplaceReport> {
        if args.cancelled.load(Ordering::Acquire) {
            return Err(KilnError::Cancelled);
        }
        let meta = self.meta.read().clone();
        let leaf_count = meta.leaf_count() as usize;
        let home = meta.home_node.0 as usize;

        let mut root_body = [0_u8; PAGE_SIZE];
        args.source.read_page(args.new_root, &mut root_body)?;
        let new_leaves = layout::decode_root(&root_body, meta.id)?;
        if new_leaves.len() != leaf_count {
            return Err(KilnError::Inconsistent(format!(
                "new root {} has {} leaves, live tree has {leaf_count}",
                args.new_root,
                new_leaves.len()
            )));
        }

        let mut report = ReplaceReport::default();
        let mut slots = self.slots.lock();
        for (slot, new_pointer) in slots.iter_mut().zip(new_leaves) {
            if !new_pointer.is_null() && new_pointer != slot.snapshot {
                slot.snapshot = new_pointer;
                report.installed += 1;
            }
            let Some(offset) = slot.volatile else {
                continue;
            };
            let dirty_epoch = {
                let body = self.pool.read_page(offset)?;
                layout::decode_leaf_header(&body)?.dirty_epoch
            };
            if dirty_epoch > args.valid_until_epoch {
                // written after the snapshot horizon; keep the volatile page
                continue;
            }
            if slot.snapshot.is_null() && dirty_epoch.is_valid() {
                warn!(
                    target: "kiln::storage",
                    event = "covered_leaf_without_snapshot",
                    storage = meta.id.0,
                    offset = offset.0
                );
                continue;
            }
            slot.volatile = None;
            let chunk = &mut args.dropped_chunks[home];
            if chunk.is_full() {
                let full = chunk.size();
                args.pools[home].release(full, chunk)?;
            }
            chunk.push(offset);
            report.dropped += 1;
        }
        drop(slots);

        self.meta.write().root_snapshot_page_id = args.new_root;
        trace!(
            target: "kiln::storage",
            event = "pointers_replaced",
            storage = meta.id.0,
            installed = report.installed,
            dropped = report.dropped
        );
        Ok(report)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
