#![forbid(unsafe_code)]
//! NUMA-local volatile page pool.
//!
//! Each NUMA node owns one `PagePool`: a fixed arena of `PAGE_SIZE` pages
//! fronted by a circular free-list of page offsets. Callers exchange
//! offsets in bulk through `PagePoolOffsetChunk` to amortize the pool lock.
//!
//! # Design
//!
//! - The free-list is a circular queue over offsets
//!   `[pages_for_free_pool, pool_size)`; the first `pages_for_free_pool`
//!   pages are accounted to the queue itself and never handed out.
//! - `grab` serves from the head, `release` appends at the tail, each in at
//!   most two segments when the cursor wraps.
//! - Running out of pages (`NoFreePages`) is normal backpressure. Releasing
//!   more pages than the capacity can hold means a double-free happened
//!   somewhere and the pool is unrecoverable (`DuplicatePage`).
//!
//! The pool mutex is the single serialization point per node and is never
//! held across I/O.

use kiln_error::{KilnError, Result};
use kiln_types::{NodeId, PAGE_SIZE, PageData, PagePoolOffset};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, trace, warn};

/// Offsets per chunk: one 16 KiB transfer buffer minus a small header,
/// matching `size_of::<u32>() * CHUNK_CAPACITY + header == 16 KiB`.
pub const CHUNK_CAPACITY: usize = 4095;

// ── Configuration ───────────────────────────────────────────────────────────

/// Sizing for one node's volatile page pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Arena size in megabytes. Must be at least 2 MB.
    pub size_mb_per_node: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size_mb_per_node: 2 }
    }
}

impl PoolConfig {
    pub fn validate(self) -> Result<Self> {
        if self.size_mb_per_node < 2 {
            return Err(KilnError::Config(
                "page_pool_size_mb_per_node must be >= 2".to_owned(),
            ));
        }
        Ok(self)
    }

    #[must_use]
    pub fn pool_size_pages(self) -> usize {
        ((self.size_mb_per_node as usize) << 20) / PAGE_SIZE
    }
}

// ── Offset chunks ───────────────────────────────────────────────────────────

/// Bounded buffer of page offsets exchanged at the grab/release boundary.
///
/// Callers refill and drain in batches so the pool mutex is taken once per
/// chunk, not once per page.
#[derive(Debug)]
pub struct PagePoolOffsetChunk {
    offsets: Vec<PagePoolOffset>,
}

impl PagePoolOffsetChunk {
    #[must_use]
    pub fn new() -> Self {
        Self {
            offsets: Vec::with_capacity(CHUNK_CAPACITY),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        CHUNK_CAPACITY
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.offsets.len() >= CHUNK_CAPACITY
    }

    /// Append one offset. Precondition: not full.
    pub fn push(&mut self, offset: PagePoolOffset) {
        debug_assert!(!self.is_full());
        self.offsets.push(offset);
    }

    pub fn pop(&mut self) -> Option<PagePoolOffset> {
        self.offsets.pop()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = PagePoolOffset> + '_ {
        self.offsets.iter().copied()
    }

    /// Append a slice of offsets. Precondition: fits within capacity.
    fn push_slice(&mut self, source: &[PagePoolOffset]) {
        debug_assert!(self.offsets.len() + source.len() <= CHUNK_CAPACITY);
        self.offsets.extend_from_slice(source);
    }

    /// Move the last `destination.len()` offsets out of the chunk.
    fn move_to(&mut self, destination: &mut [PagePoolOffset]) {
        let count = destination.len();
        debug_assert!(count <= self.offsets.len());
        let start = self.offsets.len() - count;
        destination.copy_from_slice(&self.offsets[start..]);
        self.offsets.truncate(start);
    }
}

impl Default for PagePoolOffsetChunk {
    fn default() -> Self {
        Self::new()
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStat {
    /// Pages in the arena, including the pages accounted to the free-list.
    pub total_pages: usize,
    /// Offsets currently sitting in the free-list.
    pub free_pages: usize,
    /// Maximum offsets the free-list can hold.
    pub capacity: usize,
}

#[derive(Debug)]
struct FreeQueue {
    slots: Vec<PagePoolOffset>,
    head: usize,
    count: usize,
}

/// Volatile page pool bound to one NUMA node.
#[derive(Debug)]
pub struct PagePool {
    node: NodeId,
    pool_size: usize,
    pages_for_free_pool: usize,
    frames: Vec<RwLock<PageData>>,
    queue: Mutex<FreeQueue>,
}

impl PagePool {
    /// Build the arena and seed the free-list with every grantable offset.
    pub fn new(node: NodeId, config: PoolConfig) -> Result<Self> {
        let config = config.validate()?;
        let pool_size = config.pool_size_pages();
        let pointers_total_size = pool_size * size_of::<PagePoolOffset>();
        let pages_for_free_pool = pointers_total_size.div_ceil(PAGE_SIZE);
        let capacity = pool_size - pages_for_free_pool;

        info!(
            target: "kiln::pool",
            event = "pool_init",
            node = node.0,
            size_mb = config.size_mb_per_node,
            total_pages = pool_size,
            pages_for_free_pool,
            capacity
        );

        let frames = (0..pool_size)
            .map(|_| RwLock::new([0_u8; PAGE_SIZE]))
            .collect();
        let slots = (0..capacity)
            .map(|i| PagePoolOffset((pages_for_free_pool + i) as u32))
            .collect();

        Ok(Self {
            node,
            pool_size,
            pages_for_free_pool,
            frames,
            queue: Mutex::new(FreeQueue {
                slots,
                head: 0,
                count: capacity,
            }),
        })
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// First grantable offset; offsets below it belong to the free-list.
    #[must_use]
    pub fn first_offset(&self) -> PagePoolOffset {
        PagePoolOffset(self.pages_for_free_pool as u32)
    }

    #[must_use]
    pub fn stat(&self) -> PoolStat {
        let queue = self.queue.lock();
        PoolStat {
            total_pages: self.pool_size,
            free_pages: queue.count,
            capacity: queue.slots.len(),
        }
    }

    /// Transfer up to `desired` free offsets into `chunk`.
    ///
    /// Precondition: `chunk.size() + desired <= chunk.capacity()`.
    /// Fails with `NoFreePages` only when the pool is fully drained; a
    /// partial grant is success and must not be treated as an error.
    pub fn grab(&self, desired: usize, chunk: &mut PagePoolOffsetChunk) -> Result<()> {
        debug_assert!(chunk.size() + desired <= chunk.capacity());
        let mut queue = self.queue.lock();
        trace!(
            target: "kiln::pool",
            event = "grab",
            node = self.node.0,
            desired,
            free = queue.count
        );
        if queue.count == 0 {
            warn!(target: "kiln::pool", event = "pool_exhausted", node = self.node.0);
            return Err(KilnError::NoFreePages);
        }

        let capacity = queue.slots.len();
        let mut grab_count = desired.min(queue.count);
        // serve from the head, wrapping at most once
        if queue.head + grab_count > capacity {
            let wrap_count = capacity - queue.head;
            chunk.push_slice(&queue.slots[queue.head..]);
            queue.head = 0;
            queue.count -= wrap_count;
            grab_count -= wrap_count;
        }
        let head = queue.head;
        chunk.push_slice(&queue.slots[head..head + grab_count]);
        queue.head += grab_count;
        queue.count -= grab_count;
        Ok(())
    }

    /// Append up to `desired` offsets from the tail of `chunk` back to the
    /// free-list.
    ///
    /// Precondition: `chunk.size() >= desired`. Overfilling the free-list is
    /// only possible after a double-free, so it is reported as the fatal
    /// `DuplicatePage` and the pool must not be used further.
    pub fn release(&self, desired: usize, chunk: &mut PagePoolOffsetChunk) -> Result<()> {
        debug_assert!(chunk.size() >= desired);
        let mut queue = self.queue.lock();
        trace!(
            target: "kiln::pool",
            event = "release",
            node = self.node.0,
            desired,
            free = queue.count
        );
        let capacity = queue.slots.len();
        if queue.count + desired > capacity {
            error!(
                target: "kiln::pool",
                event = "free_list_overfill",
                node = self.node.0,
                free = queue.count,
                desired,
                capacity
            );
            return Err(KilnError::DuplicatePage);
        }

        let mut release_count = desired.min(chunk.size());
        let mut tail = queue.head + queue.count;
        if tail >= capacity {
            tail -= capacity;
        }
        // append at the tail, wrapping at most once
        if tail + release_count > capacity {
            let wrap_count = capacity - tail;
            chunk.move_to(&mut queue.slots[tail..tail + wrap_count]);
            queue.count += wrap_count;
            release_count -= wrap_count;
            tail = 0;
        }
        chunk.move_to(&mut queue.slots[tail..tail + release_count]);
        queue.count += release_count;
        Ok(())
    }

    /// Read access to one page body.
    pub fn read_page(&self, offset: PagePoolOffset) -> Result<RwLockReadGuard<'_, PageData>> {
        Ok(self.frame(offset)?.read())
    }

    /// Write access to one page body.
    pub fn write_page(&self, offset: PagePoolOffset) -> Result<RwLockWriteGuard<'_, PageData>> {
        Ok(self.frame(offset)?.write())
    }

    fn frame(&self, offset: PagePoolOffset) -> Result<&RwLock<PageData>> {
        let index = offset.0 as usize;
        if index < self.pages_for_free_pool || index >= self.pool_size {
            return Err(KilnError::Inconsistent(format!(
                "page offset {} outside grantable range [{}, {}) on node {}",
                index, self.pages_for_free_pool, self.pool_size, self.node
            )));
        }
        Ok(&self.frames[index])
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let queue = self.queue.get_mut();
        if queue.count != queue.slots.len() {
            // Not a leak (the arena goes away regardless) but a smell of one.
            warn!(
                target: "kiln::pool",
                event = "pool_teardown_missing_pages",
                node = self.node.0,
                free = queue.count,
                capacity = queue.slots.len()
            );
        } else {
            debug!(
                target: "kiln::pool",
                event = "pool_teardown_clean",
                node = self.node.0
            );
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
