#![forbid(unsafe_code)]
//! End-to-end snapshot pipeline scenarios against in-memory collaborators.
//!
//! The doubles here stand in for the engine modules outside the snapshot
//! subsystem: a log manager over in-memory segments, a file-backed
//! savepoint, and a transaction gate that records pause/resume ordering.

use kiln_error::Result;
use kiln_pool::{PagePool, PoolConfig};
use kiln_snapshot::{
    LogManager, LogSegmentReader, SavepointManager, SnapshotConfig, SnapshotDeps,
    SnapshotFileSet, SnapshotManager, SnapshotMetadata, XctManager,
};
use kiln_storage::{
    Composer, MemoryStorageManager, OverwriteStorage, Partitioner, StorageKind, StorageManager,
    StorageMeta,
};
use kiln_types::{
    Epoch, LogRecord, LoggerId, NodeId, Ordinal, RecordKey, RecordKind, SnapshotId,
    SnapshotPagePointer, StorageId,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// ── Collaborator doubles ────────────────────────────────────────────────────

struct MemLogManager {
    durable: AtomicU32,
    segments: parking_lot::Mutex<BTreeMap<(u16, u16), Vec<LogRecord>>>,
    /// Artificial per-batch delay, for cancellation-window tests.
    batch_delay_ms: AtomicU64,
}

impl MemLogManager {
    fn new() -> Self {
        Self {
            durable: AtomicU32::new(0),
            segments: parking_lot::Mutex::new(BTreeMap::new()),
            batch_delay_ms: AtomicU64::new(0),
        }
    }

    fn append(&self, node: NodeId, logger: LoggerId, record: LogRecord) {
        self.segments
            .lock()
            .entry((node.0, logger.0))
            .or_default()
            .push(record);
    }

    fn set_durable(&self, epoch: Epoch) {
        self.durable.store(epoch.0, Ordering::Release);
    }

    fn set_batch_delay_ms(&self, ms: u64) {
        self.batch_delay_ms.store(ms, Ordering::Release);
    }
}

struct MemSegmentReader {
    records: Vec<LogRecord>,
    cursor: usize,
    delay: Duration,
}

impl LogSegmentReader for MemSegmentReader {
    fn next_batch(&mut self, max_records: usize) -> Result<Vec<LogRecord>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let end = (self.cursor + max_records).min(self.records.len());
        let batch = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(batch)
    }
}

impl LogManager for MemLogManager {
    fn durable_global_epoch(&self) -> Epoch {
        Epoch(self.durable.load(Ordering::Acquire))
    }

    fn open_segment(
        &self,
        node: NodeId,
        logger: LoggerId,
        from_exclusive: Option<Epoch>,
        to_inclusive: Epoch,
    ) -> Result<Box<dyn LogSegmentReader>> {
        let floor = from_exclusive.unwrap_or(Epoch::INVALID);
        let mut records: Vec<LogRecord> = self
            .segments
            .lock()
            .get(&(node.0, logger.0))
            .map(|s| {
                s.iter()
                    .filter(|r| r.epoch > floor && r.epoch <= to_inclusive)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| (r.epoch, r.ordinal));
        Ok(Box::new(MemSegmentReader {
            records,
            cursor: 0,
            delay: Duration::from_millis(self.batch_delay_ms.load(Ordering::Acquire)),
        }))
    }
}

/// Savepoint persisted as "id epoch" via tempfile + atomic rename.
struct FileSavepoint {
    path: std::path::PathBuf,
    state: parking_lot::Mutex<(SnapshotId, Epoch)>,
}

impl FileSavepoint {
    fn open(folder: &Path) -> Self {
        let path = folder.join("savepoint");
        let state = fs::read_to_string(&path)
            .ok()
            .and_then(|text| {
                let mut parts = text.split_whitespace();
                let id = parts.next()?.parse().ok()?;
                let epoch = parts.next()?.parse().ok()?;
                Some((SnapshotId(id), Epoch(epoch)))
            })
            .unwrap_or((SnapshotId::NULL, Epoch::INVALID));
        Self {
            path,
            state: parking_lot::Mutex::new(state),
        }
    }
}

impl SavepointManager for FileSavepoint {
    fn latest_snapshot_id(&self) -> SnapshotId {
        self.state.lock().0
    }

    fn latest_snapshot_epoch(&self) -> Epoch {
        self.state.lock().1
    }

    fn take_savepoint_after_snapshot(&self, id: SnapshotId, epoch: Epoch) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{} {}", id.0, epoch.0))?;
        fs::rename(&tmp, &self.path)?;
        fs::File::open(&self.path)?.sync_all()?;
        *self.state.lock() = (id, epoch);
        Ok(())
    }
}

/// Transaction gate recording pause/resume ordering.
#[derive(Default)]
struct PauseGate {
    pauses: AtomicU32,
    resumes: AtomicU32,
    paused: AtomicBool,
}

impl PauseGate {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl XctManager for PauseGate {
    fn pause_accepting_xct(&self) {
        self.pauses.fetch_add(1, Ordering::AcqRel);
        self.paused.store(true, Ordering::Release);
    }

    fn resume_accepting_xct(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Storage manager that serves storage 2 a mismatched live tree during the
/// pause window, so its pointer installation fails after storage 1's swap
/// already landed.
struct ReplaceFaultStorageManager {
    inner: Arc<MemoryStorageManager>,
    gate: Arc<PauseGate>,
    broken: Arc<OverwriteStorage>,
}

impl StorageManager for ReplaceFaultStorageManager {
    fn largest_storage_id(&self) -> StorageId {
        self.inner.largest_storage_id()
    }

    fn clone_all_storage_metadata(&self) -> Vec<StorageMeta> {
        self.inner.clone_all_storage_metadata()
    }

    fn composer_for(&self, id: StorageId) -> Option<Composer> {
        if id == StorageId(2) && self.gate.is_paused() {
            return Some(Composer::Overwrite(Arc::clone(&self.broken)));
        }
        self.inner.composer_for(id)
    }

    fn partitioner_for(&self, id: StorageId) -> Option<Partitioner> {
        self.inner.partitioner_for(id)
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    config: SnapshotConfig,
    log: Arc<MemLogManager>,
    savepoint: Arc<FileSavepoint>,
    xct: Arc<PauseGate>,
    storages: Arc<MemoryStorageManager>,
    manager: Arc<SnapshotManager>,
    next_ordinal: AtomicU64,
}

impl Harness {
    fn start(node_count: u16) -> Self {
        Self::start_with(node_count, 1024, 3_600_000)
    }

    fn start_with(node_count: u16, mapper_batch_records: usize, interval_ms: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SnapshotConfig::default();
        config.node_count = node_count;
        config.mapper_batch_records = mapper_batch_records;
        config.snapshot_interval_milliseconds = interval_ms;
        config.folder_path_pattern = dir
            .path()
            .join("node_$NODE$")
            .to_string_lossy()
            .into_owned();
        config.primary_folder_path = dir.path().to_path_buf();
        let config = config.validate().unwrap();

        let pools: Vec<Arc<PagePool>> = (0..node_count)
            .map(|n| {
                Arc::new(PagePool::new(NodeId(n), PoolConfig { size_mb_per_node: 2 }).unwrap())
            })
            .collect();
        let storages = Arc::new(MemoryStorageManager::new(pools.clone()));
        storages.set_page_loader(Arc::new(SnapshotFileSet::new(config.clone())));

        let log = Arc::new(MemLogManager::new());
        let savepoint = Arc::new(FileSavepoint::open(dir.path()));
        let xct = Arc::new(PauseGate::default());

        let manager = SnapshotManager::new(
            config.clone(),
            SnapshotDeps {
                log: Arc::clone(&log) as Arc<dyn LogManager>,
                savepoint: Arc::clone(&savepoint) as Arc<dyn SavepointManager>,
                storages: Arc::clone(&storages) as Arc<dyn kiln_storage::StorageManager>,
                xct: Arc::clone(&xct) as Arc<dyn XctManager>,
                pools,
            },
        )
        .unwrap();
        manager.start().unwrap();
        manager.control().mark_engine_initialized();

        Self {
            _dir: dir,
            config,
            log,
            savepoint,
            xct,
            storages,
            manager,
            next_ordinal: AtomicU64::new(1),
        }
    }

    fn create_storage(&self, id: u32, home_node: u16) {
        self.storages
            .create_storage(StorageMeta {
                id: StorageId(id),
                kind: StorageKind::Overwrite,
                name: format!("storage-{id}"),
                key_capacity: 1000,
                record_size: 16,
                home_node: NodeId(home_node),
                root_snapshot_page_id: SnapshotPagePointer::NULL,
            })
            .unwrap();
    }

    /// Append the redo record and apply the same write to the live tree.
    fn commit(&self, storage: u32, key: u64, fill: u8, epoch: u32) {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::AcqRel);
        let record = LogRecord {
            storage_id: StorageId(storage),
            key: RecordKey(key),
            ordinal: Ordinal(ordinal),
            epoch: Epoch(epoch),
            kind: RecordKind::Overwrite,
            payload: vec![fill; 16],
        };
        self.log.append(NodeId(0), LoggerId(0), record.clone());
        self.storages
            .apply_write(record.storage_id, record.key, &record.payload, record.epoch)
            .unwrap();
    }

    /// Append a raw log record without touching the live tree.
    fn append_raw(&self, record: LogRecord) {
        self.log.append(NodeId(0), LoggerId(0), record);
    }

    fn read(&self, storage: u32, key: u64) -> Vec<u8> {
        self.storages.read(StorageId(storage), RecordKey(key)).unwrap()
    }

    fn wait_until(&self, what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn shutdown(self) {
        self.manager.shutdown().unwrap();
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn first_snapshot_builds_files_savepoint_and_drops_volatile_pages() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    for key in 0..10 {
        harness.commit(1, key, 0x40 + key as u8, 1 + (key % 5) as u32);
    }
    harness.log.set_durable(Epoch(5));
    let free_before = harness.storages.pools()[0].stat().free_pages;

    harness.manager.trigger_snapshot_immediate(true);

    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));
    assert_eq!(harness.manager.snapshot_epoch(), Epoch(5));
    assert_eq!(harness.savepoint.latest_snapshot_id(), SnapshotId(1));
    assert_eq!(harness.savepoint.latest_snapshot_epoch(), Epoch(5));

    let metadata = SnapshotMetadata::load_from_file(&harness.config, SnapshotId(1)).unwrap();
    assert_eq!(metadata.base_epoch, Epoch::INVALID);
    assert_eq!(metadata.valid_until_epoch, Epoch(5));
    assert_eq!(metadata.largest_storage_id, StorageId(1));
    assert!(!metadata.storages[0].root_snapshot_page_id.is_null());
    assert!(
        harness
            .config
            .data_file_path(NodeId(0), SnapshotId(1))
            .exists()
    );

    // exactly one pause/resume cycle, and the drop freed every volatile page
    assert_eq!(harness.xct.pauses.load(Ordering::Acquire), 1);
    assert_eq!(harness.xct.resumes.load(Ordering::Acquire), 1);
    let storage = harness.storages.storage(StorageId(1)).unwrap();
    assert_eq!(storage.volatile_page_count(), 0);
    assert!(harness.storages.pools()[0].stat().free_pages > free_before);

    // replaying reads over the snapshot matches the live state at the pause
    for key in 0..10 {
        assert_eq!(harness.read(1, key), vec![0x40 + key as u8; 16]);
    }
    assert_eq!(harness.read(1, 999), vec![0_u8; 16]);

    harness.shutdown();
}

#[test]
fn trigger_without_new_durable_work_is_a_noop() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    harness.commit(1, 1, 0xaa, 3);
    harness.log.set_durable(Epoch(3));
    harness.manager.trigger_snapshot_immediate(true);
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));

    // durable epoch unchanged: the trigger returns without a new run
    harness.manager.trigger_snapshot_immediate(true);
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));
    assert_eq!(harness.manager.snapshot_epoch(), Epoch(3));
    assert!(!harness.config.metadata_file_path(SnapshotId(2)).exists());
    assert_eq!(harness.xct.pauses.load(Ordering::Acquire), 1);

    harness.shutdown();
}

#[test]
fn successive_snapshots_chain_epochs_and_ids() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    harness.commit(1, 7, 0x01, 2);
    harness.log.set_durable(Epoch(2));
    harness.manager.trigger_snapshot_immediate(true);

    harness.commit(1, 7, 0x02, 4);
    harness.commit(1, 500, 0x03, 5);
    harness.log.set_durable(Epoch(5));
    harness.manager.trigger_snapshot_immediate(true);

    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(2));
    assert_eq!(harness.manager.snapshot_epoch(), Epoch(5));

    let first = SnapshotMetadata::load_from_file(&harness.config, SnapshotId(1)).unwrap();
    let second = SnapshotMetadata::load_from_file(&harness.config, SnapshotId(2)).unwrap();
    // base_epoch[i+1] == valid_until_epoch[i], both components increase
    assert_eq!(first.base_epoch, Epoch::INVALID);
    assert_eq!(second.base_epoch, first.valid_until_epoch);
    assert!(second.valid_until_epoch > first.valid_until_epoch);
    assert!(second.id > first.id);
    assert_ne!(
        first.storages[0].root_snapshot_page_id,
        second.storages[0].root_snapshot_page_id
    );

    // last writer wins across snapshots; untouched keys carry over
    assert_eq!(harness.read(1, 7), vec![0x02; 16]);
    assert_eq!(harness.read(1, 500), vec![0x03; 16]);

    harness.shutdown();
}

#[test]
fn concurrent_immediate_triggers_share_one_snapshot() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    for key in 0..50 {
        harness.commit(1, key, 0x11, 2);
    }
    harness.log.set_durable(Epoch(2));

    let manager_a = Arc::clone(&harness.manager);
    let manager_b = Arc::clone(&harness.manager);
    let waiter_a = thread::spawn(move || manager_a.trigger_snapshot_immediate(true));
    let waiter_b = thread::spawn(move || manager_b.trigger_snapshot_immediate(true));
    waiter_a.join().unwrap();
    waiter_b.join().unwrap();

    // both callers return after the same epoch advance; one id allocated
    assert_eq!(harness.manager.snapshot_epoch(), Epoch(2));
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));
    assert!(harness.config.metadata_file_path(SnapshotId(1)).exists());
    assert!(!harness.config.metadata_file_path(SnapshotId(2)).exists());

    harness.shutdown();
}

#[test]
fn multi_node_snapshot_writes_per_node_files() {
    let harness = Harness::start(2);
    harness.create_storage(1, 0);
    harness.create_storage(2, 1);
    harness.commit(1, 3, 0xa1, 1);
    harness.commit(2, 9, 0xb2, 1);
    harness.log.set_durable(Epoch(1));

    harness.manager.trigger_snapshot_immediate(true);

    let metadata = SnapshotMetadata::load_from_file(&harness.config, SnapshotId(1)).unwrap();
    let roots: BTreeMap<StorageId, SnapshotPagePointer> = metadata
        .storages
        .iter()
        .map(|s| (s.id, s.root_snapshot_page_id))
        .collect();
    // each storage's pages live in its home node's file
    assert_eq!(roots[&StorageId(1)].node(), NodeId(0));
    assert_eq!(roots[&StorageId(2)].node(), NodeId(1));
    assert!(
        harness
            .config
            .data_file_path(NodeId(0), SnapshotId(1))
            .exists()
    );
    assert!(
        harness
            .config
            .data_file_path(NodeId(1), SnapshotId(1))
            .exists()
    );
    assert_eq!(harness.read(1, 3), vec![0xa1; 16]);
    assert_eq!(harness.read(2, 9), vec![0xb2; 16]);

    harness.shutdown();
}

#[test]
fn interval_trigger_snapshots_without_a_request() {
    let harness = Harness::start_with(1, 1024, 50);
    harness.create_storage(1, 0);
    harness.commit(1, 2, 0x77, 1);
    harness.log.set_durable(Epoch(1));

    // no immediate request: the master's interval timer fires on its own
    harness.wait_until("interval snapshot", || {
        harness.manager.snapshot_epoch() == Epoch(1)
    });
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));
    assert!(harness.config.metadata_file_path(SnapshotId(1)).exists());

    harness.shutdown();
}

#[test]
fn cancellation_aborts_the_run_and_a_retrigger_succeeds() {
    // one record per mapper batch plus a per-batch delay opens a wide
    // cancellation window during the mapper scan
    let harness = Harness::start_with(1, 1, 3_600_000);
    harness.create_storage(1, 0);
    for key in 0..40 {
        harness.commit(1, key, 0x22, 1);
    }
    harness.log.set_durable(Epoch(1));
    harness.log.set_batch_delay_ms(10);

    harness.manager.trigger_snapshot_immediate(false);
    let control = harness.manager.control();
    harness.wait_until("run to start", || control.gleaner.is_gleaning());
    control.gleaner.cancel();
    harness.wait_until("run to unwind", || !control.gleaner.is_gleaning());

    // abandoned run left no durable trace
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId::NULL);
    assert_eq!(harness.manager.snapshot_epoch(), Epoch::INVALID);
    assert!(!harness.config.metadata_file_path(SnapshotId(1)).exists());
    assert_eq!(harness.savepoint.latest_snapshot_id(), SnapshotId::NULL);
    assert_eq!(harness.xct.pauses.load(Ordering::Acquire), 0);
    let storage = harness.storages.storage(StorageId(1)).unwrap();
    assert!(storage.volatile_page_count() > 0, "volatile pages must remain");

    // a fresh run starts cleanly and completes
    harness.log.set_batch_delay_ms(0);
    harness.manager.trigger_snapshot_immediate(true);
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId(1));
    assert_eq!(harness.manager.snapshot_epoch(), Epoch(1));
    assert_eq!(harness.read(1, 39), vec![0x22; 16]);

    harness.shutdown();
}

#[test]
fn compose_failure_abandons_run_without_touching_live_state() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    harness.create_storage(2, 0);
    harness.commit(1, 1, 0x33, 1);
    // malformed record for storage 2: payload shorter than record_size
    harness.append_raw(LogRecord {
        storage_id: StorageId(2),
        key: RecordKey(0),
        ordinal: Ordinal(u64::MAX),
        epoch: Epoch(1),
        kind: RecordKind::Overwrite,
        payload: vec![0xff; 4],
    });
    harness.log.set_durable(Epoch(1));

    harness.manager.trigger_snapshot_immediate(false);
    let control = harness.manager.control();
    let workers = harness.config.worker_count();
    harness.wait_until("run to finish", || {
        control.gleaner.completed_count() == workers && !control.gleaner.is_gleaning()
    });

    // run abandoned: no metadata, no savepoint, no pause, volatile intact
    assert_eq!(harness.manager.previous_snapshot_id(), SnapshotId::NULL);
    assert!(!harness.config.metadata_file_path(SnapshotId(1)).exists());
    assert_eq!(harness.savepoint.latest_snapshot_id(), SnapshotId::NULL);
    assert_eq!(harness.xct.pauses.load(Ordering::Acquire), 0);
    let storage = harness.storages.storage(StorageId(1)).unwrap();
    assert_eq!(storage.volatile_page_count(), 1);
    assert_eq!(harness.read(1, 1), vec![0x33; 16]);

    harness.shutdown();
}

#[test]
fn replace_pointers_failure_after_partial_swap_stops_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SnapshotConfig::default();
    config.snapshot_interval_milliseconds = 3_600_000;
    config.folder_path_pattern = dir
        .path()
        .join("node_$NODE$")
        .to_string_lossy()
        .into_owned();
    config.primary_folder_path = dir.path().to_path_buf();
    let config = config.validate().unwrap();

    let pools = vec![Arc::new(
        PagePool::new(NodeId(0), PoolConfig { size_mb_per_node: 2 }).unwrap(),
    )];
    let inner = Arc::new(MemoryStorageManager::new(pools.clone()));
    inner.set_page_loader(Arc::new(SnapshotFileSet::new(config.clone())));
    for id in [1_u32, 2] {
        inner
            .create_storage(StorageMeta {
                id: StorageId(id),
                kind: StorageKind::Overwrite,
                name: format!("storage-{id}"),
                key_capacity: 1000,
                record_size: 16,
                home_node: NodeId(0),
                root_snapshot_page_id: SnapshotPagePointer::NULL,
            })
            .unwrap();
    }

    let gate = Arc::new(PauseGate::default());
    // stand-in tree for storage 2 with a different leaf count: installing
    // the real new root into it fails mid-swap
    let broken = Arc::new(
        OverwriteStorage::new(
            StorageMeta {
                id: StorageId(2),
                kind: StorageKind::Overwrite,
                name: "storage-2-broken".to_owned(),
                key_capacity: 100_000,
                record_size: 16,
                home_node: NodeId(0),
                root_snapshot_page_id: SnapshotPagePointer::NULL,
            },
            Arc::clone(&pools[0]),
        )
        .unwrap(),
    );
    let storages = Arc::new(ReplaceFaultStorageManager {
        inner: Arc::clone(&inner),
        gate: Arc::clone(&gate),
        broken,
    });

    let log = Arc::new(MemLogManager::new());
    let savepoint = Arc::new(FileSavepoint::open(dir.path()));
    let manager = SnapshotManager::new(
        config.clone(),
        SnapshotDeps {
            log: Arc::clone(&log) as Arc<dyn LogManager>,
            savepoint: Arc::clone(&savepoint) as Arc<dyn SavepointManager>,
            storages: Arc::clone(&storages) as Arc<dyn StorageManager>,
            xct: Arc::clone(&gate) as Arc<dyn XctManager>,
            pools,
        },
    )
    .unwrap();
    manager.start().unwrap();
    manager.control().mark_engine_initialized();

    for (ordinal, (storage, key, fill)) in
        [(1_u32, 3_u64, 0xa1_u8), (2, 9, 0xb2)].into_iter().enumerate()
    {
        let record = LogRecord {
            storage_id: StorageId(storage),
            key: RecordKey(key),
            ordinal: Ordinal(ordinal as u64 + 1),
            epoch: Epoch(1),
            kind: RecordKind::Overwrite,
            payload: vec![fill; 16],
        };
        log.append(NodeId(0), LoggerId(0), record.clone());
        inner
            .apply_write(record.storage_id, record.key, &record.payload, record.epoch)
            .unwrap();
    }
    log.set_durable(Epoch(1));

    // the failure is past the savepoint step, so it must stop the engine
    manager.trigger_snapshot_immediate(false);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !manager.control().is_stop_requested() {
        assert!(
            Instant::now() < deadline,
            "fatal replace failure must stop the engine"
        );
        thread::sleep(Duration::from_millis(5));
    }

    // steps 5 and 6 already landed: metadata and savepoint name snapshot 1
    assert!(config.metadata_file_path(SnapshotId(1)).exists());
    assert_eq!(savepoint.latest_snapshot_id(), SnapshotId(1));
    // the snapshot was never published and the pause window closed again
    assert_eq!(manager.snapshot_epoch(), Epoch::INVALID);
    assert_eq!(manager.previous_snapshot_id(), SnapshotId::NULL);
    assert_eq!(gate.pauses.load(Ordering::Acquire), 1);
    assert_eq!(gate.resumes.load(Ordering::Acquire), 1);
    // storage 1's swap landed before the failure; storage 2 kept its page
    assert_eq!(inner.storage(StorageId(1)).unwrap().volatile_page_count(), 0);
    assert_eq!(inner.storage(StorageId(2)).unwrap().volatile_page_count(), 1);

    manager.shutdown().unwrap();
}

#[test]
fn restart_recovers_latest_snapshot_from_savepoint_and_metadata() {
    let harness = Harness::start(1);
    harness.create_storage(1, 0);
    harness.commit(1, 12, 0x55, 4);
    harness.log.set_durable(Epoch(4));
    harness.manager.trigger_snapshot_immediate(true);

    let root = harness._dir.path().to_path_buf();
    let config = harness.config.clone();
    harness.manager.shutdown().unwrap();

    // "restart": fresh savepoint + manager over the same folders
    let savepoint = Arc::new(FileSavepoint::open(&root));
    assert_eq!(savepoint.latest_snapshot_id(), SnapshotId(1));
    assert_eq!(savepoint.latest_snapshot_epoch(), Epoch(4));

    let metadata = SnapshotMetadata::load_from_file(&config, SnapshotId(1)).unwrap();
    assert_eq!(metadata.valid_until_epoch, Epoch(4));
    let restored_root = metadata.storages[0].root_snapshot_page_id;
    assert!(!restored_root.is_null());

    let pools = vec![Arc::new(
        PagePool::new(NodeId(0), PoolConfig { size_mb_per_node: 2 }).unwrap(),
    )];
    let storages = Arc::new(MemoryStorageManager::new(pools.clone()));
    storages.set_page_loader(Arc::new(SnapshotFileSet::new(config.clone())));
    let mut meta = metadata.storages[0].clone();
    meta.root_snapshot_page_id = restored_root;
    storages.create_storage(meta).unwrap();

    let log = Arc::new(MemLogManager::new());
    log.set_durable(Epoch(4));
    let manager = SnapshotManager::new(
        config,
        SnapshotDeps {
            log: log as Arc<dyn LogManager>,
            savepoint: Arc::clone(&savepoint) as Arc<dyn SavepointManager>,
            storages: Arc::clone(&storages) as Arc<dyn kiln_storage::StorageManager>,
            xct: Arc::new(PauseGate::default()) as Arc<dyn XctManager>,
            pools,
        },
    )
    .unwrap();
    assert_eq!(manager.previous_snapshot_id(), SnapshotId(1));
    assert_eq!(manager.snapshot_epoch(), Epoch(4));

    // snapshot pages readable through the restored root
    assert_eq!(
        storages.read(StorageId(1), RecordKey(12)).unwrap(),
        vec![0x55; 16]
    );

    drop(harness);
}
