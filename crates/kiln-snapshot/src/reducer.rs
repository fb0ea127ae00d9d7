//! Log reducer: one per node.
//!
//! Drains the node's ring until every mapper finished, buffering batches in
//! memory. When the buffer budget is crossed, the batch is sorted by
//! `(storage, key, ordinal)` and spilled to a run file under the node's
//! snapshot folder. At end of input all runs, spilled and in-memory, are
//! k-way merged into one sorted stream per storage and handed to that
//! storage's composer, which writes pages through this node's writer.

use crate::gleaner::RunContext;
use crate::writer::{SnapshotFileSet, SnapshotWriter};
use kiln_error::{KilnError, Result};
use kiln_storage::ComposeArgs;
use kiln_types::{Epoch, LogRecord, NodeId, Ordinal, RecordKey, RecordKind, StorageId};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const POP_WAIT: Duration = Duration::from_millis(10);
const SPILL_PREFIX: &str = "tmp_run_";
const SPILL_SUFFIX: &str = ".sort";

pub struct LogReducer {
    node: NodeId,
}

impl LogReducer {
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self { node }
    }

    pub fn run(&self, ctx: &RunContext) -> Result<()> {
        let folder = ctx.config.node_folder(self.node);
        fs::create_dir_all(&folder)?;
        remove_orphan_runs(&folder);

        let result = self.drain_and_compose(ctx, &folder);
        if let Err(error) = &result {
            debug!(
                target: "kiln::snapshot::reducer",
                event = "reducer_aborted",
                node = self.node.0,
                error = %error
            );
        }
        remove_orphan_runs(&folder);
        result
    }

    fn drain_and_compose(&self, ctx: &RunContext, folder: &Path) -> Result<()> {
        let snapshot = ctx.run.snapshot;
        let budget_bytes = ctx.config.reducer_buffer_kb * 1024;
        let ring = ctx.run.ring(self.node);

        let mut buffered: Vec<LogRecord> = Vec::new();
        let mut buffered_bytes = 0_usize;
        let mut spills: Vec<PathBuf> = Vec::new();
        let mut received = 0_u64;

        loop {
            if ctx.control.gleaner.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            if let Some(batch) = ring.pop(POP_WAIT) {
                received += batch.len() as u64;
                for record in batch {
                    buffered_bytes += spilled_size(&record);
                    buffered.push(record);
                }
                if buffered_bytes >= budget_bytes {
                    let path = spill_run(
                        folder,
                        spills.len(),
                        std::mem::take(&mut buffered),
                    )?;
                    trace!(
                        target: "kiln::snapshot::reducer",
                        event = "run_spilled",
                        node = self.node.0,
                        run = spills.len(),
                        bytes = buffered_bytes,
                        path = %path.display()
                    );
                    buffered_bytes = 0;
                    spills.push(path);
                }
            } else if !ctx.run.mappers_active() && ring.is_empty() {
                break;
            }
        }

        if received == 0 {
            debug!(
                target: "kiln::snapshot::reducer",
                event = "reducer_idle",
                node = self.node.0,
                snapshot = snapshot.id.0
            );
            return Ok(());
        }

        buffered.sort_by_key(LogRecord::sort_key);
        let mut streams: Vec<RunStream> = Vec::with_capacity(spills.len() + 1);
        for path in &spills {
            streams.push(RunStream::Spill(SpillReader::open(path)?));
        }
        streams.push(RunStream::Memory(buffered.into_iter()));

        let composed = self.compose_merged(ctx, streams)?;
        info!(
            target: "kiln::snapshot::reducer",
            event = "reducer_done",
            node = self.node.0,
            snapshot = snapshot.id.0,
            records = received,
            spilled_runs = spills.len(),
            storages_composed = composed
        );
        Ok(())
    }

    /// K-way merge over the runs; each storage's contiguous slice of the
    /// merged stream goes to its composer.
    fn compose_merged(&self, ctx: &RunContext, mut streams: Vec<RunStream>) -> Result<usize> {
        let cancel = ctx.control.gleaner.cancel_flag();
        let fileset = SnapshotFileSet::new(ctx.config.clone());
        let mut writer: Option<SnapshotWriter> = None;

        let mut heap: BinaryHeap<Reverse<HeadEntry>> = BinaryHeap::new();
        for (index, stream) in streams.iter_mut().enumerate() {
            if let Some(record) = stream.next()? {
                heap.push(Reverse(HeadEntry {
                    record,
                    stream: index,
                }));
            }
        }

        let mut current: Vec<LogRecord> = Vec::new();
        let mut composed = 0_usize;
        while let Some(Reverse(head)) = heap.pop() {
            if let Some(record) = streams[head.stream].next()? {
                heap.push(Reverse(HeadEntry {
                    record,
                    stream: head.stream,
                }));
            }
            let storage_changed = current
                .last()
                .is_some_and(|last| last.storage_id != head.record.storage_id);
            if storage_changed {
                self.compose_storage(ctx, &fileset, &mut writer, &mut current, &cancel)?;
                composed += 1;
            }
            current.push(head.record);
        }
        if !current.is_empty() {
            self.compose_storage(ctx, &fileset, &mut writer, &mut current, &cancel)?;
            composed += 1;
        }

        if let Some(writer) = writer {
            writer.finalize()?;
        }
        Ok(composed)
    }

    fn compose_storage(
        &self,
        ctx: &RunContext,
        fileset: &SnapshotFileSet,
        writer: &mut Option<SnapshotWriter>,
        records: &mut Vec<LogRecord>,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> Result<()> {
        let snapshot = ctx.run.snapshot;
        let storage_id = records[0].storage_id;
        let composer = ctx.storages.composer_for(storage_id).ok_or_else(|| {
            KilnError::Inconsistent(format!(
                "no composer for storage {storage_id} with mapped records"
            ))
        })?;
        if writer.is_none() {
            *writer = Some(SnapshotWriter::create(
                &ctx.config,
                self.node,
                snapshot.id,
            )?);
        }
        let sink = writer.as_mut().ok_or_else(|| {
            KilnError::Inconsistent("snapshot writer missing after creation".to_owned())
        })?;
        let root = composer.compose(ComposeArgs {
            sink,
            source: fileset,
            records: records.as_slice(),
            base_epoch: snapshot.base_epoch,
            valid_until_epoch: snapshot.valid_until_epoch,
            cancelled: cancel,
        })?;
        ctx.run.publish_root(storage_id, self.node, root);
        records.clear();
        Ok(())
    }
}

// ── Sorted run streams ──────────────────────────────────────────────────────

struct HeadEntry {
    record: LogRecord,
    stream: usize,
}

impl PartialEq for HeadEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeadEntry {}

impl PartialOrd for HeadEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.record
            .sort_key()
            .cmp(&other.record.sort_key())
            .then(self.stream.cmp(&other.stream))
    }
}

enum RunStream {
    Memory(std::vec::IntoIter<LogRecord>),
    Spill(SpillReader),
}

impl RunStream {
    fn next(&mut self) -> Result<Option<LogRecord>> {
        match self {
            Self::Memory(iter) => Ok(iter.next()),
            Self::Spill(reader) => reader.next(),
        }
    }
}

// ── Spill files ─────────────────────────────────────────────────────────────

/// Bytes one record occupies in a spill file.
fn spilled_size(record: &LogRecord) -> usize {
    4 + 8 + 8 + 4 + 1 + 4 + record.payload.len()
}

fn record_kind_tag(kind: RecordKind) -> u8 {
    match kind {
        RecordKind::Overwrite => 0,
    }
}

fn record_kind_from_tag(tag: u8) -> Result<RecordKind> {
    match tag {
        0 => Ok(RecordKind::Overwrite),
        other => Err(KilnError::Inconsistent(format!(
            "unknown record kind {other} in spill file"
        ))),
    }
}

/// Sort `records` and write them as one run file.
fn spill_run(folder: &Path, sequence: usize, mut records: Vec<LogRecord>) -> Result<PathBuf> {
    records.sort_by_key(LogRecord::sort_key);
    let path = folder.join(format!("{SPILL_PREFIX}{sequence}{SPILL_SUFFIX}"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)?;
    let mut out = BufWriter::new(file);
    for record in &records {
        out.write_all(&record.storage_id.0.to_le_bytes())?;
        out.write_all(&record.key.0.to_le_bytes())?;
        out.write_all(&record.ordinal.0.to_le_bytes())?;
        out.write_all(&record.epoch.0.to_le_bytes())?;
        out.write_all(&[record_kind_tag(record.kind)])?;
        out.write_all(&(record.payload.len() as u32).to_le_bytes())?;
        out.write_all(&record.payload)?;
    }
    out.flush()?;
    Ok(path)
}

struct SpillReader {
    input: BufReader<File>,
}

impl SpillReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            input: BufReader::new(File::open(path)?),
        })
    }

    fn next(&mut self) -> Result<Option<LogRecord>> {
        let mut storage = [0_u8; 4];
        match self.input.read_exact(&mut storage) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut u64_buf = [0_u8; 8];
        self.input.read_exact(&mut u64_buf)?;
        let key = u64::from_le_bytes(u64_buf);
        self.input.read_exact(&mut u64_buf)?;
        let ordinal = u64::from_le_bytes(u64_buf);
        let mut u32_buf = [0_u8; 4];
        self.input.read_exact(&mut u32_buf)?;
        let epoch = u32::from_le_bytes(u32_buf);
        let mut kind = [0_u8; 1];
        self.input.read_exact(&mut kind)?;
        self.input.read_exact(&mut u32_buf)?;
        let payload_len = u32::from_le_bytes(u32_buf) as usize;
        let mut payload = vec![0_u8; payload_len];
        self.input.read_exact(&mut payload)?;
        Ok(Some(LogRecord {
            storage_id: StorageId(u32::from_le_bytes(storage)),
            key: RecordKey(key),
            ordinal: Ordinal(ordinal),
            epoch: Epoch(epoch),
            kind: record_kind_from_tag(kind[0])?,
            payload,
        }))
    }
}

/// Delete leftover run files, e.g. from a previously aborted snapshot.
fn remove_orphan_runs(folder: &Path) {
    let Ok(entries) = fs::read_dir(folder) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(SPILL_PREFIX) && name.ends_with(SPILL_SUFFIX) {
            if let Err(error) = fs::remove_file(entry.path()) {
                warn!(
                    target: "kiln::snapshot::reducer",
                    event = "orphan_run_removal_failed",
                    path = %entry.path().display(),
                    error = %error
                );
            }
        }
    }
}
