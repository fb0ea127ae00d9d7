//! Snapshot page files: sequential writer and random-access file set.
//!
//! Each node writes its pages of snapshot `<id>` to
//! `<node_folder>/snapshot_<id>.data` as a flat sequence of `PAGE_SIZE`
//! pages. Local page ids start at 1 (0 is the null pointer); page `n`
//! lives at byte offset `(n - 1) * PAGE_SIZE`.

use crate::SnapshotConfig;
use kiln_error::{KilnError, Result};
use kiln_storage::{PageSink, PageSource};
use kiln_types::{NodeId, PAGE_SIZE, PageData, SnapshotId, SnapshotPagePointer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fsync a directory so a freshly created file inside it survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// ── Writer ──────────────────────────────────────────────────────────────────

/// Sequential page writer for one `(node, snapshot)` pair.
///
/// Pages get monotonically increasing local ids in write order; composers
/// rely on this to emit leaves left-to-right and the root last.
pub struct SnapshotWriter {
    node: NodeId,
    snapshot_id: SnapshotId,
    path: PathBuf,
    folder: PathBuf,
    file: File,
    next_local: u64,
}

impl SnapshotWriter {
    /// Create the node folder (if missing) and an empty data file.
    pub fn create(config: &SnapshotConfig, node: NodeId, snapshot_id: SnapshotId) -> Result<Self> {
        let folder = config.node_folder(node);
        fs::create_dir_all(&folder)?;
        let path = config.data_file_path(node, snapshot_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        debug!(
            target: "kiln::snapshot::writer",
            event = "data_file_created",
            node = node.0,
            snapshot = snapshot_id.0,
            path = %path.display()
        );
        Ok(Self {
            node,
            snapshot_id,
            path,
            folder,
            file,
            next_local: 1,
        })
    }

    /// Pages written so far.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.next_local - 1
    }

    /// Flush and fsync the data file and its folder.
    pub fn finalize(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        fsync_dir(&self.folder)?;
        info!(
            target: "kiln::snapshot::writer",
            event = "data_file_sealed",
            node = self.node.0,
            snapshot = self.snapshot_id.0,
            pages = self.page_count(),
            path = %self.path.display()
        );
        Ok(())
    }
}

impl PageSink for SnapshotWriter {
    fn node(&self) -> NodeId {
        self.node
    }

    fn write_page(&mut self, body: &PageData) -> Result<SnapshotPagePointer> {
        let pointer = SnapshotPagePointer::new(self.snapshot_id, self.node, self.next_local)
            .map_err(|e| KilnError::Inconsistent(e.to_string()))?;
        self.file.write_all(body)?;
        self.next_local += 1;
        Ok(pointer)
    }
}

// ── File set ────────────────────────────────────────────────────────────────

/// Random-access reader over snapshot data files, any snapshot and node.
///
/// Files open lazily on first touch and stay open for the file set's
/// lifetime. Safe to share across threads.
pub struct SnapshotFileSet {
    config: SnapshotConfig,
    files: Mutex<HashMap<(SnapshotId, NodeId), File>>,
}

impl SnapshotFileSet {
    #[must_use]
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl PageSource for SnapshotFileSet {
    fn read_page(&self, pointer: SnapshotPagePointer, out: &mut PageData) -> Result<()> {
        if pointer.is_null() {
            return Err(KilnError::Inconsistent(
                "attempt to read the null snapshot page".to_owned(),
            ));
        }
        let key = (pointer.snapshot_id(), pointer.node());
        let mut files = self.files.lock();
        let file = match files.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self.config.data_file_path(key.1, key.0);
                let file = File::open(&path).map_err(|e| {
                    KilnError::Inconsistent(format!(
                        "snapshot data file {} missing: {e}",
                        path.display()
                    ))
                })?;
                entry.insert(file)
            }
        };
        let offset = (pointer.local_page_id() - 1) * PAGE_SIZE as u64;
        file.read_exact_at(out, offset)?;
        Ok(())
    }
}
