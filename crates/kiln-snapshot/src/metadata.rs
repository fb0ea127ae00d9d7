//! Durable snapshot metadata.
//!
//! One `snapshot_metadata_<id>.xml` per snapshot under the primary folder,
//! carrying the epoch range and every storage's metadata with the root
//! pointers the snapshot installed. The file and its parent directory are
//! fsynced before the savepoint may advance.

use crate::{Snapshot, SnapshotConfig};
use kiln_error::{KilnError, Result};
use kiln_storage::StorageMeta;
use kiln_types::{Epoch, SnapshotId, SnapshotPagePointer, StorageId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::time::Instant;
use tracing::{debug, info};

/// Persisted image of one snapshot's metadata.
///
/// `base_epoch` uses the raw epoch integer with 0 for "no predecessor" so
/// the file format has no optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "snapshot_metadata")]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub largest_storage_id: StorageId,
    #[serde(rename = "storage", default)]
    pub storages: Vec<StorageMeta>,
}

impl SnapshotMetadata {
    /// Assemble the metadata for `snapshot`: cloned storage records with
    /// the new root pointers installed.
    pub fn assemble(
        snapshot: &Snapshot,
        mut storages: Vec<StorageMeta>,
        new_roots: &std::collections::BTreeMap<StorageId, SnapshotPagePointer>,
    ) -> Result<Self> {
        let mut installed = 0_usize;
        for meta in &mut storages {
            if let Some(&new_root) = new_roots.get(&meta.id) {
                if new_root == meta.root_snapshot_page_id {
                    return Err(KilnError::Inconsistent(format!(
                        "storage {} produced an unchanged root {new_root}",
                        meta.id
                    )));
                }
                meta.root_snapshot_page_id = new_root;
                installed += 1;
            }
        }
        if installed != new_roots.len() {
            return Err(KilnError::Inconsistent(format!(
                "{} new roots but only {installed} matching storages",
                new_roots.len()
            )));
        }
        info!(
            target: "kiln::snapshot::metadata",
            event = "roots_installed",
            snapshot = snapshot.id.0,
            storages = storages.len(),
            changed_roots = installed
        );
        Ok(Self {
            id: snapshot.id,
            base_epoch: snapshot.base_epoch.unwrap_or(Epoch::INVALID),
            valid_until_epoch: snapshot.valid_until_epoch,
            largest_storage_id: snapshot.max_storage_id,
            storages,
        })
    }

    /// Write, fsync, and fsync the parent folder.
    pub fn save_to_file(&self, config: &SnapshotConfig) -> Result<()> {
        let folder = &config.primary_folder_path;
        if !folder.exists() {
            fs::create_dir_all(folder)?;
        }
        let path = config.metadata_file_path(self.id);
        let xml = quick_xml::se::to_string(self).map_err(|e| KilnError::Metadata(e.to_string()))?;

        let started = Instant::now();
        let mut file = File::create(&path)?;
        file.write_all(xml.as_bytes())?;
        file.sync_all()?;
        crate::writer::fsync_dir(folder)?;
        info!(
            target: "kiln::snapshot::metadata",
            event = "metadata_written",
            snapshot = self.id.0,
            bytes = xml.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            path = %path.display()
        );
        Ok(())
    }

    /// Load and parse the metadata of `snapshot_id`.
    pub fn load_from_file(config: &SnapshotConfig, snapshot_id: SnapshotId) -> Result<Self> {
        let path = config.metadata_file_path(snapshot_id);
        let xml = fs::read_to_string(&path)?;
        let parsed: Self =
            quick_xml::de::from_str(&xml).map_err(|e| KilnError::Metadata(e.to_string()))?;
        if parsed.id != snapshot_id {
            return Err(KilnError::Metadata(format!(
                "metadata file {} carries id {}, expected {snapshot_id}",
                path.display(),
                parsed.id
            )));
        }
        debug!(
            target: "kiln::snapshot::metadata",
            event = "metadata_loaded",
            snapshot = snapshot_id.0,
            storages = parsed.storages.len()
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_storage::StorageKind;
    use kiln_types::NodeId;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn test_config(root: &Path) -> SnapshotConfig {
        let mut config = SnapshotConfig::default();
        config.folder_path_pattern =
            root.join("node_$NODE$").to_string_lossy().into_owned();
        config.primary_folder_path = root.to_path_buf();
        config.validate().unwrap()
    }

    fn storage_meta(id: u32, root: SnapshotPagePointer) -> StorageMeta {
        StorageMeta {
            id: StorageId(id),
            kind: StorageKind::Overwrite,
            name: format!("storage-{id}"),
            key_capacity: 1000,
            record_size: 16,
            home_node: NodeId(0),
            root_snapshot_page_id: root,
        }
    }

    #[test]
    fn assemble_installs_new_roots() {
        let snapshot = Snapshot {
            id: SnapshotId(1),
            base_epoch: None,
            valid_until_epoch: Epoch(5),
            max_storage_id: StorageId(2),
        };
        let new_root = SnapshotPagePointer::new(SnapshotId(1), NodeId(0), 3).unwrap();
        let mut roots = BTreeMap::new();
        roots.insert(StorageId(1), new_root);

        let metadata = SnapshotMetadata::assemble(
            &snapshot,
            vec![
                storage_meta(1, SnapshotPagePointer::NULL),
                storage_meta(2, SnapshotPagePointer::NULL),
            ],
            &roots,
        )
        .unwrap();
        assert_eq!(metadata.base_epoch, Epoch::INVALID);
        assert_eq!(metadata.storages[0].root_snapshot_page_id, new_root);
        assert_eq!(
            metadata.storages[1].root_snapshot_page_id,
            SnapshotPagePointer::NULL
        );

        // a root for a storage that does not exist is an inconsistency
        roots.insert(StorageId(9), new_root);
        assert!(
            SnapshotMetadata::assemble(&snapshot, vec![storage_meta(1, SnapshotPagePointer::NULL)], &roots)
                .is_err()
        );
    }

    #[test]
    fn xml_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let root = SnapshotPagePointer::new(SnapshotId(4), NodeId(1), 77).unwrap();
        let metadata = SnapshotMetadata {
            id: SnapshotId(4),
            base_epoch: Epoch(9),
            valid_until_epoch: Epoch(12),
            largest_storage_id: StorageId(3),
            storages: vec![storage_meta(1, root), storage_meta(3, SnapshotPagePointer::NULL)],
        };
        metadata.save_to_file(&config).unwrap();
        assert!(config.metadata_file_path(SnapshotId(4)).exists());

        let loaded = SnapshotMetadata::load_from_file(&config, SnapshotId(4)).unwrap();
        assert_eq!(loaded, metadata);
        // pointer fields survive the text format bit-exactly
        assert_eq!(loaded.storages[0].root_snapshot_page_id, root);

        assert!(SnapshotMetadata::load_from_file(&config, SnapshotId(5)).is_err());
    }

    #[test]
    fn empty_storage_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let metadata = SnapshotMetadata {
            id: SnapshotId(1),
            base_epoch: Epoch::INVALID,
            valid_until_epoch: Epoch(1),
            largest_storage_id: StorageId(0),
            storages: Vec::new(),
        };
        metadata.save_to_file(&config).unwrap();
        let loaded = SnapshotMetadata::load_from_file(&config, SnapshotId(1)).unwrap();
        assert!(loaded.storages.is_empty());
    }
}
