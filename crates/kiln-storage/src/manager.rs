//! In-memory reference implementation of the storage manager seam.
//!
//! Owns the live storages and their home-node pools, and hands out
//! composers and partitioners to the snapshot pipeline. A deployment with
//! its own storage manager only needs to implement `StorageManager`.

use crate::composer::Composer;
use crate::overwrite::OverwriteStorage;
use crate::{PageSource, Partitioner, StorageKind, StorageManager, StorageMeta};
use kiln_error::{KilnError, Result};
use kiln_pool::PagePool;
use kiln_types::{Epoch, RecordKey, StorageId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub struct MemoryStorageManager {
    /// Volatile pools indexed by node id.
    pools: Vec<Arc<PagePool>>,
    storages: RwLock<BTreeMap<StorageId, Arc<OverwriteStorage>>>,
    /// Reader over installed snapshots, wired once the engine knows its
    /// snapshot folders. Needed to re-materialize dropped leaves.
    loader: RwLock<Option<Arc<dyn PageSource>>>,
}

impl MemoryStorageManager {
    #[must_use]
    pub fn new(pools: Vec<Arc<PagePool>>) -> Self {
        Self {
            pools,
            storages: RwLock::new(BTreeMap::new()),
            loader: RwLock::new(None),
        }
    }

    pub fn set_page_loader(&self, loader: Arc<dyn PageSource>) {
        *self.loader.write() = Some(loader);
    }

    #[must_use]
    pub fn pools(&self) -> &[Arc<PagePool>] {
        &self.pools
    }

    pub fn create_storage(&self, meta: StorageMeta) -> Result<Arc<OverwriteStorage>> {
        meta.validate()?;
        let home = meta.home_node.0 as usize;
        let pool = self.pools.get(home).ok_or_else(|| {
            KilnError::Config(format!(
                "storage {} wants home node {} but only {} pools exist",
                meta.id,
                meta.home_node,
                self.pools.len()
            ))
        })?;
        let mut storages = self.storages.write();
        if storages.contains_key(&meta.id) {
            return Err(KilnError::Config(format!(
                "storage id {} already exists",
                meta.id
            )));
        }
        info!(
            target: "kiln::storage",
            event = "storage_created",
            storage = meta.id.0,
            name = %meta.name,
            key_capacity = meta.key_capacity,
            home_node = meta.home_node.0
        );
        let storage = Arc::new(OverwriteStorage::new(meta.clone(), Arc::clone(pool))?);
        storages.insert(meta.id, Arc::clone(&storage));
        Ok(storage)
    }

    #[must_use]
    pub fn storage(&self, id: StorageId) -> Option<Arc<OverwriteStorage>> {
        self.storages.read().get(&id).cloned()
    }

    /// Apply one committed write to the live volatile tree.
    pub fn apply_write(
        &self,
        id: StorageId,
        key: RecordKey,
        payload: &[u8],
        epoch: Epoch,
    ) -> Result<()> {
        let storage = self
            .storage(id)
            .ok_or_else(|| KilnError::Inconsistent(format!("no storage {id}")))?;
        let loader = self.loader.read().clone();
        storage.apply_write(key, payload, epoch, loader.as_deref())
    }

    /// Read one record from the live system.
    pub fn read(&self, id: StorageId, key: RecordKey) -> Result<Vec<u8>> {
        let storage = self
            .storage(id)
            .ok_or_else(|| KilnError::Inconsistent(format!("no storage {id}")))?;
        let loader = self.loader.read().clone();
        storage.read(key, loader.as_deref())
    }
}

impl StorageManager for MemoryStorageManager {
    fn largest_storage_id(&self) -> StorageId {
        self.storages
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(StorageId(0))
    }

    fn clone_all_storage_metadata(&self) -> Vec<StorageMeta> {
        self.storages.read().values().map(|s| s.meta()).collect()
    }

    fn composer_for(&self, id: StorageId) -> Option<Composer> {
        let storage = self.storage(id)?;
        match storage.meta().kind {
            StorageKind::Overwrite => Some(Composer::Overwrite(storage)),
        }
    }

    fn partitioner_for(&self, id: StorageId) -> Option<Partitioner> {
        let storage = self.storage(id)?;
        Some(Partitioner::SingleNode {
            home: storage.meta().home_node,
        })
    }
}
