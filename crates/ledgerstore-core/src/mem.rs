//! In-memory physical engine and an explicit registry of named stores.
//!
//! `MemStoreRegistry` is an ordinary value: two registries never share
//! stores, so tests that each build their own run in parallel without
//! seeing each other's data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    paged, BatchOp, KeyValueReader, KeyValueStore, KeyValueWriter, KvIter, LiveTree, Snapshot,
    Tree, WriteBatch,
};

type Registered = Mutex<HashMap<String, LiveTree>>;

/// Frozen version of an ordered map; the snapshot type of both engines.
///
/// Taking one is O(1): it shares the engine's current map, and the engine
/// copies the map on its next write only while the snapshot is alive.
pub struct MemSnapshot {
    data: Tree,
}

impl MemSnapshot {
    pub fn new(data: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { data: Arc::new(data) }
    }

    pub(crate) fn shared(data: Tree) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KeyValueReader for MemSnapshot {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        Ok(paged(Arc::clone(&self.data), prefix, start))
    }
}

impl Snapshot for MemSnapshot {}

/// Ordered in-memory store.
pub struct MemStore {
    name: String,
    data: LiveTree,
    closed: AtomicBool,
    registry: Weak<Registered>,
}

impl MemStore {
    /// A standalone store that belongs to no registry.
    pub fn new() -> Self {
        Self {
            name: "mem".to_string(),
            data: LiveTree::default(),
            closed: AtomicBool::new(false),
            registry: Weak::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed { what: format!("mem store {}", self.name) });
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("name", &self.name)
            .field("entries", &self.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl KeyValueReader for MemStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        self.check_open()?;
        Ok(paged(Arc::clone(&self.data), prefix, start))
    }
}

impl KeyValueWriter for MemStore {
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        Arc::make_mut(&mut *self.data.write()).insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        Arc::make_mut(&mut *self.data.write()).remove(key);
        Ok(())
    }

    fn write(&self, batch: &WriteBatch) -> StoreResult<()> {
        self.check_open()?;
        let mut guard = self.data.write();
        let data = Arc::make_mut(&mut *guard);
        for op in batch.ops() {
            match op {
                BatchOp::Put(k, v) => { data.insert(k.clone(), v.clone()); }
                BatchOp::Delete(k) => { data.remove(k); }
            }
        }
        Ok(())
    }
}

impl KeyValueStore for MemStore {
    fn compact(&self, _start: &[u8], _limit: &[u8]) -> StoreResult<()> {
        self.check_open()
    }

    fn snapshot(&self) -> StoreResult<Arc<dyn Snapshot>> {
        self.check_open()?;
        Ok(Arc::new(MemSnapshot::shared(Arc::clone(&*self.data.read()))))
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        *self.data.write() = Tree::default();
        if let Some(registry) = self.registry.upgrade() {
            let mut stores = registry.lock();
            if stores.get(&self.name).is_some_and(|d| Arc::ptr_eq(d, &self.data)) {
                stores.remove(&self.name);
            }
        }
        Ok(())
    }
}

/// Named in-memory stores, passed explicitly to whoever needs them.
///
/// Data outlives individual `MemStore` handles: closing a handle and opening
/// the same name again sees the same contents, like reopening a directory.
#[derive(Clone, Default)]
pub struct MemStoreRegistry {
    stores: Arc<Registered>,
}

impl MemStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, creating an empty store if it does not exist.
    pub fn open(&self, name: &str) -> Arc<MemStore> {
        let data = {
            let mut stores = self.stores.lock();
            Arc::clone(stores.entry(name.to_string()).or_default())
        };
        Arc::new(MemStore {
            name: name.to_string(),
            data,
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(&self.stores),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.lock().contains_key(name)
    }

    /// Registered names in ascending order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget `name` and its data. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.stores.lock().remove(name).is_some()
    }
}

impl std::fmt::Debug for MemStoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStoreRegistry")
            .field("names", &self.names())
            .finish()
    }
}
