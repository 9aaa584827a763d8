//! Directory-per-store producer rooted in a node data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ledgerstore_core::{
    Config, DiskStore, EntryLimits, KeyValueStore, StoreError, StoreProducer, StoreResult,
    WriteBackCache,
};
use tracing::debug;

/// Opens `DiskStore`s under `<root>/<name>`.
///
/// Names with an existing directory open eagerly. Any other name gets a lazy
/// cache whose directory is created on its first flush.
#[derive(Debug, Clone)]
pub struct DiskProducer {
    root: PathBuf,
    config: Config,
}

impl DiskProducer {
    pub fn new<P: AsRef<Path>>(root: P, config: Config) -> StoreResult<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::Producer {
            name: root.display().to_string(),
            message: format!("failed to create data directory: {}", e),
        })?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding store `name`.
    pub fn path_of(&self, name: &str) -> StoreResult<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\')
            && !name.starts_with('.');
        if !valid {
            return Err(StoreError::Producer {
                name: name.to_string(),
                message: "store names must be plain directory names".to_string(),
            });
        }
        Ok(self.root.join(name))
    }
}

impl StoreProducer for DiskProducer {
    type Store = WriteBackCache;

    fn open(&self, name: &str) -> StoreResult<Arc<WriteBackCache>> {
        let path = self.path_of(name)?;
        let overhead = self.config.entry_overhead;
        let limits = EntryLimits::from(&self.config);

        if path.is_dir() {
            let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(&path, self.config.clone())?);
            return Ok(Arc::new(WriteBackCache::new(name, store, overhead).with_limits(limits)));
        }

        let config = self.config.clone();
        let owned = name.to_string();
        let cache = WriteBackCache::lazy(name, move || {
            debug!(name = %owned, path = %path.display(), "creating store directory");
            let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(&path, config.clone())?);
            Ok(store)
        }, overhead)
        .with_limits(limits);
        Ok(Arc::new(cache))
    }

    fn names(&self) -> StoreResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::Producer {
            name: self.root.display().to_string(),
            message: format!("failed to list data directory: {}", e),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
