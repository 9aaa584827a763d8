//! On-disk physical engine.
//!
//! DiskStore keeps an ordered RAM map as its read surface and a crash-safe
//! WAL as its durability layer.
//!
//! **Read path**: RAM only (concurrent via RwLock, iterators page through it)
//! **Write path**: one WAL record per batch with durable_sync, then RAM
//! **Recovery**: replay every complete record; a torn tail batch is discarded
//! whole and cut from the log, any other damage fails `open`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::compaction::{compact_log, needs_compaction, CompactionResult};
use crate::config::Config;
use crate::durability::remove_dir_durable;
use crate::error::{StoreError, StoreResult};
use crate::format::{serialize_batch, EntryLimits, HEADER_SIZE};
use crate::mem::MemSnapshot;
use crate::store::{
    paged, BatchOp, KeyValueReader, KeyValueStore, KeyValueWriter, KvIter, LiveTree, Snapshot,
    Tree, WriteBatch,
};
use crate::wal::{WalReader, WalWriter};

/// Approximate record bytes a live entry occupies after compaction.
const LIVE_ENTRY_OVERHEAD: u64 = 8;

/// RAM map + WAL physical store, one directory per store.
///
/// All methods take `&self`. Readers share the map's RwLock; writers
/// serialize on the WAL mutex and hold it while applying to RAM, so RAM
/// order always equals log order.
pub struct DiskStore {
    data: LiveTree,
    /// `None` once closed
    wal: Mutex<Option<WalWriter>>,
    /// Bytes currently in the log, for the compaction trigger
    log_bytes: Mutex<u64>,
    path: PathBuf,
    config: Config,
}

impl DiskStore {
    /// Open or create a store at `path`, replaying its WAL.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io(&wal_dir, e, "failed to create WAL directory"))?;

        let recovery = WalReader::new(&wal_dir).recover()?;
        let mut data = BTreeMap::new();
        for batch in &recovery.batches {
            apply(&mut data, batch);
        }

        if !recovery.batches.is_empty() {
            info!(
                path = %path.display(),
                batches = recovery.batches.len(),
                entries = data.len(),
                torn_tail = recovery.torn_tail.is_some(),
                "recovered store from WAL"
            );
        }
        recovery.truncate_torn_tail()?;

        let wal = WalWriter::new(&wal_dir, config.wal_rotation_size_bytes)?;

        Ok(Self {
            data: Arc::new(RwLock::new(Arc::new(data))),
            wal: Mutex::new(Some(wal)),
            log_bytes: Mutex::new(recovery.log_bytes),
            path,
            config,
        })
    }

    /// Directory holding this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live key-value pairs.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.wal.lock().is_none()
    }

    fn closed_error(&self) -> StoreError {
        StoreError::Closed { what: format!("disk store {}", self.path.display()) }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn limits(&self) -> EntryLimits {
        EntryLimits::from(&self.config)
    }

    /// Rewrite the log as its live set and report what was reclaimed.
    pub fn compact_now(&self) -> StoreResult<CompactionResult> {
        let mut wal = self.wal.lock();
        if wal.is_none() {
            return Err(self.closed_error());
        }
        let wal_dir = self.path.join("wal");

        // The writer's file handle must not outlive its segment.
        *wal = None;
        let live: Tree = Arc::clone(&*self.data.read());
        let result = compact_log(&wal_dir, &live, self.limits());
        // Reopen whether or not compaction succeeded; the log is intact either way.
        *wal = Some(WalWriter::new(&wal_dir, self.config.wal_rotation_size_bytes)?);
        let result = result?;

        *self.log_bytes.lock() = result.compacted_bytes;
        info!(
            path = %self.path.display(),
            live = result.live_entries,
            retired = result.retired_segments,
            saved = result.bytes_saved(),
            "compacted WAL"
        );
        Ok(result)
    }

    /// Compact only if dead log space reached `compaction_trigger_ratio`.
    pub fn maybe_compact(&self) -> StoreResult<Option<CompactionResult>> {
        let log_bytes = *self.log_bytes.lock();
        let live_bytes: u64 = {
            let data = self.data.read();
            let entries = data.len() as u64;
            let payload: u64 = data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
            payload + entries * LIVE_ENTRY_OVERHEAD + HEADER_SIZE as u64
        };
        if needs_compaction(log_bytes, live_bytes, self.config.compaction_trigger_ratio) {
            return self.compact_now().map(Some);
        }
        Ok(None)
    }
}

fn apply(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: &[BatchOp]) {
    for op in ops {
        match op {
            BatchOp::Put(k, v) => { data.insert(k.clone(), v.clone()); }
            BatchOp::Delete(k) => { data.remove(k); }
        }
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}

impl KeyValueReader for DiskStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        self.check_open()?;
        Ok(paged(Arc::clone(&self.data), prefix, start))
    }
}

impl KeyValueWriter for DiskStore {
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&batch)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&batch)
    }

    /// WRITE ORDERING:
    /// 1. serialize the whole batch (size limits checked, nothing written yet)
    /// 2. WAL append + durable_sync
    /// 3. apply to RAM
    ///
    /// If the WAL write fails, RAM is never modified.
    fn write(&self, batch: &WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return self.check_open();
        }
        let record = serialize_batch(batch.ops(), self.limits())?;

        let mut wal = self.wal.lock();
        let writer = wal.as_mut().ok_or_else(|| self.closed_error())?;
        writer.append(&record)?;
        *self.log_bytes.lock() += record.len() as u64;

        apply(Arc::make_mut(&mut *self.data.write()), batch.ops());
        Ok(())
    }
}

impl KeyValueStore for DiskStore {
    /// The log has no key-range structure: any range compacts the whole log.
    fn compact(&self, _start: &[u8], _limit: &[u8]) -> StoreResult<()> {
        self.compact_now().map(|_| ())
    }

    fn snapshot(&self) -> StoreResult<Arc<dyn Snapshot>> {
        self.check_open()?;
        Ok(Arc::new(MemSnapshot::shared(Arc::clone(&*self.data.read()))))
    }

    fn close(&self) -> StoreResult<()> {
        if let Some(writer) = self.wal.lock().take() {
            writer.sync()?;
            debug!(path = %self.path.display(), "closed disk store");
        }
        Ok(())
    }

    fn destroy(&self) -> StoreResult<()> {
        self.wal.lock().take();
        *self.data.write() = Tree::default();
        remove_dir_durable(&self.path)
            .map_err(|e| StoreError::io(&self.path, e, "failed to remove store directory"))?;
        info!(path = %self.path.display(), "destroyed disk store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (DiskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().join("db"), Config::default()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_empty() {
        let (store, _dir) = test_store();
        assert!(store.is_empty());
        assert!(store.path().join("wal").is_dir());
    }

    #[test]
    fn test_put_get_overwrite_delete() {
        let (store, _dir) = test_store();
        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.len(), 1);
        store.delete(b"k").unwrap();
        assert!(!store.has(b"k").unwrap());
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            store.put(b"survive1", b"yes").unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"survive2", b"also_yes");
            batch.put(b"doomed", b"temp");
            batch.delete(b"doomed");
            store.write(&batch).unwrap();
            // no close: simulates a crash
        }
        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            assert_eq!(store.get(b"survive1").unwrap(), Some(b"yes".to_vec()));
            assert_eq!(store.get(b"survive2").unwrap(), Some(b"also_yes".to_vec()));
            assert_eq!(store.get(b"doomed").unwrap(), None);
            assert_eq!(store.len(), 2);
        }
    }

    fn newest_wal_file(root: &Path) -> PathBuf {
        let segments = crate::wal::list_wal_files(&root.join("wal")).unwrap();
        segments.last().unwrap().1.clone()
    }

    #[test]
    fn test_torn_tail_is_cut_before_new_appends() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            store.put(b"first", b"1").unwrap();
        }
        let wal_path = newest_wal_file(dir.path());
        let mut data = std::fs::read(&wal_path).unwrap();
        let half = data[..data.len() / 2].to_vec();
        data.extend_from_slice(&half);
        std::fs::write(&wal_path, data).unwrap();

        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            assert_eq!(store.len(), 1);
            store.put(b"second", b"2").unwrap();
        }

        // The second restart sees no damage in front of the new record
        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"first").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"second").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_corrupt_log_fails_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
        }
        let wal_path = newest_wal_file(dir.path());
        let mut data = std::fs::read(&wal_path).unwrap();
        data[HEADER_SIZE] ^= 0xFF;
        std::fs::write(&wal_path, data).unwrap();

        let err = DiskStore::open(dir.path(), Config::default()).unwrap_err();
        assert!(matches!(err, StoreError::WalCorrupted { offset: 0, .. }), "{:?}", err);
    }

    #[test]
    fn test_oversized_batch_leaves_ram_untouched() {
        let (store, _dir) = test_store();
        let mut batch = WriteBatch::new();
        batch.put(b"ok", b"v");
        batch.put(&vec![0u8; 4096], b"v");
        assert!(matches!(store.write(&batch), Err(StoreError::OversizedEntry { .. })));
        assert_eq!(store.get(b"ok").unwrap(), None);
    }

    #[test]
    fn test_iter_prefix_ordering() {
        let (store, _dir) = test_store();
        store.put(&[0x01, b'c'], b"val_c").unwrap();
        store.put(&[0x01, b'a'], b"val_a").unwrap();
        store.put(&[0x02, b'x'], b"val_x").unwrap();
        store.put(&[0x01, b'b'], b"val_b").unwrap();

        let results: Vec<_> = store.iter(&[0x01], b"").unwrap().map(Result::unwrap).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], (vec![0x01, b'a'], b"val_a".to_vec()));
        assert_eq!(results[2], (vec![0x01, b'c'], b"val_c".to_vec()));
    }

    #[test]
    fn test_compact_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            for i in 0..50u32 {
                store.put(b"hot", &i.to_le_bytes()).unwrap();
            }
            store.put(b"cold", b"c").unwrap();
            store.put(b"gone", b"g").unwrap();
            store.delete(b"gone").unwrap();

            let result = store.maybe_compact().unwrap().expect("log is mostly dead");
            assert_eq!(result.live_entries, 2);
            store.put(b"after", b"a").unwrap();
        }
        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"hot").unwrap(), Some(49u32.to_le_bytes().to_vec()));
        assert_eq!(store.get(b"cold").unwrap(), Some(b"c".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.get(b"after").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_close_then_reopen() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        store.put(b"k", b"v").unwrap();
        store.close().unwrap();
        assert!(matches!(store.put(b"k", b"x"), Err(StoreError::Closed { .. })));
        drop(store);

        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_destroy_removes_directory() {
        let (store, _dir) = test_store();
        store.put(b"k", b"v").unwrap();
        let path = store.path().to_path_buf();
        store.destroy().unwrap();
        assert!(!path.exists());
        assert!(store.get(b"k").is_err());
    }

    #[test]
    fn test_snapshot_isolated_from_writes() {
        let (store, _dir) = test_store();
        store.put(b"a", b"1").unwrap();
        let snap = store.snapshot().unwrap();
        store.put(b"b", b"2").unwrap();
        let keys: Vec<_> = snap.iter(b"", b"").unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_concurrent_reads() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);
        for i in 0..100 {
            store.put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let s = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let val = s.get(format!("k{}", i).as_bytes()).unwrap().unwrap();
                    assert_eq!(val, format!("v{}", i).as_bytes());
                }
            }));
        }
        for h in handles { h.join().unwrap(); }
    }
}
