//! Write-back cache over a physical store.
//!
//! Every mutation lands in an ordered in-memory buffer; reads merge the
//! buffer over the store; `flush` drains the buffer into the store as one
//! batch. A lazy cache opens its store only when there is something to
//! flush, so names that are registered but never written never touch disk.
//!
//! Entries are checked against the store's size limits when they are
//! buffered, so a write the store would reject never reaches a flush.
//! The buffer map is shared copy-on-write with snapshots and the flush in
//! progress; iterators read it one page at a time.

use std::cmp::Ordering as KeyOrdering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::EntryLimits;
use crate::store::{
    range_page, BatchOp, KeyValueReader, KeyValueStore, KeyValueWriter, KvIter, KvPair,
    PageSource, PagedIter, Snapshot, WriteBatch,
};

/// A store whose writes are buffered until `flush`.
pub trait FlushableStore: KeyValueStore {
    /// Durably write every buffered entry as one batch, then forget it.
    /// On error the buffer is left intact and the call can be retried.
    fn flush(&self) -> StoreResult<()>;

    /// Bytes buffered since the last flush, counting a fixed overhead per entry.
    fn not_flushed_size_estimate(&self) -> u64;

    /// Whether the physical store behind the cache has been opened.
    fn is_materialized(&self) -> bool {
        true
    }

    /// Read `key` from the physical store, ignoring the buffer. An unopened
    /// store reads as empty.
    fn get_underlying(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Write `key` straight to the physical store, opening it if needed.
    fn put_underlying(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;
}

/// Opens the physical store of a lazy cache.
pub type StoreFactory = Box<dyn Fn() -> StoreResult<Arc<dyn KeyValueStore>> + Send + Sync>;

/// A buffered value; `None` is a tombstone.
type Buffered = Option<Vec<u8>>;

type BufferMap = Arc<BTreeMap<Vec<u8>, Buffered>>;

type BufferedIter = Box<dyn Iterator<Item = (Vec<u8>, Buffered)> + Send>;

enum Backing {
    Ready(Arc<dyn KeyValueStore>),
    Lazy {
        producer: StoreFactory,
        store: OnceLock<Arc<dyn KeyValueStore>>,
        opening: Mutex<()>,
    },
}

impl Backing {
    fn opened(&self) -> Option<&Arc<dyn KeyValueStore>> {
        match self {
            Backing::Ready(store) => Some(store),
            Backing::Lazy { store, .. } => store.get(),
        }
    }
}

#[derive(Default)]
struct WriteBuffer {
    entries: BufferMap,
    size: u64,
}

/// Pages of the live buffer, locked once per page.
struct BufferPages(Arc<Mutex<WriteBuffer>>);

impl PageSource for BufferPages {
    type Value = Buffered;

    fn page(&self, from: &[u8], upper: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, Buffered)> {
        range_page(&*self.0.lock().entries, from, upper, limit)
    }
}

/// Write-back cache in front of one physical store.
pub struct WriteBackCache {
    name: String,
    backing: Backing,
    buffer: Arc<Mutex<WriteBuffer>>,
    /// Held for a whole flush so two flushes never race on the same capture
    flush_lock: Mutex<()>,
    closed: AtomicBool,
    entry_overhead: u64,
    limits: EntryLimits,
}

impl WriteBackCache {
    /// Cache over an already-open store.
    pub fn new(name: impl Into<String>, store: Arc<dyn KeyValueStore>, entry_overhead: u64) -> Self {
        Self::with_backing(name.into(), Backing::Ready(store), entry_overhead)
    }

    /// Cache whose store is opened by `producer` on first flush or `force_open`.
    ///
    /// Until then reads behave as if the store were empty. A failed open is
    /// reported to the flushing caller and attempted again next time; after
    /// the first success the producer is never called again.
    pub fn lazy<F>(name: impl Into<String>, producer: F, entry_overhead: u64) -> Self
    where
        F: Fn() -> StoreResult<Arc<dyn KeyValueStore>> + Send + Sync + 'static,
    {
        let backing = Backing::Lazy {
            producer: Box::new(producer),
            store: OnceLock::new(),
            opening: Mutex::new(()),
        };
        Self::with_backing(name.into(), backing, entry_overhead)
    }

    fn with_backing(name: String, backing: Backing, entry_overhead: u64) -> Self {
        Self {
            name,
            backing,
            buffer: Arc::new(Mutex::new(WriteBuffer::default())),
            flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            entry_overhead,
            limits: EntryLimits::from(&Config::default()),
        }
    }

    /// Reject buffered writes that exceed `limits`. Pass the limits of the
    /// store the cache flushes into.
    pub fn with_limits(mut self, limits: EntryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of buffered entries, tombstones included.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().entries.len()
    }

    /// Open the physical store now if it is not open yet.
    pub fn force_open(&self) -> StoreResult<()> {
        self.check_open()?;
        self.materialize().map(|_| ())
    }

    fn materialize(&self) -> StoreResult<Arc<dyn KeyValueStore>> {
        match &self.backing {
            Backing::Ready(store) => Ok(Arc::clone(store)),
            Backing::Lazy { producer, store, opening } => {
                if let Some(s) = store.get() {
                    return Ok(Arc::clone(s));
                }
                let _opening = opening.lock();
                if let Some(s) = store.get() {
                    return Ok(Arc::clone(s));
                }
                let opened = producer()?;
                debug!(name = %self.name, "materialized lazy store");
                Ok(Arc::clone(store.get_or_init(|| opened)))
            }
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed { what: format!("cache {}", self.name) });
        }
        Ok(())
    }

    fn entry_size(&self, key: &[u8], value: &Buffered) -> u64 {
        let value_len = value.as_ref().map_or(0, Vec::len);
        (key.len() + value_len) as u64 + self.entry_overhead
    }

    fn buffer_op(&self, buffer: &mut WriteBuffer, key: Vec<u8>, value: Buffered) {
        let added = self.entry_size(&key, &value);
        if let Some(old) = Arc::make_mut(&mut buffer.entries).insert(key.clone(), value) {
            buffer.size -= self.entry_size(&key, &old);
        }
        buffer.size += added;
    }
}

impl std::fmt::Debug for WriteBackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBackCache")
            .field("name", &self.name)
            .field("materialized", &self.is_materialized())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

impl KeyValueReader for WriteBackCache {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(buffered) = self.buffer.lock().entries.get(key) {
            return Ok(buffered.clone());
        }
        // A flush removes entries only after they reached the store.
        match self.backing.opened() {
            Some(store) => store.get(key),
            None => Ok(None),
        }
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        self.check_open()?;
        let buffered = PagedIter::new(BufferPages(Arc::clone(&self.buffer)), prefix, start);
        let stored = match self.backing.opened() {
            Some(store) => store.iter(prefix, start)?,
            None => Box::new(std::iter::empty()),
        };
        Ok(Box::new(MergeIter::new(Box::new(buffered), stored)))
    }
}

impl KeyValueWriter for WriteBackCache {
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.limits.check(key, value)?;
        let mut buffer = self.buffer.lock();
        self.buffer_op(&mut buffer, key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.limits.check(key, &[])?;
        let mut buffer = self.buffer.lock();
        self.buffer_op(&mut buffer, key.to_vec(), None);
        Ok(())
    }

    fn write(&self, batch: &WriteBatch) -> StoreResult<()> {
        self.check_open()?;
        self.limits.check_ops(batch.ops())?;
        let mut buffer = self.buffer.lock();
        for op in batch.ops() {
            match op {
                BatchOp::Put(k, v) => self.buffer_op(&mut buffer, k.clone(), Some(v.clone())),
                BatchOp::Delete(k) => self.buffer_op(&mut buffer, k.clone(), None),
            }
        }
        Ok(())
    }
}

impl KeyValueStore for WriteBackCache {
    fn compact(&self, start: &[u8], limit: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        match self.backing.opened() {
            Some(store) => store.compact(start, limit),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> StoreResult<Arc<dyn Snapshot>> {
        self.check_open()?;
        let buffered = Arc::clone(&self.buffer.lock().entries);
        let base = match self.backing.opened() {
            Some(store) => Some(store.snapshot()?),
            None => None,
        };
        Ok(Arc::new(CacheSnapshot { buffered, base }))
    }

    /// Unflushed writes are discarded.
    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.buffer.lock() = WriteBuffer::default();
        match self.backing.opened() {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    /// An unopened lazy store has nothing on disk, so only the buffer goes.
    fn destroy(&self) -> StoreResult<()> {
        if let Some(store) = self.backing.opened() {
            store.destroy()?;
        }
        self.closed.store(true, Ordering::Release);
        *self.buffer.lock() = WriteBuffer::default();
        Ok(())
    }
}

impl FlushableStore for WriteBackCache {
    fn flush(&self) -> StoreResult<()> {
        let _flushing = self.flush_lock.lock();
        self.check_open()?;

        let captured: BufferMap = {
            let buffer = self.buffer.lock();
            if buffer.entries.is_empty() {
                return Ok(());
            }
            Arc::clone(&buffer.entries)
        };

        let store = self.materialize()?;
        let mut batch = WriteBatch::new();
        for (key, value) in captured.iter() {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        store.write(&batch)?;

        let mut guard = self.buffer.lock();
        if Arc::ptr_eq(&guard.entries, &captured) {
            // No write landed while the batch was in flight.
            *guard = WriteBuffer::default();
        } else {
            // Entries rewritten in the meantime stay buffered.
            let buffer = &mut *guard;
            let entries = Arc::make_mut(&mut buffer.entries);
            for (key, value) in captured.iter() {
                if entries.get(key) == Some(value) {
                    entries.remove(key);
                    buffer.size -= self.entry_size(key, value);
                }
            }
        }
        debug!(name = %self.name, entries = batch.len(), bytes = batch.value_size(), "flushed cache");
        Ok(())
    }

    fn not_flushed_size_estimate(&self) -> u64 {
        self.buffer.lock().size
    }

    fn is_materialized(&self) -> bool {
        self.backing.opened().is_some()
    }

    fn get_underlying(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        match self.backing.opened() {
            Some(store) => store.get(key),
            None => Ok(None),
        }
    }

    fn put_underlying(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.materialize()?.put(key, value)
    }
}

/// Point-in-time view of a cache: a frozen buffer over a store snapshot.
struct CacheSnapshot {
    buffered: BufferMap,
    base: Option<Arc<dyn Snapshot>>,
}

impl KeyValueReader for CacheSnapshot {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.buffered.get(key) {
            return Ok(buffered.clone());
        }
        match &self.base {
            Some(base) => base.get(key),
            None => Ok(None),
        }
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        let buffered = PagedIter::new(Arc::clone(&self.buffered), prefix, start);
        let stored = match &self.base {
            Some(base) => base.iter(prefix, start)?,
            None => Box::new(std::iter::empty()),
        };
        Ok(Box::new(MergeIter::new(Box::new(buffered), stored)))
    }
}

impl Snapshot for CacheSnapshot {
    fn release(&self) {
        if let Some(base) = &self.base {
            base.release();
        }
    }
}

enum Step {
    Buffered,
    Both,
    Stored,
}

/// Lazy ordered merge of buffered entries over a store iterator.
///
/// On equal keys the buffered entry wins; a buffered tombstone hides the
/// stored pair.
struct MergeIter {
    buffered: Peekable<BufferedIter>,
    stored: Peekable<KvIter>,
}

impl MergeIter {
    fn new(buffered: BufferedIter, stored: KvIter) -> Self {
        Self {
            buffered: buffered.peekable(),
            stored: stored.peekable(),
        }
    }
}

impl Iterator for MergeIter {
    type Item = StoreResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = match (self.buffered.peek(), self.stored.peek()) {
                (None, None) => return None,
                (Some(_), None) => Step::Buffered,
                (None, Some(_)) | (Some(_), Some(Err(_))) => Step::Stored,
                (Some((bk, _)), Some(Ok((sk, _)))) => match bk.cmp(sk) {
                    KeyOrdering::Less => Step::Buffered,
                    KeyOrdering::Equal => Step::Both,
                    KeyOrdering::Greater => Step::Stored,
                },
            };
            match step {
                Step::Stored => return self.stored.next(),
                Step::Both => {
                    self.stored.next();
                }
                Step::Buffered => {}
            }
            if let Some((key, Some(value))) = self.buffered.next() {
                return Some(Ok((key, value)));
            }
        }
    }
}
