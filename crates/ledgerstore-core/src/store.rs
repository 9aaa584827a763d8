//! Key-value store capability set.
//!
//! Every physical engine (and every cache layered on top of one) exposes the
//! same narrow surface: point reads and writes, atomic batches, ordered
//! prefix iteration, compaction, point-in-time snapshots, close and an
//! irrecoverable destroy.
//!
//! Iteration follows the usual node-database convention: `iter(prefix, start)`
//! visits every key beginning with `prefix`, in ascending byte order, starting
//! at `prefix ++ start`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StoreResult;

/// An owned key-value pair.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Owned, ordered iterator over a store. Dropping it releases it.
pub type KvIter = Box<dyn Iterator<Item = StoreResult<KvPair>> + Send>;

/// Read side of a store.
pub trait KeyValueReader: Send + Sync {
    /// Whether `key` is present.
    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Value for `key`, or `None` if absent.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Iterate keys beginning with `prefix`, starting at `prefix ++ start`.
    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter>;
}

/// Write side of a store.
pub trait KeyValueWriter: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Apply every operation of `batch` as one all-or-nothing unit.
    fn write(&self, batch: &WriteBatch) -> StoreResult<()>;
}

/// A read-only, point-in-time view of a store.
pub trait Snapshot: KeyValueReader {
    /// Release resources held by the view. Reads after release are undefined
    /// for engines that pin on-disk state; in-memory views ignore it.
    fn release(&self) {}
}

/// Full capability set of a physical engine.
pub trait KeyValueStore: KeyValueReader + KeyValueWriter {
    /// Reclaim space for keys in `[start, limit)`. Engines without key-range
    /// structure may compact everything.
    fn compact(&self, start: &[u8], limit: &[u8]) -> StoreResult<()>;

    /// Take a point-in-time view, independent of later writes.
    fn snapshot(&self) -> StoreResult<Arc<dyn Snapshot>>;

    /// Release the engine. Further operations return `StoreError::Closed`.
    fn close(&self) -> StoreResult<()>;

    /// Close and irrecoverably delete all data.
    fn destroy(&self) -> StoreResult<()>;
}

/// A single batched mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put(k, _) | BatchOp::Delete(k) => k,
        }
    }
}

/// Ordered list of mutations applied by `KeyValueWriter::write`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.size += key.len();
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    /// Bytes of keys and values queued so far.
    pub fn value_size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Empty the batch for reuse.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.size = 0;
    }
}

/// Smallest key strictly greater than every key beginning with `prefix`,
/// or `None` when no such key exists (empty or all-0xff prefix).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Smallest key strictly greater than `key`.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Lower and upper bounds of an `iter(prefix, start)` scan.
pub(crate) fn scan_bounds(prefix: &[u8], start: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    let mut lower = Vec::with_capacity(prefix.len() + start.len());
    lower.extend_from_slice(prefix);
    lower.extend_from_slice(start);
    (lower, prefix_upper_bound(prefix))
}

/// Ordered map behind an engine. Snapshots share it; writers copy it only
/// while an older version is still held.
pub(crate) type Tree = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

/// The current version of a live engine's map.
pub(crate) type LiveTree = Arc<RwLock<Tree>>;

/// Pairs read per lock acquisition while iterating.
pub(crate) const PAGE_SIZE: usize = 256;

/// At most `limit` pairs of `map` in `[from, upper)`.
pub(crate) fn range_page<V: Clone>(
    map: &BTreeMap<Vec<u8>, V>,
    from: &[u8],
    upper: Option<&[u8]>,
    limit: usize,
) -> Vec<(Vec<u8>, V)> {
    if upper.is_some_and(|u| from >= u) {
        return Vec::new();
    }
    let upper = match upper {
        Some(u) => Bound::Excluded(u),
        None => Bound::Unbounded,
    };
    map.range::<[u8], _>((Bound::Included(from), upper))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// An ordered map that can be read one page at a time.
pub(crate) trait PageSource: Send + 'static {
    type Value: Send + 'static;

    fn page(&self, from: &[u8], upper: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, Self::Value)>;
}

impl<V: Clone + Send + Sync + 'static> PageSource for Arc<BTreeMap<Vec<u8>, V>> {
    type Value = V;

    fn page(&self, from: &[u8], upper: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, V)> {
        range_page(&**self, from, upper, limit)
    }
}

impl PageSource for LiveTree {
    type Value = Vec<u8>;

    fn page(&self, from: &[u8], upper: Option<&[u8]>, limit: usize) -> Vec<KvPair> {
        range_page(&**self.read(), from, upper, limit)
    }
}

/// Lazy `iter(prefix, start)` scan that holds no lock between pages.
///
/// Each page resumes just after the last key handed out, so writes to a
/// live source are seen for keys not yet reached.
pub(crate) struct PagedIter<S: PageSource> {
    source: S,
    /// `None` once the source is exhausted
    cursor: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    page: std::vec::IntoIter<(Vec<u8>, S::Value)>,
}

impl<S: PageSource> PagedIter<S> {
    pub(crate) fn new(source: S, prefix: &[u8], start: &[u8]) -> Self {
        let (lower, upper) = scan_bounds(prefix, start);
        Self { source, cursor: Some(lower), upper, page: Vec::new().into_iter() }
    }
}

impl<S: PageSource> Iterator for PagedIter<S> {
    type Item = (Vec<u8>, S::Value);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.page.next() {
            return Some(item);
        }
        let from = self.cursor.take()?;
        let page = self.source.page(&from, self.upper.as_deref(), PAGE_SIZE);
        if page.len() == PAGE_SIZE {
            self.cursor = page.last().map(|(key, _)| key_successor(key));
        }
        self.page = page.into_iter();
        self.page.next()
    }
}

/// `KvIter` over a page source of plain values.
pub(crate) fn paged<S: PageSource<Value = Vec<u8>>>(source: S, prefix: &[u8], start: &[u8]) -> KvIter {
    Box::new(PagedIter::new(source, prefix, start).map(Ok))
}
