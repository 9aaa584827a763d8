//! Hot-swappable read-only snapshot.
//!
//! `SwitchableSnapshot` holds the active view behind an RwLock. A swap is a
//! pointer replacement under the write lock that bumps a generation counter.
//! Iterators remember the generation they were opened against and the last
//! key they returned; when they see a newer generation they reopen on the
//! new view just past that key, so a scan never repeats or skips a key at
//! the swap point.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreResult;
use crate::store::{key_successor, KeyValueReader, KvIter, KvPair, Snapshot};

struct Active {
    view: Arc<dyn Snapshot>,
    generation: u64,
}

/// A snapshot whose underlying view can be replaced while it is in use.
///
/// Clones share the same active view.
#[derive(Clone)]
pub struct SwitchableSnapshot {
    active: Arc<RwLock<Active>>,
}

impl SwitchableSnapshot {
    pub fn new(view: Arc<dyn Snapshot>) -> Self {
        Self {
            active: Arc::new(RwLock::new(Active { view, generation: 0 })),
        }
    }

    /// Install `view` and return the previous one so the caller can release
    /// it once no reader needs it.
    pub fn switch_to(&self, view: Arc<dyn Snapshot>) -> Arc<dyn Snapshot> {
        let mut active = self.active.write();
        active.generation += 1;
        debug!(generation = active.generation, "switched snapshot view");
        std::mem::replace(&mut active.view, view)
    }

    /// Number of swaps so far.
    pub fn generation(&self) -> u64 {
        self.active.read().generation
    }

    /// The view currently installed.
    pub fn current(&self) -> Arc<dyn Snapshot> {
        Arc::clone(&self.active.read().view)
    }
}

impl std::fmt::Debug for SwitchableSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchableSnapshot")
            .field("generation", &self.generation())
            .finish()
    }
}

impl KeyValueReader for SwitchableSnapshot {
    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        self.active.read().view.has(key)
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.active.read().view.get(key)
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        let (inner, generation) = {
            let active = self.active.read();
            (active.view.iter(prefix, start)?, active.generation)
        };
        Ok(Box::new(SwitchableIter {
            active: Arc::clone(&self.active),
            prefix: prefix.to_vec(),
            start: start.to_vec(),
            generation,
            inner,
            last_key: None,
            exhausted: false,
        }))
    }
}

impl Snapshot for SwitchableSnapshot {
    fn release(&self) {
        self.active.read().view.release();
    }
}

/// Iterator that follows its snapshot across swaps.
struct SwitchableIter {
    active: Arc<RwLock<Active>>,
    prefix: Vec<u8>,
    start: Vec<u8>,
    generation: u64,
    inner: KvIter,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl SwitchableIter {
    /// Reopen on the active view if it changed since `inner` was opened.
    fn follow_swap(&mut self) -> StoreResult<()> {
        let (view, generation) = {
            let active = self.active.read();
            if active.generation == self.generation {
                return Ok(());
            }
            (Arc::clone(&active.view), active.generation)
        };
        // Every returned key starts with `prefix`.
        let start = match &self.last_key {
            Some(key) => key_successor(&key[self.prefix.len()..]),
            None => self.start.clone(),
        };
        self.inner = view.iter(&self.prefix, &start)?;
        self.generation = generation;
        debug!(generation, "iterator reopened on new snapshot view");
        Ok(())
    }
}

impl Iterator for SwitchableIter {
    type Item = StoreResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if let Err(e) = self.follow_swap() {
            return Some(Err(e));
        }
        match self.inner.next() {
            Some(Ok((key, value))) => {
                self.last_key = Some(key.clone());
                Some(Ok((key, value)))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSnapshot;
    use std::collections::BTreeMap;

    fn view(keys: &[&str], value: &str) -> Arc<dyn Snapshot> {
        let map: BTreeMap<Vec<u8>, Vec<u8>> = keys.iter()
            .map(|k| (k.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect();
        Arc::new(MemSnapshot::new(map))
    }

    fn next_key(iter: &mut KvIter) -> Option<String> {
        iter.next().map(|r| String::from_utf8(r.unwrap().0).unwrap())
    }

    #[test]
    fn test_switch_returns_previous_view() {
        let snap = SwitchableSnapshot::new(view(&["a"], "old"));
        let old = snap.switch_to(view(&["a"], "new"));

        assert_eq!(old.get(b"a").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snap.get(b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(snap.generation(), 1);
    }

    #[test]
    fn test_iterator_continues_after_switch() {
        let snap = SwitchableSnapshot::new(view(&["k1", "k2", "k3", "k4"], "old"));
        let mut iter = snap.iter(b"k", b"").unwrap();
        assert_eq!(next_key(&mut iter).as_deref(), Some("k1"));
        assert_eq!(next_key(&mut iter).as_deref(), Some("k2"));

        // k15 sorts before the cursor and must not appear; k5 is new and after it.
        snap.switch_to(view(&["k1", "k15", "k2", "k3", "k4", "k5"], "new"));

        let rest: Vec<_> = iter.map(|r| r.unwrap()).collect();
        let keys: Vec<_> = rest.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec()]);
        assert!(rest.iter().all(|(_, v)| v == b"new"));
    }

    #[test]
    fn test_unstarted_iterator_uses_original_start() {
        let snap = SwitchableSnapshot::new(view(&["p1", "p2"], "old"));
        let mut iter = snap.iter(b"p", b"2").unwrap();
        snap.switch_to(view(&["p1", "p2", "p3"], "new"));

        assert_eq!(next_key(&mut iter).as_deref(), Some("p2"));
        assert_eq!(next_key(&mut iter).as_deref(), Some("p3"));
        assert_eq!(next_key(&mut iter), None);
    }

    #[test]
    fn test_exhausted_iterator_stays_exhausted() {
        let snap = SwitchableSnapshot::new(view(&["a"], "old"));
        let mut iter = snap.iter(b"", b"").unwrap();
        assert_eq!(next_key(&mut iter).as_deref(), Some("a"));
        assert_eq!(next_key(&mut iter), None);

        snap.switch_to(view(&["a", "b"], "new"));
        assert_eq!(next_key(&mut iter), None);
    }

    #[test]
    fn test_prefix_is_respected_after_switch() {
        let snap = SwitchableSnapshot::new(view(&["a1", "b1", "b2"], "old"));
        let mut iter = snap.iter(b"b", b"").unwrap();
        assert_eq!(next_key(&mut iter).as_deref(), Some("b1"));
        snap.switch_to(view(&["a1", "b1", "b2", "c1"], "new"));
        assert_eq!(next_key(&mut iter).as_deref(), Some("b2"));
        assert_eq!(next_key(&mut iter), None);
    }

    #[test]
    fn test_concurrent_switch_and_scan() {
        let keys: Vec<String> = (0..200).map(|i| format!("k{:03}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let snap = SwitchableSnapshot::new(view(&refs, "v0"));

        let writer = {
            let snap = snap.clone();
            let refs: Vec<String> = keys.clone();
            std::thread::spawn(move || {
                let refs: Vec<&str> = refs.iter().map(String::as_str).collect();
                for round in 1..50 {
                    snap.switch_to(view(&refs, &format!("v{}", round)));
                }
            })
        };

        let seen: Vec<Vec<u8>> = snap.iter(b"k", b"").unwrap().map(|r| r.unwrap().0).collect();
        writer.join().unwrap();

        let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        assert_eq!(seen, expected);
    }
}
