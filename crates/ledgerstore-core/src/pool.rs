//! Database pool: named write-back caches advanced together.
//!
//! `DbPool` registers caches under names and flushes all of them as one
//! checkpoint. The flush protocol:
//! 1. destroy every store queued for drop and forget its name
//! 2. write a dirty marker `prev -> id` straight to every remaining store
//! 3. flush every cache
//! 4. write the clean marker `id` straight to every store
//! 5. record `id` and reset the flush triggers
//!
//! A crash between 2 and 4 leaves at least one dirty marker behind, which
//! `check_startup_consistency` reports before the node serves anything.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::flushable::{FlushableStore, WriteBackCache};
use crate::format::EntryLimits;
use crate::marker::{Marker, MarkerFormat};
use crate::mem::MemStoreRegistry;
use crate::store::KeyValueStore;

/// Opens the named stores a pool manages.
pub trait StoreProducer: Send + Sync {
    type Store: FlushableStore + 'static;

    /// Open `name`, creating it if needed. Creation may be deferred until
    /// the returned cache is first flushed.
    fn open(&self, name: &str) -> StoreResult<Arc<Self::Store>>;

    /// Names of stores that already exist.
    fn names(&self) -> StoreResult<Vec<String>>;
}

struct PoolState<S> {
    stores: HashMap<String, Arc<S>>,
    queued_drops: BTreeSet<String>,
    dropped: HashSet<String>,
    last_flushed: Option<Vec<u8>>,
    last_flush_at: Instant,
}

/// Coordinator of a named set of write-back caches.
pub struct DbPool<P: StoreProducer> {
    producer: P,
    config: Config,
    marker: MarkerFormat,
    state: Mutex<PoolState<P::Store>>,
}

impl<P: StoreProducer> DbPool<P> {
    pub fn new(producer: P, config: Config, marker: MarkerFormat) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            producer,
            config,
            marker,
            state: Mutex::new(PoolState {
                stores: HashMap::new(),
                queued_drops: BTreeSet::new(),
                dropped: HashSet::new(),
                last_flushed: None,
                last_flush_at: Instant::now(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn marker_format(&self) -> &MarkerFormat {
        &self.marker
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// The cache registered under `name`, opening and registering it first
    /// if needed. Names dropped by an earlier flush of this pool stay gone.
    pub fn get_or_create(&self, name: &str) -> StoreResult<Arc<P::Store>> {
        let mut state = self.state.lock();
        self.open_locked(&mut state, name)
    }

    fn open_locked(&self, state: &mut PoolState<P::Store>, name: &str) -> StoreResult<Arc<P::Store>> {
        if state.dropped.contains(name) {
            return Err(StoreError::Dropped { name: name.to_string() });
        }
        if let Some(store) = state.stores.get(name) {
            return Ok(Arc::clone(store));
        }
        let store = self.producer.open(name)?;
        state.stores.insert(name.to_string(), Arc::clone(&store));
        debug!(name, "registered store");
        Ok(store)
    }

    /// Schedule `name` for destruction at the next flush. Until then it
    /// stays registered and usable.
    pub fn queue_drop(&self, name: &str) {
        let mut state = self.state.lock();
        if state.queued_drops.insert(name.to_string()) {
            debug!(name, "queued store for drop");
        }
    }

    pub fn is_queued_for_drop(&self, name: &str) -> bool {
        self.state.lock().queued_drops.contains(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().stores.contains_key(name)
    }

    /// Registered names in ascending order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Checkpoint of the last completed flush, or the one agreed on at startup.
    pub fn last_flushed(&self) -> Option<Vec<u8>> {
        self.state.lock().last_flushed.clone()
    }

    /// Buffered bytes across every registered cache.
    pub fn not_flushed_size_estimate(&self) -> u64 {
        let state = self.state.lock();
        total_buffered(&state.stores)
    }

    /// Decoded marker of `name`, or `None` if it has none.
    pub fn checkpoint_of(&self, name: &str) -> StoreResult<Option<Marker>> {
        let store = self.get_or_create(name)?;
        Ok(store.get_underlying(&self.marker.key)?.map(|raw| self.marker.decode(&raw)))
    }

    /// Genesis setup: flush each named cache and stamp it with the clean
    /// marker `checkpoint`, so that later flushes find a prior checkpoint.
    ///
    /// Fails with `AlreadyInitialized` once the pool has a checkpoint, either
    /// from an earlier call or from the startup check.
    pub fn initialize(&self, names: &[&str], checkpoint: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = &state.last_flushed {
            return Err(StoreError::AlreadyInitialized { checkpoint: existing.clone() });
        }
        for name in names {
            let store = self.open_locked(&mut state, name)?;
            store.flush()?;
            store.put_underlying(&self.marker.key, &self.marker.clean(checkpoint))?;
        }
        state.last_flushed = Some(checkpoint.to_vec());
        state.last_flush_at = Instant::now();
        info!(checkpoint = %hex::encode(checkpoint), stores = names.len(), "initialized stores");
        Ok(())
    }

    /// Flush every cache and advance all markers to `checkpoint`.
    ///
    /// Any error aborts the remaining steps and is returned as is; caches
    /// keep whatever they had not yet flushed, and drops not yet performed
    /// stay queued.
    pub fn flush(&self, checkpoint: &[u8]) -> StoreResult<()> {
        let started = Instant::now();
        let mut state = self.state.lock();

        let drops: Vec<String> = state.queued_drops.iter().cloned().collect();
        for name in &drops {
            let store = match state.stores.get(name) {
                Some(store) => Arc::clone(store),
                None => self.producer.open(name)?,
            };
            store.destroy()?;
            state.stores.remove(name);
            state.queued_drops.remove(name);
            state.dropped.insert(name.clone());
            debug!(name = %name, "dropped store");
        }

        let ordered: BTreeMap<&String, &Arc<P::Store>> = state.stores.iter().collect();
        let mut active = Vec::with_capacity(ordered.len());
        for (name, store) in ordered {
            // Never opened and nothing to write: it stays off disk.
            if !store.is_materialized() && store.not_flushed_size_estimate() == 0 {
                continue;
            }
            let prev = self.previous_checkpoint(name, store.as_ref(), state.last_flushed.as_deref())?;
            store.put_underlying(&self.marker.key, &self.marker.dirty(&prev, checkpoint))?;
            active.push((name.clone(), Arc::clone(store)));
        }

        for (_, store) in &active {
            store.flush()?;
        }

        let clean = self.marker.clean(checkpoint);
        for (_, store) in &active {
            store.put_underlying(&self.marker.key, &clean)?;
            store.flush()?;
        }

        state.last_flushed = Some(checkpoint.to_vec());
        state.last_flush_at = Instant::now();
        info!(
            checkpoint = %hex::encode(checkpoint),
            stores = active.len(),
            drops = drops.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed pool"
        );
        Ok(())
    }

    /// Checkpoint a store is moving away from.
    fn previous_checkpoint(
        &self,
        name: &str,
        store: &P::Store,
        last_flushed: Option<&[u8]>,
    ) -> StoreResult<Vec<u8>> {
        let missing = || StoreError::MissingCheckpoint { name: name.to_string() };
        match store.get_underlying(&self.marker.key)? {
            Some(raw) => match self.marker.decode(&raw) {
                Marker::Clean(id) => Ok(id),
                // Left by an earlier flush of this process that failed midway.
                Marker::Dirty { prev, .. } => {
                    last_flushed.map(<[u8]>::to_vec).or(prev).ok_or_else(missing)
                }
            },
            // A store created after the last checkpoint joins at it.
            None if !store.is_materialized() => {
                last_flushed.map(<[u8]>::to_vec).ok_or_else(missing)
            }
            None => Err(missing()),
        }
    }

    /// Flush if `flush_interval` has passed since the last flush or the
    /// buffered size estimate exceeds `flush_size_threshold`.
    pub fn flush_if_needed(&self, checkpoint: &[u8]) -> StoreResult<bool> {
        let due = {
            let state = self.state.lock();
            state.last_flush_at.elapsed() >= self.config.flush_interval
                || total_buffered(&state.stores) > self.config.flush_size_threshold
        };
        if !due {
            return Ok(false);
        }
        self.flush(checkpoint)?;
        Ok(true)
    }

    /// Verify that every known store carries the same clean marker.
    ///
    /// Covers every registered cache and every store the producer reports
    /// as existing; the latter are registered so later flushes keep them in
    /// step. Caches never opened and without a marker are skipped.
    pub fn check_startup_consistency(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        let mut names: BTreeSet<String> = state.stores.keys().cloned().collect();
        names.extend(self.producer.names()?);
        names.retain(|name| !state.dropped.contains(name));

        let mut agreed: Option<(String, Option<Vec<u8>>)> = None;
        for name in &names {
            let store = self.open_locked(&mut state, name)?;
            let raw = store.get_underlying(&self.marker.key)?;
            if raw.is_none() && !store.is_materialized() {
                continue;
            }
            let found = match raw.map(|r| self.marker.decode(&r)) {
                Some(Marker::Dirty { raw, .. }) => {
                    error!(name = %name, marker = %hex::encode(&raw), "dirty checkpoint marker, a flush was interrupted");
                    return Err(StoreError::DirtyState { name: name.clone(), marker: raw });
                }
                Some(Marker::Clean(id)) => Some(id),
                None => None,
            };
            let (first, expected) = agreed.get_or_insert_with(|| (name.clone(), found.clone()));
            if *expected != found {
                error!(name = %name, first = %first, "checkpoint markers disagree");
                return Err(StoreError::NotSynchronized {
                    name: name.clone(),
                    expected: expected.clone(),
                    found,
                });
            }
        }

        let checkpoint = agreed.and_then(|(_, id)| id);
        info!(
            stores = names.len(),
            checkpoint = %checkpoint.as_deref().map(hex::encode).unwrap_or_default(),
            "startup consistency check passed"
        );
        if checkpoint.is_some() {
            state.last_flushed = checkpoint;
        }
        Ok(())
    }

    /// Close every store without flushing and empty the registry. Writes
    /// since the last flush are lost. Returns the first close error.
    pub fn close_all(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        let mut first_err = None;
        let mut stores: Vec<(String, Arc<P::Store>)> = state.stores.drain().collect();
        stores.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, store) in stores {
            if let Err(e) = store.close() {
                error!(name = %name, error = %e, "failed to close store");
                first_err.get_or_insert(e);
            }
        }
        state.queued_drops.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn total_buffered<S: FlushableStore>(stores: &HashMap<String, Arc<S>>) -> u64 {
    stores.values().map(|s| s.not_flushed_size_estimate()).sum()
}

impl<P: StoreProducer> std::fmt::Debug for DbPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("names", &self.names())
            .field("last_flushed", &self.last_flushed().map(hex::encode))
            .finish()
    }
}

/// Producer over a `MemStoreRegistry`.
///
/// Names already in the registry get eager caches; unknown names get lazy
/// caches that register themselves on first flush.
#[derive(Debug, Clone)]
pub struct MemProducer {
    registry: MemStoreRegistry,
    entry_overhead: u64,
    limits: EntryLimits,
}

impl MemProducer {
    pub fn new(registry: MemStoreRegistry, config: &Config) -> Self {
        Self {
            registry,
            entry_overhead: config.entry_overhead,
            limits: EntryLimits::from(config),
        }
    }

    pub fn registry(&self) -> &MemStoreRegistry {
        &self.registry
    }
}

impl StoreProducer for MemProducer {
    type Store = WriteBackCache;

    fn open(&self, name: &str) -> StoreResult<Arc<WriteBackCache>> {
        if self.registry.contains(name) {
            let store: Arc<dyn KeyValueStore> = self.registry.open(name);
            let cache = WriteBackCache::new(name, store, self.entry_overhead).with_limits(self.limits);
            return Ok(Arc::new(cache));
        }
        let registry = self.registry.clone();
        let owned = name.to_string();
        let cache = WriteBackCache::lazy(name, move || {
            let store: Arc<dyn KeyValueStore> = registry.open(&owned);
            Ok(store)
        }, self.entry_overhead)
        .with_limits(self.limits);
        Ok(Arc::new(cache))
    }

    fn names(&self) -> StoreResult<Vec<String>> {
        Ok(self.registry.names())
    }
}
