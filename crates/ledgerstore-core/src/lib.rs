//! Ledgerstore Core: checkpointed persistence for node databases
//!
//! Keeps a group of logical databases advancing together: writes are
//! buffered per store and made durable in one coordinated flush that
//! stamps every store with the same checkpoint identifier.
//!
//! # Architecture
//!
//! - **Physical engines**: `MemStore` (ordered RAM map) and `DiskStore`
//!   (ordered RAM map + crash-safe WAL), both behind `KeyValueStore`
//! - **Write-back cache**: `WriteBackCache` buffers writes in front of one
//!   engine, optionally opening the engine lazily on first flush
//! - **Pool**: `DbPool` registers caches under names, defers drops to the
//!   next flush and writes dirty/clean checkpoint markers around each flush
//! - **Snapshots**: `SwitchableSnapshot` lets iterators survive a view swap
//!
//! # No Blockchain Types
//!
//! Checkpoint identifiers are opaque bytes. Node-specific tables and
//! adapters live in `ledgerstore-node`.

pub mod compaction;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod flushable;
pub mod format;
pub mod marker;
pub mod mem;
pub mod pool;
pub mod snapshot;
pub mod store;
pub mod wal;

// Re-export key types for convenience
pub use compaction::CompactionResult;
pub use config::Config;
pub use engine::DiskStore;
pub use error::{StoreError, StoreResult};
pub use flushable::{FlushableStore, StoreFactory, WriteBackCache};
pub use format::EntryLimits;
pub use marker::{Marker, MarkerFormat};
pub use mem::{MemSnapshot, MemStore, MemStoreRegistry};
pub use pool::{DbPool, MemProducer, StoreProducer};
pub use snapshot::SwitchableSnapshot;
pub use store::{
    key_successor, prefix_upper_bound, BatchOp, KeyValueReader, KeyValueStore, KeyValueWriter,
    KvIter, KvPair, Snapshot, WriteBatch,
};
