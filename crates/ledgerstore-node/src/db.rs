//! Checkpointed database groups.
//!
//! `CheckpointedDb` is the one generic coordinator: a `DbPool` plus a main
//! store carved into tables. `ConsensusDb`, `LedgerDb` and `LogIndexDb` only
//! choose a layout (main store, marker encoding, tables) and flush thresholds.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ledgerstore_core::{
    Config, DbPool, KeyValueStore, MarkerFormat, StoreError, StoreProducer, WriteBackCache,
};
use thiserror::Error;
use tracing::info;

use crate::producer::DiskProducer;
use crate::table::{Table, TableError, TableSet};

/// Errors from opening, committing or closing a database group.
#[derive(Debug, Error)]
pub enum DbError {
    /// Store, pool or checkpoint failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The layout's tables could not be built
    #[error(transparent)]
    Table(#[from] TableError),
}

impl DbError {
    /// Whether the on-disk checkpoint state cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Store(e) if e.is_fatal())
    }
}

/// Static description of a database group.
#[derive(Debug, Clone, Copy)]
pub struct DbLayout {
    /// Store holding the tables
    pub main_store: &'static str,
    /// Reserved key of the checkpoint marker in every store
    pub marker_key: &'static [u8],
    /// `(name, prefix)` of each table in the main store
    pub tables: &'static [(&'static str, &'static [u8])],
}

impl DbLayout {
    pub fn marker_format(&self) -> MarkerFormat {
        MarkerFormat::with_key(self.marker_key)
    }
}

/// A pool of stores that advance through checkpoints together, with the
/// main store exposed as tables.
pub struct CheckpointedDb<P: StoreProducer = DiskProducer> {
    pool: DbPool<P>,
    tables: TableSet,
    layout: DbLayout,
}

impl<P: StoreProducer> CheckpointedDb<P> {
    /// Open the group and verify its stores agree on a checkpoint.
    ///
    /// A dirty or disagreeing marker fails the open; nothing is repaired.
    pub fn open(producer: P, config: Config, layout: DbLayout) -> Result<Self, DbError> {
        let pool = DbPool::new(producer, config, layout.marker_format())?;
        pool.check_startup_consistency()?;

        let main: Arc<dyn KeyValueStore> = pool.get_or_create(layout.main_store)?;
        let mut builder = TableSet::builder().reserve(layout.marker_key);
        for (name, prefix) in layout.tables {
            builder = builder.table(name, prefix);
        }
        let tables = builder.build(main)?;

        info!(
            main = layout.main_store,
            tables = tables.len(),
            stores = pool.names().len(),
            initialized = pool.last_flushed().is_some(),
            "opened database group"
        );
        Ok(Self { pool, tables, layout })
    }

    /// Whether the group has a checkpoint yet.
    pub fn is_initialized(&self) -> bool {
        self.pool.last_flushed().is_some()
    }

    /// Stamp the main store with the genesis checkpoint. Fails once the
    /// group has any checkpoint.
    pub fn initialize(&self, genesis: &[u8]) -> Result<(), DbError> {
        self.pool.initialize(&[self.layout.main_store], genesis)?;
        Ok(())
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Result<&Table, TableError> {
        self.tables.table(name)
    }

    pub fn layout(&self) -> &DbLayout {
        &self.layout
    }

    pub fn pool(&self) -> &DbPool<P> {
        &self.pool
    }

    /// An auxiliary store of the group, created on first flush if new.
    pub fn store(&self, name: &str) -> Result<Arc<P::Store>, DbError> {
        Ok(self.pool.get_or_create(name)?)
    }

    /// Drop an auxiliary store at the next commit.
    pub fn drop_store(&self, name: &str) {
        self.pool.queue_drop(name);
    }

    /// Make everything written so far durable as `checkpoint`.
    pub fn commit(&self, checkpoint: &[u8]) -> Result<(), DbError> {
        self.pool.flush(checkpoint)?;
        Ok(())
    }

    /// Commit only if a flush trigger fired. Returns whether it did.
    pub fn maybe_commit(&self, checkpoint: &[u8]) -> Result<bool, DbError> {
        Ok(self.pool.flush_if_needed(checkpoint)?)
    }

    pub fn last_checkpoint(&self) -> Option<Vec<u8>> {
        self.pool.last_flushed()
    }

    /// Close every store. Writes since the last commit are lost.
    pub fn close(&self) -> Result<(), DbError> {
        self.pool.close_all()?;
        Ok(())
    }
}

impl<P: StoreProducer> std::fmt::Debug for CheckpointedDb<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointedDb")
            .field("main", &self.layout.main_store)
            .field("tables", &self.tables.names())
            .field("pool", &self.pool)
            .finish()
    }
}

fn open_disk(dir: &Path, config: Config, layout: DbLayout) -> Result<CheckpointedDb, DbError> {
    let producer = DiskProducer::new(dir, config.clone())?;
    CheckpointedDb::open(producer, config, layout)
}

/// Consensus events and blocks, plus one store per epoch.
#[derive(Debug)]
pub struct ConsensusDb {
    db: CheckpointedDb,
    events: Table,
    blocks: Table,
    epoch_state: Table,
}

impl ConsensusDb {
    pub const LAYOUT: DbLayout = DbLayout {
        main_store: "consensus",
        marker_key: b"flag",
        tables: &[("events", b"e"), ("blocks", b"b"), ("epoch_state", b"s")],
    };

    pub fn default_config() -> Config {
        Config::default()
    }

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DbError> {
        Self::open_with(dir, Self::default_config())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self, DbError> {
        let db = open_disk(dir.as_ref(), config, Self::LAYOUT)?;
        Ok(Self {
            events: db.table("events")?.clone(),
            blocks: db.table("blocks")?.clone(),
            epoch_state: db.table("epoch_state")?.clone(),
            db,
        })
    }

    pub fn events(&self) -> &Table {
        &self.events
    }

    pub fn blocks(&self) -> &Table {
        &self.blocks
    }

    pub fn epoch_state(&self) -> &Table {
        &self.epoch_state
    }

    /// Per-epoch store; an epoch that is never written never reaches disk.
    pub fn epoch(&self, epoch: u64) -> Result<Arc<WriteBackCache>, DbError> {
        self.db.store(&epoch_store_name(epoch))
    }

    /// Drop a sealed epoch's store at the next commit.
    pub fn retire_epoch(&self, epoch: u64) {
        self.db.drop_store(&epoch_store_name(epoch));
    }
}

fn epoch_store_name(epoch: u64) -> String {
    format!("epoch-{:010}", epoch)
}

impl Deref for ConsensusDb {
    type Target = CheckpointedDb;

    fn deref(&self) -> &CheckpointedDb {
        &self.db
    }
}

/// Ledger state: accounts, contract storage, code and receipts.
#[derive(Debug)]
pub struct LedgerDb {
    db: CheckpointedDb,
    accounts: Table,
    storage: Table,
    code: Table,
    receipts: Table,
}

impl LedgerDb {
    pub const LAYOUT: DbLayout = DbLayout {
        main_store: "ledger",
        marker_key: b"mark",
        tables: &[("accounts", b"a"), ("storage", b"s"), ("code", b"c"), ("receipts", b"r")],
    };

    /// State writes are large and frequent: buffer more before flushing.
    pub fn default_config() -> Config {
        Config {
            flush_size_threshold: 256 * 1024 * 1024,
            ..Config::default()
        }
    }

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DbError> {
        Self::open_with(dir, Self::default_config())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self, DbError> {
        let db = open_disk(dir.as_ref(), config, Self::LAYOUT)?;
        Ok(Self {
            accounts: db.table("accounts")?.clone(),
            storage: db.table("storage")?.clone(),
            code: db.table("code")?.clone(),
            receipts: db.table("receipts")?.clone(),
            db,
        })
    }

    pub fn accounts(&self) -> &Table {
        &self.accounts
    }

    pub fn storage(&self) -> &Table {
        &self.storage
    }

    pub fn code(&self) -> &Table {
        &self.code
    }

    pub fn receipts(&self) -> &Table {
        &self.receipts
    }
}

impl Deref for LedgerDb {
    type Target = CheckpointedDb;

    fn deref(&self) -> &CheckpointedDb {
        &self.db
    }
}

/// Log index: logs by position, plus topic and address lookups.
#[derive(Debug)]
pub struct LogIndexDb {
    db: CheckpointedDb,
    logs: Table,
    topics: Table,
    addresses: Table,
}

impl LogIndexDb {
    pub const LAYOUT: DbLayout = DbLayout {
        main_store: "logs",
        marker_key: b"__checkpoint__",
        tables: &[("logs", b"l"), ("topics", b"t"), ("addresses", b"a")],
    };

    /// The index is cheap to rebuild, so it flushes small and often.
    pub fn default_config() -> Config {
        Config {
            flush_interval: Duration::from_secs(60),
            flush_size_threshold: 16 * 1024 * 1024,
            ..Config::default()
        }
    }

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DbError> {
        Self::open_with(dir, Self::default_config())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self, DbError> {
        let db = open_disk(dir.as_ref(), config, Self::LAYOUT)?;
        Ok(Self {
            logs: db.table("logs")?.clone(),
            topics: db.table("topics")?.clone(),
            addresses: db.table("addresses")?.clone(),
            db,
        })
    }

    pub fn logs(&self) -> &Table {
        &self.logs
    }

    pub fn topics(&self) -> &Table {
        &self.topics
    }

    pub fn addresses(&self) -> &Table {
        &self.addresses
    }
}

impl Deref for LogIndexDb {
    type Target = CheckpointedDb;

    fn deref(&self) -> &CheckpointedDb {
        &self.db
    }
}
