//! Integration tests: database groups on a real data directory.
//!
//! These tests exercise the full open -> commit -> reopen cycle with
//! `DiskProducer`, including stores that appear and disappear between
//! checkpoints and markers left behind by an interrupted flush.

use std::path::Path;

use ledgerstore_core::{
    Config, DiskStore, FlushableStore, KeyValueReader, KeyValueStore, KeyValueWriter, Marker,
    MarkerFormat, Snapshot, StoreError, SwitchableSnapshot, WriteBatch,
};
use ledgerstore_node::{
    CheckpointedDb, ConsensusDb, DbError, DbLayout, DiskProducer, LedgerDb, LogIndexDb,
    TableError,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Write a raw value into the store directory `name`, bypassing any pool.
fn poke(root: &Path, name: &str, key: &[u8], value: &[u8]) {
    let store = DiskStore::open(root.join(name), Config::default()).unwrap();
    store.put(key, value).unwrap();
    store.close().unwrap();
}

fn peek(root: &Path, name: &str, key: &[u8]) -> Option<Vec<u8>> {
    let store = DiskStore::open(root.join(name), Config::default()).unwrap();
    let value = store.get(key).unwrap();
    store.close().unwrap();
    value
}

// ---------------------------------------------------------------------------
// Checkpoint lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_epochs_follow_checkpoints_across_restarts() {
    let dir = TempDir::new().unwrap();

    {
        let db = ConsensusDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.blocks().put(b"0001", b"block-1").unwrap();
        db.epoch(1).unwrap().put(b"validators", b"v1").unwrap();
        db.commit(b"cp1").unwrap();
        db.close().unwrap();
    }

    assert_eq!(peek(dir.path(), "consensus", b"flag"), Some(b"cp1".to_vec()));
    assert_eq!(peek(dir.path(), "epoch-0000000001", b"flag"), Some(b"cp1".to_vec()));

    {
        let db = ConsensusDb::open(dir.path()).unwrap();
        assert_eq!(db.last_checkpoint(), Some(b"cp1".to_vec()));
        let epoch = db.epoch(1).unwrap();
        assert!(epoch.is_materialized());
        assert_eq!(epoch.get(b"validators").unwrap(), Some(b"v1".to_vec()));

        db.retire_epoch(1);
        db.epoch(2).unwrap().put(b"validators", b"v2").unwrap();
        db.commit(b"cp2").unwrap();
        db.close().unwrap();
    }

    assert!(!dir.path().join("epoch-0000000001").exists());

    let db = ConsensusDb::open(dir.path()).unwrap();
    assert_eq!(db.last_checkpoint(), Some(b"cp2".to_vec()));
    assert_eq!(db.blocks().get(b"0001").unwrap(), Some(b"block-1".to_vec()));
    assert_eq!(
        db.pool().names(),
        vec!["consensus".to_string(), "epoch-0000000002".to_string()]
    );
}

#[test]
fn test_uncommitted_writes_are_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let db = LogIndexDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.logs().put(b"0001", b"transfer").unwrap();
        db.commit(b"cp1").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"0002", b"approval");
        batch.delete(b"0001");
        db.logs().write(&batch).unwrap();
        db.close().unwrap();
    }

    let db = LogIndexDb::open(dir.path()).unwrap();
    let logs: Vec<_> = db.logs().iter(b"", b"").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(logs, vec![(b"0001".to_vec(), b"transfer".to_vec())]);
}

// ---------------------------------------------------------------------------
// Startup consistency
// ---------------------------------------------------------------------------

#[test]
fn test_interrupted_flush_blocks_startup() {
    let dir = TempDir::new().unwrap();
    {
        let db = LedgerDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.close().unwrap();
    }

    // What a crash between the dirty marker and the data drain leaves behind
    let dirty = MarkerFormat::with_key(b"mark").dirty(b"genesis", b"block-1");
    poke(dir.path(), "ledger", b"mark", &dirty);

    match LedgerDb::open(dir.path()).unwrap_err() {
        DbError::Store(StoreError::DirtyState { name, marker }) => {
            assert_eq!(name, "ledger");
            assert_eq!(marker, b"DIRTY:genesis->block-1".to_vec());
        }
        other => panic!("expected dirty state, got {:?}", other),
    }
}

#[test]
fn test_diverged_stores_block_startup() {
    let dir = TempDir::new().unwrap();
    {
        let db = ConsensusDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.epoch(7).unwrap().put(b"k", b"v").unwrap();
        db.commit(b"cp1").unwrap();
        db.close().unwrap();
    }
    poke(dir.path(), "epoch-0000000007", b"flag", b"cp0");

    let err = ConsensusDb::open(dir.path()).unwrap_err();
    assert!(matches!(err, DbError::Store(StoreError::NotSynchronized { .. })), "{:?}", err);
}

#[test]
fn test_stray_store_without_marker_blocks_startup() {
    let dir = TempDir::new().unwrap();
    {
        let db = LedgerDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.close().unwrap();
    }
    poke(dir.path(), "leftover", b"k", b"v");

    assert!(LedgerDb::open(dir.path()).is_err());
}

#[test]
fn test_damaged_log_blocks_startup() {
    let dir = TempDir::new().unwrap();
    {
        let db = LedgerDb::open(dir.path()).unwrap();
        db.initialize(b"genesis").unwrap();
        db.accounts().put(b"alice", b"100").unwrap();
        db.commit(b"block-1").unwrap();
        db.close().unwrap();
    }

    let wal_dir = dir.path().join("ledger").join("wal");
    let segment = std::fs::read_dir(&wal_dir).unwrap().next().unwrap().unwrap().path();
    let mut data = std::fs::read(&segment).unwrap();
    data[ledgerstore_core::format::HEADER_SIZE] ^= 0xFF;
    std::fs::write(&segment, data).unwrap();

    let err = LedgerDb::open(dir.path()).unwrap_err();
    assert!(matches!(err, DbError::Store(StoreError::WalCorrupted { offset: 0, .. })), "{:?}", err);
}

// ---------------------------------------------------------------------------
// Layouts and snapshots
// ---------------------------------------------------------------------------

#[test]
fn test_custom_layout_over_disk_producer() {
    const LAYOUT: DbLayout = DbLayout {
        main_store: "blobs",
        marker_key: b"\xffmarker",
        tables: &[("meta", b"m"), ("data", b"d")],
    };

    let dir = TempDir::new().unwrap();
    let producer = DiskProducer::new(dir.path(), Config::default()).unwrap();
    let db = CheckpointedDb::open(producer, Config::default(), LAYOUT).unwrap();
    db.initialize(b"genesis").unwrap();
    db.table("data").unwrap().put(b"x", b"1").unwrap();
    db.commit(b"cp1").unwrap();

    let checkpoint = db.pool().checkpoint_of("blobs").unwrap();
    assert_eq!(checkpoint, Some(Marker::Clean(b"cp1".to_vec())));
    assert!(matches!(db.table("missing"), Err(TableError::UnknownTable(_))));
}

#[test]
fn test_snapshot_switch_between_commits() {
    let dir = TempDir::new().unwrap();
    let db = LedgerDb::open(dir.path()).unwrap();
    db.initialize(b"genesis").unwrap();
    let main = db.store("ledger").unwrap();

    db.accounts().put(b"alice", b"100").unwrap();
    db.commit(b"block-1").unwrap();
    let snapshot = SwitchableSnapshot::new(main.snapshot().unwrap());

    db.accounts().put(b"alice", b"90").unwrap();
    db.accounts().put(b"bob", b"10").unwrap();
    db.commit(b"block-2").unwrap();

    let mut iter = snapshot.iter(b"a", b"").unwrap();
    assert_eq!(iter.next().unwrap().unwrap(), (b"aalice".to_vec(), b"100".to_vec()));

    let previous = snapshot.switch_to(main.snapshot().unwrap());
    let rest: Vec<_> = iter.map(|r| r.unwrap()).collect();
    assert_eq!(rest, vec![(b"abob".to_vec(), b"10".to_vec())]);
    assert_eq!(snapshot.get(b"aalice").unwrap(), Some(b"90".to_vec()));

    previous.release();
}
