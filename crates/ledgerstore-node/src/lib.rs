//! Node-side storage for ledgerstore.
//!
//! A node keeps several groups of stores (consensus, ledger state, log
//! index), each flushed atomically to a shared checkpoint by a core
//! `DbPool`. This crate supplies the pieces that tie a group to disk:
//!
//! - [`DiskProducer`] maps store names to directories under a data root
//! - [`TableSet`] carves one store into prefix-isolated tables
//! - [`CheckpointedDb`] opens a group, checks it, and commits checkpoints
//! - [`ConsensusDb`], [`LedgerDb`] and [`LogIndexDb`] fix a layout per group

pub mod db;
pub mod producer;
pub mod table;

pub use db::{CheckpointedDb, ConsensusDb, DbError, DbLayout, LedgerDb, LogIndexDb};
pub use producer::DiskProducer;
pub use table::{Table, TableError, TableSet, TableSetBuilder};
