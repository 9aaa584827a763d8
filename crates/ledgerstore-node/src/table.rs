//! Prefixed tables over a shared store.
//!
//! Each table owns a unique key prefix, mapping a set of logical tables onto
//! one flat, ordered keyspace: keys are stored as `[prefix][key]`.

use std::sync::Arc;

use hashbrown::HashMap;
use ledgerstore_core::{
    BatchOp, KeyValueReader, KeyValueStore, KeyValueWriter, KvIter, StoreError, StoreResult,
    WriteBatch,
};
use thiserror::Error;

/// Errors raised while wiring tables.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("tables {first} and {second} have colliding prefixes 0x{} and 0x{}", hex::encode(.first_prefix), hex::encode(.second_prefix))]
    PrefixCollision {
        first: String,
        second: String,
        first_prefix: Vec<u8>,
        second_prefix: Vec<u8>,
    },

    #[error("table {0} is declared twice")]
    DuplicateTable(String),

    #[error("table {name} prefix 0x{} covers the reserved key 0x{}", hex::encode(.prefix), hex::encode(.reserved))]
    ReservedKey {
        name: String,
        prefix: Vec<u8>,
        reserved: Vec<u8>,
    },

    #[error("no table named {0}")]
    UnknownTable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Build a prefixed key: `[prefix][key]`
fn prefixed_key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(prefix.len() + key.len());
    prefixed.extend_from_slice(prefix);
    prefixed.extend_from_slice(key);
    prefixed
}

/// A key-prefixed view of a store. Keys passed in and handed out never
/// include the prefix.
#[derive(Clone)]
pub struct Table {
    store: Arc<dyn KeyValueStore>,
    prefix: Vec<u8>,
}

impl Table {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: &[u8]) -> Self {
        Self { store, prefix: prefix.to_vec() }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("prefix", &hex::encode(&self.prefix))
            .finish()
    }
}

impl KeyValueReader for Table {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.store.get(&prefixed_key(&self.prefix, key))
    }

    fn iter(&self, prefix: &[u8], start: &[u8]) -> StoreResult<KvIter> {
        let strip = self.prefix.len();
        let inner = self.store.iter(&prefixed_key(&self.prefix, prefix), start)?;
        Ok(Box::new(inner.map(move |item| item.map(|(mut key, value)| {
            key.drain(..strip);
            (key, value)
        }))))
    }
}

impl KeyValueWriter for Table {
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.store.put(&prefixed_key(&self.prefix, key), value)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.store.delete(&prefixed_key(&self.prefix, key))
    }

    fn write(&self, batch: &WriteBatch) -> StoreResult<()> {
        let mut prefixed = WriteBatch::new();
        for op in batch.ops() {
            match op {
                BatchOp::Put(k, v) => prefixed.put(&prefixed_key(&self.prefix, k), v),
                BatchOp::Delete(k) => prefixed.delete(&prefixed_key(&self.prefix, k)),
            }
        }
        self.store.write(&prefixed)
    }
}

/// Named tables sharing one store.
#[derive(Debug, Clone)]
pub struct TableSet {
    tables: HashMap<String, Table>,
}

impl TableSet {
    pub fn builder() -> TableSetBuilder {
        TableSetBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Like `get`, but a missing name is an error.
    pub fn table(&self, name: &str) -> Result<&Table, TableError> {
        self.tables.get(name).ok_or_else(|| TableError::UnknownTable(name.to_string()))
    }

    /// Table names in ascending order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Declares tables, then validates and wires them onto a store.
#[derive(Debug, Default, Clone)]
pub struct TableSetBuilder {
    declared: Vec<(String, Vec<u8>)>,
    reserved: Vec<Vec<u8>>,
}

impl TableSetBuilder {
    /// Declare table `name` stored under `prefix`.
    pub fn table(mut self, name: &str, prefix: &[u8]) -> Self {
        self.declared.push((name.to_string(), prefix.to_vec()));
        self
    }

    /// Keep `key` out of every table's range.
    pub fn reserve(mut self, key: &[u8]) -> Self {
        self.reserved.push(key.to_vec());
        self
    }

    /// Wire every declared table onto `store`.
    ///
    /// Two prefixes collide when one starts with the other: their tables
    /// would read each other's keys.
    pub fn build(self, store: Arc<dyn KeyValueStore>) -> Result<TableSet, TableError> {
        for (i, (name, prefix)) in self.declared.iter().enumerate() {
            for (other, other_prefix) in &self.declared[..i] {
                if other == name {
                    return Err(TableError::DuplicateTable(name.clone()));
                }
                if prefix.starts_with(other_prefix) || other_prefix.starts_with(prefix) {
                    return Err(TableError::PrefixCollision {
                        first: other.clone(),
                        second: name.clone(),
                        first_prefix: other_prefix.clone(),
                        second_prefix: prefix.clone(),
                    });
                }
            }
            if let Some(reserved) = self.reserved.iter().find(|r| r.starts_with(prefix)) {
                return Err(TableError::ReservedKey {
                    name: name.clone(),
                    prefix: prefix.clone(),
                    reserved: reserved.clone(),
                });
            }
        }

        let tables = self.declared.into_iter()
            .map(|(name, prefix)| (name, Table::new(Arc::clone(&store), &prefix)))
            .collect();
        Ok(TableSet { tables })
    }
}
