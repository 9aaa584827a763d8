//! Error types for ledgerstore operations
//!
//! All ledgerstore errors are represented by the StoreError enum. Engine
//! errors carry detailed context for debugging and recovery; the checkpoint
//! errors (`MissingCheckpoint`, `DirtyState`, `NotSynchronized`) are fatal
//! and must stop the node.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Ledgerstore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", in_path(.path.as_deref()))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL file is corrupted and cannot be recovered
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Torn write detected (partial record at end of file)
    #[error("torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("magic bytes not found in {} at offset {offset}: found {}", .path.display(), hex::encode(.found_bytes))]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Entry size exceeds maximum allowed
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },

    /// Operation on a store (or cache) that was already closed or destroyed
    #[error("{what} is closed")]
    Closed { what: String },

    /// A registered store has no checkpoint marker when a flush is attempted
    #[error("store {name} has no checkpoint marker; it was never initialized with a first checkpoint")]
    MissingCheckpoint { name: String },

    /// A dirty marker was found: a previous flush was interrupted
    #[error("dirty state in store {name}: crash during flush (marker {})", hex::encode(.marker))]
    DirtyState { name: String, marker: Vec<u8> },

    /// Clean markers disagree across stores
    #[error("databases not synchronized: store {name} is at {}, expected {}", show_id(.found.as_deref()), show_id(.expected.as_deref()))]
    NotSynchronized {
        name: String,
        expected: Option<Vec<u8>>,
        found: Option<Vec<u8>>,
    },

    /// Genesis setup on a pool that already has a checkpoint
    #[error("stores already initialized at checkpoint {}", hex::encode(.checkpoint))]
    AlreadyInitialized { checkpoint: Vec<u8> },

    /// The name was dropped at an earlier flush of this pool
    #[error("store {name} was dropped and cannot be reopened")]
    Dropped { name: String },

    /// A store producer failed to open or create a store
    #[error("failed to open store {name}: {message}")]
    Producer { name: String, message: String },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Errors that mean the on-disk checkpoint state cannot be trusted.
    /// The node must stop; there is no automatic repair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::MissingCheckpoint { .. }
                | StoreError::DirtyState { .. }
                | StoreError::NotSynchronized { .. }
        )
    }

    /// Build an `Io` error with path context.
    pub(crate) fn io(path: &Path, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn in_path(path: Option<&Path>) -> String {
    path.map(|p| format!(" in {}", p.display())).unwrap_or_default()
}

fn show_id(id: Option<&[u8]>) -> String {
    match id {
        Some(id) => format!("0x{}", hex::encode(id)),
        None => "<no marker>".to_string(),
    }
}

/// Result type alias for ledgerstore operations
pub type StoreResult<T> = Result<T, StoreError>;
