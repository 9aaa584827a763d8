//! Configuration management for ledgerstore
//!
//! Provides hardware-class presets for the flush triggers and the on-disk
//! engine, and validation for custom configurations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default flush interval: flush at least every 10 minutes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default size trigger: flush once 100 MiB of writes are buffered.
pub const DEFAULT_FLUSH_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Per-entry bookkeeping cost counted on top of key and value bytes.
pub const DEFAULT_ENTRY_OVERHEAD: u64 = 32;

/// Ledgerstore configuration with hardware tier presets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Flush unconditionally once this much time has passed since the last flush
    pub flush_interval: Duration,
    /// Flush once the buffered size estimate across all caches exceeds this (bytes)
    pub flush_size_threshold: u64,
    /// Constant added to `key.len() + value.len()` for every buffered entry
    pub entry_overhead: u64,
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Compaction trigger: compact when dead log space ratio exceeds this
    pub compaction_trigger_ratio: f64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl Config {
    /// Server-class node
    pub fn server() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_size_threshold: DEFAULT_FLUSH_SIZE_THRESHOLD,
            entry_overhead: DEFAULT_ENTRY_OVERHEAD,
            wal_rotation_size_bytes: 100 * 1024 * 1024,
            compaction_trigger_ratio: 0.3,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
        }
    }

    /// Phone-class device: smaller buffers, same cadence
    pub fn phone() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_size_threshold: 32 * 1024 * 1024,
            entry_overhead: DEFAULT_ENTRY_OVERHEAD,
            wal_rotation_size_bytes: 50 * 1024 * 1024,
            compaction_trigger_ratio: 0.25,
            max_key_size: 1024,
            max_value_size: 16 * 1024 * 1024,
        }
    }

    /// Budget-class device: flush early and often
    pub fn budget() -> Self {
        Self {
            flush_interval: Duration::from_secs(5 * 60),
            flush_size_threshold: 8 * 1024 * 1024,
            entry_overhead: DEFAULT_ENTRY_OVERHEAD,
            wal_rotation_size_bytes: 25 * 1024 * 1024,
            compaction_trigger_ratio: 0.2,
            max_key_size: 512,
            max_value_size: 8 * 1024 * 1024,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        let invalid = |msg: &str| Err(StoreError::InvalidConfig(msg.to_string()));

        if self.flush_interval.is_zero() {
            return invalid("flush_interval must be > 0");
        }
        if self.flush_size_threshold == 0 {
            return invalid("flush_size_threshold must be > 0");
        }
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return invalid("wal_rotation_size_bytes must be >= 1MB");
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return invalid("compaction_trigger_ratio must be in (0.0, 1.0)");
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return invalid("max_key_size must be in [1, 65535]");
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return invalid("max_value_size must be in [1, 128MB]");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
