//! Compaction: dead space reclamation for the write-ahead log
//!
//! Over time the log accumulates overwritten values and deletes. Compaction
//! writes the live key set as a fresh log segment and retires every older
//! segment, using the atomic rename pattern:
//! 1. Write live entries to wal-{next}.lgst.compact
//! 2. durable_sync the new file
//! 3. Rename it to wal-{next}.lgst (atomic on POSIX)
//! 4. durable_sync the directory
//! 5. Delete older segments, then durable_sync the directory again
//!
//! A crash before step 3 leaves an orphaned .compact file that replay ignores.
//! A crash during step 5 leaves a suffix of old segments in front of the
//! compacted one; replaying them and then the compacted segment still yields
//! exactly the live set.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::durability::{durable_sync, sync_dir};
use crate::error::{StoreError, StoreResult};
use crate::format::{serialize_batch, EntryLimits};
use crate::store::BatchOp;
use crate::wal::{list_wal_files, wal_file_name};

/// Live entries per compacted record
const OPS_PER_RECORD: usize = 1024;

/// Result of a compaction operation.
#[derive(Debug)]
pub struct CompactionResult {
    /// Path to the compacted segment
    pub file_path: PathBuf,
    /// Segments retired
    pub retired_segments: usize,
    /// Live entries written
    pub live_entries: usize,
    /// Log size before compaction in bytes
    pub original_bytes: u64,
    /// Compacted segment size in bytes
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Ratio of dead space in the original log (0.0 = no waste, 1.0 = all waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.compacted_bytes.min(self.original_bytes) as f64 / self.original_bytes as f64)
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Rewrite the log in `wal_dir` as a single segment holding `live`.
///
/// The caller must hold the WAL writer lock for the whole call and reopen
/// the writer afterwards; it resumes on the compacted segment.
pub fn compact_log(
    wal_dir: &Path,
    live: &BTreeMap<Vec<u8>, Vec<u8>>,
    limits: EntryLimits,
) -> StoreResult<CompactionResult> {
    let old_segments = list_wal_files(wal_dir)?;
    let next_seq = old_segments.last().map_or(0, |(seq, _)| seq + 1);
    let mut original_bytes = 0u64;
    for (_, path) in &old_segments {
        original_bytes += fs::metadata(path)
            .map_err(|e| StoreError::io(path, e, "failed to stat WAL segment"))?
            .len();
    }

    let file_path = wal_dir.join(wal_file_name(next_seq));
    let compact_path = file_path.with_extension("lgst.compact");

    let mut compacted_bytes = 0u64;
    {
        let mut out = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&compact_path)
            .map_err(|e| StoreError::io(&compact_path, e, "failed to create compact file"))?;

        let entries: Vec<BatchOp> = live.iter()
            .map(|(k, v)| BatchOp::Put(k.clone(), v.clone()))
            .collect();
        for chunk in entries.chunks(OPS_PER_RECORD) {
            let record = serialize_batch(chunk, limits)?;
            out.write_all(&record)
                .map_err(|e| StoreError::io(&compact_path, e, "failed to write compacted record"))?;
            compacted_bytes += record.len() as u64;
        }

        durable_sync(&out)
            .map_err(|e| StoreError::io(&compact_path, e, "failed to sync compacted file"))?;
    }

    fs::rename(&compact_path, &file_path)
        .map_err(|e| StoreError::io(&file_path, e, "failed to rename compacted file"))?;
    sync_dir(wal_dir)
        .map_err(|e| StoreError::io(wal_dir, e, "failed to sync directory after compaction"))?;

    for (_, path) in &old_segments {
        fs::remove_file(path)
            .map_err(|e| StoreError::io(path, e, "failed to retire WAL segment"))?;
    }
    sync_dir(wal_dir)
        .map_err(|e| StoreError::io(wal_dir, e, "failed to sync directory after retiring segments"))?;

    Ok(CompactionResult {
        file_path,
        retired_segments: old_segments.len(),
        live_entries: live.len(),
        original_bytes,
        compacted_bytes,
    })
}

/// Whether a log of `log_bytes` holding `live_bytes` of live records has
/// reached the dead space `threshold`.
pub fn needs_compaction(log_bytes: u64, live_bytes: u64, threshold: f64) -> bool {
    if log_bytes == 0 {
        return false;
    }
    let dead_ratio = 1.0 - (live_bytes.min(log_bytes) as f64 / log_bytes as f64);
    dead_ratio >= threshold
}
