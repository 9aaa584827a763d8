//! Write-Ahead Log for the on-disk engine
//!
//! Every write batch becomes exactly one record. The write path is:
//! 1. Serialize the batch into one record (with CRC32C)
//! 2. Append the record to the current WAL file
//! 3. durable_sync() the file
//! 4. Return success; only then does the caller update RAM
//!
//! Replay discards a torn tail record, so a batch interrupted by a crash is
//! dropped as a whole. Damage anywhere else in the log fails recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::durability::durable_sync;
use crate::error::{StoreError, StoreResult};
use crate::format::{deserialize_batch, HEADER_SIZE, MAGIC_ARRAY};
use crate::store::BatchOp;

const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".lgst";

/// File name of the WAL segment with sequence `seq`.
pub fn wal_file_name(seq: u64) -> String {
    format!("{}{:016x}{}", WAL_PREFIX, seq, WAL_SUFFIX)
}

fn parse_wal_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(WAL_PREFIX)?.strip_suffix(WAL_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// All WAL segments in `wal_dir`, sorted by sequence.
pub fn list_wal_files(wal_dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let dir_entries = std::fs::read_dir(wal_dir)
        .map_err(|e| StoreError::io(wal_dir, e, "failed to read WAL directory"))?;

    let mut files = Vec::new();
    for entry in dir_entries {
        let entry = entry.map_err(|e| StoreError::io(wal_dir, e, "failed to read directory entry"))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_wal_file_name) {
            files.push((seq, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// WAL writer: appends batch records and makes them durable.
///
/// INVARIANT: append() must complete (including durable_sync) BEFORE the
/// caller applies the batch to the in-memory map.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    /// Current file size in bytes (tracked to avoid stat calls)
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
}

impl WalWriter {
    /// Open a writer in `wal_dir`, resuming the highest-numbered segment.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> StoreResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io(&wal_dir, e, "failed to create WAL directory"))?;

        let sequence = list_wal_files(&wal_dir)?.last().map_or(0, |(seq, _)| *seq);
        let path = wal_dir.join(wal_file_name(sequence));
        let file = open_append(&path)?;
        let size = file.metadata()
            .map_err(|e| StoreError::io(&path, e, "failed to stat WAL file"))?
            .len();

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    /// Append one serialized record with full durability.
    ///
    /// If a crash happens after the write but before the sync, the record
    /// may or may not survive; replay treats a partial record as torn and
    /// discards it.
    pub fn append(&mut self, record: &[u8]) -> StoreResult<()> {
        if self.size > 0 && self.size + record.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file.write_all(record)
            .map_err(|e| StoreError::io(&self.path, e, "WAL write failed"))?;
        durable_sync(&self.file)
            .map_err(|e| StoreError::io(&self.path, e, "WAL durable_sync failed"))?;

        self.size += record.len() as u64;
        Ok(())
    }

    /// Rotate to a new WAL file. Syncs the current file before switching.
    fn rotate(&mut self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StoreError::io(&self.path, e, "WAL sync before rotation failed"))?;

        self.sequence += 1;
        let new_path = self.wal_dir.join(wal_file_name(self.sequence));
        self.file = open_append(&new_path)?;
        self.path = new_path;
        self.size = 0;
        Ok(())
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StoreError::io(&self.path, e, "WAL sync failed"))
    }
}

fn open_append(path: &Path) -> StoreResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e, "failed to open WAL file"))
}

/// WAL reader: replays batch records in sequence order.
pub struct WalReader {
    wal_dir: PathBuf,
}

/// Outcome of a replay.
#[derive(Debug, Default)]
pub struct Recovery {
    pub batches: Vec<Vec<BatchOp>>,
    /// Bytes of all segments up to the last intact record
    pub log_bytes: u64,
    /// Segment and offset where a torn tail was discarded
    pub torn_tail: Option<(PathBuf, u64)>,
}

impl Recovery {
    /// Cut a discarded torn tail off its segment so that later appends
    /// directly follow the last intact record.
    pub fn truncate_torn_tail(&self) -> StoreResult<()> {
        let Some((path, len)) = &self.torn_tail else {
            return Ok(());
        };
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e, "failed to open WAL file for truncation"))?;
        file.set_len(*len)
            .map_err(|e| StoreError::io(path, e, "failed to truncate torn WAL tail"))?;
        durable_sync(&file)
            .map_err(|e| StoreError::io(path, e, "failed to sync truncated WAL file"))
    }
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover all batches from every segment, oldest first.
    ///
    /// Only the end of the newest segment may hold a damaged record: a crash
    /// there leaves a torn tail, which is discarded. A damaged record in an
    /// older segment, or one followed by an intact record, means the log
    /// itself is corrupt and recovery fails with `WalCorrupted`.
    pub fn recover(&self) -> StoreResult<Recovery> {
        let mut recovery = Recovery::default();
        let segments = list_wal_files(&self.wal_dir)?;
        let newest = segments.len().saturating_sub(1);
        for (index, (_, path)) in segments.iter().enumerate() {
            self.recover_file(path, index == newest, &mut recovery)?;
        }
        Ok(recovery)
    }

    fn recover_file(&self, path: &Path, newest: bool, recovery: &mut Recovery) -> StoreResult<()> {
        let mut file = File::open(path)
            .map_err(|e| StoreError::io(path, e, "failed to open WAL file for recovery"))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| StoreError::io(path, e, "failed to read WAL file"))?;

        let mut offset = 0;
        while offset < buffer.len() {
            match parse_record(&buffer, offset) {
                Ok((ops, total)) => {
                    recovery.batches.push(ops);
                    offset += total;
                }
                Err(reason) => {
                    if !newest || intact_record_after(&buffer, offset) {
                        error!(path = %path.display(), offset, reason = %reason, "corrupt WAL record");
                        return Err(StoreError::WalCorrupted {
                            path: path.to_path_buf(),
                            offset: offset as u64,
                            reason,
                        });
                    }
                    warn!(
                        path = %path.display(),
                        offset,
                        discarded = buffer.len() - offset,
                        reason = %reason,
                        "torn WAL tail discarded"
                    );
                    recovery.torn_tail = Some((path.to_path_buf(), offset as u64));
                    break;
                }
            }
        }

        recovery.log_bytes += offset as u64;
        Ok(())
    }
}

/// Decode the record at `offset`, returning its ops and framed length.
fn parse_record(buffer: &[u8], offset: usize) -> Result<(Vec<BatchOp>, usize), String> {
    if offset + HEADER_SIZE > buffer.len() {
        return Err("partial record header".to_string());
    }
    if buffer[offset..offset + 4] != MAGIC_ARRAY {
        return Err("bad record magic".to_string());
    }
    let length = u32::from_le_bytes([
        buffer[offset + 4], buffer[offset + 5],
        buffer[offset + 6], buffer[offset + 7],
    ]) as usize;
    let total = HEADER_SIZE + length;
    if offset + total > buffer.len() {
        return Err(format!(
            "record needs {} bytes, {} available",
            total,
            buffer.len() - offset
        ));
    }
    let ops = deserialize_batch(&buffer[offset..offset + total]).map_err(|e| e.to_string())?;
    Ok((ops, total))
}

/// Whether any intact record starts after the damaged one at `offset`.
fn intact_record_after(buffer: &[u8], offset: usize) -> bool {
    let mut from = offset + 1;
    while let Some(next) = find_next_magic(buffer, from) {
        if parse_record(buffer, next).is_ok() {
            return true;
        }
        from = next + 1;
    }
    false
}

/// Scan forward for the next occurrence of the record magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}
