//! Binary format definitions for ledgerstore WAL records
//!
//! One WAL record holds one whole write batch, so a batch is recovered
//! entirely or not at all:
//! ChunkHeader (32 bytes) + op_count(u32) + ops
//!
//! Each op: operation(u8) + padding(u8) + key_len(u16 LE) + value_len(u32 LE) + key + value

use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::store::BatchOp;

/// Magic bytes identifying ledgerstore WAL records: "LGST"
pub const MAGIC_ARRAY: [u8; 4] = [0x4C, 0x47, 0x53, 0x54];

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Record type for a write batch
pub const RECORD_BATCH: u8 = 1;

/// Per-op fixed prefix: operation + padding + key_len + value_len
const OP_PREFIX_SIZE: usize = 1 + 1 + 2 + 4;

/// Operation types inside a batch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
}

/// Size limits enforced when serializing a record.
#[derive(Debug, Clone, Copy)]
pub struct EntryLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl EntryLimits {
    /// Reject a key or value that no record could hold. Deletes pass an
    /// empty value.
    pub fn check(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        check_size("key", key.len(), self.max_key_size.min(u16::MAX as usize))?;
        check_size("value", value.len(), self.max_value_size)
    }

    /// Check every op of a batch.
    pub fn check_ops(&self, ops: &[BatchOp]) -> StoreResult<()> {
        for op in ops {
            match op {
                BatchOp::Put(k, v) => self.check(k, v)?,
                BatchOp::Delete(k) => self.check(k, &[])?,
            }
        }
        Ok(())
    }
}

impl From<&crate::config::Config> for EntryLimits {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
        }
    }
}

/// Fixed-size header for each WAL record
/// Size: 32 bytes, alignment: 4
///
/// Layout:
///   [0..4]   magic:       [u8;4] - "LGST"
///   [4..8]   length:      u32    - payload length in bytes
///   [8..12]  checksum:    u32    - CRC32C of payload bytes
///   [12]     record_type: u8
///   [13..16] reserved:    [u8;3]
///   [16..32] padding:     [u8;16]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub record_type: u8,
    pub reserved: [u8; 3],
    pub _padding: [u8; 16],
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, record_type: u8) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            record_type,
            reserved: [0; 3],
            _padding: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.record_type;
        buf[13..16].copy_from_slice(&self.reserved);
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut padding = [0u8; 16];
        padding.copy_from_slice(&bytes[16..32]);

        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            record_type: bytes[12],
            reserved: [bytes[13], bytes[14], bytes[15]],
            _padding: padding,
        }
    }
}

/// Serialize a batch into one complete WAL record.
///
/// Sizes are validated before any allocation.
pub fn serialize_batch(ops: &[BatchOp], limits: EntryLimits) -> StoreResult<Vec<u8>> {
    let mut payload_size = 4usize;
    for op in ops {
        let (key, value) = match op {
            BatchOp::Put(k, v) => (k.as_slice(), v.as_slice()),
            BatchOp::Delete(k) => (k.as_slice(), &[][..]),
        };
        limits.check(key, value)?;
        payload_size += OP_PREFIX_SIZE + key.len() + value.len();
    }
    if payload_size > u32::MAX as usize {
        return Err(StoreError::OversizedEntry {
            entry_size: payload_size as u64,
            max_size: u32::MAX as u64,
            component: "batch",
        });
    }

    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        let (operation, key, value) = match op {
            BatchOp::Put(k, v) => (Operation::Put, k.as_slice(), v.as_slice()),
            BatchOp::Delete(k) => (Operation::Delete, k.as_slice(), &[][..]),
        };
        payload.push(operation as u8);
        payload.push(0);
        payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
    }

    let checksum = crc32c::crc32c(&payload);
    let header = ChunkHeader::new(payload.len() as u32, checksum, RECORD_BATCH);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

fn check_size(component: &'static str, size: usize, max: usize) -> StoreResult<()> {
    if size > max {
        return Err(StoreError::OversizedEntry {
            entry_size: size as u64,
            max_size: max as u64,
            component,
        });
    }
    Ok(())
}

fn corrupted(offset: usize, reason: String) -> StoreError {
    StoreError::WalCorrupted {
        path: PathBuf::from("<buffer>"),
        offset: offset as u64,
        reason,
    }
}

/// Deserialize one WAL record into its batch operations.
pub fn deserialize_batch(data: &[u8]) -> StoreResult<Vec<BatchOp>> {
    let header_bytes = match data.get(..HEADER_SIZE).and_then(|h| <&[u8; HEADER_SIZE]>::try_from(h).ok()) {
        Some(h) => h,
        None => {
            return Err(corrupted(0, format!(
                "record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE
            )))
        }
    };
    let header = ChunkHeader::from_bytes(header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(StoreError::NoMagicFound {
            path: PathBuf::from("<buffer>"),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(StoreError::TornWrite {
            path: PathBuf::from("<buffer>"),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }
    let payload = &data[HEADER_SIZE..payload_end];

    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    if header.record_type != RECORD_BATCH {
        return Err(corrupted(12, format!("unknown record type: {}", header.record_type)));
    }
    if payload.len() < 4 {
        return Err(corrupted(HEADER_SIZE, "payload too short for op count".to_string()));
    }

    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let mut ops = Vec::with_capacity(count.min(payload.len() / OP_PREFIX_SIZE));
    let mut pos = 4;

    for _ in 0..count {
        if payload.len() < pos + OP_PREFIX_SIZE {
            return Err(corrupted(HEADER_SIZE + pos, "truncated op header".to_string()));
        }
        let op_type = payload[pos];
        let key_len = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        let value_len = u32::from_le_bytes([
            payload[pos + 4], payload[pos + 5], payload[pos + 6], payload[pos + 7],
        ]) as usize;
        let key_start = pos + OP_PREFIX_SIZE;
        let value_start = key_start + key_len;
        let value_end = value_start + value_len;

        if payload.len() < value_end {
            return Err(corrupted(HEADER_SIZE + pos, format!(
                "op needs {} bytes for key({}) + value({})", value_end - pos, key_len, value_len
            )));
        }

        let key = payload[key_start..value_start].to_vec();
        match op_type {
            t if t == Operation::Put as u8 => {
                ops.push(BatchOp::Put(key, payload[value_start..value_end].to_vec()))
            }
            t if t == Operation::Delete as u8 => ops.push(BatchOp::Delete(key)),
            other => {
                return Err(corrupted(HEADER_SIZE + pos, format!("invalid operation type: {}", other)))
            }
        }
        pos = value_end;
    }

    Ok(ops)
}
