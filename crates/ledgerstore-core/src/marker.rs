//! Checkpoint marker encoding.
//!
//! Every store reserves one key for its marker. A clean marker is exactly
//! the checkpoint identifier. A dirty marker is
//! `dirty_tag ++ previous ++ separator ++ next` and is written before a
//! flush drains data, so finding one at startup proves a flush was cut short.

use serde::{Deserialize, Serialize};

/// Decoded value of a marker key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Last fully committed checkpoint.
    Clean(Vec<u8>),
    /// A flush from `prev` to `next` started and never finished.
    ///
    /// `prev`/`next` are split on the first separator and are best effort:
    /// any value starting with the dirty tag is dirty, parseable or not.
    Dirty {
        raw: Vec<u8>,
        prev: Option<Vec<u8>>,
        next: Option<Vec<u8>>,
    },
}

impl Marker {
    pub fn is_dirty(&self) -> bool {
        matches!(self, Marker::Dirty { .. })
    }
}

/// Reserved key and byte encoding of checkpoint markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerFormat {
    pub key: Vec<u8>,
    pub dirty_tag: Vec<u8>,
    pub separator: Vec<u8>,
}

impl Default for MarkerFormat {
    fn default() -> Self {
        Self::with_key(b"__checkpoint__")
    }
}

impl MarkerFormat {
    /// Default dirty encoding under a custom reserved key.
    pub fn with_key(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            dirty_tag: b"DIRTY:".to_vec(),
            separator: b"->".to_vec(),
        }
    }

    pub fn clean(&self, checkpoint: &[u8]) -> Vec<u8> {
        checkpoint.to_vec()
    }

    pub fn dirty(&self, prev: &[u8], next: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.dirty_tag.len() + prev.len() + self.separator.len() + next.len(),
        );
        out.extend_from_slice(&self.dirty_tag);
        out.extend_from_slice(prev);
        out.extend_from_slice(&self.separator);
        out.extend_from_slice(next);
        out
    }

    pub fn decode(&self, raw: &[u8]) -> Marker {
        let Some(body) = raw.strip_prefix(self.dirty_tag.as_slice()) else {
            return Marker::Clean(raw.to_vec());
        };
        let split = find(body, &self.separator);
        Marker::Dirty {
            raw: raw.to_vec(),
            prev: split.map(|at| body[..at].to_vec()),
            next: split.map(|at| body[at + self.separator.len()..].to_vec()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_marker_is_identity() {
        let format = MarkerFormat::default();
        let encoded = format.clean(b"cp1");
        assert_eq!(encoded, b"cp1");
        assert_eq!(format.decode(&encoded), Marker::Clean(b"cp1".to_vec()));
    }

    #[test]
    fn test_dirty_marker_carries_both_ids() {
        let format = MarkerFormat::with_key(b"flag");
        let encoded = format.dirty(b"genesis", b"cp1");
        assert_eq!(encoded, b"DIRTY:genesis->cp1");
        match format.decode(&encoded) {
            Marker::Dirty { prev, next, .. } => {
                assert_eq!(prev.as_deref(), Some(&b"genesis"[..]));
                assert_eq!(next.as_deref(), Some(&b"cp1"[..]));
            }
            other => panic!("expected dirty marker, got {:?}", other),
        }
    }

    #[test]
    fn test_any_tagged_value_is_dirty() {
        let format = MarkerFormat::default();
        let marker = format.decode(b"DIRTY:garbage");
        assert!(marker.is_dirty());
        assert_eq!(marker, Marker::Dirty { raw: b"DIRTY:garbage".to_vec(), prev: None, next: None });
    }

    #[test]
    fn test_binary_ids() {
        let format = MarkerFormat::default();
        let prev = [0u8, 1, 2, 0xff];
        let next = [9u8; 32];
        match format.decode(&format.dirty(&prev, &next)) {
            Marker::Dirty { prev: p, next: n, .. } => {
                assert_eq!(p.as_deref(), Some(&prev[..]));
                assert_eq!(n.as_deref(), Some(&next[..]));
            }
            other => panic!("expected dirty marker, got {:?}", other),
        }
    }
}
