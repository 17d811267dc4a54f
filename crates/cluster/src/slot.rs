//! Hash slot calculation
//!
//! Keys map to one of [`TOTAL_SLOTS`] slots via CRC16 (XMODEM). When a key
//! contains a non-empty `{...}` section only that section is hashed, so
//! related keys can be forced onto the same slot.

use crc::{Crc, CRC_16_XMODEM};
use serde::{Deserialize, Serialize};

/// Total number of slots (consistent with Redis Cluster)
pub const TOTAL_SLOTS: u32 = 16384;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Return the part of `key` that is hashed
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// Calculate slot for a key
pub fn key_slot(key: &[u8]) -> u32 {
    CRC16.checksum(hash_tag(key)) as u32 % TOTAL_SLOTS
}

/// A contiguous range of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start slot (inclusive)
    pub start: u32,
    /// End slot (exclusive)
    pub end: u32,
}

impl SlotRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Check if a slot belongs to this range
    pub fn contains(&self, slot: u32) -> bool {
        slot >= self.start && slot < self.end
    }

    pub fn slot_count(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_slot_known_values() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_hash_tag() {
        assert_eq!(hash_tag(b"{user1000}.following"), b"user1000");
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"foo{{bar}}zap"), b"{bar");
        assert_eq!(hash_tag(b"foo{bar}{zap}"), b"bar");
        assert_eq!(hash_tag(b"no-tag"), b"no-tag");
        assert_eq!(hash_tag(b"open{only"), b"open{only");
    }

    #[test]
    fn test_tagged_keys_share_slot() {
        assert_eq!(
            key_slot(b"calls:{svc.echo}"),
            key_slot(b"calls:timeout:{svc.echo}:m1")
        );
        assert_eq!(key_slot(b"calls:{svc.echo}"), key_slot(b"svc.echo"));
    }

    #[test]
    fn test_slot_range_contains() {
        let range = SlotRange::new(0, 4096);
        assert!(range.contains(0));
        assert!(range.contains(4095));
        assert!(!range.contains(4096));
        assert_eq!(range.slot_count(), 4096);
    }
}
