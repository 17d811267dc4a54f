//! Slot ownership for cluster-mode servers

use std::collections::HashMap;

use crc::{Crc, CRC_16_XMODEM};

pub const TOTAL_SLOTS: u32 = 16384;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Slot of `key`, honouring `{hash tags}`
pub fn key_slot(key: &[u8]) -> u32 {
    let hashed = key
        .iter()
        .position(|&b| b == b'{')
        .and_then(|open| {
            let rest = &key[open + 1..];
            rest.iter()
                .position(|&b| b == b'}')
                .filter(|&len| len > 0)
                .map(|len| &rest[..len])
        })
        .unwrap_or(key);
    CRC16.checksum(hashed) as u32 % TOTAL_SLOTS
}

/// Slot range owned by one node, end inclusive as in `CLUSTER SLOTS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOwner {
    pub start: u32,
    pub end: u32,
    pub addr: String,
}

/// Cluster view shared by every node of a test cluster
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    pub owners: Vec<SlotOwner>,
    /// Slots being migrated away: slot -> importing node
    pub migrating: HashMap<u32, String>,
}

impl SlotTable {
    /// Split the slot space evenly across `addrs`
    pub fn even(addrs: &[String]) -> Self {
        let n = addrs.len() as u32;
        let per_node = TOTAL_SLOTS / n;
        let owners = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                let i = i as u32;
                let start = i * per_node;
                let end = if i + 1 == n {
                    TOTAL_SLOTS - 1
                } else {
                    (i + 1) * per_node - 1
                };
                SlotOwner {
                    start,
                    end,
                    addr: addr.clone(),
                }
            })
            .collect();
        Self {
            owners,
            migrating: HashMap::new(),
        }
    }

    pub fn owner_of(&self, slot: u32) -> Option<&str> {
        self.owners
            .iter()
            .find(|o| slot >= o.start && slot <= o.end)
            .map(|o| o.addr.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split_covers_all_slots() {
        let addrs: Vec<String> = (0..3).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect();
        let table = SlotTable::even(&addrs);
        assert_eq!(table.owners[0].start, 0);
        assert_eq!(table.owners[2].end, TOTAL_SLOTS - 1);
        for pair in table.owners.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        assert_eq!(table.owner_of(16383), Some("127.0.0.1:7002"));
    }

    #[test]
    fn test_key_slot() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"{foo}.bar"), 12182);
    }
}
