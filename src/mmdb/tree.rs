//! MMDB Search Tree Traversal
//!
//! Implements binary search tree traversal for IP address lookups.
//! The tree uses a compact binary representation where each node contains
//! two records (left and right) that point to either:
//! - Another node (continue traversal)
//! - A data section offset (found)
//! - A "not found" marker (the value `node_count`)
//!
//! Record layouts, big-endian:
//!
//! ```text
//! 24-bit: [left 24][right 24]
//! 28-bit: [left low 24][left high 4 | right high 4][right low 24]
//! 32-bit: [left 32][right 32]
//! ```

use super::format::MmdbHeader;
use super::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use crate::error::{MmdbError, Result};
use std::net::IpAddr;

/// Outcome of walking the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeResult {
    /// Reached a data record
    Data {
        /// Offset into the data section
        offset: u32,
        /// Bits consumed from the root
        depth: u8,
    },
    /// Reached the empty marker
    Empty {
        /// Bits consumed from the root
        depth: u8,
    },
    /// Ran out of key bits while still on an internal node
    Exhausted {
        /// Node the walk stopped on
        node: u32,
        /// Bits consumed from the root
        depth: u8,
    },
}

impl TreeResult {
    /// Bits consumed from the root when the walk stopped
    pub fn depth(&self) -> u8 {
        match self {
            TreeResult::Data { depth, .. }
            | TreeResult::Empty { depth }
            | TreeResult::Exhausted { depth, .. } => *depth,
        }
    }

    /// Data section offset, if the walk found data
    pub fn data_offset(&self) -> Option<u32> {
        match self {
            TreeResult::Data { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// Where IPv4 lookups begin
///
/// For an IPv6 tree this is the record reached by following 96 left
/// records (`::/96`). The walk may stop early on a leaf, in which case
/// every IPv4 lookup lands on that leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Start {
    /// Node index, or a leaf record value if `>= node_count`
    pub node: u32,
    /// Bits consumed to get there
    pub depth: u8,
}

/// Search tree for IP address lookups
pub struct SearchTree<'a> {
    /// The raw file data containing the tree
    data: &'a [u8],
    /// Parsed header information
    header: &'a MmdbHeader,
}

impl<'a> SearchTree<'a> {
    /// Create a search tree over a complete file
    pub fn new(data: &'a [u8], header: &'a MmdbHeader) -> Self {
        Self { data, header }
    }

    /// Look up an IP address
    pub fn lookup(&self, ip: IpAddr, ipv4_start: Ipv4Start) -> Result<TreeResult> {
        match (ip, self.header.ip_version) {
            (IpAddr::V4(addr), IpVersion::V4) => self.walk(0, 0, u32::from(addr) as u128, 32),
            (IpAddr::V4(addr), IpVersion::V6) => self.walk(
                ipv4_start.node,
                ipv4_start.depth,
                u32::from(addr) as u128,
                32,
            ),
            (IpAddr::V6(addr), IpVersion::V6) => self.walk(0, 0, u128::from(addr), 128),
            (IpAddr::V6(addr), IpVersion::V4) => Err(MmdbError::Ipv6LookupInIpv4Database(addr)),
        }
    }

    /// Walk `bit_count` bits of `bits`, most significant first
    ///
    /// `start_node` may itself be a leaf record (as produced by
    /// [`ipv4_start_node`](Self::ipv4_start_node)), in which case no bits
    /// are consumed.
    pub fn walk(&self, start_node: u32, start_depth: u8, bits: u128, bit_count: u8) -> Result<TreeResult> {
        let node_count = self.header.node_count;
        let mut node = start_node;
        let mut depth = start_depth;

        if node >= node_count {
            return self.classify_leaf(node, depth);
        }

        for i in 0..bit_count {
            let bit = ((bits >> (bit_count - 1 - i)) & 1) as u8;
            let record = self.read_record(node, bit)?;
            depth = depth.saturating_add(1);

            if record < node_count {
                node = record;
            } else {
                return self.classify_leaf(record, depth);
            }
        }

        Ok(TreeResult::Exhausted { node, depth })
    }

    /// Find the IPv4 start node
    ///
    /// IPv4 trees start at the root. IPv6 trees keep IPv4 space under
    /// `::/96`, reached by 96 zero bits.
    pub fn ipv4_start_node(&self) -> Result<Ipv4Start> {
        if self.header.ip_version == IpVersion::V4 {
            return Ok(Ipv4Start { node: 0, depth: 0 });
        }

        let mut node = 0u32;
        let mut depth = 0u8;
        while depth < 96 && node < self.header.node_count {
            node = self.read_record(node, 0)?;
            depth += 1;
        }

        Ok(Ipv4Start { node, depth })
    }

    /// Read a record from a node
    ///
    /// Each node contains two records. `side` determines which:
    /// - 0 = left record (for IP bit 0)
    /// - 1 = right record (for IP bit 1)
    pub fn read_record(&self, node: u32, side: u8) -> Result<u32> {
        if node >= self.header.node_count {
            return Err(MmdbError::Traversal(format!(
                "Node index {} exceeds node count {}",
                node, self.header.node_count
            )));
        }

        let node_bytes = self.header.record_size.node_bytes();
        let offset = node as usize * node_bytes;
        let bytes = self
            .data
            .get(offset..offset + node_bytes)
            .filter(|_| offset + node_bytes <= self.header.tree_size)
            .ok_or_else(|| {
                MmdbError::Traversal(format!(
                    "Node {} at offset {} lies outside the search tree ({} bytes)",
                    node, offset, self.header.tree_size
                ))
            })?;

        let value = match (self.header.record_size, side) {
            (RecordSize::Bits24, 0) => u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            (RecordSize::Bits24, _) => u32::from_be_bytes([0, bytes[3], bytes[4], bytes[5]]),
            (RecordSize::Bits28, 0) => {
                u32::from_be_bytes([bytes[3] >> 4, bytes[0], bytes[1], bytes[2]])
            }
            (RecordSize::Bits28, _) => {
                u32::from_be_bytes([bytes[3] & 0x0F, bytes[4], bytes[5], bytes[6]])
            }
            (RecordSize::Bits32, 0) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (RecordSize::Bits32, _) => u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        };

        Ok(value)
    }

    /// Turn a record value `>= node_count` into a result
    fn classify_leaf(&self, record: u32, depth: u8) -> Result<TreeResult> {
        if record == self.header.node_count {
            return Ok(TreeResult::Empty { depth });
        }
        let offset = self.data_offset(record)?;
        Ok(TreeResult::Data { offset, depth })
    }

    /// Calculate data section offset from record value
    ///
    /// `data_offset = (record - node_count) - 16`, where 16 is the
    /// separator between tree and data section.
    pub fn data_offset(&self, record: u32) -> Result<u32> {
        let offset = record
            .checked_sub(self.header.node_count)
            .and_then(|n| n.checked_sub(DATA_SECTION_SEPARATOR_SIZE as u32))
            .ok_or_else(|| {
                MmdbError::Traversal(format!(
                    "Record {} points into the data section separator (node_count = {})",
                    record, self.header.node_count
                ))
            })?;

        if offset as usize >= self.header.data_section_len() {
            return Err(MmdbError::Traversal(format!(
                "Record {} points at data offset {} beyond the data section ({} bytes)",
                record,
                offset,
                self.header.data_section_len()
            )));
        }

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn header(node_count: u32, record_size: RecordSize, ip_version: IpVersion, data_len: usize) -> MmdbHeader {
        let tree_size = node_count as usize * record_size.node_bytes();
        let data_section_start = tree_size + DATA_SECTION_SEPARATOR_SIZE;
        MmdbHeader {
            node_count,
            record_size,
            ip_version,
            tree_size,
            data_section_start,
            data_section_end: data_section_start + data_len,
            metadata_start: data_section_start + data_len + 14,
        }
    }

    #[test]
    fn test_read_24bit_record() {
        let data = [0x00, 0x00, 0x01, 0x00, 0x00, 0x02];
        let header = header(1, RecordSize::Bits24, IpVersion::V4, 0);
        let tree = SearchTree::new(&data, &header);

        assert_eq!(tree.read_record(0, 0).unwrap(), 1);
        assert_eq!(tree.read_record(0, 1).unwrap(), 2);
    }

    #[test]
    fn test_read_28bit_record() {
        // Left: 0x1000001, Right: 0x2000002
        let data = [0x00, 0x00, 0x01, 0x12, 0x00, 0x00, 0x02];
        let header = header(1, RecordSize::Bits28, IpVersion::V6, 0);
        let tree = SearchTree::new(&data, &header);

        assert_eq!(tree.read_record(0, 0).unwrap(), 0x1000001);
        assert_eq!(tree.read_record(0, 1).unwrap(), 0x2000002);
    }

    #[test]
    fn test_read_32bit_record() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x07];
        let header = header(1, RecordSize::Bits32, IpVersion::V4, 0);
        let tree = SearchTree::new(&data, &header);

        assert_eq!(tree.read_record(0, 0).unwrap(), 0xDEADBEEF);
        assert_eq!(tree.read_record(0, 1).unwrap(), 7);
    }

    #[test]
    fn test_node_out_of_range() {
        let data = [0u8; 6];
        let header = header(1, RecordSize::Bits24, IpVersion::V4, 0);
        let tree = SearchTree::new(&data, &header);

        assert!(matches!(tree.read_record(1, 0), Err(MmdbError::Traversal(_))));
    }

    #[test]
    fn test_data_offset() {
        let header = header(100, RecordSize::Bits24, IpVersion::V6, 200);
        let tree = SearchTree::new(&[], &header);

        // 116 - 100 - 16 = 0
        assert_eq!(tree.data_offset(116).unwrap(), 0);
        // 200 - 100 - 16 = 84
        assert_eq!(tree.data_offset(200).unwrap(), 84);
        // Inside the separator
        assert!(matches!(tree.data_offset(110), Err(MmdbError::Traversal(_))));
        // Beyond the data section
        assert!(matches!(tree.data_offset(316), Err(MmdbError::Traversal(_))));
    }

    #[test]
    fn test_walk_two_node_tree() {
        // node 0: left -> node 1, right -> empty
        // node 1: left -> data offset 0, right -> empty
        let data = [0, 0, 1, 0, 0, 2, 0, 0, 18, 0, 0, 2];
        let header = header(2, RecordSize::Bits24, IpVersion::V4, 4);
        let tree = SearchTree::new(&data, &header);
        let start = tree.ipv4_start_node().unwrap();

        assert_eq!(
            tree.lookup(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), start).unwrap(),
            TreeResult::Data { offset: 0, depth: 2 }
        );
        assert_eq!(
            tree.lookup(IpAddr::V4(Ipv4Addr::new(128, 0, 0, 1)), start).unwrap(),
            TreeResult::Empty { depth: 1 }
        );
        assert_eq!(
            tree.lookup(IpAddr::V4(Ipv4Addr::new(64, 0, 0, 1)), start).unwrap(),
            TreeResult::Empty { depth: 2 }
        );
    }

    #[test]
    fn test_walk_exhausted() {
        // Single node whose left record loops back to itself
        let data = [0, 0, 0, 0, 0, 1];
        let header = header(1, RecordSize::Bits24, IpVersion::V4, 0);
        let tree = SearchTree::new(&data, &header);

        assert_eq!(
            tree.walk(0, 0, 0, 32).unwrap(),
            TreeResult::Exhausted { node: 0, depth: 32 }
        );
    }

    #[test]
    fn test_ipv6_lookup_in_ipv4_tree() {
        let data = [0, 0, 1, 0, 0, 1];
        let header = header(1, RecordSize::Bits24, IpVersion::V4, 0);
        let tree = SearchTree::new(&data, &header);
        let start = tree.ipv4_start_node().unwrap();

        let err = tree.lookup(IpAddr::V6(Ipv6Addr::LOCALHOST), start).unwrap_err();
        assert!(matches!(err, MmdbError::Ipv6LookupInIpv4Database(_)));
    }

    #[test]
    fn test_ipv4_start_node_stops_at_leaf() {
        // IPv6 tree with one node: left is empty, right is empty
        let data = [0, 0, 1, 0, 0, 1];
        let header = header(1, RecordSize::Bits24, IpVersion::V6, 0);
        let tree = SearchTree::new(&data, &header);

        let start = tree.ipv4_start_node().unwrap();
        assert_eq!(start, Ipv4Start { node: 1, depth: 1 });
        assert_eq!(
            tree.lookup(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), start).unwrap(),
            TreeResult::Empty { depth: 1 }
        );
    }
}
