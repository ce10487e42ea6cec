//! IP Tree Builder for MMDB Format
//!
//! Builds the binary search tree that maps IP networks to data section
//! offsets. Supports both IPv4 and IPv6 trees with CIDR prefixes; IPv4
//! networks in an IPv6 tree live under `::/96`.
//!
//! Longest-prefix semantics hold regardless of insertion order: a more
//! specific network always shadows a less specific one that contains it,
//! whichever was inserted first.

use crate::error::{MmdbError, Result};
use crate::mmdb::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use std::net::IpAddr;

/// IP tree builder using arena allocation
pub struct IpTreeBuilder {
    /// All nodes in the tree (arena); node 0 is the root
    nodes: Vec<Node>,
    /// IP version (determines tree depth)
    ip_version: IpVersion,
}

/// A node in the IP tree
#[derive(Debug, Clone)]
struct Node {
    /// Left child (bit 0)
    left: NodePointer,
    /// Right child (bit 1)
    right: NodePointer,
}

/// Node pointer - can point to another node, data, or be empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    /// Points to another node (value is node ID)
    Node(u32),
    /// Points to data section (data offset, prefix length)
    ///
    /// The prefix length only matters while building: it decides which of
    /// two overlapping networks wins. It is not written to disk.
    Data(u32, u8),
    /// Empty (not found marker)
    Empty,
}

impl IpTreeBuilder {
    /// Create a builder with just an empty root
    pub fn new(ip_version: IpVersion) -> Self {
        Self {
            nodes: vec![Node::new_empty()],
            ip_version,
        }
    }

    /// IP version of the tree being built
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Number of nodes allocated so far
    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Reserve capacity for nodes to avoid reallocation
    pub fn reserve_nodes(&mut self, capacity: usize) {
        self.nodes.reserve(capacity.saturating_sub(self.nodes.len()));
    }

    /// Insert a network with its data offset
    ///
    /// # Arguments
    /// * `addr` - Network address (host bits are ignored)
    /// * `prefix_len` - Network prefix length, relative to `addr`'s family
    /// * `data_offset` - Offset into the data section
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8, data_offset: u32) -> Result<()> {
        let (key, depth) = match (addr, self.ip_version) {
            (IpAddr::V4(v4), version) => {
                if prefix_len > 32 {
                    return Err(MmdbError::Build(format!(
                        "IPv4 prefix length {} exceeds 32",
                        prefix_len
                    )));
                }
                let bits = u32::from(v4) as u128;
                match version {
                    IpVersion::V4 => (bits << 96, prefix_len),
                    IpVersion::V6 => (bits, 96 + prefix_len),
                }
            }
            (IpAddr::V6(v6), IpVersion::V6) => {
                if prefix_len > 128 {
                    return Err(MmdbError::Build(format!(
                        "IPv6 prefix length {} exceeds 128",
                        prefix_len
                    )));
                }
                (u128::from(v6), prefix_len)
            }
            (IpAddr::V6(v6), IpVersion::V4) => {
                return Err(MmdbError::Build(format!(
                    "Cannot insert IPv6 network {}/{} into an IPv4-only tree",
                    v6, prefix_len
                )))
            }
        };

        self.insert_bits(key, depth, data_offset);
        Ok(())
    }

    /// Insert the first `prefix_len` bits of a left-aligned 128-bit key
    fn insert_bits(&mut self, bits: u128, prefix_len: u8, data_offset: u32) {
        if prefix_len == 0 {
            // The whole address space: fill everything below the root
            self.backfill_less_specific(0, data_offset, 0);
            return;
        }

        let mut node_id = 0u32;

        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as u8;
            let child = self.nodes[node_id as usize].child(bit);

            if depth + 1 == prefix_len {
                match child {
                    NodePointer::Node(child_id) => {
                        // More specific networks already exist below: fill
                        // around them
                        self.backfill_less_specific(child_id, data_offset, prefix_len);
                    }
                    NodePointer::Empty | NodePointer::Data(..) => {
                        // Data on this edge can only be as or less specific
                        self.nodes[node_id as usize]
                            .set_child(bit, NodePointer::Data(data_offset, prefix_len));
                    }
                }
                return;
            }

            node_id = match child {
                NodePointer::Node(child_id) => child_id,
                NodePointer::Empty => {
                    let new_id = self.allocate_node(Node::new_empty());
                    self.nodes[node_id as usize].set_child(bit, NodePointer::Node(new_id));
                    new_id
                }
                NodePointer::Data(existing_offset, existing_prefix) => {
                    // A less specific network covers this edge. Split it so
                    // both halves keep the existing data, then keep going.
                    let existing = NodePointer::Data(existing_offset, existing_prefix);
                    let new_id = self.allocate_node(Node {
                        left: existing,
                        right: existing,
                    });
                    self.nodes[node_id as usize].set_child(bit, NodePointer::Node(new_id));
                    new_id
                }
            };
        }
    }

    /// Allocate a new node and return its ID
    fn allocate_node(&mut self, node: Node) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        id
    }

    /// Backfill a subtree with less-specific prefix data
    ///
    /// Empty edges take the new data, as do edges holding data of an equal
    /// or shorter prefix. Edges holding more specific data are left alone.
    fn backfill_less_specific(&mut self, node_id: u32, data_offset: u32, prefix_len: u8) {
        for bit in 0..2u8 {
            match self.nodes[node_id as usize].child(bit) {
                NodePointer::Empty => {
                    self.nodes[node_id as usize]
                        .set_child(bit, NodePointer::Data(data_offset, prefix_len));
                }
                NodePointer::Data(_, existing_prefix) => {
                    if prefix_len >= existing_prefix {
                        self.nodes[node_id as usize]
                            .set_child(bit, NodePointer::Data(data_offset, prefix_len));
                    }
                }
                NodePointer::Node(child_id) => {
                    self.backfill_less_specific(child_id, data_offset, prefix_len);
                }
            }
        }
    }

    /// Smallest record size able to address this tree and a data section
    /// of `data_section_size` bytes
    pub fn smallest_record_size(&self, data_section_size: usize) -> Option<RecordSize> {
        let largest = self.node_count() as u64
            + DATA_SECTION_SEPARATOR_SIZE as u64
            + data_section_size as u64;
        RecordSize::ALL
            .into_iter()
            .find(|size| largest <= size.max_value() as u64)
    }

    /// Build the tree and return serialized bytes
    ///
    /// Returns: (tree_bytes, node_count)
    pub fn build(&self, record_size: RecordSize) -> Result<(Vec<u8>, u32)> {
        let node_count = self.node_count();
        let node_bytes = record_size.node_bytes();
        let mut tree = vec![0u8; node_count as usize * node_bytes];

        for (node_id, node) in self.nodes.iter().enumerate() {
            let left = pointer_to_value(node.left, node_count, record_size)?;
            let right = pointer_to_value(node.right, node_count, record_size)?;
            let out = &mut tree[node_id * node_bytes..(node_id + 1) * node_bytes];
            write_node(out, record_size, left, right);
        }

        Ok((tree, node_count))
    }
}

impl Node {
    fn new_empty() -> Self {
        Self {
            left: NodePointer::Empty,
            right: NodePointer::Empty,
        }
    }

    fn child(&self, bit: u8) -> NodePointer {
        if bit == 0 {
            self.left
        } else {
            self.right
        }
    }

    fn set_child(&mut self, bit: u8, pointer: NodePointer) {
        if bit == 0 {
            self.left = pointer;
        } else {
            self.right = pointer;
        }
    }
}

/// Convert a node pointer to its on-disk record value
fn pointer_to_value(pointer: NodePointer, node_count: u32, record_size: RecordSize) -> Result<u32> {
    let value = match pointer {
        NodePointer::Empty => node_count as u64,
        NodePointer::Node(id) => id as u64,
        // The reader computes `record - node_count - 16`
        NodePointer::Data(offset, _) => {
            node_count as u64 + DATA_SECTION_SEPARATOR_SIZE as u64 + offset as u64
        }
    };

    if value > record_size.max_value() as u64 {
        return Err(MmdbError::Build(format!(
            "Record value {} does not fit in {}-bit records",
            value,
            record_size.bits()
        )));
    }

    Ok(value as u32)
}

/// Write one node's two records
fn write_node(out: &mut [u8], record_size: RecordSize, left: u32, right: u32) {
    let l = left.to_be_bytes();
    let r = right.to_be_bytes();
    match record_size {
        RecordSize::Bits24 => {
            out[0..3].copy_from_slice(&l[1..]);
            out[3..6].copy_from_slice(&r[1..]);
        }
        RecordSize::Bits28 => {
            // Middle byte: left high nibble, then right high nibble
            out[0..3].copy_from_slice(&l[1..]);
            out[3] = ((l[0] & 0x0F) << 4) | (r[0] & 0x0F);
            out[4..7].copy_from_slice(&r[1..]);
        }
        RecordSize::Bits32 => {
            out[0..4].copy_from_slice(&l);
            out[4..8].copy_from_slice(&r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    /// Walk built tree bytes the way a reader does; returns (offset, depth)
    fn walk(tree: &[u8], node_count: u32, record_size: RecordSize, bits: u128, bit_count: u8) -> Option<(u32, u8)> {
        let node_bytes = record_size.node_bytes();
        let mut node = 0u32;
        for i in 0..bit_count {
            let bit = (bits >> (bit_count - 1 - i)) & 1;
            let raw = &tree[node as usize * node_bytes..(node as usize + 1) * node_bytes];
            let record = match (record_size, bit) {
                (RecordSize::Bits24, 0) => u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
                (RecordSize::Bits24, _) => u32::from_be_bytes([0, raw[3], raw[4], raw[5]]),
                (RecordSize::Bits28, 0) => u32::from_be_bytes([raw[3] >> 4, raw[0], raw[1], raw[2]]),
                (RecordSize::Bits28, _) => u32::from_be_bytes([raw[3] & 0x0F, raw[4], raw[5], raw[6]]),
                (RecordSize::Bits32, 0) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                (RecordSize::Bits32, _) => u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            };
            if record < node_count {
                node = record;
            } else if record == node_count {
                return None;
            } else {
                return Some((record - node_count - 16, i + 1));
            }
        }
        None
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> u128 {
        u32::from(Ipv4Addr::new(a, b, c, d)) as u128
    }

    #[test]
    fn test_new_builder() {
        let builder = IpTreeBuilder::new(IpVersion::V4);
        assert_eq!(builder.ip_version(), IpVersion::V4);
        assert_eq!(builder.node_count(), 1);
    }

    #[test]
    fn test_build_empty_tree() {
        let builder = IpTreeBuilder::new(IpVersion::V4);
        let (bytes, node_count) = builder.build(RecordSize::Bits24).unwrap();
        assert_eq!(node_count, 1);
        // Both records hold the empty marker (node_count = 1)
        assert_eq!(bytes, [0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_insert_ipv4_cidr() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        builder
            .insert(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16, 200)
            .unwrap();

        let (bytes, node_count) = builder.build(RecordSize::Bits24).unwrap();
        assert_eq!(node_count, 16);
        assert_eq!(bytes.len(), node_count as usize * 6);

        assert_eq!(
            walk(&bytes, node_count, RecordSize::Bits24, v4(192, 168, 77, 1), 32),
            Some((200, 16))
        );
        assert_eq!(walk(&bytes, node_count, RecordSize::Bits24, v4(192, 169, 0, 1), 32), None);
    }

    #[test]
    fn test_all_record_sizes() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        builder
            .insert(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8, 0x00FF_FFF0)
            .unwrap();

        for size in RecordSize::ALL {
            let result = builder.build(size);
            if size == RecordSize::Bits24 {
                // 8 nodes + 16 + 0xFFFFF0 overflows 24 bits
                assert!(result.is_err());
                continue;
            }
            let (bytes, node_count) = result.unwrap();
            assert_eq!(
                walk(&bytes, node_count, size, v4(10, 9, 8, 7), 32),
                Some((0x00FF_FFF0, 8)),
                "record size {:?}",
                size
            );
        }
    }

    #[test]
    fn test_more_specific_wins_in_either_order() {
        let networks = [(v4(10, 0, 0, 0), 8u8, 1u32), (v4(10, 1, 0, 0), 16, 2), (v4(10, 1, 2, 0), 24, 3)];
        let orders: [[usize; 3]; 3] = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];

        for order in orders {
            let mut builder = IpTreeBuilder::new(IpVersion::V4);
            for &i in &order {
                let (addr, prefix, offset) = networks[i];
                builder
                    .insert(IpAddr::V4(Ipv4Addr::from(addr as u32)), prefix, offset)
                    .unwrap();
            }
            let (bytes, nodes) = builder.build(RecordSize::Bits32).unwrap();
            let lookup = |bits| walk(&bytes, nodes, RecordSize::Bits32, bits, 32).map(|r| r.0);

            assert_eq!(lookup(v4(10, 1, 2, 3)), Some(3), "order {:?}", order);
            assert_eq!(lookup(v4(10, 1, 3, 3)), Some(2), "order {:?}", order);
            assert_eq!(lookup(v4(10, 2, 0, 1)), Some(1), "order {:?}", order);
            assert_eq!(lookup(v4(11, 0, 0, 1)), None, "order {:?}", order);
        }
    }

    #[test]
    fn test_later_insert_of_same_network_wins() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        let net = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0));
        builder.insert(net, 8, 1).unwrap();
        builder.insert(net, 8, 2).unwrap();

        let (bytes, nodes) = builder.build(RecordSize::Bits24).unwrap();
        assert_eq!(walk(&bytes, nodes, RecordSize::Bits24, v4(10, 0, 0, 1), 32), Some((2, 8)));
    }

    #[test]
    fn test_default_route() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        builder.insert(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), 24, 5).unwrap();
        builder.insert(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 9).unwrap();

        let (bytes, nodes) = builder.build(RecordSize::Bits24).unwrap();
        assert_eq!(walk(&bytes, nodes, RecordSize::Bits24, v4(1, 2, 3, 4), 32), Some((5, 24)));
        assert_eq!(walk(&bytes, nodes, RecordSize::Bits24, v4(200, 0, 0, 1), 32).map(|r| r.0), Some(9));
    }

    #[test]
    fn test_ipv4_in_ipv6_tree() {
        let mut builder = IpTreeBuilder::new(IpVersion::V6);
        builder.insert(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 0)), 24, 7).unwrap();

        let (bytes, nodes) = builder.build(RecordSize::Bits28).unwrap();
        assert_eq!(nodes, 96 + 24);
        assert_eq!(
            walk(&bytes, nodes, RecordSize::Bits28, v4(8, 8, 8, 8), 128),
            Some((7, 120))
        );
    }

    #[test]
    fn test_insert_ipv6() {
        let mut builder = IpTreeBuilder::new(IpVersion::V6);
        let addr = Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 1);
        builder.insert(IpAddr::V6(addr), 32, 100).unwrap();

        let (bytes, nodes) = builder.build(RecordSize::Bits24).unwrap();
        let probe = u128::from(Ipv6Addr::new(0x2001, 0x0db8, 0xffff, 0, 0, 0, 0, 0));
        assert_eq!(walk(&bytes, nodes, RecordSize::Bits24, probe, 128), Some((100, 32)));
    }

    #[test]
    fn test_invalid_prefix_length() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        let result = builder.insert(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 33, 100);
        assert!(matches!(result, Err(MmdbError::Build(_))));

        let mut builder = IpTreeBuilder::new(IpVersion::V6);
        let result = builder.insert(IpAddr::V6(Ipv6Addr::LOCALHOST), 129, 100);
        assert!(matches!(result, Err(MmdbError::Build(_))));
    }

    #[test]
    fn test_ipv6_in_ipv4_tree_fails() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4);
        let result = builder.insert(IpAddr::V6(Ipv6Addr::LOCALHOST), 128, 100);
        assert!(matches!(result, Err(MmdbError::Build(_))));
    }

    #[test]
    fn test_smallest_record_size() {
        let builder = IpTreeBuilder::new(IpVersion::V4);
        assert_eq!(builder.smallest_record_size(100), Some(RecordSize::Bits24));
        assert_eq!(builder.smallest_record_size(0x00FF_FFFF), Some(RecordSize::Bits28));
        assert_eq!(builder.smallest_record_size(0x0FFF_FFFF), Some(RecordSize::Bits32));
        assert_eq!(builder.smallest_record_size(u32::MAX as usize), None);
    }
}
