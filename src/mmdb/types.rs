//! MMDB Type Definitions
//!
//! Layout constants and the small enums that describe a search tree.

use crate::error::{MmdbError, Result};

/// MMDB metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// The marker must appear within this many bytes of the end of the file
pub const METADATA_SEARCH_SIZE: usize = 128 * 1024;

/// Zero bytes between the search tree and the data section
pub const DATA_SECTION_SEPARATOR_SIZE: usize = 16;

/// Only major version of the binary format this crate reads and writes
pub const BINARY_FORMAT_MAJOR_VERSION: u16 = 2;

/// IP version of a search tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4 only (32-bit keys)
    V4,
    /// IPv6 (128-bit keys; IPv4 lives under `::/96`)
    V6,
}

impl IpVersion {
    /// Parse the `ip_version` metadata value
    pub fn from_number(n: u64) -> Result<Self> {
        match n {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            _ => Err(MmdbError::InvalidMetadata(format!(
                "Invalid IP version: {}",
                n
            ))),
        }
    }

    /// The number stored in metadata (4 or 6)
    pub fn number(self) -> u16 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Number of address bits a lookup walks
    pub fn bit_count(self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordSize {
    /// 24-bit records (3 bytes per record, 6 bytes per node)
    Bits24 = 24,
    /// 28-bit records (3.5 bytes per record, 7 bytes per node)
    Bits28 = 28,
    /// 32-bit records (4 bytes per record, 8 bytes per node)
    Bits32 = 32,
}

impl RecordSize {
    /// All record sizes, smallest first
    pub const ALL: [RecordSize; 3] = [RecordSize::Bits24, RecordSize::Bits28, RecordSize::Bits32];

    /// Get the size of a node (2 records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Record width in bits
    pub fn bits(self) -> u16 {
        self as u16
    }

    /// Largest value a record of this size can hold
    pub fn max_value(self) -> u32 {
        match self {
            RecordSize::Bits24 => 0x00FF_FFFF,
            RecordSize::Bits28 => 0x0FFF_FFFF,
            RecordSize::Bits32 => u32::MAX,
        }
    }

    /// Create from bit size
    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(MmdbError::InvalidMetadata(format!(
                "Invalid record size: {} bits",
                bits
            ))),
        }
    }
}
