//! MMDB Binary Format Parsing
//!
//! Locates the metadata section, decodes it into [`Metadata`] and derives the
//! section boundaries a reader needs ([`MmdbHeader`]).
//!
//! File layout:
//!
//! ```text
//! [search tree][16 zero bytes][data section][marker][metadata map]
//! ```
//!
//! Only the header is consulted on the lookup path; everything else stays in
//! the mapped file until requested.

use super::types::{
    IpVersion, RecordSize, BINARY_FORMAT_MAJOR_VERSION, DATA_SECTION_SEPARATOR_SIZE,
    METADATA_MARKER, METADATA_SEARCH_SIZE,
};
use crate::data_section::{DataDecoder, DataValue};
use crate::error::{MmdbError, Result};
use indexmap::IndexMap;
use memchr::memmem;

/// Section boundaries and tree shape derived from metadata
///
/// All offsets are absolute positions in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmdbHeader {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits (24, 28, or 32)
    pub record_size: RecordSize,
    /// IP version (4 or 6)
    pub ip_version: IpVersion,
    /// Size of the search tree in bytes
    pub tree_size: usize,
    /// First byte of the data section
    pub data_section_start: usize,
    /// One past the last byte of the data section (the marker offset)
    pub data_section_end: usize,
    /// First byte of the metadata map
    pub metadata_start: usize,
}

impl MmdbHeader {
    /// Parse the metadata of a complete file and derive its layout
    pub fn from_file(data: &[u8]) -> Result<(Self, Metadata)> {
        let required = METADATA_MARKER.len() + 1;
        if data.len() < required {
            return Err(MmdbError::FileTooSmall {
                size: data.len(),
                required,
            });
        }

        let marker_offset = find_metadata_marker(data)?;
        let metadata_start = marker_offset + METADATA_MARKER.len();
        let metadata = Metadata::decode(&data[metadata_start..])?;

        let tree_size = metadata.search_tree_size();
        let data_section_start = tree_size
            .checked_add(DATA_SECTION_SEPARATOR_SIZE)
            .filter(|&start| start <= marker_offset)
            .ok_or_else(|| {
                MmdbError::Format(format!(
                    "Search tree of {} nodes ({} bytes) does not fit before the metadata marker at {}",
                    metadata.node_count, tree_size, marker_offset
                ))
            })?;

        let header = MmdbHeader {
            node_count: metadata.node_count,
            record_size: metadata.record_size,
            ip_version: metadata.ip_version,
            tree_size,
            data_section_start,
            data_section_end: marker_offset,
            metadata_start,
        };

        Ok((header, metadata))
    }

    /// Length of the data section in bytes
    pub fn data_section_len(&self) -> usize {
        self.data_section_end - self.data_section_start
    }
}

/// Decoded database metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size
    pub record_size: RecordSize,
    /// IP version of the tree
    pub ip_version: IpVersion,
    /// Format major version (always 2)
    pub binary_format_major_version: u16,
    /// Format minor version
    pub binary_format_minor_version: u16,
    /// Free-form database type, e.g. "GeoIP2-City"
    pub database_type: String,
    /// Locale codes the records may carry names for
    pub languages: Vec<String>,
    /// Description keyed by language code
    pub description: IndexMap<String, String>,
    /// Build time in seconds since the Unix epoch
    pub build_epoch: u64,
}

impl Metadata {
    /// Decode the metadata map that follows the marker
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = DataDecoder::new(bytes)
            .decode(0)
            .map_err(|e| MmdbError::InvalidMetadata(format!("Failed to decode metadata: {}", e)))?;
        Self::from_value(&value)
    }

    /// Extract typed metadata from a decoded map
    pub fn from_value(value: &DataValue) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| MmdbError::InvalidMetadata("Metadata is not a map".to_string()))?;

        let node_count = extract_uint(map, "node_count")?;
        let node_count = u32::try_from(node_count).map_err(|_| {
            MmdbError::InvalidMetadata(format!("node_count {} does not fit in 32 bits", node_count))
        })?;
        if node_count == 0 {
            return Err(MmdbError::InvalidMetadata(
                "node_count must be at least 1".to_string(),
            ));
        }

        let record_size = RecordSize::from_bits(extract_uint(map, "record_size")?)?;
        if node_count > record_size.max_value() {
            return Err(MmdbError::InvalidMetadata(format!(
                "node_count {} cannot be addressed with {}-bit records",
                node_count,
                record_size.bits()
            )));
        }

        let ip_version = IpVersion::from_number(extract_uint(map, "ip_version")?)?;

        let major = extract_u16(map, "binary_format_major_version")?;
        if major != BINARY_FORMAT_MAJOR_VERSION {
            return Err(MmdbError::InvalidMetadata(format!(
                "Unsupported binary format major version {}",
                major
            )));
        }
        let minor = match map.get("binary_format_minor_version") {
            Some(_) => extract_u16(map, "binary_format_minor_version")?,
            None => 0,
        };

        let database_type = match map.get("database_type") {
            Some(DataValue::String(s)) => s.clone(),
            Some(other) => return Err(wrong_type("database_type", "a string", other)),
            None => return Err(missing("database_type")),
        };

        let build_epoch = extract_uint(map, "build_epoch")?;

        let languages = match map.get("languages") {
            None => Vec::new(),
            Some(DataValue::Array(items)) => items
                .iter()
                .map(|item| match item {
                    DataValue::String(s) => Ok(s.clone()),
                    other => Err(wrong_type("languages", "an array of strings", other)),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => return Err(wrong_type("languages", "an array of strings", other)),
        };

        let description = match map.get("description") {
            None => IndexMap::new(),
            Some(DataValue::Map(entries)) => entries
                .iter()
                .map(|(lang, text)| match text {
                    DataValue::String(s) => Ok((lang.clone(), s.clone())),
                    other => Err(wrong_type("description", "a map of strings", other)),
                })
                .collect::<Result<IndexMap<_, _>>>()?,
            Some(other) => return Err(wrong_type("description", "a map of strings", other)),
        };

        Ok(Metadata {
            node_count,
            record_size,
            ip_version,
            binary_format_major_version: major,
            binary_format_minor_version: minor,
            database_type,
            languages,
            description,
            build_epoch,
        })
    }

    /// Encode back into the metadata map written after the marker
    pub fn to_value(&self) -> DataValue {
        let mut map = IndexMap::new();
        map.insert(
            "binary_format_major_version".to_string(),
            DataValue::Uint16(self.binary_format_major_version),
        );
        map.insert(
            "binary_format_minor_version".to_string(),
            DataValue::Uint16(self.binary_format_minor_version),
        );
        map.insert("build_epoch".to_string(), DataValue::Uint64(self.build_epoch));
        map.insert(
            "database_type".to_string(),
            DataValue::String(self.database_type.clone()),
        );
        map.insert(
            "description".to_string(),
            DataValue::Map(
                self.description
                    .iter()
                    .map(|(k, v)| (k.clone(), DataValue::String(v.clone())))
                    .collect(),
            ),
        );
        map.insert(
            "ip_version".to_string(),
            DataValue::Uint16(self.ip_version.number()),
        );
        map.insert(
            "languages".to_string(),
            DataValue::Array(
                self.languages
                    .iter()
                    .map(|l| DataValue::String(l.clone()))
                    .collect(),
            ),
        );
        map.insert("node_count".to_string(), DataValue::Uint32(self.node_count));
        map.insert(
            "record_size".to_string(),
            DataValue::Uint16(self.record_size.bits()),
        );
        DataValue::Map(map)
    }

    /// Size of the search tree in bytes: `node_count * record_size * 2 / 8`
    pub fn search_tree_size(&self) -> usize {
        self.node_count as usize * self.record_size.node_bytes()
    }
}

/// Find the metadata marker in an MMDB file
///
/// The marker "\xAB\xCD\xEFMaxMind.com" appears somewhere in the last 128KB
/// of the file. The metadata comes AFTER the marker. If the marker occurs
/// more than once, the last occurrence wins.
pub fn find_metadata_marker(data: &[u8]) -> Result<usize> {
    let search_start = data.len().saturating_sub(METADATA_SEARCH_SIZE);

    memmem::rfind(&data[search_start..], METADATA_MARKER)
        .map(|pos| search_start + pos)
        .ok_or(MmdbError::MetadataNotFound)
}

fn extract_uint(map: &IndexMap<String, DataValue>, key: &str) -> Result<u64> {
    match map.get(key) {
        Some(DataValue::Uint16(n)) => Ok(*n as u64),
        Some(DataValue::Uint32(n)) => Ok(*n as u64),
        Some(DataValue::Uint64(n)) => Ok(*n),
        Some(DataValue::Uint128(n)) => u64::try_from(*n).map_err(|_| {
            MmdbError::InvalidMetadata(format!("Field '{}' does not fit in 64 bits", key))
        }),
        Some(other) => Err(wrong_type(key, "an unsigned integer", other)),
        None => Err(missing(key)),
    }
}

fn extract_u16(map: &IndexMap<String, DataValue>, key: &str) -> Result<u16> {
    let n = extract_uint(map, key)?;
    u16::try_from(n)
        .map_err(|_| MmdbError::InvalidMetadata(format!("Field '{}' value {} is out of range", key, n)))
}

fn missing(key: &str) -> MmdbError {
    MmdbError::InvalidMetadata(format!("Required field '{}' not found", key))
}

fn wrong_type(key: &str, expected: &str, found: &DataValue) -> MmdbError {
    MmdbError::InvalidMetadata(format!(
        "Field '{}' must be {}, found {}",
        key,
        expected,
        found.type_name()
    ))
}
