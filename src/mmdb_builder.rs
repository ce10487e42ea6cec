//! MMDB Database Builder
//!
//! Assembles complete MaxMind DB files from IP networks and their records:
//!
//! ```text
//! [search tree][16 zero bytes][data section][marker][metadata map]
//! ```
//!
//! Records are deduplicated in the data section, so many networks sharing
//! one record cost a single copy.

use crate::data_section::{encode_plain, DataEncoder, DataValue};
use crate::error::{MmdbError, Result};
use crate::ip_tree_builder::IpTreeBuilder;
use crate::mmdb::{
    IpVersion, Metadata, RecordSize, BINARY_FORMAT_MAJOR_VERSION, DATA_SECTION_SEPARATOR_SIZE,
    METADATA_MARKER,
};
use indexmap::IndexMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const DEFAULT_DATABASE_TYPE: &str = "MMDB-Reader-IP";
const DEFAULT_DESCRIPTION: &str = "IP database built with mmdb-reader";

/// One network and its record
#[derive(Debug, Clone)]
struct NetworkEntry {
    addr: IpAddr,
    prefix_len: u8,
    data: DataValue,
}

/// Database builder
///
/// # Example
/// ```
/// use mmdb_reader::{DataValue, DatabaseBuilder, Reader};
///
/// let mut builder = DatabaseBuilder::new()
///     .with_database_type("Example-ASN")
///     .with_description("en", "Example ASN database");
/// builder.add_ip("1.2.3.0/24", DataValue::Uint32(64496))?;
///
/// let reader = Reader::from_bytes(builder.build()?)?;
/// assert_eq!(
///     reader.lookup_str("1.2.3.4")?,
///     Some(DataValue::Uint32(64496))
/// );
/// # Ok::<(), mmdb_reader::MmdbError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct DatabaseBuilder {
    entries: Vec<NetworkEntry>,
    /// Optional custom database type name
    database_type: Option<String>,
    /// Optional custom description (language -> text)
    description: IndexMap<String, String>,
    languages: Option<Vec<String>>,
    /// `None` picks the smallest size that fits
    record_size: Option<RecordSize>,
    /// `None` picks IPv6 only if an IPv6 network was added
    ip_version: Option<IpVersion>,
    build_epoch: Option<u64>,
}

impl DatabaseBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom database type name
    ///
    /// If not set, defaults to "MMDB-Reader-IP".
    pub fn with_database_type(mut self, db_type: impl Into<String>) -> Self {
        self.database_type = Some(db_type.into());
        self
    }

    /// Add a description in a specific language
    ///
    /// Can be called multiple times for different languages.
    /// If not called, defaults to an English description.
    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    /// Set the locale codes records carry names for (default: `["en"]`)
    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = Some(languages.into_iter().map(Into::into).collect());
        self
    }

    /// Force a record size instead of picking the smallest that fits
    pub fn with_record_size(mut self, record_size: RecordSize) -> Self {
        self.record_size = Some(record_size);
        self
    }

    /// Force the tree's IP version
    ///
    /// An IPv6 tree can hold IPv4 networks; an IPv4 tree rejects IPv6
    /// networks at build time.
    pub fn with_ip_version(mut self, ip_version: IpVersion) -> Self {
        self.ip_version = Some(ip_version);
        self
    }

    /// Set the build time instead of using the current time
    pub fn with_build_epoch(mut self, epoch: u64) -> Self {
        self.build_epoch = Some(epoch);
        self
    }

    /// Add a network from an address ("1.2.3.4") or CIDR ("1.2.3.0/24")
    ///
    /// A bare address is a full-length network (/32 or /128).
    pub fn add_ip(&mut self, key: &str, data: DataValue) -> Result<()> {
        let (addr, prefix_len) = parse_network(key)?;
        self.add_network(addr, prefix_len, data)
    }

    /// Add a network given as address and prefix length
    pub fn add_network(&mut self, addr: IpAddr, prefix_len: u8, data: DataValue) -> Result<()> {
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_prefix {
            return Err(MmdbError::Build(format!(
                "Prefix length {} exceeds {} for {}",
                prefix_len, max_prefix, addr
            )));
        }

        self.entries.push(NetworkEntry {
            addr,
            prefix_len,
            data,
        });
        Ok(())
    }

    /// Build the database
    pub fn build(&self) -> Result<Vec<u8>> {
        let ip_version = self.ip_version.unwrap_or_else(|| {
            if self.entries.iter().any(|e| e.addr.is_ipv6()) {
                IpVersion::V6
            } else {
                IpVersion::V4
            }
        });

        // Data section first: the tree needs the offsets
        let mut encoder = DataEncoder::new();
        let mut tree = IpTreeBuilder::new(ip_version);
        for entry in &self.entries {
            let offset = encoder.encode(&entry.data)?;
            tree.insert(entry.addr, entry.prefix_len, offset)?;
        }
        let data_section = encoder.into_bytes();

        let record_size = match self.record_size {
            Some(size) => size,
            None => tree.smallest_record_size(data_section.len()).ok_or_else(|| {
                MmdbError::Build(format!(
                    "{} nodes and {} bytes of data cannot be addressed with 32-bit records",
                    tree.node_count(),
                    data_section.len()
                ))
            })?,
        };
        let (tree_bytes, node_count) = tree.build(record_size)?;

        let metadata = self.metadata(node_count, record_size, ip_version);
        let mut metadata_bytes = Vec::new();
        encode_plain(&metadata.to_value(), &mut metadata_bytes)?;

        let mut database = Vec::with_capacity(
            tree_bytes.len()
                + DATA_SECTION_SEPARATOR_SIZE
                + data_section.len()
                + METADATA_MARKER.len()
                + metadata_bytes.len(),
        );
        database.extend_from_slice(&tree_bytes);
        database.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR_SIZE]);
        database.extend_from_slice(&data_section);
        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&metadata_bytes);

        debug!(
            networks = self.entries.len(),
            node_count,
            record_size = record_size.bits(),
            ip_version = ip_version.number(),
            data_section_len = data_section.len(),
            size = database.len(),
            "Database built"
        );

        Ok(database)
    }

    fn metadata(&self, node_count: u32, record_size: RecordSize, ip_version: IpVersion) -> Metadata {
        let description = if self.description.is_empty() {
            let mut default = IndexMap::new();
            default.insert("en".to_string(), DEFAULT_DESCRIPTION.to_string());
            default
        } else {
            self.description.clone()
        };

        let build_epoch = self.build_epoch.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        Metadata {
            node_count,
            record_size,
            ip_version,
            binary_format_major_version: BINARY_FORMAT_MAJOR_VERSION,
            binary_format_minor_version: 0,
            database_type: self
                .database_type
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_TYPE.to_string()),
            languages: self
                .languages
                .clone()
                .unwrap_or_else(|| vec!["en".to_string()]),
            description,
            build_epoch,
        }
    }

    /// Get statistics about the builder
    pub fn stats(&self) -> BuilderStats {
        let ipv6_entries = self.entries.iter().filter(|e| e.addr.is_ipv6()).count();
        BuilderStats {
            total_entries: self.entries.len(),
            ipv4_entries: self.entries.len() - ipv6_entries,
            ipv6_entries,
        }
    }
}

/// Alternate name for [`DatabaseBuilder`]
pub type MmdbBuilder = DatabaseBuilder;

/// Builder statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderStats {
    /// Total number of networks added
    pub total_entries: usize,
    /// Number of IPv4 networks
    pub ipv4_entries: usize,
    /// Number of IPv6 networks
    pub ipv6_entries: usize,
}

/// Parse "addr" or "addr/prefix"
fn parse_network(key: &str) -> Result<(IpAddr, u8)> {
    let key = key.trim();
    let invalid = || MmdbError::InvalidIpAddress(key.to_string());

    match key.split_once('/') {
        None => {
            let addr: IpAddr = key.parse().map_err(|_| invalid())?;
            let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
            Ok((addr, prefix_len))
        }
        Some((addr_str, prefix_str)) => {
            let addr: IpAddr = addr_str.parse().map_err(|_| invalid())?;
            let prefix_len: u8 = prefix_str.parse().map_err(|_| invalid())?;
            let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
            if prefix_len > max_prefix {
                return Err(invalid());
            }
            Ok((addr, prefix_len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmdb::MmdbHeader;
    use crate::Reader;

    #[test]
    fn test_parse_ip_address() {
        let (addr, prefix_len) = parse_network("8.8.8.8").unwrap();
        assert_eq!(addr.to_string(), "8.8.8.8");
        assert_eq!(prefix_len, 32);
    }

    #[test]
    fn test_parse_cidr() {
        let (addr, prefix_len) = parse_network("192.168.0.0/16").unwrap();
        assert_eq!(addr.to_string(), "192.168.0.0");
        assert_eq!(prefix_len, 16);
    }

    #[test]
    fn test_parse_ipv6() {
        let (addr, prefix_len) = parse_network("2001:4860:4860::8888").unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(prefix_len, 128);

        let (_, prefix_len) = parse_network("2001:db8::/32").unwrap();
        assert_eq!(prefix_len, 32);
    }

    #[test]
    fn test_parse_rejects_non_networks() {
        for bad in ["evil.com", "*.evil.com", "1.2.3.0/33", "::/129", "1.2.3.0/", "/24", ""] {
            assert!(
                matches!(parse_network(bad), Err(MmdbError::InvalidIpAddress(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_empty_builder_builds_valid_database() {
        let bytes = DatabaseBuilder::new().build().unwrap();
        let reader = Reader::from_bytes(bytes).unwrap();

        assert_eq!(reader.metadata().node_count, 1);
        assert_eq!(reader.metadata().ip_version, IpVersion::V4);
        assert!(reader.lookup_str("1.1.1.1").unwrap().is_none());
    }

    #[test]
    fn test_ip_version_auto_detect() {
        let mut builder = DatabaseBuilder::new();
        builder.add_ip("10.0.0.0/8", DataValue::Bool(true)).unwrap();
        let bytes = builder.build().unwrap();
        assert_eq!(Reader::from_bytes(bytes).unwrap().metadata().ip_version, IpVersion::V4);

        builder.add_ip("2001:db8::/32", DataValue::Bool(false)).unwrap();
        let reader = Reader::from_bytes(builder.build().unwrap()).unwrap();
        assert_eq!(reader.metadata().ip_version, IpVersion::V6);
        assert_eq!(reader.lookup_str("10.1.1.1").unwrap(), Some(DataValue::Bool(true)));
        assert_eq!(reader.lookup_str("2001:db8::1").unwrap(), Some(DataValue::Bool(false)));
    }

    #[test]
    fn test_ipv6_network_in_forced_ipv4_tree() {
        let mut builder = DatabaseBuilder::new().with_ip_version(IpVersion::V4);
        builder.add_ip("2001:db8::/32", DataValue::Bool(true)).unwrap();
        assert!(matches!(builder.build(), Err(MmdbError::Build(_))));
    }

    #[test]
    fn test_record_size_auto_select() {
        let mut builder = DatabaseBuilder::new();
        builder.add_ip("1.2.3.0/24", DataValue::Uint16(1)).unwrap();
        let (header, _) = MmdbHeader::from_file(&builder.build().unwrap()).unwrap();
        assert_eq!(header.record_size, RecordSize::Bits24);
    }

    #[test]
    fn test_explicit_record_sizes() {
        for size in RecordSize::ALL {
            let mut builder = DatabaseBuilder::new().with_record_size(size);
            builder
                .add_ip("172.16.0.0/12", DataValue::String("private".to_string()))
                .unwrap();

            let reader = Reader::from_bytes(builder.build().unwrap()).unwrap();
            assert_eq!(reader.metadata().record_size, size);
            assert_eq!(
                reader.lookup_str("172.20.1.1").unwrap(),
                Some(DataValue::String("private".to_string()))
            );
        }
    }

    #[test]
    fn test_metadata_options() {
        let bytes = DatabaseBuilder::new()
            .with_database_type("Custom-Type")
            .with_description("en", "English")
            .with_description("de", "Deutsch")
            .with_languages(["en", "de"])
            .with_build_epoch(1_234_567_890)
            .build()
            .unwrap();

        let reader = Reader::from_bytes(bytes).unwrap();
        let metadata = reader.metadata();
        assert_eq!(metadata.database_type, "Custom-Type");
        assert_eq!(metadata.languages, ["en", "de"]);
        assert_eq!(metadata.description.get("de").map(String::as_str), Some("Deutsch"));
        assert_eq!(metadata.build_epoch, 1_234_567_890);
        assert_eq!(metadata.binary_format_major_version, 2);
    }

    #[test]
    fn test_shared_records_are_stored_once() {
        let record = DataValue::String("x".repeat(100));

        let mut one = DatabaseBuilder::new().with_build_epoch(0);
        one.add_ip("10.0.0.0/8", record.clone()).unwrap();

        let mut many = DatabaseBuilder::new().with_build_epoch(0);
        for i in 0..50u8 {
            many.add_network(IpAddr::from([10, i, 0, 0]), 16, record.clone())
                .unwrap();
        }

        let (h1, _) = MmdbHeader::from_file(&one.build().unwrap()).unwrap();
        let (h2, _) = MmdbHeader::from_file(&many.build().unwrap()).unwrap();
        assert_eq!(h1.data_section_len(), h2.data_section_len());
    }

    #[test]
    fn test_stats() {
        let mut builder = DatabaseBuilder::new();
        builder.add_ip("1.1.1.1", DataValue::Bool(true)).unwrap();
        builder.add_ip("::1", DataValue::Bool(true)).unwrap();
        builder.add_ip("10.0.0.0/8", DataValue::Bool(true)).unwrap();

        assert_eq!(
            builder.stats(),
            BuilderStats {
                total_entries: 3,
                ipv4_entries: 2,
                ipv6_entries: 1,
            }
        );
    }

    #[test]
    fn test_add_network_rejects_long_prefix() {
        let mut builder = DatabaseBuilder::new();
        let err = builder
            .add_network("10.0.0.0".parse().unwrap(), 40, DataValue::Bool(true))
            .unwrap_err();
        assert!(matches!(err, MmdbError::Build(_)));
    }

    #[test]
    fn test_record_nesting_limited_to_reader_depth() {
        use crate::data_section::MAX_DECODE_DEPTH;

        let nested = |levels: usize| {
            (0..levels).fold(DataValue::Bool(true), |inner, _| {
                DataValue::Map([("k".to_string(), inner)].into_iter().collect())
            })
        };

        let mut builder = DatabaseBuilder::new();
        builder.add_ip("1.2.3.0/24", nested(MAX_DECODE_DEPTH)).unwrap();
        let reader = Reader::from_bytes(builder.build().unwrap()).unwrap();
        assert_eq!(
            reader.lookup_str("1.2.3.4").unwrap(),
            Some(nested(MAX_DECODE_DEPTH))
        );

        let mut builder = DatabaseBuilder::new();
        builder.add_ip("1.2.3.0/24", nested(MAX_DECODE_DEPTH + 1)).unwrap();
        assert!(matches!(builder.build(), Err(MmdbError::Build(_))));
    }
}
