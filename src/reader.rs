//! Database reader
//!
//! [`Reader`] owns the bytes of one MMDB file, either memory-mapped or read
//! into memory, and answers IP lookups against them. Opening parses the
//! metadata and caches the IPv4 start node; after that every lookup is a
//! read-only walk over the tree plus a decode of the matching record.
//!
//! The handle is `Send + Sync`. Lookups take `&self`, so one reader can be
//! shared across threads by reference or through an `Arc`. Closing takes
//! `&mut self`, which means no lookup can be in flight while it runs.

use crate::data_section::{DataDecoder, DataValue, DecodeLimits, PathElement};
use crate::error::{MmdbError, Result};
use crate::mmdb::{
    IpVersion, Ipv4Start, Metadata, MmdbHeader, SearchTree, TreeResult, METADATA_MARKER,
};
use crate::verify::{verify_bytes_with_limits, VerificationReport};
use memmap2::Mmap;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, trace};

/// How the file is brought into memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Memory-map the file (default)
    #[default]
    Mmap,
    /// Read the whole file into an owned buffer
    Memory,
}

/// Options for opening a database
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// How to load the file
    pub mode: OpenMode,
    /// Bounds applied when decoding records
    pub limits: DecodeLimits,
}

/// Builder for opening databases with custom configuration
///
/// Created via [`Reader::options`].
///
/// # Examples
///
/// ```no_run
/// use mmdb_reader::{OpenMode, Reader};
///
/// let reader = Reader::options()
///     .mode(OpenMode::Memory)
///     .max_depth(32)
///     .open("GeoLite2-Country.mmdb")?;
/// # Ok::<(), mmdb_reader::MmdbError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReaderOpener {
    options: ReaderOptions,
}

impl ReaderOpener {
    /// Choose memory-mapped or in-memory loading
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Replace all decode limits
    pub fn limits(mut self, limits: DecodeLimits) -> Self {
        self.options.limits = limits;
        self
    }

    /// Maximum consecutive pointer hops while decoding
    pub fn max_pointer_chain(mut self, hops: usize) -> Self {
        self.options.limits.max_pointer_chain = hops;
        self
    }

    /// Maximum nesting depth while decoding
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.options.limits.max_depth = depth;
        self
    }

    /// Maximum number of values produced by one decode
    pub fn max_values(mut self, values: usize) -> Self {
        self.options.limits.max_values = values;
        self
    }

    /// Open a database file with the configured options
    pub fn open(self, path: impl AsRef<Path>) -> Result<Reader> {
        Reader::open_with(path, self.options)
    }

    /// Load a database from bytes with the configured options
    ///
    /// The open mode is ignored; the bytes are always owned.
    pub fn from_bytes(self, bytes: Vec<u8>) -> Result<Reader> {
        Reader::from_storage(Storage::Owned(bytes), OpenMode::Memory, self.options.limits)
    }
}

/// Storage for database data - either owned or memory-mapped
enum Storage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Mmap(m) => &m[..],
        }
    }
}

/// Result of a lookup that also reports the matched network
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    /// Decoded record, or `None` if the address has no data
    pub data: Option<DataValue>,
    /// Prefix length of the network the walk ended in
    ///
    /// For IPv4 addresses this is relative to the 32-bit address, even
    /// when the database is IPv6.
    pub prefix_len: u8,
    /// Internal node the walk stopped on when the address ran out of bits
    ///
    /// `None` whenever the walk ended on a data or empty record.
    pub node: Option<u32>,
    /// The address that was looked up
    pub ip: IpAddr,
}

impl LookupResult {
    /// Network address: the queried address with host bits cleared
    pub fn network(&self) -> IpAddr {
        mask_address(self.ip, self.prefix_len)
    }
}

/// Read-only handle on an MMDB file
///
/// # Examples
///
/// ```no_run
/// use mmdb_reader::Reader;
///
/// let reader = Reader::open("GeoLite2-City.mmdb")?;
///
/// if let Some(record) = reader.lookup_str("8.8.8.8")? {
///     println!("{}", record.pretty(2));
/// }
/// # Ok::<(), mmdb_reader::MmdbError>(())
/// ```
pub struct Reader {
    /// `None` once closed
    storage: Option<Storage>,
    mode: OpenMode,
    header: MmdbHeader,
    metadata: Metadata,
    ipv4_start: Ipv4Start,
    limits: DecodeLimits,
}

impl Reader {
    /// Open a database file using memory mapping
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Configure how a database is opened
    pub fn options() -> ReaderOpener {
        ReaderOpener::default()
    }

    /// Open a database file with explicit options
    pub fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;

        let size = file.metadata()?.len() as usize;
        let required = METADATA_MARKER.len() + 1;
        if size < required {
            return Err(MmdbError::FileTooSmall { size, required });
        }

        let storage = match options.mode {
            // SAFETY: the mapping is read-only and owned by the reader. As with
            // any mmap, the file must not be truncated while it is open.
            OpenMode::Mmap => Storage::Mmap(unsafe { Mmap::map(&file)? }),
            OpenMode::Memory => Storage::Owned(std::fs::read(path)?),
        };

        debug!(path = %path.display(), mode = ?options.mode, "Opening database");
        Self::from_storage(storage, options.mode, options.limits)
    }

    /// Create a reader from raw bytes
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_storage(Storage::Owned(data), OpenMode::Memory, DecodeLimits::default())
    }

    fn from_storage(storage: Storage, mode: OpenMode, limits: DecodeLimits) -> Result<Self> {
        let data = storage.as_slice();
        let (header, metadata) = MmdbHeader::from_file(data)?;
        let ipv4_start = SearchTree::new(data, &header).ipv4_start_node()?;

        debug!(
            size = data.len(),
            node_count = header.node_count,
            record_size = header.record_size.bits(),
            ip_version = header.ip_version.number(),
            data_section_len = header.data_section_len(),
            database_type = %metadata.database_type,
            "Database loaded"
        );

        Ok(Self {
            storage: Some(storage),
            mode,
            header,
            metadata,
            ipv4_start,
            limits,
        })
    }

    /// Release the underlying file or buffer
    ///
    /// Closing twice is a no-op. Every lookup after close returns
    /// [`MmdbError::Closed`]; metadata stays available.
    pub fn close(&mut self) {
        if self.storage.take().is_some() {
            debug!(database_type = %self.metadata.database_type, "Database closed");
        }
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.storage.is_none()
    }

    /// How the database was loaded
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Parsed metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Section layout derived from metadata
    pub fn header(&self) -> &MmdbHeader {
        &self.header
    }

    /// Decode limits applied to every record
    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    /// Decode the raw metadata map, including keys [`Metadata`] does not model
    pub fn metadata_value(&self) -> Result<DataValue> {
        let data = self.data()?;
        DataDecoder::new(&data[self.header.metadata_start..])
            .with_limits(self.limits)
            .decode(0)
    }

    /// Look up an IP address
    ///
    /// Returns `Ok(None)` when the address is not in the database.
    pub fn lookup(&self, ip: IpAddr) -> Result<Option<DataValue>> {
        match self.lookup_offset(ip)? {
            Some((offset, _)) => self.decode_at(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Parse and look up an IP address string
    pub fn lookup_str(&self, ip: &str) -> Result<Option<DataValue>> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| MmdbError::InvalidIpAddress(ip.to_string()))?;
        self.lookup(addr)
    }

    /// Look up an IP address and report the network it matched
    pub fn lookup_prefix(&self, ip: IpAddr) -> Result<LookupResult> {
        let (result, prefix_len) = self.walk(ip)?;
        let data = match result.data_offset() {
            Some(offset) => Some(self.decode_at(offset)?),
            None => None,
        };
        let node = match result {
            TreeResult::Exhausted { node, .. } => Some(node),
            _ => None,
        };
        Ok(LookupResult {
            data,
            prefix_len,
            node,
            ip,
        })
    }

    /// Look up an IP address and follow a path into the record
    ///
    /// Returns `Ok(None)` if the address is not found or the path does not
    /// exist in its record.
    pub fn lookup_path(&self, ip: IpAddr, path: &[PathElement<'_>]) -> Result<Option<DataValue>> {
        Ok(self
            .lookup(ip)?
            .and_then(|record| record.path(path).cloned()))
    }

    /// Find the data offset and prefix length for an address
    ///
    /// Many addresses share one record; callers that cache decoded values
    /// can key on the offset and decode with [`decode_at`](Self::decode_at).
    pub fn lookup_offset(&self, ip: IpAddr) -> Result<Option<(u32, u8)>> {
        let (result, prefix_len) = self.walk(ip)?;
        Ok(result.data_offset().map(|offset| (offset, prefix_len)))
    }

    /// Decode the record at a data section offset
    pub fn decode_at(&self, offset: u32) -> Result<DataValue> {
        let data = self.data()?;
        let section = &data[self.header.data_section_start..self.header.data_section_end];
        DataDecoder::new(section)
            .with_limits(self.limits)
            .decode(offset)
    }

    /// Check the whole file for structural problems
    pub fn verify(&self) -> Result<VerificationReport> {
        Ok(verify_bytes_with_limits(self.data()?, self.limits))
    }

    fn data(&self) -> Result<&[u8]> {
        self.storage
            .as_ref()
            .map(Storage::as_slice)
            .ok_or(MmdbError::Closed)
    }

    /// Walk the tree for an address; returns the result and its prefix length
    ///
    /// Running out of address bits on an internal node is a miss, not an
    /// error. Only out-of-range node or data references fail.
    fn walk(&self, ip: IpAddr) -> Result<(TreeResult, u8)> {
        let data = self.data()?;
        let tree = SearchTree::new(data, &self.header);
        let result = tree.lookup(ip, self.ipv4_start)?;

        // IPv4 prefixes are reported relative to the 32-bit address
        let prefix_len = match (ip, self.header.ip_version) {
            (IpAddr::V4(_), IpVersion::V6) => result.depth().saturating_sub(96),
            _ => result.depth(),
        };

        trace!(%ip, prefix_len, found = result.data_offset().is_some(), "Lookup");
        Ok((result, prefix_len))
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .field("header", &self.header)
            .field("database_type", &self.metadata.database_type)
            .finish()
    }
}

/// Clear the host bits of an address
fn mask_address(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let mask = u32::MAX
                .checked_shl(32 - prefix_len.min(32) as u32)
                .unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(addr) & mask))
        }
        IpAddr::V6(addr) => {
            let mask = u128::MAX
                .checked_shl(128 - prefix_len.min(128) as u32)
                .unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(addr) & mask))
        }
    }
}
