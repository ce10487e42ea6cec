//! mmdb-reader - Fast Reader for MaxMind DB (MMDB) IP Databases
//!
//! mmdb-reader opens MaxMind DB files (GeoIP2, GeoLite2, ASN and custom
//! databases), walks their binary search tree for an IP address and decodes
//! the record it points at. It also ships a writer, so databases can be
//! built for tests, fixtures and private data sets.
//!
//! # Quick Start
//!
//! ```rust
//! use mmdb_reader::{DataValue, DatabaseBuilder, Reader};
//! use serde_json::json;
//!
//! // Build a small database
//! let mut builder = DatabaseBuilder::new().with_database_type("Example-City");
//! builder.add_ip(
//!     "81.2.69.0/24",
//!     DataValue::from_json(&json!({"country": {"iso_code": "GB"}}))?,
//! )?;
//! # let tmp_path = std::env::temp_dir().join("mmdb_reader_doctest_city.mmdb");
//! # std::fs::write(&tmp_path, builder.build()?)?;
//!
//! // Open it (memory-mapped) and look addresses up
//! # let reader = Reader::open(&tmp_path)?;
//! # let _ = std::fs::remove_file(&tmp_path);
//! # /*
//! let reader = Reader::open("example-city.mmdb")?;
//! # */
//! let result = reader.lookup_prefix("81.2.69.160".parse()?)?;
//! assert_eq!(result.prefix_len, 24);
//!
//! let iso_code = reader.lookup_path(
//!     "81.2.69.160".parse()?,
//!     &["country".into(), "iso_code".into()],
//! )?;
//! assert_eq!(iso_code, Some(DataValue::String("GB".to_string())));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Key Features
//!
//! - **Zero-Copy Loading**: Memory-mapped files open instantly; pages load on demand
//! - **Full Format Support**: 24/28/32-bit records, IPv4 and IPv6 trees, every data type
//! - **Hardened Decoding**: Bounds-checked reads, pointer-chain and depth limits
//! - **Thread Safe**: `Reader` is `Send + Sync`; lookups take `&self`
//! - **Verification**: Full structural check for untrusted files
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  MMDB File Format                    │
//! ├──────────────────────────────────────┤
//! │  1. Search Tree (binary trie)        │
//! │  2. 16-byte zero separator           │
//! │  3. Data Section (deduplicated)      │
//! │  4. "\xAB\xCD\xEFMaxMind.com"        │
//! │  5. Metadata map                     │
//! └──────────────────────────────────────┘
//!          ↓ mmap() or read
//! ┌──────────────────────────────────────┐
//! │  Reader (read-only, shared)          │
//! │  tree walk → offset → decode         │
//! └──────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
/// Data section encoding/decoding
pub mod data_section;
/// Error types for MMDB operations
pub mod error;
/// IP search tree builder
pub mod ip_tree_builder;
pub mod mmdb;
/// Complete database writer
pub mod mmdb_builder;
/// Database reader and lookups
pub mod reader;
pub mod serialization;
pub mod verify;

// Re-exports for Rust consumers

/// Database reader
pub use crate::reader::{LookupResult, OpenMode, Reader, ReaderOpener, ReaderOptions};

/// Data value type for database records
pub use crate::data_section::{DataDecoder, DataEncoder, DataValue, DecodeLimits, PathElement};

pub use crate::error::{MmdbError, Result};

pub use crate::mmdb::{IpVersion, Metadata, RecordSize};

/// Database builder for creating MMDB files
///
/// # Example
/// ```rust
/// use mmdb_reader::{DatabaseBuilder, DataValue, RecordSize};
///
/// let mut builder = DatabaseBuilder::new()
///     .with_database_type("Internal-Networks")
///     .with_record_size(RecordSize::Bits28);
///
/// builder.add_ip("10.0.0.0/8", DataValue::String("corp".to_string()))?;
/// builder.add_ip("2001:db8::/32", DataValue::String("lab".to_string()))?;
///
/// let db_bytes = builder.build()?;
/// # Ok::<(), mmdb_reader::MmdbError>(())
/// ```
pub use crate::mmdb_builder::{BuilderStats, DatabaseBuilder};

pub use crate::ip_tree_builder::IpTreeBuilder;
pub use crate::verify::{VerificationReport, VerificationStats};

// Version information
/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library major version
pub const VERSION_MAJOR: u32 = 0;

/// Library minor version
pub const VERSION_MINOR: u32 = 3;

/// Library patch version
pub const VERSION_PATCH: u32 = 0;
