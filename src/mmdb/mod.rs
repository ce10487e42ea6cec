//! MaxMind DB (MMDB) file structure
//!
//! The MMDB format uses a binary search tree over IP address bits for
//! lookups. Leaves point into a data section encoded with the
//! [`data_section`](crate::data_section) codec, and a metadata map at the
//! end of the file describes the tree.
//!
//! ## Architecture
//!
//! - **types**: layout constants, [`IpVersion`], [`RecordSize`]
//! - **format**: metadata marker search, [`Metadata`], [`MmdbHeader`]
//! - **tree**: search tree traversal for IP lookups

pub mod format;
pub mod tree;
pub mod types;

pub use format::{find_metadata_marker, Metadata, MmdbHeader};
pub use tree::{Ipv4Start, SearchTree, TreeResult};
pub use types::{
    IpVersion, RecordSize, BINARY_FORMAT_MAJOR_VERSION, DATA_SECTION_SEPARATOR_SIZE,
    METADATA_MARKER, METADATA_SEARCH_SIZE,
};
