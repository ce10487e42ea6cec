/// Error types for the mmdb-reader library
use std::fmt;
use std::io;
use std::net::Ipv6Addr;

/// Result type alias for reader operations
pub type Result<T> = std::result::Result<T, MmdbError>;

/// Main error type for opening, walking and decoding MMDB files
///
/// A lookup that simply has no matching entry is not an error; it is
/// reported as `Ok(None)` by the lookup methods.
#[derive(Debug)]
pub enum MmdbError {
    /// Failed to open, read or map the file
    Io(io::Error),

    /// File is too small to contain a metadata section
    FileTooSmall {
        /// Actual file size in bytes
        size: usize,
        /// Minimum required size in bytes
        required: usize,
    },

    /// The metadata marker was not found near the end of the file
    MetadataNotFound,

    /// Metadata decoded but is missing required keys or has the wrong shape
    InvalidMetadata(String),

    /// Malformed, truncated or invalid bytes in the data section
    Format(String),

    /// Corrupt search tree encountered while walking it
    Traversal(String),

    /// Query string is not an IP address
    InvalidIpAddress(String),

    /// IPv6 address queried against an IPv4-only database
    Ipv6LookupInIpv4Database(Ipv6Addr),

    /// The reader has been closed
    Closed,

    /// Database construction failed
    Build(String),
}

impl MmdbError {
    /// True for errors caused by malformed file contents
    ///
    /// These are deterministic: retrying the same operation on the same
    /// bytes fails the same way.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            MmdbError::FileTooSmall { .. }
                | MmdbError::MetadataNotFound
                | MmdbError::InvalidMetadata(_)
                | MmdbError::Format(_)
        )
    }

    /// True for errors caused by a corrupt search tree
    pub fn is_traversal_error(&self) -> bool {
        matches!(self, MmdbError::Traversal(_))
    }
}

impl fmt::Display for MmdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmdbError::Io(e) => write!(f, "I/O error: {}", e),
            MmdbError::FileTooSmall { size, required } => {
                write!(f, "File too small: {} bytes (need at least {})", size, required)
            }
            MmdbError::MetadataNotFound => write!(f, "MMDB metadata marker not found"),
            MmdbError::InvalidMetadata(msg) => write!(f, "Invalid metadata: {}", msg),
            MmdbError::Format(msg) => write!(f, "Invalid MMDB format: {}", msg),
            MmdbError::Traversal(msg) => write!(f, "Corrupt search tree: {}", msg),
            MmdbError::InvalidIpAddress(msg) => write!(f, "Invalid IP address: {}", msg),
            MmdbError::Ipv6LookupInIpv4Database(addr) => {
                write!(f, "Cannot look up IPv6 address {} in an IPv4-only database", addr)
            }
            MmdbError::Closed => write!(f, "Database has been closed"),
            MmdbError::Build(msg) => write!(f, "Build error: {}", msg),
        }
    }
}

impl std::error::Error for MmdbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MmdbError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MmdbError {
    fn from(err: io::Error) -> Self {
        MmdbError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(MmdbError::Format("bad".into()).is_format_error());
        assert!(MmdbError::MetadataNotFound.is_format_error());
        assert!(MmdbError::FileTooSmall { size: 1, required: 15 }.is_format_error());
        assert!(!MmdbError::Traversal("bad".into()).is_format_error());
        assert!(MmdbError::Traversal("bad".into()).is_traversal_error());
        assert!(!MmdbError::Closed.is_format_error());
    }

    #[test]
    fn test_io_error_source() {
        use std::error::Error;

        let err: MmdbError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, MmdbError::Io(_)));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("I/O error"));
    }
}
