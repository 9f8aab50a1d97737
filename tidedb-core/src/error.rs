//! Error types for TideDB

use thiserror::Error;

/// Result type alias for TideDB operations
pub type Result<T> = std::result::Result<T, TideError>;

/// TideDB error types
#[derive(Error, Debug)]
pub enum TideError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Malformed options or arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database (or file it needs) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database exists but the caller asked for a fresh one
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Database handle has been closed
    #[error("Database is closed")]
    Closed,

    /// Deferred failure of a flush or compaction
    #[error("Background error: {0}")]
    Background(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TideError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TideError::Io(_) | TideError::Background(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TideError::Corruption(_) | TideError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is the not-found class
    pub fn is_not_found(&self) -> bool {
        match self {
            TideError::NotFound(_) => true,
            TideError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Build a copy suitable for handing to a second caller.
    ///
    /// `std::io::Error` is not `Clone`, so IO errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> TideError {
        match self {
            TideError::Io(e) => TideError::Io(std::io::Error::new(e.kind(), e.to_string())),
            TideError::Corruption(m) => TideError::Corruption(m.clone()),
            TideError::ChecksumMismatch { expected, actual } => TideError::ChecksumMismatch {
                expected: *expected,
                actual: *actual,
            },
            TideError::InvalidArgument(m) => TideError::InvalidArgument(m.clone()),
            TideError::NotFound(m) => TideError::NotFound(m.clone()),
            TideError::AlreadyExists(m) => TideError::AlreadyExists(m.clone()),
            TideError::Compression(m) => TideError::Compression(m.clone()),
            TideError::Closed => TideError::Closed,
            TideError::Background(m) => TideError::Background(m.clone()),
            TideError::Internal(m) => TideError::Internal(m.clone()),
        }
    }
}
