//! Error types for the boundary layer

use thiserror::Error;
use tidedb_core::TideError;

#[derive(Error, Debug)]
pub enum NativeError {
    /// Handle was never issued, or its object was already destroyed
    #[error("invalid {kind} handle: {handle:#x}")]
    InvalidHandle { kind: &'static str, handle: u64 },

    /// Required argument was absent
    #[error("{0} must not be null")]
    NullArgument(&'static str),

    /// Argument out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Iterator accessor called while not positioned on an entry
    #[error("iterator is not valid")]
    IteratorNotValid,

    /// Failure inside the engine
    #[error(transparent)]
    Engine(#[from] TideError),

    /// Info log file could not be opened
    #[error("cannot open info log: {0}")]
    InfoLog(#[source] std::io::Error),
}

/// Errors cross the boundary as their message
impl From<NativeError> for String {
    fn from(e: NativeError) -> Self {
        e.to_string()
    }
}

/// Result type of every boundary call
pub type NativeResult<T> = std::result::Result<T, String>;
