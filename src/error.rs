//! Error types for hbow.

use thiserror::Error;

/// Errors surfaced by vocabulary and database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A persistence file could not be opened, read or written.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A descriptor buffer does not hold a whole number of descriptors.
    #[error("descriptor buffer of {len} floats is not a multiple of descriptor length {descriptor_length}")]
    BadDescriptorBuffer {
        len: usize,
        descriptor_length: usize,
    },

    /// A persistence stream is truncated or internally inconsistent.
    #[error("malformed file: {0}")]
    MalformedFile(String),

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type alias for hbow operations.
pub type Result<T> = std::result::Result<T, Error>;
