//! Error types for LEED
//!
//! A single error enum is shared by the storage engine, the node layer and
//! the admin tooling.

use thiserror::Error;

/// Common result type for LEED operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LEED
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("insufficient device capacity: layout needs {required} blocks, device has {available}")]
    InsufficientCapacity { required: u64, available: u64 },

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Operation outcomes
    #[error("key not found")]
    NotFound,

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("value log full: need {required} bytes, {available} bytes left")]
    ValueLogFull { required: u64, available: u64 },

    #[error("invalid key length {0}: keys must be 1..=255 bytes")]
    InvalidKey(usize),

    #[error("value too large: {len} bytes, max {max}")]
    ValueTooLarge { len: usize, max: u64 },

    // Migration errors
    #[error("key range not found: [{start:#x}, {end:#x})")]
    RangeNotFound { start: u64, end: u64 },

    #[error("key range busy: [{start:#x}, {end:#x}) still copying")]
    RangeBusy { start: u64, end: u64 },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a no-space error
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpace(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this error means a capacity limit was hit
    #[must_use]
    pub const fn is_no_space(&self) -> bool {
        matches!(
            self,
            Self::NoSpace(_) | Self::ValueLogFull { .. } | Self::InsufficientCapacity { .. }
        )
    }

    /// Check if the operation was rejected before touching storage
    #[must_use]
    pub const fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_) | Self::ValueTooLarge { .. } | Self::InvalidArgument(_)
        )
    }
}
