//! Status taxonomy for index operations.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. No panics
//! or unwinding cross the API boundary.

use thiserror::Error;

/// Result type alias using [`Status`].
pub type Result<T> = std::result::Result<T, Status>;

/// Unified status type surfaced by the indexing core.
#[derive(Debug, Error)]
pub enum Status {
    // -------------------------------------------------------------------------
    // Expected misses
    // -------------------------------------------------------------------------
    /// Lookup miss. Expected on read paths and never logged.
    #[error("not found")]
    NotFound,

    // -------------------------------------------------------------------------
    // Resource exhaustion
    // -------------------------------------------------------------------------
    /// DRAM or PMem allocation failed. The failed operation left no
    /// observable change behind.
    #[error("memory overflow: {0}")]
    MemoryOverflow(&'static str),

    /// Reserved for bounded-range operations.
    #[error("out of range")]
    OutOfRange,

    // -------------------------------------------------------------------------
    // Caller errors
    // -------------------------------------------------------------------------
    /// Construction-time parameter validation failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    // -------------------------------------------------------------------------
    // Fatal
    // -------------------------------------------------------------------------
    /// Persistent image is inconsistent. The engine must refuse to open.
    #[error("corruption: {0}")]
    Corruption(&'static str),

    /// I/O failure from the backing persistent mapping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Status {
    /// True for statuses a caller may treat as a routine miss.
    #[inline]
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// True when the status is fatal for the engine.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}
