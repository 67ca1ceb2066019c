//! # MAGMA Error Handling
//!
//! Error types for the GPU memory stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Misaligned, zero-length or out-of-range request
    InvalidArgument,
    /// Address range already mapped
    Conflict,
    /// Mapping, binding or address space not found
    NotFound,
    /// Allocation of a record, directory node or callback failed
    ResourceExhausted,
    /// Address space is evicting, or a reservation is contended on a
    /// path that must not block
    Busy,
    /// The device was removed while the operation was running
    DeviceGone,
    /// A bounded wait expired before the awaited work retired
    Timeout,
    /// The page-table update backend reported a failure
    Backend(BackendError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Conflict => write!(f, "address range already mapped"),
            Self::NotFound => write!(f, "not found"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::Busy => write!(f, "resource busy"),
            Self::DeviceGone => write!(f, "device gone"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Backend(e) => write!(f, "update backend error: {}", e),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Phase of the update backend protocol that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// Declaring the synchronization requirement failed
    Prepare,
    /// Writing entries failed
    Update,
    /// Submitting the batch failed
    Commit,
    /// Mapping a directory into the updater failed
    MapTable,
    /// The placement validator rejected a buffer
    Validate,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Prepare => "prepare",
            Self::Update => "update",
            Self::Commit => "commit",
            Self::MapTable => "map_table",
            Self::Validate => "validate",
        };
        f.write_str(phase)
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}
