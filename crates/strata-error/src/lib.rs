//! Primary error type for strata operations.
//!
//! Errors fall into three groups:
//!
//! - **Caller errors** (out-of-bounds index, missing key, capacity limits):
//!   returned from the public API; the collection stays usable.
//! - **Fatal errors** (corruption, codec failures, storage faults): the
//!   collection must be treated as poisoned. [`StrataError::is_fatal`]
//!   classifies them.
//! - **External errors**: failures raised by caller-supplied callbacks,
//!   wrapped so the origin is identifiable.

#![forbid(unsafe_code)]

use strata_types::SlabId;
use thiserror::Error;

/// Primary error type for strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Caller errors ===
    /// An Array index operation outside `0..max`.
    #[error("index {index} is out of bounds (0..{max})")]
    IndexOutOfBounds { index: u64, max: u64 },

    /// Map `get`/`remove` on an absent key.
    #[error("key not found")]
    KeyNotFound,

    /// A Map digester was built before the root seed was set.
    #[error("hash seed is uninitialized")]
    HashSeedUninitialized,

    /// An element or key exceeded a hard size or count limit.
    #[error("{what} exceeds the maximum of {max}")]
    CapacityExceeded { what: &'static str, max: u64 },

    /// A value cannot be represented in the storable encoding.
    #[error("element is not storable: {detail}")]
    NonStorable { detail: String },

    // === Fatal errors ===
    /// Serializing a slab or element failed.
    #[error("encoding failed: {detail}")]
    EncodingFailed { detail: String },

    /// Deserializing a slab or element failed.
    #[error("decoding failed: {detail}")]
    DecodingFailed { detail: String },

    /// The base byte store reported an I/O fault.
    #[error("storage failed: {detail}")]
    StorageFailed { detail: String },

    /// A referenced slab does not exist in storage.
    #[error("slab {id} not found")]
    SlabNotFound { id: SlabId },

    /// A slab was loaded but has an unexpected kind.
    #[error("slab {id} has the wrong kind, expected {expected}")]
    WrongSlabType { id: SlabId, expected: &'static str },

    /// A slab's recorded size disagrees with its content.
    #[error("slab size invalid: {detail}")]
    SlabSizeInvalid { detail: String },

    /// A collision-group digest level disagrees with its position.
    #[error("digest level {got} does not match expected level {expected}")]
    DigestLevelMismatch { got: u8, expected: u8 },

    // === External ===
    /// An error raised by a caller-supplied callback.
    #[error("external callback failed: {detail}")]
    External { detail: String },
}

impl StrataError {
    /// Whether this error indicates corruption or an engine bug.
    ///
    /// A fatal error poisons the collection; callers must not keep mutating
    /// it and should surface the error to their recovery layer.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EncodingFailed { .. }
                | Self::DecodingFailed { .. }
                | Self::StorageFailed { .. }
                | Self::SlabNotFound { .. }
                | Self::WrongSlabType { .. }
                | Self::SlabSizeInvalid { .. }
                | Self::DigestLevelMismatch { .. }
        )
    }

    /// Create an encoding error.
    pub fn encoding(detail: impl Into<String>) -> Self {
        Self::EncodingFailed {
            detail: detail.into(),
        }
    }

    /// Create a decoding error.
    pub fn decoding(detail: impl Into<String>) -> Self {
        Self::DecodingFailed {
            detail: detail.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::StorageFailed {
            detail: detail.into(),
        }
    }

    /// Wrap a failure from a caller-supplied callback.
    pub fn external(detail: impl Into<String>) -> Self {
        Self::External {
            detail: detail.into(),
        }
    }
}

/// Result type alias using [`StrataError`].
pub type Result<T> = std::result::Result<T, StrataError>;
