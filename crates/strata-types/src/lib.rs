//! Core identifier and configuration types shared across the strata crates.
//!
//! - [`Address`]: the 8-byte account that owns a tree.
//! - [`SlabIndex`]: the 8-byte monotone counter allocated per address.
//! - [`SlabId`]: `(Address, SlabIndex)`, the opaque 16-byte slab handle.
//! - [`Digest`]: the unsigned 64-bit hash value ordering Map elements.
//! - [`TypeInfo`]: the user type tag carried by a root slab.
//! - [`SlabLimits`]: per-tree slab size thresholds, captured at creation.

#![forbid(unsafe_code)]

use std::fmt;

/// Serialized width of a [`SlabId`] in bytes.
pub const SLAB_ID_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// The 8-byte identifier of the account that owns a tree.
///
/// All slabs of one tree share one address. The all-zero address is the
/// distinguished "undefined" owner used for temporary, uncommitted
/// allocations; the cache layer never persists slabs under it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Address(pub [u8; 8]);

impl Address {
    /// The undefined (temporary) owner.
    pub const UNDEFINED: Self = Self([0; 8]);

    /// Whether this is the undefined owner.
    #[must_use]
    pub const fn is_undefined(self) -> bool {
        u64::from_be_bytes(self.0) == 0
    }

    /// The address as a big-endian integer, used for commit ordering.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.as_u64())
    }
}

// ---------------------------------------------------------------------------
// SlabIndex
// ---------------------------------------------------------------------------

/// The 8-byte monotone counter allocated per [`Address`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SlabIndex(pub [u8; 8]);

impl SlabIndex {
    /// The undefined index; never a valid allocation result.
    pub const UNDEFINED: Self = Self([0; 8]);

    /// The following index. Allocation starts at 1, so the first call on
    /// `UNDEFINED` yields index 1.
    #[must_use]
    pub const fn next(self) -> Self {
        Self((u64::from_be_bytes(self.0) + 1).to_be_bytes())
    }

    /// The index as a big-endian integer, used for commit ordering.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for SlabIndex {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

// ---------------------------------------------------------------------------
// SlabId
// ---------------------------------------------------------------------------

/// The opaque 16-byte handle of a slab: owning address plus per-address index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SlabId {
    pub address: Address,
    pub index: SlabIndex,
}

impl SlabId {
    /// The undefined handle; terminates leaf chains and marks "no slab".
    pub const UNDEFINED: Self = Self {
        address: Address::UNDEFINED,
        index: SlabIndex::UNDEFINED,
    };

    #[must_use]
    pub const fn new(address: Address, index: SlabIndex) -> Self {
        Self { address, index }
    }

    /// Whether this is the undefined handle.
    #[must_use]
    pub const fn is_undefined(self) -> bool {
        self.address.is_undefined() && self.index.as_u64() == 0
    }

    /// Serialize into a 16-byte big-endian buffer.
    ///
    /// The buffer must be at least [`SLAB_ID_SIZE`] bytes.
    pub fn write_to(self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.address.0);
        buf[8..SLAB_ID_SIZE].copy_from_slice(&self.index.0);
    }

    /// Deserialize from a 16-byte buffer. Returns `None` when the buffer is
    /// too short.
    #[must_use]
    pub fn from_raw_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < SLAB_ID_SIZE {
            return None;
        }
        let mut address = [0u8; 8];
        let mut index = [0u8; 8];
        address.copy_from_slice(&buf[..8]);
        index.copy_from_slice(&buf[8..SLAB_ID_SIZE]);
        Some(Self {
            address: Address(address),
            index: SlabIndex(index),
        })
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.index.as_u64())
    }
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// A 64-bit digest value; one Map key produces up to four digest levels.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Digest(pub u64);

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TypeInfo
// ---------------------------------------------------------------------------

/// The user type tag a root slab carries in its extra data.
///
/// The engine treats it as opaque; embedders map it to their own type model
/// through the type-info decode hook on the slab storage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TypeInfo(pub u64);

// ---------------------------------------------------------------------------
// SlabLimits
// ---------------------------------------------------------------------------

/// Per-tree slab size thresholds, captured when the tree is created.
///
/// `threshold` is the split target; a data slab is kept between
/// `min_threshold` and `max_threshold` encoded bytes, except for roots and
/// single-oversize-element slabs. There is no process-wide setting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct SlabLimits {
    threshold: u32,
}

impl SlabLimits {
    /// Construct limits with the given split-target threshold.
    ///
    /// Values below 128 bytes are clamped; a slab must at least hold its own
    /// framing plus a couple of elements.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        let threshold = if threshold < 128 { 128 } else { threshold };
        Self { threshold }
    }

    /// The split target in encoded bytes.
    #[must_use]
    pub const fn threshold(self) -> u32 {
        self.threshold
    }

    /// Below this encoded size a non-root slab is underflow.
    #[must_use]
    pub const fn min_threshold(self) -> u32 {
        self.threshold / 2
    }

    /// Above this encoded size a slab is overflow and must split.
    #[must_use]
    pub const fn max_threshold(self) -> u32 {
        self.threshold * 2
    }

    /// Largest element kept inline. Anything above this bound could never
    /// leave a legal split and is stored in its own slab instead.
    #[must_use]
    pub const fn max_inline_element_size(self) -> u32 {
        self.threshold
    }
}

impl Default for SlabLimits {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_id_roundtrip() {
        let id = SlabId::new(Address::from(0x0102_0304_0506_0708), SlabIndex::from(42));
        let mut buf = [0u8; SLAB_ID_SIZE];
        id.write_to(&mut buf);
        assert_eq!(SlabId::from_raw_bytes(&buf), Some(id));
    }

    #[test]
    fn slab_id_from_short_buffer() {
        assert_eq!(SlabId::from_raw_bytes(&[0u8; 15]), None);
    }

    #[test]
    fn undefined_id_is_all_zero() {
        let mut buf = [0xFFu8; SLAB_ID_SIZE];
        SlabId::UNDEFINED.write_to(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(SlabId::UNDEFINED.is_undefined());
        assert!(!SlabId::new(Address::from(1), SlabIndex::from(1)).is_undefined());
    }

    #[test]
    fn index_allocation_starts_at_one() {
        let first = SlabIndex::UNDEFINED.next();
        assert_eq!(first.as_u64(), 1);
        assert_eq!(first.next().as_u64(), 2);
    }

    #[test]
    fn display_formats() {
        let id = SlabId::new(Address::from(0xAB), SlabIndex::from(7));
        assert_eq!(id.to_string(), "0xab.7");
    }

    #[test]
    fn limits_derived_bounds() {
        let limits = SlabLimits::new(1024);
        assert_eq!(limits.min_threshold(), 512);
        assert_eq!(limits.max_threshold(), 2048);
        assert_eq!(limits.max_inline_element_size(), 1024);
    }

    #[test]
    fn limits_clamp_tiny_threshold() {
        assert_eq!(SlabLimits::new(16).threshold(), 128);
    }
}
