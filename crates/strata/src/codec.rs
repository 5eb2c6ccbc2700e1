//! Binary slab framing: byte-level primitives, the flag byte, and the tag
//! table shared by every slab encoder/decoder.
//!
//! Every serialized slab begins with:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ version (1 byte, 0x00)                       │
//! ├──────────────────────────────────────────────┤
//! │ flag (1 byte): root | ext-refs | rsvd | kind │
//! ├──────────────────────────────────────────────┤
//! │ root extra data (root slabs only)            │
//! ├──────────────────────────────────────────────┤
//! │ body (kind-specific)                         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte integers are big-endian. The encoder and decoder must
//! agree on the kind table exactly; unknown kinds are a decoding error.

use strata_error::{Result, StrataError};
use strata_types::{SLAB_ID_SIZE, SlabId};

/// Format version written as the first byte of every slab.
pub const SLAB_VERSION: u8 = 0;

/// Flag bit: this slab is a root and carries an extra-data block.
pub const FLAG_ROOT: u8 = 0x80;
/// Flag bit: the slab body references other slabs by handle.
pub const FLAG_HAS_EXTERNAL_REFS: u8 = 0x40;
/// Flag bit: reserved size marker; written as zero in version 0.
pub const FLAG_HAS_SIZE_MARKER: u8 = 0x20;
/// Low nibble of the flag byte: the slab kind.
pub const FLAG_KIND_MASK: u8 = 0x0F;

/// A 16-byte handle reference inside an element stream.
pub const TAG_HANDLE: u8 = 0xF7;
/// A collision group embedded in its parent's body.
pub const TAG_INLINE_COLLISION_GROUP: u8 = 0xF8;
/// A collision group stored as a separate slab; payload is a handle.
pub const TAG_EXTERNAL_COLLISION_GROUP: u8 = 0xF9;

// ---------------------------------------------------------------------------
// Slab kind
// ---------------------------------------------------------------------------

/// The closed set of slab kinds, as encoded in the flag byte's low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlabKind {
    ArrayData = 0x0,
    ArrayMeta = 0x1,
    Storable = 0x3,
    MapData = 0x8,
    MapMeta = 0x9,
    CollisionGroup = 0xB,
}

impl SlabKind {
    /// Parse a kind from the flag byte's low nibble.
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::ArrayData),
            0x1 => Some(Self::ArrayMeta),
            0x3 => Some(Self::Storable),
            0x8 => Some(Self::MapData),
            0x9 => Some(Self::MapMeta),
            0xB => Some(Self::CollisionGroup),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_nibble(self) -> u8 {
        self as u8
    }
}

/// Decoded slab flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabFlag {
    pub root: bool,
    pub has_external_refs: bool,
    pub kind: SlabKind,
}

impl SlabFlag {
    #[must_use]
    pub const fn new(kind: SlabKind) -> Self {
        Self {
            root: false,
            has_external_refs: false,
            kind,
        }
    }

    #[must_use]
    pub const fn with_root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    #[must_use]
    pub const fn with_external_refs(mut self, external: bool) -> Self {
        self.has_external_refs = external;
        self
    }

    #[must_use]
    pub const fn encode(self) -> u8 {
        let mut flag = self.kind.as_nibble();
        if self.root {
            flag |= FLAG_ROOT;
        }
        if self.has_external_refs {
            flag |= FLAG_HAS_EXTERNAL_REFS;
        }
        flag
    }

    pub fn decode(byte: u8) -> Result<Self> {
        if byte & 0x10 != 0 {
            return Err(StrataError::decoding(format!(
                "flag byte {byte:#04x} has reserved kind bit set"
            )));
        }
        let Some(kind) = SlabKind::from_nibble(byte & FLAG_KIND_MASK) else {
            return Err(StrataError::decoding(format!(
                "unknown slab kind {:#03x}",
                byte & FLAG_KIND_MASK
            )));
        };
        Ok(Self {
            root: byte & FLAG_ROOT != 0,
            has_external_refs: byte & FLAG_HAS_EXTERNAL_REFS != 0,
            kind,
        })
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Append-only big-endian byte sink for slab and element encoders.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_slab_id(&mut self, id: SlabId) {
        let mut raw = [0u8; SLAB_ID_SIZE];
        id.write_to(&mut raw);
        self.buf.extend_from_slice(&raw);
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Forward-only big-endian reader over a serialized slab.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(StrataError::decoding(format!(
                "unexpected end of input: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| StrataError::decoding("unexpected end of input while peeking"))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_slab_id(&mut self) -> Result<SlabId> {
        let raw = self.take(SLAB_ID_SIZE)?;
        SlabId::from_raw_bytes(raw)
            .ok_or_else(|| StrataError::decoding("truncated slab id"))
    }

    /// Consume a required tag byte, failing with a descriptive error.
    pub fn expect_tag(&mut self, tag: u8, what: &str) -> Result<()> {
        let got = self.read_u8()?;
        if got != tag {
            return Err(StrataError::decoding(format!(
                "expected {what} tag {tag:#04x}, found {got:#04x}"
            )));
        }
        Ok(())
    }

    /// Fail unless the input is fully consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(StrataError::decoding(format!(
                "{} trailing bytes after slab body",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Address, SlabIndex};

    #[test]
    fn primitive_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_u8(0xAB);
        enc.write_u16(0xCDEF);
        enc.write_u32(0x0102_0304);
        enc.write_u64(0x1122_3344_5566_7788);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0xAB);
        assert_eq!(dec.read_u16().unwrap(), 0xCDEF);
        assert_eq!(dec.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(dec.read_u64().unwrap(), 0x1122_3344_5566_7788);
        dec.finish().unwrap();
    }

    #[test]
    fn slab_id_roundtrip() {
        let id = SlabId::new(Address::from(7), SlabIndex::from(9));
        let mut enc = Encoder::new();
        enc.write_slab_id(id);
        let bytes = enc.into_bytes();
        assert_eq!(bytes.len(), SLAB_ID_SIZE);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_slab_id().unwrap(), id);
    }

    #[test]
    fn short_input_is_a_decoding_error() {
        let mut dec = Decoder::new(&[0x01]);
        assert!(matches!(
            dec.read_u32(),
            Err(StrataError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let dec = Decoder::new(&[0x01, 0x02]);
        assert!(dec.finish().is_err());
    }

    #[test]
    fn flag_roundtrip_all_kinds() {
        for kind in [
            SlabKind::ArrayData,
            SlabKind::ArrayMeta,
            SlabKind::Storable,
            SlabKind::MapData,
            SlabKind::MapMeta,
            SlabKind::CollisionGroup,
        ] {
            let flag = SlabFlag::new(kind).with_root(true).with_external_refs(true);
            let decoded = SlabFlag::decode(flag.encode()).unwrap();
            assert_eq!(decoded, flag);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(SlabFlag::decode(0x02).is_err());
        assert!(SlabFlag::decode(0x0F).is_err());
    }

    #[test]
    fn reserved_kind_bit_is_rejected() {
        assert!(SlabFlag::decode(0x10).is_err());
    }

    #[test]
    fn expect_tag_mismatch() {
        let mut dec = Decoder::new(&[TAG_HANDLE]);
        assert!(dec.expect_tag(TAG_INLINE_COLLISION_GROUP, "collision group").is_err());
    }
}
