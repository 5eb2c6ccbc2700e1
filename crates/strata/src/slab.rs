//! The closed slab variant set and its serialization dispatch.
//!
//! Slab kind dispatch is a plain enum match; the engines know the exact set
//! of node shapes and nothing outside this crate adds new ones. Only root
//! slabs carry an extra-data block (type tag, total count, and the digest
//! seed for maps).

use crate::array::{ArrayDataSlab, ArrayMetaSlab};
use crate::codec::{Decoder, Encoder, SLAB_VERSION, SlabFlag, SlabKind};
use crate::map::{MapDataSlab, MapMetaSlab};
use crate::value::{DecodeStorableFn, DecodeTypeInfoFn, Value};
use strata_error::{Result, StrataError};
use strata_types::{SlabId, TypeInfo};

/// Serialized width of the version and flag bytes.
pub(crate) const SLAB_ENVELOPE_SIZE: u32 = 2;

/// Choose the split boundary for a slab's element sizes.
///
/// Prefers the boundary nearest the byte midpoint among those leaving both
/// halves at or above `min` (each half pays `prefix` framing bytes). When no
/// boundary is legal — one oversize element dominates — falls back to the
/// plain midpoint so the split still terminates.
pub(crate) fn split_point(sizes: &[u32], prefix: u32, min: u32) -> usize {
    debug_assert!(sizes.len() >= 2);
    let total: u32 = sizes.iter().sum();
    let midpoint = total.div_ceil(2);
    let mut best: Option<(u32, usize)> = None;
    let mut left = 0u32;
    for (i, size) in sizes.iter().enumerate().take(sizes.len() - 1) {
        left += size;
        let right = total - left;
        if prefix + left < min || prefix + right < min {
            continue;
        }
        let distance = left.abs_diff(midpoint);
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, i + 1));
        }
    }
    if let Some((_, at)) = best {
        return at;
    }
    let mut left = 0u32;
    for (i, size) in sizes.iter().enumerate().take(sizes.len() - 1) {
        left += size;
        if left >= midpoint {
            return (i + 1).max(1);
        }
    }
    sizes.len() - 1
}

// ---------------------------------------------------------------------------
// Root extra data
// ---------------------------------------------------------------------------

/// Root-only metadata of an Array tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayExtraData {
    pub type_info: TypeInfo,
    pub count: u64,
}

impl ArrayExtraData {
    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(2);
        enc.write_u64(self.type_info.0);
        enc.write_u64(self.count);
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>, decode_type_info: DecodeTypeInfoFn) -> Result<Self> {
        let fields = dec.read_u8()?;
        if fields != 2 {
            return Err(StrataError::decoding(format!(
                "array extra data has {fields} fields, expected 2"
            )));
        }
        let type_info = decode_type_info(dec)?;
        let count = dec.read_u64()?;
        Ok(Self { type_info, count })
    }
}

/// Root-only metadata of a Map tree. The seed pair feeds the digester and
/// must never change after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapExtraData {
    pub type_info: TypeInfo,
    pub count: u64,
    pub seed_k0: u64,
    pub seed_k1: u64,
}

impl MapExtraData {
    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(4);
        enc.write_u64(self.type_info.0);
        enc.write_u64(self.count);
        enc.write_u64(self.seed_k0);
        enc.write_u64(self.seed_k1);
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>, decode_type_info: DecodeTypeInfoFn) -> Result<Self> {
        let fields = dec.read_u8()?;
        if fields != 4 {
            return Err(StrataError::decoding(format!(
                "map extra data has {fields} fields, expected 4"
            )));
        }
        let type_info = decode_type_info(dec)?;
        let count = dec.read_u64()?;
        let seed_k0 = dec.read_u64()?;
        let seed_k1 = dec.read_u64()?;
        Ok(Self {
            type_info,
            count,
            seed_k0,
            seed_k1,
        })
    }
}

// ---------------------------------------------------------------------------
// Storable slab
// ---------------------------------------------------------------------------

/// A minimal slab holding one encoded value too large to stay inline.
///
/// Its handle is referenced from an array or map element through the handle
/// tag; reads dereference it transparently.
#[derive(Debug, Clone, PartialEq)]
pub struct StorableSlab {
    pub id: SlabId,
    pub value: Value,
}

impl StorableSlab {
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        SLAB_ENVELOPE_SIZE + self.value.byte_size()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(self.byte_size() as usize);
        enc.write_u8(SLAB_VERSION);
        enc.write_u8(
            SlabFlag::new(SlabKind::Storable)
                .with_external_refs(self.value.is_ref())
                .encode(),
        );
        self.value.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    fn decode_body(
        dec: &mut Decoder<'_>,
        id: SlabId,
        decode_storable: DecodeStorableFn,
    ) -> Result<Self> {
        let value = decode_storable(dec)?;
        dec.finish()?;
        Ok(Self { id, value })
    }
}

// ---------------------------------------------------------------------------
// Slab
// ---------------------------------------------------------------------------

/// An independently serialized storage node.
#[derive(Debug, Clone)]
pub enum Slab {
    ArrayData(ArrayDataSlab),
    ArrayMeta(ArrayMetaSlab),
    MapData(MapDataSlab),
    MapMeta(MapMetaSlab),
    Storable(StorableSlab),
}

impl Slab {
    /// The slab's own handle.
    #[must_use]
    pub fn id(&self) -> SlabId {
        match self {
            Self::ArrayData(s) => s.header.id,
            Self::ArrayMeta(s) => s.header.id,
            Self::MapData(s) => s.header.id,
            Self::MapMeta(s) => s.header.id,
            Self::Storable(s) => s.id,
        }
    }

    /// The cached encoded size of the slab body (extra data excluded).
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        match self {
            Self::ArrayData(s) => s.header.size,
            Self::ArrayMeta(s) => s.header.size,
            Self::MapData(s) => s.header.size,
            Self::MapMeta(s) => s.header.size,
            Self::Storable(s) => s.byte_size(),
        }
    }

    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::ArrayData(_) => "array data",
            Self::ArrayMeta(_) => "array meta",
            Self::MapData(_) => "map data",
            Self::MapMeta(_) => "map meta",
            Self::Storable(_) => "storable",
        }
    }

    /// Serialize the slab into its self-describing binary form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::ArrayData(s) => s.encode(),
            Self::ArrayMeta(s) => s.encode(),
            Self::MapData(s) => s.encode(),
            Self::MapMeta(s) => s.encode(),
            Self::Storable(s) => s.encode(),
        }
    }

    /// Deserialize a slab, dispatching on the flag byte's kind nibble.
    pub fn decode(
        id: SlabId,
        data: &[u8],
        decode_storable: DecodeStorableFn,
        decode_type_info: DecodeTypeInfoFn,
    ) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let version = dec.read_u8()?;
        if version != SLAB_VERSION {
            return Err(StrataError::decoding(format!(
                "unsupported slab version {version}"
            )));
        }
        let flag = SlabFlag::decode(dec.read_u8()?)?;
        match flag.kind {
            SlabKind::ArrayData => Ok(Self::ArrayData(ArrayDataSlab::decode_body(
                &mut dec,
                id,
                flag,
                decode_storable,
                decode_type_info,
            )?)),
            SlabKind::ArrayMeta => Ok(Self::ArrayMeta(ArrayMetaSlab::decode_body(
                &mut dec,
                id,
                flag,
                decode_type_info,
            )?)),
            SlabKind::MapData | SlabKind::CollisionGroup => {
                Ok(Self::MapData(MapDataSlab::decode_body(
                    &mut dec,
                    id,
                    flag,
                    decode_storable,
                    decode_type_info,
                )?))
            }
            SlabKind::MapMeta => Ok(Self::MapMeta(MapMetaSlab::decode_body(
                &mut dec,
                id,
                flag,
                decode_type_info,
            )?)),
            SlabKind::Storable => {
                if flag.root {
                    return Err(StrataError::decoding(
                        "storable slab cannot be a root".to_owned(),
                    ));
                }
                Ok(Self::Storable(StorableSlab::decode_body(
                    &mut dec,
                    id,
                    decode_storable,
                )?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{decode_storable, decode_type_info};
    use strata_types::{Address, SlabIndex};

    fn test_id(index: u64) -> SlabId {
        SlabId::new(Address::from(0xA1), SlabIndex::from(index))
    }

    #[test]
    fn storable_slab_roundtrip() {
        let slab = StorableSlab {
            id: test_id(5),
            value: Value::Str("a somewhat long payload".to_owned()),
        };
        let data = Slab::Storable(slab.clone()).encode().unwrap();
        let decoded = Slab::decode(test_id(5), &data, decode_storable, decode_type_info).unwrap();
        match decoded {
            Slab::Storable(s) => assert_eq!(s, slab),
            other => panic!("wrong slab kind: {}", other.kind_name()),
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        let slab = StorableSlab {
            id: test_id(1),
            value: Value::U64(1),
        };
        let mut data = Slab::Storable(slab).encode().unwrap();
        data[0] = 9;
        assert!(Slab::decode(test_id(1), &data, decode_storable, decode_type_info).is_err());
    }

    #[test]
    fn root_flagged_storable_is_rejected() {
        let slab = StorableSlab {
            id: test_id(1),
            value: Value::U64(1),
        };
        let mut data = Slab::Storable(slab).encode().unwrap();
        data[1] |= crate::codec::FLAG_ROOT;
        assert!(Slab::decode(test_id(1), &data, decode_storable, decode_type_info).is_err());
    }

    #[test]
    fn extra_data_roundtrip() {
        let extra = MapExtraData {
            type_info: TypeInfo(99),
            count: 1234,
            seed_k0: 7,
            seed_k1: 8,
        };
        let mut enc = Encoder::new();
        extra.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(MapExtraData::decode(&mut dec, decode_type_info).unwrap(), extra);

        let array_extra = ArrayExtraData {
            type_info: TypeInfo(3),
            count: 10,
        };
        let mut enc = Encoder::new();
        array_extra.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            ArrayExtraData::decode(&mut dec, decode_type_info).unwrap(),
            array_extra
        );
    }
}
