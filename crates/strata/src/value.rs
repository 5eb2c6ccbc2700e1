//! The storable value model and the caller-supplied callback signatures.
//!
//! The engine stores a closed set of payload shapes. A [`Value::Ref`] is the
//! 16-byte handle tag: the payload lives in its own [`crate::slab::StorableSlab`]
//! and reads dereference it transparently through the slab store.

use crate::codec::{Decoder, Encoder, TAG_HANDLE};
use crate::slab::Slab;
use crate::storage::SlabStore;
use strata_error::{Result, StrataError};
use strata_types::{SLAB_ID_SIZE, SlabId, TypeInfo};

const VAL_U64: u8 = 0x01;
const VAL_STR: u8 = 0x02;
const VAL_BYTES: u8 = 0x03;
const VAL_BOOL: u8 = 0x04;

/// A storable user payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    U64(u64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    /// A 16-byte handle to a [`crate::slab::StorableSlab`] holding the
    /// actual payload.
    Ref(SlabId),
}

impl Value {
    /// Encoded size in bytes, including the kind tag. O(1).
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        match self {
            Self::U64(_) => 1 + 8,
            Self::Str(s) => 1 + 4 + s.len() as u32,
            Self::Bytes(b) => 1 + 4 + b.len() as u32,
            Self::Bool(_) => 1 + 1,
            Self::Ref(_) => 1 + SLAB_ID_SIZE as u32,
        }
    }

    /// Whether this value is a handle to an external storable slab.
    #[must_use]
    pub const fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::U64(v) => {
                enc.write_u8(VAL_U64);
                enc.write_u64(*v);
            }
            Self::Str(s) => {
                if s.len() > u32::MAX as usize {
                    return Err(StrataError::NonStorable {
                        detail: "string longer than u32::MAX bytes".to_owned(),
                    });
                }
                enc.write_u8(VAL_STR);
                enc.write_u32(s.len() as u32);
                enc.write_raw(s.as_bytes());
            }
            Self::Bytes(b) => {
                if b.len() > u32::MAX as usize {
                    return Err(StrataError::NonStorable {
                        detail: "byte string longer than u32::MAX bytes".to_owned(),
                    });
                }
                enc.write_u8(VAL_BYTES);
                enc.write_u32(b.len() as u32);
                enc.write_raw(b);
            }
            Self::Bool(v) => {
                enc.write_u8(VAL_BOOL);
                enc.write_u8(u8::from(*v));
            }
            Self::Ref(id) => {
                enc.write_u8(TAG_HANDLE);
                enc.write_slab_id(*id);
            }
        }
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let tag = dec.read_u8()?;
        match tag {
            VAL_U64 => Ok(Self::U64(dec.read_u64()?)),
            VAL_STR => {
                let len = dec.read_u32()? as usize;
                let raw = dec.read_raw(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|e| StrataError::decoding(format!("invalid utf-8 string: {e}")))?;
                Ok(Self::Str(s.to_owned()))
            }
            VAL_BYTES => {
                let len = dec.read_u32()? as usize;
                Ok(Self::Bytes(dec.read_raw(len)?.to_vec()))
            }
            VAL_BOOL => match dec.read_u8()? {
                0 => Ok(Self::Bool(false)),
                1 => Ok(Self::Bool(true)),
                other => Err(StrataError::decoding(format!(
                    "invalid bool payload {other:#04x}"
                ))),
            },
            TAG_HANDLE => Ok(Self::Ref(dec.read_slab_id()?)),
            other => Err(StrataError::decoding(format!(
                "unknown value tag {other:#04x}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Decode hooks and caller callbacks
// ---------------------------------------------------------------------------

/// Decodes one user payload from an element stream.
pub type DecodeStorableFn = fn(&mut Decoder<'_>) -> Result<Value>;

/// Decodes the per-tree user type tag from a root extra-data block.
pub type DecodeTypeInfoFn = fn(&mut Decoder<'_>) -> Result<TypeInfo>;

/// Produces the canonical, equality-respecting byte form of a key into the
/// provided scratch buffer.
pub type HashInputFn = fn(&Value, &mut Vec<u8>) -> Result<()>;

/// Structural equality between a stored element and a live key. Receives the
/// slab store so stored handles can be dereferenced.
pub type KeyCompareFn = fn(&mut dyn SlabStore, &Value, &Value) -> Result<bool>;

/// Default storable decoder: the built-in [`Value`] encoding.
pub fn decode_storable(dec: &mut Decoder<'_>) -> Result<Value> {
    Value::decode(dec)
}

/// Default type-info decoder: a bare u64 tag.
pub fn decode_type_info(dec: &mut Decoder<'_>) -> Result<TypeInfo> {
    Ok(TypeInfo(dec.read_u64()?))
}

/// Default hash input: the value's own canonical encoding.
///
/// Handles are rejected; a key must be hashed over its payload, never over
/// the slab id it happens to live in.
pub fn default_hash_input(value: &Value, scratch: &mut Vec<u8>) -> Result<()> {
    if value.is_ref() {
        return Err(StrataError::NonStorable {
            detail: "cannot derive hash input from a slab reference".to_owned(),
        });
    }
    let mut enc = Encoder::with_capacity(value.byte_size() as usize);
    value.encode(&mut enc)?;
    scratch.clear();
    scratch.extend_from_slice(&enc.into_bytes());
    Ok(())
}

/// Default key comparison: dereference the stored side if it is a handle,
/// then compare structurally.
pub fn default_compare(
    storage: &mut dyn SlabStore,
    key: &Value,
    stored: &Value,
) -> Result<bool> {
    if let Value::Ref(id) = stored {
        let resolved = resolve_value(storage, Value::Ref(*id))?;
        return Ok(*key == resolved);
    }
    Ok(key == stored)
}

/// Dereference a [`Value::Ref`] through the slab store; other values pass
/// through unchanged.
pub fn resolve_value(storage: &mut dyn SlabStore, value: Value) -> Result<Value> {
    let Value::Ref(id) = value else {
        return Ok(value);
    };
    match storage.retrieve(id)? {
        Some(Slab::Storable(storable)) => Ok(storable.value.clone()),
        Some(_) => Err(StrataError::WrongSlabType {
            id,
            expected: "storable",
        }),
        None => Err(StrataError::SlabNotFound { id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Address, SlabIndex};

    fn roundtrip(value: &Value) -> Value {
        let mut enc = Encoder::new();
        value.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        assert_eq!(bytes.len(), value.byte_size() as usize);
        let mut dec = Decoder::new(&bytes);
        let decoded = Value::decode(&mut dec).unwrap();
        dec.finish().unwrap();
        decoded
    }

    #[test]
    fn value_roundtrips() {
        for value in [
            Value::U64(0),
            Value::U64(u64::MAX),
            Value::Str(String::new()),
            Value::Str("hello world".to_owned()),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Bool(true),
            Value::Bool(false),
            Value::Ref(SlabId::new(Address::from(3), SlabIndex::from(8))),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn invalid_bool_payload_rejected() {
        let mut dec = Decoder::new(&[VAL_BOOL, 0x02]);
        assert!(Value::decode(&mut dec).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut dec = Decoder::new(&[0x6E]);
        assert!(Value::decode(&mut dec).is_err());
    }

    #[test]
    fn hash_input_is_deterministic_and_tag_separated() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        default_hash_input(&Value::Str("1".to_owned()), &mut a).unwrap();
        default_hash_input(&Value::U64(1), &mut b).unwrap();
        assert_ne!(a, b);

        let mut again = Vec::new();
        default_hash_input(&Value::Str("1".to_owned()), &mut again).unwrap();
        assert_eq!(a, again);
    }

    #[test]
    fn hash_input_rejects_handles() {
        let mut scratch = Vec::new();
        let result = default_hash_input(&Value::Ref(SlabId::UNDEFINED), &mut scratch);
        assert!(matches!(result, Err(StrataError::NonStorable { .. })));
    }
}
