//! The Map engine: a scalable ordered mapping keyed on staged digests.
//!
//! The spine is a hash-prefix tree: meta slabs partition the level-0 digest
//! space by first-hkey, data slabs hold `(hkey, element)` pairs sorted by
//! hkey, and leaves chain in digest order. Keys that collide at one digest
//! level descend into a collision group — a nested element set at the next
//! level, inline while small and promoted to its own slab when inline
//! encoding could push the enclosing data slab past the size ceiling. When
//! the digester runs out of levels the group degenerates into an
//! insertion-ordered list, which terminates regardless of how pathological
//! the collisions are.
//!
//! Tie-break: elements sharing an hkey keep insertion order at that level,
//! so iteration yields (full digest prefix, then insertion order).

use std::collections::VecDeque;

use rand::RngCore;
use tracing::debug;

use crate::array::{externalize_value, take_resolved};
use crate::codec::{
    Decoder, Encoder, SLAB_VERSION, SlabFlag, SlabKind, TAG_EXTERNAL_COLLISION_GROUP, TAG_HANDLE,
    TAG_INLINE_COLLISION_GROUP,
};
use crate::slab::{MapExtraData, SLAB_ENVELOPE_SIZE, Slab, split_point};
use crate::storage::{SlabStore, retrieve_expect};
use crate::value::{
    DecodeStorableFn, DecodeTypeInfoFn, HashInputFn, KeyCompareFn, Value, resolve_value,
};
use strata_digest::{Digester, DigesterBuilder, Xxh3Sha256DigesterBuilder};
use strata_error::{Result, StrataError};
use strata_types::{Address, Digest, SlabId, SlabLimits, TypeInfo};

/// Encoded bytes before the element tuple of a data slab: envelope, next
/// handle, level, hkey count, element count.
pub(crate) const MAP_DATA_PREFIX_SIZE: u32 = SLAB_ENVELOPE_SIZE + 16 + 1 + 4 + 4;
/// Encoded bytes before the child headers of a meta slab.
pub(crate) const MAP_META_PREFIX_SIZE: u32 = SLAB_ENVELOPE_SIZE + 2;
/// Encoded bytes per meta child header: id, first hkey, size.
pub(crate) const MAP_META_CHILD_SIZE: u32 = 16 + 8 + 4;
/// Encoded bytes of one hkey.
pub(crate) const HKEY_SIZE: u32 = 8;
/// Tuple framing of an inline collision group: tag, level, hkey count,
/// element count.
pub(crate) const INLINE_GROUP_PREFIX_SIZE: u32 = 1 + 1 + 4 + 4;
/// Encoded bytes of an external collision group element: tag, handle tag,
/// handle.
pub(crate) const EXTERNAL_GROUP_SIZE: u32 = 1 + 1 + 16;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Cached identity, encoded size, and first hkey of one map slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSlabHeader {
    pub id: SlabId,
    pub size: u32,
    pub first_key: Digest,
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// One slot of a hashed element set.
#[derive(Debug, Clone)]
pub(crate) enum MapElement {
    /// A plain `(key, value)` entry.
    Single { key: Value, value: Value },
    /// A collision group embedded in this slab's body.
    InlineGroup(Box<MapElements>),
    /// A collision group stored as its own slab.
    ExternalGroup(SlabId),
}

impl MapElement {
    fn byte_size(&self) -> u32 {
        match self {
            Self::Single { key, value } => key.byte_size() + value.byte_size(),
            Self::InlineGroup(group) => INLINE_GROUP_PREFIX_SIZE + group.size(),
            Self::ExternalGroup(_) => EXTERNAL_GROUP_SIZE,
        }
    }
}

/// The element set of a data slab or collision group: hash-sorted while
/// digests remain, insertion-ordered once they are exhausted.
#[derive(Debug, Clone)]
pub(crate) enum MapElements {
    Hashed(HashedElements),
    List(ListElements),
}

/// Elements sorted by their level-`level` digest.
#[derive(Debug, Clone)]
pub(crate) struct HashedElements {
    pub(crate) level: u8,
    size: u32,
    pub(crate) hkeys: Vec<Digest>,
    pub(crate) elements: Vec<MapElement>,
}

/// Insertion-ordered fallback once digest levels are exhausted.
#[derive(Debug, Clone)]
pub(crate) struct ListElements {
    pub(crate) level: u8,
    size: u32,
    pub(crate) entries: Vec<(Value, Value)>,
}

/// Everything a map mutation needs besides the storage handle.
pub(crate) struct MapOpContext<'a> {
    pub(crate) builder: &'a dyn DigesterBuilder,
    pub(crate) hash_input: HashInputFn,
    pub(crate) compare: KeyCompareFn,
    pub(crate) address: Address,
    pub(crate) limits: SlabLimits,
}

impl MapOpContext<'_> {
    fn digester_for(&self, key: &Value) -> Result<Box<dyn Digester>> {
        let mut scratch = Vec::new();
        (self.hash_input)(key, &mut scratch)?;
        self.builder.digest(&scratch)
    }
}

impl MapElements {
    /// An empty element set for `level`, list-mode once digests run out.
    pub(crate) fn new_for_level(level: u8, digest_levels: u8) -> Self {
        if level >= digest_levels {
            Self::List(ListElements {
                level,
                size: 0,
                entries: Vec::new(),
            })
        } else {
            Self::Hashed(HashedElements {
                level,
                size: 0,
                hkeys: Vec::new(),
                elements: Vec::new(),
            })
        }
    }

    /// Cached content size in bytes (tuple framing excluded).
    pub(crate) fn size(&self) -> u32 {
        match self {
            Self::Hashed(h) => h.size,
            Self::List(l) => l.size,
        }
    }

    pub(crate) fn first_hkey(&self) -> Option<Digest> {
        match self {
            Self::Hashed(h) => h.hkeys.first().copied(),
            Self::List(_) => None,
        }
    }

    /// Number of top-level slots.
    pub(crate) fn slot_count(&self) -> usize {
        match self {
            Self::Hashed(h) => h.elements.len(),
            Self::List(l) => l.entries.len(),
        }
    }

    /// Number of user entries, counting through nested groups but not
    /// through external slabs.
    pub(crate) fn inline_entry_count(&self) -> u64 {
        match self {
            Self::Hashed(h) => h
                .elements
                .iter()
                .map(|e| match e {
                    MapElement::Single { .. } | MapElement::ExternalGroup(_) => 1,
                    MapElement::InlineGroup(g) => g.inline_entry_count(),
                })
                .sum(),
            Self::List(l) => l.entries.len() as u64,
        }
    }

    /// Recompute the content size from scratch; validators compare this
    /// against the cached size.
    pub(crate) fn recomputed_size(&self) -> u32 {
        match self {
            Self::Hashed(h) => {
                HKEY_SIZE * h.hkeys.len() as u32
                    + h.elements
                        .iter()
                        .map(|e| match e {
                            MapElement::InlineGroup(g) => {
                                INLINE_GROUP_PREFIX_SIZE + g.recomputed_size()
                            }
                            other => other.byte_size(),
                        })
                        .sum::<u32>()
            }
            Self::List(l) => l
                .entries
                .iter()
                .map(|(k, v)| k.byte_size() + v.byte_size())
                .sum(),
        }
    }

    fn has_external_refs(&self) -> bool {
        match self {
            Self::Hashed(h) => h.elements.iter().any(|e| match e {
                MapElement::Single { key, value } => key.is_ref() || value.is_ref(),
                MapElement::InlineGroup(g) => g.has_external_refs(),
                MapElement::ExternalGroup(_) => true,
            }),
            Self::List(l) => l
                .entries
                .iter()
                .any(|(k, v)| k.is_ref() || v.is_ref()),
        }
    }

    /// The single plain entry left in a shrinking collision group, if that
    /// is all that remains.
    fn sole_single(&self) -> Option<(Value, Value)> {
        match self {
            Self::Hashed(h) => match h.elements.as_slice() {
                [MapElement::Single { key, value }] => Some((key.clone(), value.clone())),
                _ => None,
            },
            Self::List(l) => match l.entries.as_slice() {
                [(key, value)] => Some((key.clone(), value.clone())),
                _ => None,
            },
        }
    }

    // -- Lookup -------------------------------------------------------------

    pub(crate) fn get(
        &self,
        storage: &mut dyn SlabStore,
        compare: KeyCompareFn,
        digester: &mut dyn Digester,
        level: u8,
        key: &Value,
    ) -> Result<Value> {
        match self {
            Self::Hashed(h) => {
                if h.level != level {
                    return Err(StrataError::DigestLevelMismatch {
                        got: h.level,
                        expected: level,
                    });
                }
                let hkey = digester.digest(level)?;
                let Ok(index) = h.hkeys.binary_search(&hkey) else {
                    return Err(StrataError::KeyNotFound);
                };
                match &h.elements[index] {
                    MapElement::Single { key: stored, value } => {
                        if compare(storage, key, stored)? {
                            Ok(value.clone())
                        } else {
                            Err(StrataError::KeyNotFound)
                        }
                    }
                    MapElement::InlineGroup(group) => {
                        group.get(storage, compare, digester, level + 1, key)
                    }
                    MapElement::ExternalGroup(id) => {
                        let group = load_collision_slab(storage, *id)?;
                        group
                            .elements
                            .get(storage, compare, digester, level + 1, key)
                    }
                }
            }
            Self::List(l) => {
                for (stored, value) in &l.entries {
                    if compare(storage, key, stored)? {
                        return Ok(value.clone());
                    }
                }
                Err(StrataError::KeyNotFound)
            }
        }
    }

    // -- Insertion ----------------------------------------------------------

    pub(crate) fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        level: u8,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        match self {
            Self::Hashed(h) => {
                if h.level != level {
                    return Err(StrataError::DigestLevelMismatch {
                        got: h.level,
                        expected: level,
                    });
                }
                let hkey = digester.digest(level)?;
                match h.hkeys.binary_search(&hkey) {
                    Err(pos) => {
                        let element = MapElement::Single { key, value };
                        h.size += HKEY_SIZE + element.byte_size();
                        h.hkeys.insert(pos, hkey);
                        h.elements.insert(pos, element);
                        Ok(None)
                    }
                    Ok(index) => {
                        let before = h.elements[index].byte_size();
                        let old =
                            h.set_in_slot(storage, ctx, digester, level, index, key, value)?;
                        let after = h.elements[index].byte_size();
                        h.size = h.size - before + after;
                        Ok(old)
                    }
                }
            }
            Self::List(l) => {
                for (stored, existing) in &mut l.entries {
                    if (ctx.compare)(storage, &key, stored)? {
                        let delta = value.byte_size();
                        let old = std::mem::replace(existing, value);
                        l.size = l.size + delta - old.byte_size();
                        return Ok(Some(old));
                    }
                }
                l.size += key.byte_size() + value.byte_size();
                l.entries.push((key, value));
                Ok(None)
            }
        }
    }

    // -- Removal ------------------------------------------------------------

    /// Remove `key`, returning the stored `(key, value)` pair.
    pub(crate) fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        level: u8,
        key: &Value,
    ) -> Result<(Value, Value)> {
        match self {
            Self::Hashed(h) => {
                if h.level != level {
                    return Err(StrataError::DigestLevelMismatch {
                        got: h.level,
                        expected: level,
                    });
                }
                let hkey = digester.digest(level)?;
                let Ok(index) = h.hkeys.binary_search(&hkey) else {
                    return Err(StrataError::KeyNotFound);
                };
                let before = h.elements[index].byte_size();
                match &mut h.elements[index] {
                    MapElement::Single { key: stored, .. } => {
                        if !(ctx.compare)(storage, key, stored)? {
                            return Err(StrataError::KeyNotFound);
                        }
                        h.hkeys.remove(index);
                        let MapElement::Single { key, value } = h.elements.remove(index) else {
                            unreachable!()
                        };
                        h.size -= HKEY_SIZE + before;
                        Ok((key, value))
                    }
                    MapElement::InlineGroup(group) => {
                        let removed = group.remove(storage, ctx, digester, level + 1, key)?;
                        if let Some((k, v)) = group.sole_single() {
                            h.elements[index] = MapElement::Single { key: k, value: v };
                        }
                        let after = h.elements[index].byte_size();
                        h.size = h.size - before + after;
                        Ok(removed)
                    }
                    MapElement::ExternalGroup(id) => {
                        let group_id = *id;
                        let mut group = load_collision_slab(storage, group_id)?;
                        let removed =
                            group
                                .elements
                                .remove(storage, ctx, digester, level + 1, key)?;
                        if let Some((k, v)) = group.elements.sole_single() {
                            // Back to a plain entry; the external slab goes.
                            storage.remove(group_id)?;
                            let replacement = MapElement::Single { key: k, value: v };
                            let after = replacement.byte_size();
                            h.elements[index] = replacement;
                            h.size = h.size - before + after;
                        } else if group.elements.slot_count() == 0 {
                            storage.remove(group_id)?;
                            h.hkeys.remove(index);
                            h.elements.remove(index);
                            h.size -= HKEY_SIZE + before;
                        } else {
                            group.refresh_header();
                            storage.store(group_id, Slab::MapData(group))?;
                        }
                        Ok(removed)
                    }
                }
            }
            Self::List(l) => {
                for index in 0..l.entries.len() {
                    if (ctx.compare)(storage, key, &l.entries[index].0)? {
                        let (k, v) = l.entries.remove(index);
                        l.size -= k.byte_size() + v.byte_size();
                        return Ok((k, v));
                    }
                }
                Err(StrataError::KeyNotFound)
            }
        }
    }

    // -- Serialization ------------------------------------------------------

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Hashed(h) => {
                enc.write_u8(h.level);
                enc.write_u32(h.hkeys.len() as u32);
                for hkey in &h.hkeys {
                    enc.write_u64(hkey.0);
                }
                enc.write_u32(h.elements.len() as u32);
                for element in &h.elements {
                    match element {
                        MapElement::Single { key, value } => {
                            key.encode(enc)?;
                            value.encode(enc)?;
                        }
                        MapElement::InlineGroup(group) => {
                            enc.write_u8(TAG_INLINE_COLLISION_GROUP);
                            group.encode(enc)?;
                        }
                        MapElement::ExternalGroup(id) => {
                            enc.write_u8(TAG_EXTERNAL_COLLISION_GROUP);
                            enc.write_u8(TAG_HANDLE);
                            enc.write_slab_id(*id);
                        }
                    }
                }
                Ok(())
            }
            Self::List(l) => {
                enc.write_u8(l.level);
                enc.write_u32(0);
                enc.write_u32(l.entries.len() as u32);
                for (key, value) in &l.entries {
                    key.encode(enc)?;
                    value.encode(enc)?;
                }
                Ok(())
            }
        }
    }

    fn decode(
        dec: &mut Decoder<'_>,
        expected_level: Option<u8>,
        decode_storable: DecodeStorableFn,
    ) -> Result<Self> {
        let level = dec.read_u8()?;
        if let Some(expected) = expected_level {
            if level != expected {
                return Err(StrataError::decoding(format!(
                    "collision group at level {level}, expected {expected}"
                )));
            }
        }
        let hkey_count = dec.read_u32()? as usize;
        let mut hkeys = Vec::with_capacity(hkey_count);
        let mut previous: Option<Digest> = None;
        for _ in 0..hkey_count {
            let hkey = Digest(dec.read_u64()?);
            if previous.is_some_and(|p| p >= hkey) {
                return Err(StrataError::decoding(
                    "hkeys are not strictly ascending".to_owned(),
                ));
            }
            previous = Some(hkey);
            hkeys.push(hkey);
        }
        let element_count = dec.read_u32()? as usize;

        if hkey_count == 0 && element_count > 0 {
            // List mode.
            let mut entries = Vec::with_capacity(element_count);
            let mut size = 0u32;
            for _ in 0..element_count {
                let key = decode_storable(dec)?;
                let value = decode_storable(dec)?;
                size += key.byte_size() + value.byte_size();
                entries.push((key, value));
            }
            return Ok(Self::List(ListElements {
                level,
                size,
                entries,
            }));
        }

        if hkey_count != element_count {
            return Err(StrataError::decoding(format!(
                "{hkey_count} hkeys but {element_count} elements"
            )));
        }
        let mut elements = Vec::with_capacity(element_count);
        let mut size = HKEY_SIZE * hkey_count as u32;
        for _ in 0..element_count {
            let element = match dec.peek_u8()? {
                TAG_INLINE_COLLISION_GROUP => {
                    dec.read_u8()?;
                    let group = Self::decode(dec, Some(level + 1), decode_storable)?;
                    MapElement::InlineGroup(Box::new(group))
                }
                TAG_EXTERNAL_COLLISION_GROUP => {
                    dec.read_u8()?;
                    dec.expect_tag(TAG_HANDLE, "external collision group handle")?;
                    MapElement::ExternalGroup(dec.read_slab_id()?)
                }
                _ => {
                    let key = decode_storable(dec)?;
                    let value = decode_storable(dec)?;
                    MapElement::Single { key, value }
                }
            };
            size += element.byte_size();
            elements.push(element);
        }
        Ok(Self::Hashed(HashedElements {
            level,
            size,
            hkeys,
            elements,
        }))
    }
}

impl HashedElements {
    /// Replace or extend the occupied slot `index` whose hkey matched.
    #[allow(clippy::too_many_arguments)]
    fn set_in_slot(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        level: u8,
        index: usize,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        match &mut self.elements[index] {
            MapElement::Single {
                key: stored,
                value: existing,
            } => {
                if (ctx.compare)(storage, &key, stored)? {
                    return Ok(Some(std::mem::replace(existing, value)));
                }
                // Same hkey, different key: open a collision group one
                // level down holding both entries.
                let MapElement::Single {
                    key: old_key,
                    value: old_value,
                } = std::mem::replace(
                    &mut self.elements[index],
                    MapElement::ExternalGroup(SlabId::UNDEFINED),
                )
                else {
                    unreachable!()
                };
                let mut group =
                    MapElements::new_for_level(level + 1, digester.levels());
                let mut old_digester = ctx.digester_for(&old_key)?;
                group.set(
                    storage,
                    ctx,
                    old_digester.as_mut(),
                    level + 1,
                    old_key,
                    old_value,
                )?;
                old_digester.recycle();
                group.set(storage, ctx, digester, level + 1, key, value)?;
                debug!(level = level + 1, "opened collision group");
                self.elements[index] = MapElement::InlineGroup(Box::new(group));
                self.maybe_promote_group(storage, ctx, index)?;
                Ok(None)
            }
            MapElement::InlineGroup(group) => {
                let old = group.set(storage, ctx, digester, level + 1, key, value)?;
                self.maybe_promote_group(storage, ctx, index)?;
                Ok(old)
            }
            MapElement::ExternalGroup(id) => {
                let group_id = *id;
                let mut group = load_collision_slab(storage, group_id)?;
                let old = group
                    .elements
                    .set(storage, ctx, digester, level + 1, key, value)?;
                group.refresh_header();
                storage.store(group_id, Slab::MapData(group))?;
                Ok(old)
            }
        }
    }

    /// Promotion predicate: an inline group too large to leave a legal
    /// split of the enclosing spine slab moves into its own slab. Groups
    /// nested inside a collision slab stay inline; they push no spine slab
    /// past its ceiling.
    fn maybe_promote_group(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        index: usize,
    ) -> Result<()> {
        if self.level != 0 {
            return Ok(());
        }
        let MapElement::InlineGroup(group) = &self.elements[index] else {
            return Ok(());
        };
        if INLINE_GROUP_PREFIX_SIZE + group.size() <= ctx.limits.max_inline_element_size() {
            return Ok(());
        }
        let MapElement::InlineGroup(group) = std::mem::replace(
            &mut self.elements[index],
            MapElement::ExternalGroup(SlabId::UNDEFINED),
        ) else {
            unreachable!()
        };
        let id = storage.allocate(ctx.address)?;
        debug!(slab = %id, size = group.size(), "promoted collision group to external slab");
        let mut slab = MapDataSlab {
            header: MapSlabHeader {
                id,
                size: 0,
                first_key: Digest(0),
            },
            next: SlabId::UNDEFINED,
            elements: *group,
            collision_group: true,
            extra: None,
        };
        slab.refresh_header();
        storage.store(id, Slab::MapData(slab))?;
        self.elements[index] = MapElement::ExternalGroup(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data slab
// ---------------------------------------------------------------------------

/// A leaf of the map spine, or an external collision group.
#[derive(Debug, Clone)]
pub struct MapDataSlab {
    pub(crate) header: MapSlabHeader,
    pub(crate) next: SlabId,
    pub(crate) elements: MapElements,
    pub(crate) collision_group: bool,
    pub(crate) extra: Option<MapExtraData>,
}

impl MapDataSlab {
    pub(crate) fn new_root(id: SlabId, extra: MapExtraData) -> Self {
        let mut slab = Self {
            header: MapSlabHeader {
                id,
                size: 0,
                first_key: Digest(0),
            },
            next: SlabId::UNDEFINED,
            elements: MapElements::new_for_level(0, strata_digest::DIGEST_LEVELS),
            collision_group: false,
            extra: Some(extra),
        };
        slab.refresh_header();
        slab
    }

    pub(crate) fn refresh_header(&mut self) {
        self.header.size = MAP_DATA_PREFIX_SIZE + self.elements.size();
        self.header.first_key = self.elements.first_hkey().unwrap_or(Digest(0));
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let kind = if self.collision_group {
            SlabKind::CollisionGroup
        } else {
            SlabKind::MapData
        };
        let mut enc = Encoder::with_capacity(self.header.size as usize + 48);
        enc.write_u8(SLAB_VERSION);
        enc.write_u8(
            SlabFlag::new(kind)
                .with_root(self.extra.is_some())
                .with_external_refs(self.elements.has_external_refs())
                .encode(),
        );
        if let Some(extra) = &self.extra {
            extra.encode(&mut enc);
        }
        enc.write_slab_id(self.next);
        self.elements.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }

    pub(crate) fn decode_body(
        dec: &mut Decoder<'_>,
        id: SlabId,
        flag: SlabFlag,
        decode_storable: DecodeStorableFn,
        decode_type_info: DecodeTypeInfoFn,
    ) -> Result<Self> {
        let extra = if flag.root {
            Some(MapExtraData::decode(dec, decode_type_info)?)
        } else {
            None
        };
        let next = dec.read_slab_id()?;
        let elements = MapElements::decode(dec, None, decode_storable)?;
        dec.finish()?;
        let mut slab = Self {
            header: MapSlabHeader {
                id,
                size: 0,
                first_key: Digest(0),
            },
            next,
            elements,
            collision_group: flag.kind == SlabKind::CollisionGroup,
            extra,
        };
        slab.refresh_header();
        Ok(slab)
    }
}

/// Load an external collision group slab (cloned for mutation).
fn load_collision_slab(storage: &mut dyn SlabStore, id: SlabId) -> Result<MapDataSlab> {
    match retrieve_expect(storage, id)? {
        Slab::MapData(slab) if slab.collision_group => Ok(slab.clone()),
        _ => Err(StrataError::WrongSlabType {
            id,
            expected: "collision group",
        }),
    }
}

// ---------------------------------------------------------------------------
// Meta slab
// ---------------------------------------------------------------------------

/// An interior node of the map spine, partitioning the hkey space.
#[derive(Debug, Clone)]
pub struct MapMetaSlab {
    pub(crate) header: MapSlabHeader,
    pub(crate) children: Vec<MapSlabHeader>,
    pub(crate) extra: Option<MapExtraData>,
}

impl MapMetaSlab {
    pub(crate) fn new(id: SlabId, children: Vec<MapSlabHeader>) -> Self {
        let mut slab = Self {
            header: MapSlabHeader {
                id,
                size: 0,
                first_key: Digest(0),
            },
            children,
            extra: None,
        };
        slab.refresh();
        slab
    }

    pub(crate) fn refresh(&mut self) {
        self.header.size =
            MAP_META_PREFIX_SIZE + MAP_META_CHILD_SIZE * self.children.len() as u32;
        self.header.first_key = self
            .children
            .first()
            .map_or(Digest(0), |c| c.first_key);
    }

    /// Child whose hkey range contains `hkey`.
    fn child_for(&self, hkey: Digest) -> usize {
        let pos = self.children.partition_point(|c| c.first_key <= hkey);
        pos.saturating_sub(1)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(self.header.size as usize + 48);
        enc.write_u8(SLAB_VERSION);
        enc.write_u8(
            SlabFlag::new(SlabKind::MapMeta)
                .with_root(self.extra.is_some())
                .encode(),
        );
        if let Some(extra) = &self.extra {
            extra.encode(&mut enc);
        }
        enc.write_u16(self.children.len() as u16);
        for child in &self.children {
            enc.write_slab_id(child.id);
            enc.write_u64(child.first_key.0);
            enc.write_u32(child.size);
        }
        Ok(enc.into_bytes())
    }

    pub(crate) fn decode_body(
        dec: &mut Decoder<'_>,
        id: SlabId,
        flag: SlabFlag,
        decode_type_info: DecodeTypeInfoFn,
    ) -> Result<Self> {
        let extra = if flag.root {
            Some(MapExtraData::decode(dec, decode_type_info)?)
        } else {
            None
        };
        let count = dec.read_u16()? as usize;
        let mut children = Vec::with_capacity(count);
        let mut previous: Option<Digest> = None;
        for _ in 0..count {
            let child_id = dec.read_slab_id()?;
            let first_key = Digest(dec.read_u64()?);
            let size = dec.read_u32()?;
            if previous.is_some_and(|p| p > first_key) {
                return Err(StrataError::decoding(
                    "meta children are not ordered by first hkey".to_owned(),
                ));
            }
            previous = Some(first_key);
            children.push(MapSlabHeader {
                id: child_id,
                size,
                first_key,
            });
        }
        dec.finish()?;
        let mut slab = Self::new(id, children);
        slab.extra = extra;
        Ok(slab)
    }
}

// ---------------------------------------------------------------------------
// Spine operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum MapSlab {
    Data(MapDataSlab),
    Meta(MapMetaSlab),
}

pub(crate) fn load_map_slab(storage: &mut dyn SlabStore, id: SlabId) -> Result<MapSlab> {
    match retrieve_expect(storage, id)? {
        Slab::MapData(slab) if !slab.collision_group => Ok(MapSlab::Data(slab.clone())),
        Slab::MapMeta(slab) => Ok(MapSlab::Meta(slab.clone())),
        _ => Err(StrataError::WrongSlabType {
            id,
            expected: "map slab",
        }),
    }
}

impl MapSlab {
    pub(crate) fn header(&self) -> MapSlabHeader {
        match self {
            Self::Data(s) => s.header,
            Self::Meta(s) => s.header,
        }
    }

    fn set_id(&mut self, id: SlabId) {
        match self {
            Self::Data(s) => s.header.id = id,
            Self::Meta(s) => s.header.id = id,
        }
    }

    fn id(&self) -> SlabId {
        self.header().id
    }

    fn take_extra(&mut self) -> Option<MapExtraData> {
        match self {
            Self::Data(s) => s.extra.take(),
            Self::Meta(s) => s.extra.take(),
        }
    }

    fn set_extra(&mut self, extra: Option<MapExtraData>) {
        match self {
            Self::Data(s) => s.extra = extra,
            Self::Meta(s) => s.extra = extra,
        }
    }

    /// Record the tree's entry count in the root extra data, if present.
    fn set_count(&mut self, count: u64) {
        let extra = match self {
            Self::Data(s) => s.extra.as_mut(),
            Self::Meta(s) => s.extra.as_mut(),
        };
        if let Some(extra) = extra {
            extra.count = count;
        }
    }

    pub(crate) fn into_slab(self) -> Slab {
        match self {
            Self::Data(s) => Slab::MapData(s),
            Self::Meta(s) => Slab::MapMeta(s),
        }
    }

    fn is_full(&self, limits: SlabLimits) -> bool {
        self.header().size > limits.max_threshold()
    }

    fn underflow(&self, limits: SlabLimits) -> Option<u32> {
        let size = self.header().size;
        (size < limits.min_threshold()).then(|| limits.min_threshold() - size)
    }

    fn can_lend(&self, needed: u32, limits: SlabLimits) -> bool {
        let slots = match self {
            Self::Data(s) => s.elements.slot_count(),
            Self::Meta(s) => s.children.len(),
        };
        slots >= 2 && self.header().size >= limits.min_threshold() + needed
    }

    fn split_off(&mut self, limits: SlabLimits) -> Result<MapSlab> {
        match self {
            Self::Data(slab) => {
                let MapElements::Hashed(h) = &mut slab.elements else {
                    return Err(StrataError::SlabSizeInvalid {
                        detail: format!("cannot split list-mode slab {}", slab.header.id),
                    });
                };
                if h.elements.len() < 2 {
                    return Err(StrataError::SlabSizeInvalid {
                        detail: format!(
                            "cannot split data slab {} with {} elements",
                            slab.header.id,
                            h.elements.len()
                        ),
                    });
                }
                let sizes: Vec<u32> = h
                    .elements
                    .iter()
                    .map(|e| HKEY_SIZE + e.byte_size())
                    .collect();
                let at = split_point(&sizes, MAP_DATA_PREFIX_SIZE, limits.min_threshold());
                let right_hkeys = h.hkeys.split_off(at);
                let right_elements = h.elements.split_off(at);
                let right_size: u32 = right_hkeys.len() as u32 * HKEY_SIZE
                    + right_elements.iter().map(MapElement::byte_size).sum::<u32>();
                h.size -= right_size;
                let level = h.level;
                let mut right = MapDataSlab {
                    header: MapSlabHeader {
                        id: SlabId::UNDEFINED,
                        size: 0,
                        first_key: Digest(0),
                    },
                    next: slab.next,
                    elements: MapElements::Hashed(HashedElements {
                        level,
                        size: right_size,
                        hkeys: right_hkeys,
                        elements: right_elements,
                    }),
                    collision_group: false,
                    extra: None,
                };
                right.refresh_header();
                slab.refresh_header();
                Ok(Self::Data(right))
            }
            Self::Meta(slab) => {
                let at = slab.children.len() / 2;
                let right_children = slab.children.split_off(at);
                let right = MapMetaSlab::new(SlabId::UNDEFINED, right_children);
                slab.refresh();
                Ok(Self::Meta(right))
            }
        }
    }

    fn merge(&mut self, right: MapSlab) -> Result<()> {
        match (self, right) {
            (Self::Data(left), Self::Data(right)) => {
                let (MapElements::Hashed(lh), MapElements::Hashed(rh)) =
                    (&mut left.elements, right.elements)
                else {
                    return Err(StrataError::SlabSizeInvalid {
                        detail: format!("cannot merge list-mode slab at {}", left.header.id),
                    });
                };
                lh.size += rh.size;
                lh.hkeys.extend(rh.hkeys);
                lh.elements.extend(rh.elements);
                left.next = right.next;
                left.refresh_header();
                Ok(())
            }
            (Self::Meta(left), Self::Meta(right)) => {
                left.children.extend(right.children);
                left.refresh();
                Ok(())
            }
            (left, _) => Err(StrataError::SlabSizeInvalid {
                detail: format!("cannot merge slabs of different kinds at {}", left.id()),
            }),
        }
    }

    fn redistribute(&mut self, right: &mut MapSlab, limits: SlabLimits) -> Result<()> {
        match (self, right) {
            (Self::Data(left), Self::Data(right)) => {
                let (MapElements::Hashed(lh), MapElements::Hashed(rh)) =
                    (&mut left.elements, &mut right.elements)
                else {
                    return Err(StrataError::SlabSizeInvalid {
                        detail: format!(
                            "cannot redistribute list-mode slab at {}",
                            left.header.id
                        ),
                    });
                };
                let mut hkeys = std::mem::take(&mut lh.hkeys);
                hkeys.append(&mut rh.hkeys);
                let mut elements = std::mem::take(&mut lh.elements);
                elements.append(&mut rh.elements);
                let sizes: Vec<u32> = elements
                    .iter()
                    .map(|e| HKEY_SIZE + e.byte_size())
                    .collect();
                let at = split_point(&sizes, MAP_DATA_PREFIX_SIZE, limits.min_threshold());
                rh.hkeys = hkeys.split_off(at);
                rh.elements = elements.split_off(at);
                lh.hkeys = hkeys;
                lh.elements = elements;
                lh.size = lh.hkeys.len() as u32 * HKEY_SIZE
                    + lh.elements.iter().map(MapElement::byte_size).sum::<u32>();
                rh.size = rh.hkeys.len() as u32 * HKEY_SIZE
                    + rh.elements.iter().map(MapElement::byte_size).sum::<u32>();
                left.refresh_header();
                right.refresh_header();
                Ok(())
            }
            (Self::Meta(left), Self::Meta(right)) => {
                let mut children = std::mem::take(&mut left.children);
                children.append(&mut right.children);
                let at = children.len() / 2;
                right.children = children.split_off(at);
                left.children = children;
                left.refresh();
                right.refresh();
                Ok(())
            }
            (left, _) => Err(StrataError::SlabSizeInvalid {
                detail: format!(
                    "cannot redistribute slabs of different kinds at {}",
                    left.id()
                ),
            }),
        }
    }

    fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        match self {
            Self::Data(slab) => {
                let old = slab.elements.set(storage, ctx, digester, 0, key, value)?;
                slab.refresh_header();
                Ok(old)
            }
            Self::Meta(slab) => slab.set(storage, ctx, digester, key, value),
        }
    }

    fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        key: &Value,
    ) -> Result<(Value, Value)> {
        match self {
            Self::Data(slab) => {
                let removed = slab.elements.remove(storage, ctx, digester, 0, key)?;
                slab.refresh_header();
                Ok(removed)
            }
            Self::Meta(slab) => slab.remove(storage, ctx, digester, key),
        }
    }
}

impl MapMetaSlab {
    fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        let hkey = digester.digest(0)?;
        let child_index = self.child_for(hkey);
        let mut child = load_map_slab(storage, self.children[child_index].id)?;
        let old = child.set(storage, ctx, digester, key, value)?;
        self.children[child_index] = child.header();
        if child.is_full(ctx.limits) {
            self.split_child(storage, ctx.limits, child_index, child)?;
        } else {
            storage.store(child.id(), child.into_slab())?;
        }
        self.refresh();
        Ok(old)
    }

    fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        ctx: &MapOpContext<'_>,
        digester: &mut dyn Digester,
        key: &Value,
    ) -> Result<(Value, Value)> {
        let hkey = digester.digest(0)?;
        let child_index = self.child_for(hkey);
        let mut child = load_map_slab(storage, self.children[child_index].id)?;
        let removed = child.remove(storage, ctx, digester, key)?;
        self.children[child_index] = child.header();
        if child.underflow(ctx.limits).is_some() {
            self.merge_or_rebalance_child(storage, ctx.limits, child_index, child)?;
        } else {
            storage.store(child.id(), child.into_slab())?;
        }
        self.refresh();
        Ok(removed)
    }

    fn split_child(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        child_index: usize,
        mut child: MapSlab,
    ) -> Result<()> {
        let address = self.header.id.address;
        let mut right = child.split_off(limits)?;
        let right_id = storage.allocate(address)?;
        right.set_id(right_id);
        if let MapSlab::Data(left) = &mut child {
            left.next = right_id;
        }
        self.children[child_index] = child.header();
        self.children.insert(child_index + 1, right.header());
        storage.store(child.id(), child.into_slab())?;
        storage.store(right_id, right.into_slab())?;
        self.refresh();
        Ok(())
    }

    /// Identical discipline to the array engine: borrow from the larger
    /// sibling able to lend, else merge with the smaller available one.
    fn merge_or_rebalance_child(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        child_index: usize,
        child: MapSlab,
    ) -> Result<()> {
        let needed = child.underflow(limits).unwrap_or(0);
        let left = if child_index > 0 {
            Some(load_map_slab(storage, self.children[child_index - 1].id)?)
        } else {
            None
        };
        let right = if child_index + 1 < self.children.len() {
            Some(load_map_slab(storage, self.children[child_index + 1].id)?)
        } else {
            None
        };
        let left_can = left.as_ref().is_some_and(|s| s.can_lend(needed, limits));
        let right_can = right.as_ref().is_some_and(|s| s.can_lend(needed, limits));

        let borrow_left = |this: &mut Self,
                           storage: &mut dyn SlabStore,
                           mut left: MapSlab,
                           mut child: MapSlab|
         -> Result<()> {
            left.redistribute(&mut child, limits)?;
            this.children[child_index - 1] = left.header();
            this.children[child_index] = child.header();
            storage.store(left.id(), left.into_slab())?;
            storage.store(child.id(), child.into_slab())
        };
        let borrow_right = |this: &mut Self,
                            storage: &mut dyn SlabStore,
                            mut child: MapSlab,
                            mut right: MapSlab|
         -> Result<()> {
            child.redistribute(&mut right, limits)?;
            this.children[child_index] = child.header();
            this.children[child_index + 1] = right.header();
            storage.store(child.id(), child.into_slab())?;
            storage.store(right.id(), right.into_slab())
        };

        match (left, right) {
            (Some(l), Some(r)) if left_can && right_can => {
                if l.header().size >= r.header().size {
                    borrow_left(self, storage, l, child)?;
                } else {
                    borrow_right(self, storage, child, r)?;
                }
            }
            (Some(l), _) if left_can => borrow_left(self, storage, l, child)?,
            (_, Some(r)) if right_can => borrow_right(self, storage, child, r)?,
            (Some(l), Some(r)) => {
                if l.header().size <= r.header().size {
                    self.merge_with_left(storage, child_index, l, child)?;
                } else {
                    self.merge_with_right(storage, child_index, child, r)?;
                }
            }
            (Some(l), None) => self.merge_with_left(storage, child_index, l, child)?,
            (None, Some(r)) => self.merge_with_right(storage, child_index, child, r)?,
            (None, None) => {
                storage.store(child.id(), child.into_slab())?;
            }
        }
        self.refresh();
        Ok(())
    }

    fn merge_with_left(
        &mut self,
        storage: &mut dyn SlabStore,
        child_index: usize,
        mut left: MapSlab,
        child: MapSlab,
    ) -> Result<()> {
        let child_id = child.id();
        left.merge(child)?;
        self.children[child_index - 1] = left.header();
        self.children.remove(child_index);
        storage.remove(child_id)?;
        storage.store(left.id(), left.into_slab())
    }

    fn merge_with_right(
        &mut self,
        storage: &mut dyn SlabStore,
        child_index: usize,
        mut child: MapSlab,
        right: MapSlab,
    ) -> Result<()> {
        let right_id = right.id();
        child.merge(right)?;
        self.children[child_index] = child.header();
        self.children.remove(child_index + 1);
        storage.remove(right_id)?;
        storage.store(child.id(), child.into_slab())
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// A scalable ordered mapping owned by one account.
pub struct OrderedMap {
    root_id: SlabId,
    limits: SlabLimits,
    seed: (u64, u64),
    builder: Box<dyn DigesterBuilder>,
}

fn random_seed() -> (u64, u64) {
    let mut rng = rand::rng();
    loop {
        let k0 = rng.next_u64();
        let k1 = rng.next_u64();
        if k0 != 0 || k1 != 0 {
            return (k0, k1);
        }
    }
}

impl OrderedMap {
    /// Create an empty map with the default digester and a fresh random
    /// seed.
    pub fn new(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
    ) -> Result<Self> {
        Self::new_with_digester_builder(
            storage,
            address,
            type_info,
            limits,
            Box::new(Xxh3Sha256DigesterBuilder::new()),
        )
    }

    /// Create an empty map with a caller-supplied digester builder. The
    /// seed is still generated here and recorded in the root's extra data.
    pub fn new_with_digester_builder(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
        mut builder: Box<dyn DigesterBuilder>,
    ) -> Result<Self> {
        let seed = random_seed();
        builder.set_seed(seed.0, seed.1);
        let root_id = storage.allocate(address)?;
        let root = MapDataSlab::new_root(
            root_id,
            MapExtraData {
                type_info,
                count: 0,
                seed_k0: seed.0,
                seed_k1: seed.1,
            },
        );
        storage.store(root_id, Slab::MapData(root))?;
        Ok(Self {
            root_id,
            limits,
            seed,
            builder,
        })
    }

    /// Re-attach to an existing map; the digester seed comes from the
    /// root's extra data.
    pub fn open(storage: &mut dyn SlabStore, root_id: SlabId, limits: SlabLimits) -> Result<Self> {
        Self::open_with_digester_builder(
            storage,
            root_id,
            limits,
            Box::new(Xxh3Sha256DigesterBuilder::new()),
        )
    }

    /// [`Self::open`] with a caller-supplied digester builder.
    pub fn open_with_digester_builder(
        storage: &mut dyn SlabStore,
        root_id: SlabId,
        limits: SlabLimits,
        mut builder: Box<dyn DigesterBuilder>,
    ) -> Result<Self> {
        let map = Self {
            root_id,
            limits,
            seed: (0, 0),
            builder: Box::new(Xxh3Sha256DigesterBuilder::new()),
        };
        let extra = map.extra(storage)?;
        builder.set_seed(extra.seed_k0, extra.seed_k1);
        Ok(Self {
            root_id,
            limits,
            seed: (extra.seed_k0, extra.seed_k1),
            builder,
        })
    }

    /// The root slab handle; stable across all mutations.
    #[must_use]
    pub fn slab_id(&self) -> SlabId {
        self.root_id
    }

    /// The owning account.
    #[must_use]
    pub fn address(&self) -> Address {
        self.root_id.address
    }

    /// The digest seed recorded at creation.
    #[must_use]
    pub fn seed(&self) -> (u64, u64) {
        self.seed
    }

    /// The size thresholds captured at creation.
    #[must_use]
    pub fn limits(&self) -> SlabLimits {
        self.limits
    }

    pub(crate) fn digester_builder(&self) -> &dyn DigesterBuilder {
        self.builder.as_ref()
    }

    fn extra(&self, storage: &mut dyn SlabStore) -> Result<MapExtraData> {
        let root = retrieve_expect(storage, self.root_id)?;
        let extra = match root {
            Slab::MapData(s) => s.extra,
            Slab::MapMeta(s) => s.extra,
            _ => {
                return Err(StrataError::WrongSlabType {
                    id: self.root_id,
                    expected: "map slab",
                });
            }
        };
        extra.ok_or_else(|| StrataError::decoding("map root slab is missing extra data"))
    }

    /// Number of entries.
    pub fn count(&self, storage: &mut dyn SlabStore) -> Result<u64> {
        Ok(self.extra(storage)?.count)
    }

    /// The user type tag recorded at creation.
    pub fn type_info(&self, storage: &mut dyn SlabStore) -> Result<TypeInfo> {
        Ok(self.extra(storage)?.type_info)
    }

    fn context<'a>(&'a self, compare: KeyCompareFn, hash_input: HashInputFn) -> MapOpContext<'a> {
        MapOpContext {
            builder: self.builder.as_ref(),
            hash_input,
            compare,
            address: self.root_id.address,
            limits: self.limits,
        }
    }

    /// Insert or overwrite `key`. Returns the previously stored value on
    /// overwrite.
    pub fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>> {
        if key.byte_size() > self.limits.max_inline_element_size() {
            return Err(StrataError::CapacityExceeded {
                what: "map key size",
                max: u64::from(self.limits.max_inline_element_size()),
            });
        }
        let ctx = self.context(compare, hash_input);
        let value = externalize_value(storage, ctx.address, ctx.limits, value)?;
        let mut digester = ctx.digester_for(&key)?;

        let mut root = load_map_slab(storage, self.root_id)?;
        let old = root.set(storage, &ctx, digester.as_mut(), key, value)?;
        digester.recycle();
        if old.is_none() {
            let count = self.count(storage)?;
            root.set_count(count + 1);
        }
        self.store_root(storage, root)?;
        match old {
            Some(old) => take_resolved(storage, old).map(Some),
            None => Ok(None),
        }
    }

    /// Look up `key`. External values are dereferenced transparently.
    pub fn get(
        &self,
        storage: &mut dyn SlabStore,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        key: &Value,
    ) -> Result<Value> {
        let ctx = self.context(compare, hash_input);
        let mut digester = ctx.digester_for(key)?;
        let hkey = digester.digest(0)?;

        let mut id = self.root_id;
        let data = loop {
            match retrieve_expect(storage, id)? {
                Slab::MapData(slab) if !slab.collision_group => break slab.clone(),
                Slab::MapMeta(slab) => {
                    id = slab.children[slab.child_for(hkey)].id;
                }
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id,
                        expected: "map slab",
                    });
                }
            }
        };
        let result = data
            .elements
            .get(storage, compare, digester.as_mut(), 0, key);
        digester.recycle();
        resolve_value(storage, result?)
    }

    /// Whether `key` is present.
    pub fn has(
        &self,
        storage: &mut dyn SlabStore,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        key: &Value,
    ) -> Result<bool> {
        match self.get(storage, compare, hash_input, key) {
            Ok(_) => Ok(true),
            Err(StrataError::KeyNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove `key`, returning the stored `(key, value)` pair.
    pub fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        key: &Value,
    ) -> Result<(Value, Value)> {
        let ctx = self.context(compare, hash_input);
        let mut digester = ctx.digester_for(key)?;

        let mut root = load_map_slab(storage, self.root_id)?;
        let removed = root.remove(storage, &ctx, digester.as_mut(), key);
        digester.recycle();
        let (removed_key, removed_value) = removed?;
        let count = self.count(storage)?;
        root.set_count(count - 1);
        self.store_root(storage, root)?;
        let removed_value = take_resolved(storage, removed_value)?;
        Ok((removed_key, removed_value))
    }

    fn store_root(&self, storage: &mut dyn SlabStore, root: MapSlab) -> Result<()> {
        if root.is_full(self.limits) {
            return self.split_root(storage, root);
        }
        if let MapSlab::Meta(meta) = &root {
            if meta.children.len() == 1 {
                return self.promote_sole_child(storage, root);
            }
        }
        storage.store(self.root_id, root.into_slab())
    }

    fn split_root(&self, storage: &mut dyn SlabStore, mut root: MapSlab) -> Result<()> {
        let address = self.address();
        let extra = root.take_extra();
        let left_id = storage.allocate(address)?;
        root.set_id(left_id);
        let mut left = root;
        let mut right = left.split_off(self.limits)?;
        let right_id = storage.allocate(address)?;
        right.set_id(right_id);
        if let MapSlab::Data(slab) = &mut left {
            slab.next = right_id;
        }
        debug!(root = %self.root_id, %left_id, %right_id, "map root split");
        let mut new_root = MapMetaSlab::new(self.root_id, vec![left.header(), right.header()]);
        new_root.extra = extra;
        storage.store(left_id, left.into_slab())?;
        storage.store(right_id, right.into_slab())?;
        storage.store(self.root_id, Slab::MapMeta(new_root))
    }

    fn promote_sole_child(&self, storage: &mut dyn SlabStore, mut root: MapSlab) -> Result<()> {
        let extra = root.take_extra();
        let MapSlab::Meta(meta) = root else {
            return Err(StrataError::SlabSizeInvalid {
                detail: format!("root {} is not a meta slab", self.root_id),
            });
        };
        let child_id = meta.children[0].id;
        let mut child = load_map_slab(storage, child_id)?;
        storage.remove(child_id)?;
        child.set_id(self.root_id);
        child.set_extra(extra);
        debug!(root = %self.root_id, %child_id, "map root collapsed into sole child");
        storage.store(self.root_id, child.into_slab())
    }

    /// Handle of the leftmost spine data slab.
    pub(crate) fn first_data_slab_id(&self, storage: &mut dyn SlabStore) -> Result<SlabId> {
        let mut id = self.root_id;
        loop {
            id = match retrieve_expect(storage, id)? {
                Slab::MapData(_) => return Ok(id),
                Slab::MapMeta(slab) => slab.children[0].id,
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id,
                        expected: "map slab",
                    });
                }
            };
        }
    }

    /// A cursor over all entries in digest order.
    pub fn iterator(&self, storage: &mut dyn SlabStore) -> Result<MapIterator> {
        Ok(MapIterator {
            current: self.first_data_slab_id(storage)?,
            buffered: VecDeque::new(),
        })
    }

    /// Visit every `(key, value)` entry; the visitor returns `false` to
    /// stop early.
    pub fn iterate<F>(&self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value, Value) -> Result<bool>,
    {
        let mut iter = self.iterator(storage)?;
        while let Some((key, value)) = iter.next(storage)? {
            if !f(key, value)? {
                break;
            }
        }
        Ok(())
    }

    /// Visit every key in digest order.
    pub fn iterate_keys<F>(&self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<bool>,
    {
        self.iterate(storage, |key, _| f(key))
    }

    /// Visit every value in digest order.
    pub fn iterate_values<F>(&self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<bool>,
    {
        self.iterate(storage, |_, value| f(value))
    }

    /// Yield every entry in digest order while tearing the tree down. The
    /// map ends as a single empty root data slab with its seed intact.
    pub fn pop_iterate<F>(&mut self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value, Value) -> Result<()>,
    {
        let extra = self.extra(storage)?;

        let mut meta_ids = Vec::new();
        let mut frontier = vec![self.root_id];
        while let Some(id) = frontier.pop() {
            if let Slab::MapMeta(slab) = retrieve_expect(storage, id)? {
                meta_ids.push(id);
                frontier.extend(slab.children.iter().map(|c| c.id));
            }
        }

        let mut leaf = self.first_data_slab_id(storage)?;
        while !leaf.is_undefined() {
            let slab = match retrieve_expect(storage, leaf)? {
                Slab::MapData(slab) => slab.clone(),
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id: leaf,
                        expected: "map data slab",
                    });
                }
            };
            let mut entries = VecDeque::new();
            flatten_elements(storage, &slab.elements, true, &mut entries)?;
            for (key, value) in entries {
                let value = take_resolved(storage, value)?;
                f(key, value)?;
            }
            storage.remove(leaf)?;
            leaf = slab.next;
        }
        for id in meta_ids {
            storage.remove(id)?;
        }

        let root = MapDataSlab::new_root(
            self.root_id,
            MapExtraData {
                type_info: extra.type_info,
                count: 0,
                seed_k0: extra.seed_k0,
                seed_k1: extra.seed_k1,
            },
        );
        storage.store(self.root_id, Slab::MapData(root))
    }
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

/// Expand a slab's element set into `(key, value)` pairs in canonical
/// order, descending into collision groups. With `consume` set, external
/// collision slabs are deleted as they are drained.
fn flatten_elements(
    storage: &mut dyn SlabStore,
    elements: &MapElements,
    consume: bool,
    out: &mut VecDeque<(Value, Value)>,
) -> Result<()> {
    match elements {
        MapElements::Hashed(h) => {
            for element in &h.elements {
                match element {
                    MapElement::Single { key, value } => {
                        out.push_back((key.clone(), value.clone()));
                    }
                    MapElement::InlineGroup(group) => {
                        flatten_elements(storage, group, consume, out)?;
                    }
                    MapElement::ExternalGroup(id) => {
                        let group = load_collision_slab(storage, *id)?;
                        flatten_elements(storage, &group.elements, consume, out)?;
                        if consume {
                            storage.remove(*id)?;
                        }
                    }
                }
            }
            Ok(())
        }
        MapElements::List(l) => {
            for (key, value) in &l.entries {
                out.push_back((key.clone(), value.clone()));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Batch construction
// ---------------------------------------------------------------------------

impl OrderedMap {
    /// Build a dense map bottom-up from a `(key, value)` sequence.
    ///
    /// Entries are digested under a fresh seed and laid out in digest
    /// order; leaves are filled to the size ceiling, linked, and meta
    /// levels built the same way. Duplicate keys keep the last value.
    pub fn from_batch<I>(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        entries: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        Self::from_batch_with_digester_builder(
            storage,
            address,
            type_info,
            limits,
            compare,
            hash_input,
            Box::new(Xxh3Sha256DigesterBuilder::new()),
            entries,
        )
    }

    /// [`Self::from_batch`] with a caller-supplied digester builder.
    #[allow(clippy::too_many_arguments)]
    pub fn from_batch_with_digester_builder<I>(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
        compare: KeyCompareFn,
        hash_input: HashInputFn,
        mut builder: Box<dyn DigesterBuilder>,
        entries: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let seed = random_seed();
        builder.set_seed(seed.0, seed.1);
        let ctx = MapOpContext {
            builder: builder.as_ref(),
            hash_input,
            compare,
            address,
            limits,
        };

        // Digest everything, then order by (hkey, insertion order).
        let mut items: Vec<(Digest, usize, Value, Value)> = Vec::new();
        for (order, (key, value)) in entries.into_iter().enumerate() {
            if key.byte_size() > limits.max_inline_element_size() {
                return Err(StrataError::CapacityExceeded {
                    what: "map key size",
                    max: u64::from(limits.max_inline_element_size()),
                });
            }
            let value = externalize_value(storage, address, limits, value)?;
            let mut digester = ctx.digester_for(&key)?;
            let hkey = digester.digest(0)?;
            digester.recycle();
            items.push((hkey, order, key, value));
        }
        items.sort_by_key(|(hkey, order, _, _)| (*hkey, *order));

        let digest_levels = strata_digest::DIGEST_LEVELS;
        let mut count = 0u64;
        let mut leaf_headers: Vec<MapSlabHeader> = Vec::new();
        let mut current = MapDataSlab {
            header: MapSlabHeader {
                id: storage.allocate(address)?,
                size: MAP_DATA_PREFIX_SIZE,
                first_key: Digest(0),
            },
            next: SlabId::UNDEFINED,
            elements: MapElements::new_for_level(0, digest_levels),
            collision_group: false,
            extra: None,
        };
        let mut sealed: Option<MapDataSlab> = None;

        let mut items = items.into_iter().peekable();
        while let Some((hkey, _, key, value)) = items.next() {
            // Collect the run of entries sharing this hkey.
            let element = if items.peek().is_some_and(|(next, _, _, _)| *next == hkey) {
                let mut group = MapElements::new_for_level(1, digest_levels);
                let insert = |group: &mut MapElements,
                                  storage: &mut dyn SlabStore,
                                  key: Value,
                                  value: Value|
                 -> Result<bool> {
                    let mut digester = ctx.digester_for(&key)?;
                    let old = group.set(storage, &ctx, digester.as_mut(), 1, key, value)?;
                    digester.recycle();
                    Ok(old.is_none())
                };
                if insert(&mut group, storage, key, value)? {
                    count += 1;
                }
                while items.peek().is_some_and(|(next, _, _, _)| *next == hkey) {
                    let (_, _, key, value) = items.next().unwrap_or_else(|| unreachable!());
                    if insert(&mut group, storage, key, value)? {
                        count += 1;
                    }
                }
                if INLINE_GROUP_PREFIX_SIZE + group.size() > limits.max_inline_element_size() {
                    let id = storage.allocate(address)?;
                    let mut slab = MapDataSlab {
                        header: MapSlabHeader {
                            id,
                            size: 0,
                            first_key: Digest(0),
                        },
                        next: SlabId::UNDEFINED,
                        elements: group,
                        collision_group: true,
                        extra: None,
                    };
                    slab.refresh_header();
                    storage.store(id, Slab::MapData(slab))?;
                    MapElement::ExternalGroup(id)
                } else {
                    MapElement::InlineGroup(Box::new(group))
                }
            } else {
                count += 1;
                MapElement::Single { key, value }
            };

            let element_size = HKEY_SIZE + element.byte_size();
            if current.elements.slot_count() > 0
                && current.header.size + element_size > limits.max_threshold()
            {
                let replacement = MapDataSlab {
                    header: MapSlabHeader {
                        id: storage.allocate(address)?,
                        size: MAP_DATA_PREFIX_SIZE,
                        first_key: Digest(0),
                    },
                    next: SlabId::UNDEFINED,
                    elements: MapElements::new_for_level(0, digest_levels),
                    collision_group: false,
                    extra: None,
                };
                let mut finished = std::mem::replace(&mut current, replacement);
                finished.next = current.header.id;
                if let Some(previous) = sealed.take() {
                    leaf_headers.push(previous.header);
                    storage.store(previous.header.id, Slab::MapData(previous))?;
                }
                sealed = Some(finished);
            }
            let MapElements::Hashed(h) = &mut current.elements else {
                unreachable!()
            };
            h.size += element_size;
            h.hkeys.push(hkey);
            h.elements.push(element);
            current.refresh_header();
        }

        // Rebalance the tail so every non-root leaf is legal.
        if current.header.size < limits.min_threshold() {
            if let Some(previous) = sealed.take() {
                let mut left = MapSlab::Data(previous);
                let mut right = MapSlab::Data(current);
                if left.header().size + right.header().size - MAP_DATA_PREFIX_SIZE
                    <= limits.max_threshold()
                {
                    left.merge(right)?;
                    let MapSlab::Data(merged) = left else { unreachable!() };
                    current = merged;
                } else {
                    left.redistribute(&mut right, limits)?;
                    let (MapSlab::Data(l), MapSlab::Data(r)) = (left, right) else {
                        unreachable!()
                    };
                    current = r;
                    sealed = Some(l);
                }
            }
        }
        if let Some(previous) = sealed.take() {
            leaf_headers.push(previous.header);
            storage.store(previous.header.id, Slab::MapData(previous))?;
        }

        let extra = MapExtraData {
            type_info,
            count,
            seed_k0: seed.0,
            seed_k1: seed.1,
        };
        let last_id = current.header.id;
        if leaf_headers.is_empty() {
            current.extra = Some(extra);
            storage.store(last_id, Slab::MapData(current))?;
            return Ok(Self {
                root_id: last_id,
                limits,
                seed,
                builder,
            });
        }
        leaf_headers.push(current.header);
        storage.store(last_id, Slab::MapData(current))?;

        // Build meta levels until a single node remains.
        let mut level = leaf_headers;
        loop {
            let mut next_level: Vec<MapSlabHeader> = Vec::new();
            let mut groups: Vec<Vec<MapSlabHeader>> = Vec::new();
            let mut group: Vec<MapSlabHeader> = Vec::new();
            for header in level {
                let group_size =
                    MAP_META_PREFIX_SIZE + MAP_META_CHILD_SIZE * (group.len() as u32 + 1);
                if !group.is_empty() && group_size > limits.max_threshold() {
                    groups.push(std::mem::take(&mut group));
                }
                group.push(header);
            }
            if !group.is_empty() {
                groups.push(group);
            }
            if groups.len() > 1 && groups.last().is_some_and(|g| g.len() < 2) {
                let tail = groups.pop().unwrap_or_default();
                let prev = groups.last_mut().unwrap_or_else(|| unreachable!());
                let stolen = prev.pop().unwrap_or_else(|| unreachable!());
                let mut rebuilt = vec![stolen];
                rebuilt.extend(tail);
                groups.push(rebuilt);
            }

            let single = groups.len() == 1;
            for children in groups {
                let id = storage.allocate(address)?;
                let mut meta = MapMetaSlab::new(id, children);
                if single {
                    meta.extra = Some(extra);
                }
                next_level.push(meta.header);
                storage.store(id, Slab::MapMeta(meta))?;
            }
            if single {
                return Ok(Self {
                    root_id: next_level[0].id,
                    limits,
                    seed,
                    builder,
                });
            }
            level = next_level;
        }
    }
}

/// Stateful cursor over a map's leaf chain.
pub struct MapIterator {
    current: SlabId,
    buffered: VecDeque<(Value, Value)>,
}

impl MapIterator {
    /// The next `(key, value)` entry in digest order, or `None` when
    /// exhausted. Values are dereferenced transparently.
    pub fn next(&mut self, storage: &mut dyn SlabStore) -> Result<Option<(Value, Value)>> {
        loop {
            if let Some((key, value)) = self.buffered.pop_front() {
                let value = resolve_value(storage, value)?;
                return Ok(Some((key, value)));
            }
            if self.current.is_undefined() {
                return Ok(None);
            }
            let slab = match retrieve_expect(storage, self.current)? {
                Slab::MapData(slab) => slab.clone(),
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id: self.current,
                        expected: "map data slab",
                    });
                }
            };
            flatten_elements(storage, &slab.elements, false, &mut self.buffered)?;
            self.current = slab.next;
        }
    }
}
