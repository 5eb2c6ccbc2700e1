//! The Array engine: a scalable ordered sequence over slabs.
//!
//! The tree is index-addressed: every meta slab records the cumulative
//! first-index of each child, so `get(i)` binary-searches one child header
//! array per level. Data slabs form a singly linked leaf chain in index
//! order, terminated by the undefined handle.
//!
//! Structural policy:
//!
//! - Inserting past `max_threshold` splits a slab at the element boundary
//!   nearest the byte midpoint, leaving both halves above `min_threshold`.
//! - Deleting below `min_threshold` borrows from the larger sibling when a
//!   sibling can lend, and merges with the smaller sibling otherwise.
//! - The root is exempt from underflow; a meta root with a single child is
//!   replaced by that child.
//! - An element larger than `max_inline_element_size` is stored in its own
//!   storable slab and referenced by handle.

use std::collections::VecDeque;

use tracing::debug;

use crate::codec::{Decoder, Encoder, SLAB_VERSION, SlabFlag, SlabKind};
use crate::slab::{ArrayExtraData, SLAB_ENVELOPE_SIZE, Slab, StorableSlab, split_point};
use crate::storage::{SlabStore, retrieve_expect};
use crate::value::{DecodeStorableFn, DecodeTypeInfoFn, Value, resolve_value};
use strata_error::{Result, StrataError};
use strata_types::{Address, SlabId, SlabLimits, TypeInfo};

/// Encoded bytes before the element stream of a data slab: envelope, next
/// handle, element count.
pub(crate) const ARRAY_DATA_PREFIX_SIZE: u32 = SLAB_ENVELOPE_SIZE + 16 + 4;
/// Encoded bytes before the child headers of a meta slab: envelope, child
/// count.
pub(crate) const ARRAY_META_PREFIX_SIZE: u32 = SLAB_ENVELOPE_SIZE + 2;
/// Encoded bytes per meta child header: id, first index, count, size.
pub(crate) const ARRAY_META_CHILD_SIZE: u32 = 16 + 8 + 4 + 4;

/// Hard cap on element count; a slab header's count field is 32-bit.
pub const MAX_ARRAY_LEN: u64 = u32::MAX as u64;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Cached identity, logical count, and encoded size of one array slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArraySlabHeader {
    pub id: SlabId,
    pub count: u32,
    pub size: u32,
}

// ---------------------------------------------------------------------------
// Data slab
// ---------------------------------------------------------------------------

/// A leaf holding element payloads in index order.
#[derive(Debug, Clone)]
pub struct ArrayDataSlab {
    pub(crate) header: ArraySlabHeader,
    pub(crate) next: SlabId,
    pub(crate) elements: Vec<Value>,
    pub(crate) extra: Option<ArrayExtraData>,
}

impl ArrayDataSlab {
    pub(crate) fn new(id: SlabId) -> Self {
        Self {
            header: ArraySlabHeader {
                id,
                count: 0,
                size: ARRAY_DATA_PREFIX_SIZE,
            },
            next: SlabId::UNDEFINED,
            elements: Vec::new(),
            extra: None,
        }
    }

    pub(crate) fn new_root(id: SlabId, type_info: TypeInfo) -> Self {
        let mut slab = Self::new(id);
        slab.extra = Some(ArrayExtraData {
            type_info,
            count: 0,
        });
        slab
    }

    fn content_size(&self) -> u32 {
        self.header.size - ARRAY_DATA_PREFIX_SIZE
    }

    fn insert_local(&mut self, index: usize, value: Value) {
        self.header.size += value.byte_size();
        self.header.count += 1;
        self.elements.insert(index, value);
    }

    fn remove_local(&mut self, index: usize) -> Value {
        let value = self.elements.remove(index);
        self.header.size -= value.byte_size();
        self.header.count -= 1;
        value
    }

    fn set_local(&mut self, index: usize, value: Value) -> Value {
        self.header.size += value.byte_size();
        let old = std::mem::replace(&mut self.elements[index], value);
        self.header.size -= old.byte_size();
        old
    }

    fn has_external_refs(&self) -> bool {
        self.elements.iter().any(Value::is_ref)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(self.header.size as usize + 32);
        enc.write_u8(SLAB_VERSION);
        enc.write_u8(
            SlabFlag::new(SlabKind::ArrayData)
                .with_root(self.extra.is_some())
                .with_external_refs(self.has_external_refs())
                .encode(),
        );
        if let Some(extra) = &self.extra {
            extra.encode(&mut enc);
        }
        enc.write_slab_id(self.next);
        enc.write_u32(self.elements.len() as u32);
        for element in &self.elements {
            element.encode(&mut enc)?;
        }
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
            Some(ArrayExtraData::decode(dec, decode_type_info)?)
        } else {
            None
        };
        let next = dec.read_slab_id()?;
        let count = dec.read_u32()? as usize;
        let mut elements = Vec::with_capacity(count);
        let mut size = ARRAY_DATA_PREFIX_SIZE;
        for _ in 0..count {
            let element = decode_storable(dec)?;
            size += element.byte_size();
            elements.push(element);
        }
        dec.finish()?;
        Ok(Self {
            header: ArraySlabHeader {
                id,
                count: count as u32,
                size,
            },
            next,
            elements,
            extra,
        })
    }
}

// ---------------------------------------------------------------------------
// Meta slab
// ---------------------------------------------------------------------------

/// An interior node holding ordered child headers.
#[derive(Debug, Clone)]
pub struct ArrayMetaSlab {
    pub(crate) header: ArraySlabHeader,
    pub(crate) children: Vec<ArraySlabHeader>,
    /// `cumulative[i]` = elements in children `0..=i`; rebuilt after any
    /// child change, searched by `partition_point`.
    pub(crate) cumulative: Vec<u64>,
    pub(crate) extra: Option<ArrayExtraData>,
}

impl ArrayMetaSlab {
    pub(crate) fn new(id: SlabId, children: Vec<ArraySlabHeader>) -> Self {
        let mut slab = Self {
            header: ArraySlabHeader {
                id,
                count: 0,
                size: 0,
            },
            children,
            cumulative: Vec::new(),
            extra: None,
        };
        slab.refresh();
        slab
    }

    /// Recompute the cumulative index table and the cached header from the
    /// child headers.
    pub(crate) fn refresh(&mut self) {
        self.cumulative.clear();
        let mut sum = 0u64;
        for child in &self.children {
            sum += u64::from(child.count);
            self.cumulative.push(sum);
        }
        self.header.count = sum.min(u64::from(u32::MAX)) as u32;
        self.header.size =
            ARRAY_META_PREFIX_SIZE + ARRAY_META_CHILD_SIZE * self.children.len() as u32;
    }

    /// Child containing `index`, with the index rebased to that child.
    fn child_for(&self, index: u64) -> Result<(usize, u64)> {
        let pos = self.cumulative.partition_point(|&c| c <= index);
        if pos >= self.children.len() {
            return Err(StrataError::IndexOutOfBounds {
                index,
                max: u64::from(self.header.count),
            });
        }
        let start = if pos == 0 { 0 } else { self.cumulative[pos - 1] };
        Ok((pos, index - start))
    }

    /// Like [`Self::child_for`], but an index equal to the total count maps
    /// to an append on the last child.
    fn child_for_insert(&self, index: u64) -> Result<(usize, u64)> {
        if index == u64::from(self.header.count) {
            let last = self.children.len() - 1;
            return Ok((last, u64::from(self.children[last].count)));
        }
        self.child_for(index)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(self.header.size as usize + 32);
        enc.write_u8(SLAB_VERSION);
        enc.write_u8(
            SlabFlag::new(SlabKind::ArrayMeta)
                .with_root(self.extra.is_some())
                .encode(),
        );
        if let Some(extra) = &self.extra {
            extra.encode(&mut enc);
        }
        enc.write_u16(self.children.len() as u16);
        let mut first_index = 0u64;
        for child in &self.children {
            enc.write_slab_id(child.id);
            enc.write_u64(first_index);
            enc.write_u32(child.count);
            enc.write_u32(child.size);
            first_index += u64::from(child.count);
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
            Some(ArrayExtraData::decode(dec, decode_type_info)?)
        } else {
            None
        };
        let count = dec.read_u16()? as usize;
        let mut children = Vec::with_capacity(count);
        let mut expected_first = 0u64;
        for _ in 0..count {
            let child_id = dec.read_slab_id()?;
            let first_index = dec.read_u64()?;
            let child_count = dec.read_u32()?;
            let child_size = dec.read_u32()?;
            if first_index != expected_first {
                return Err(StrataError::decoding(format!(
                    "meta child {child_id} has first index {first_index}, expected {expected_first}"
                )));
            }
            expected_first += u64::from(child_count);
            children.push(ArraySlabHeader {
                id: child_id,
                count: child_count,
                size: child_size,
            });
        }
        dec.finish()?;
        let mut slab = Self::new(id, children);
        slab.extra = extra;
        Ok(slab)
    }
}

// ---------------------------------------------------------------------------
// Unified slab operations
// ---------------------------------------------------------------------------

/// An array slab lifted out of storage for mutation.
#[derive(Debug, Clone)]
pub(crate) enum ArraySlab {
    Data(ArrayDataSlab),
    Meta(ArrayMetaSlab),
}

pub(crate) fn load_array_slab(storage: &mut dyn SlabStore, id: SlabId) -> Result<ArraySlab> {
    match retrieve_expect(storage, id)? {
        Slab::ArrayData(slab) => Ok(ArraySlab::Data(slab.clone())),
        Slab::ArrayMeta(slab) => Ok(ArraySlab::Meta(slab.clone())),
        _ => Err(StrataError::WrongSlabType {
            id,
            expected: "array slab",
        }),
    }
}

impl ArraySlab {
    pub(crate) fn header(&self) -> ArraySlabHeader {
        match self {
            Self::Data(s) => s.header,
            Self::Meta(s) => s.header,
        }
    }

    pub(crate) fn id(&self) -> SlabId {
        self.header().id
    }

    fn set_id(&mut self, id: SlabId) {
        match self {
            Self::Data(s) => s.header.id = id,
            Self::Meta(s) => s.header.id = id,
        }
    }

    pub(crate) fn extra(&self) -> Option<&ArrayExtraData> {
        match self {
            Self::Data(s) => s.extra.as_ref(),
            Self::Meta(s) => s.extra.as_ref(),
        }
    }

    fn extra_mut(&mut self) -> Option<&mut ArrayExtraData> {
        match self {
            Self::Data(s) => s.extra.as_mut(),
            Self::Meta(s) => s.extra.as_mut(),
        }
    }

    fn take_extra(&mut self) -> Option<ArrayExtraData> {
        match self {
            Self::Data(s) => s.extra.take(),
            Self::Meta(s) => s.extra.take(),
        }
    }

    fn set_extra(&mut self, extra: Option<ArrayExtraData>) {
        match self {
            Self::Data(s) => s.extra = extra,
            Self::Meta(s) => s.extra = extra,
        }
    }

    pub(crate) fn into_slab(self) -> Slab {
        match self {
            Self::Data(s) => Slab::ArrayData(s),
            Self::Meta(s) => Slab::ArrayMeta(s),
        }
    }

    fn is_full(&self, limits: SlabLimits) -> bool {
        self.header().size > limits.max_threshold()
    }

    /// Bytes missing to reach `min_threshold`, if underflowing.
    fn underflow(&self, limits: SlabLimits) -> Option<u32> {
        let size = self.header().size;
        (size < limits.min_threshold()).then(|| limits.min_threshold() - size)
    }

    /// Whether this slab can give up `needed` bytes and stay legal.
    fn can_lend(&self, needed: u32, limits: SlabLimits) -> bool {
        let element_count = match self {
            Self::Data(s) => s.elements.len(),
            Self::Meta(s) => s.children.len(),
        };
        element_count >= 2 && self.header().size >= limits.min_threshold() + needed
    }

    /// Split the upper half off into a new slab. The returned slab carries
    /// the undefined id; the caller allocates and links it.
    fn split_off(&mut self, limits: SlabLimits) -> Result<ArraySlab> {
        match self {
            Self::Data(slab) => {
                if slab.elements.len() < 2 {
                    return Err(StrataError::SlabSizeInvalid {
                        detail: format!(
                            "cannot split data slab {} with {} elements",
                            slab.header.id,
                            slab.elements.len()
                        ),
                    });
                }
                let sizes: Vec<u32> = slab.elements.iter().map(Value::byte_size).collect();
                let at = split_point(&sizes, ARRAY_DATA_PREFIX_SIZE, limits.min_threshold());
                let right_elements = slab.elements.split_off(at);
                let right_size: u32 =
                    ARRAY_DATA_PREFIX_SIZE + right_elements.iter().map(Value::byte_size).sum::<u32>();
                let right = ArrayDataSlab {
                    header: ArraySlabHeader {
                        id: SlabId::UNDEFINED,
                        count: right_elements.len() as u32,
                        size: right_size,
                    },
                    next: slab.next,
                    elements: right_elements,
                    extra: None,
                };
                slab.header.count = slab.elements.len() as u32;
                slab.header.size = ARRAY_DATA_PREFIX_SIZE
                    + slab.elements.iter().map(Value::byte_size).sum::<u32>();
                Ok(Self::Data(right))
            }
            Self::Meta(slab) => {
                let at = slab.children.len() / 2;
                let right_children = slab.children.split_off(at);
                let mut right = ArrayMetaSlab::new(SlabId::UNDEFINED, right_children);
                right.extra = None;
                slab.refresh();
                Ok(Self::Meta(right))
            }
        }
    }

    /// Absorb `right` (the immediately following sibling).
    fn merge(&mut self, right: ArraySlab) -> Result<()> {
        match (self, right) {
            (Self::Data(left), Self::Data(right)) => {
                left.header.size += right.content_size();
                left.header.count += right.header.count;
                left.elements.extend(right.elements);
                left.next = right.next;
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

    /// Even out the byte sizes of two adjacent siblings.
    fn redistribute(&mut self, right: &mut ArraySlab, limits: SlabLimits) -> Result<()> {
        match (self, right) {
            (Self::Data(left), Self::Data(right)) => {
                let mut all = std::mem::take(&mut left.elements);
                all.append(&mut right.elements);
                let sizes: Vec<u32> = all.iter().map(Value::byte_size).collect();
                let at = split_point(&sizes, ARRAY_DATA_PREFIX_SIZE, limits.min_threshold());
                let right_elements = all.split_off(at);
                left.elements = all;
                left.header.count = left.elements.len() as u32;
                left.header.size = ARRAY_DATA_PREFIX_SIZE
                    + left.elements.iter().map(Value::byte_size).sum::<u32>();
                right.header.count = right_elements.len() as u32;
                right.header.size = ARRAY_DATA_PREFIX_SIZE
                    + right_elements.iter().map(Value::byte_size).sum::<u32>();
                right.elements = right_elements;
                Ok(())
            }
            (Self::Meta(left), Self::Meta(right)) => {
                let mut all = std::mem::take(&mut left.children);
                all.append(&mut right.children);
                let at = all.len() / 2;
                right.children = all.split_off(at);
                left.children = all;
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

    // -- Recursive operations -----------------------------------------------

    fn insert(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
        value: Value,
    ) -> Result<()> {
        match self {
            Self::Data(slab) => {
                slab.insert_local(index as usize, value);
                Ok(())
            }
            Self::Meta(slab) => slab.insert(storage, limits, index, value),
        }
    }

    fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
    ) -> Result<Value> {
        match self {
            Self::Data(slab) => Ok(slab.remove_local(index as usize)),
            Self::Meta(slab) => slab.remove(storage, limits, index),
        }
    }

    fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
        value: Value,
    ) -> Result<Value> {
        match self {
            Self::Data(slab) => Ok(slab.set_local(index as usize, value)),
            Self::Meta(slab) => slab.set(storage, limits, index, value),
        }
    }
}

impl ArrayMetaSlab {
    fn insert(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
        value: Value,
    ) -> Result<()> {
        let (child_index, local) = self.child_for_insert(index)?;
        let mut child = load_array_slab(storage, self.children[child_index].id)?;
        child.insert(storage, limits, local, value)?;
        self.children[child_index] = child.header();
        if child.is_full(limits) {
            self.split_child(storage, limits, child_index, child)?;
        } else {
            storage.store(child.id(), child.into_slab())?;
        }
        self.refresh();
        Ok(())
    }

    fn remove(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
    ) -> Result<Value> {
        let (child_index, local) = self.child_for(index)?;
        let mut child = load_array_slab(storage, self.children[child_index].id)?;
        let value = child.remove(storage, limits, local)?;
        self.children[child_index] = child.header();
        if child.underflow(limits).is_some() {
            self.merge_or_rebalance_child(storage, limits, child_index, child)?;
        } else {
            storage.store(child.id(), child.into_slab())?;
        }
        self.refresh();
        Ok(value)
    }

    fn set(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        index: u64,
        value: Value,
    ) -> Result<Value> {
        let (child_index, local) = self.child_for(index)?;
        let mut child = load_array_slab(storage, self.children[child_index].id)?;
        let old = child.set(storage, limits, local, value)?;
        self.children[child_index] = child.header();
        if child.is_full(limits) {
            self.split_child(storage, limits, child_index, child)?;
        } else if child.underflow(limits).is_some() {
            self.merge_or_rebalance_child(storage, limits, child_index, child)?;
        } else {
            storage.store(child.id(), child.into_slab())?;
        }
        self.refresh();
        Ok(old)
    }

    fn split_child(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        child_index: usize,
        mut child: ArraySlab,
    ) -> Result<()> {
        let address = self.header.id.address;
        let mut right = child.split_off(limits)?;
        let right_id = storage.allocate(address)?;
        right.set_id(right_id);
        if let ArraySlab::Data(left) = &mut child {
            left.next = right_id;
        }
        self.children[child_index] = child.header();
        self.children.insert(child_index + 1, right.header());
        storage.store(child.id(), child.into_slab())?;
        storage.store(right_id, right.into_slab())?;
        self.refresh();
        Ok(())
    }

    /// Fix an underflowing child: borrow from the larger sibling able to
    /// lend, otherwise merge with the smaller available sibling.
    fn merge_or_rebalance_child(
        &mut self,
        storage: &mut dyn SlabStore,
        limits: SlabLimits,
        child_index: usize,
        mut child: ArraySlab,
    ) -> Result<()> {
        let needed = child.underflow(limits).unwrap_or(0);
        let left = if child_index > 0 {
            Some(load_array_slab(storage, self.children[child_index - 1].id)?)
        } else {
            None
        };
        let right = if child_index + 1 < self.children.len() {
            Some(load_array_slab(storage, self.children[child_index + 1].id)?)
        } else {
            None
        };
        let left_can = left.as_ref().is_some_and(|s| s.can_lend(needed, limits));
        let right_can = right.as_ref().is_some_and(|s| s.can_lend(needed, limits));

        let borrow_left = |this: &mut Self,
                           storage: &mut dyn SlabStore,
                           mut left: ArraySlab,
                           mut child: ArraySlab|
         -> Result<()> {
            left.redistribute(&mut child, limits)?;
            this.children[child_index - 1] = left.header();
            this.children[child_index] = child.header();
            storage.store(left.id(), left.into_slab())?;
            storage.store(child.id(), child.into_slab())
        };
        let borrow_right = |this: &mut Self,
                            storage: &mut dyn SlabStore,
                            mut child: ArraySlab,
                            mut right: ArraySlab|
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
                // Merge with the smaller sibling.
                if l.header().size <= r.header().size {
                    self.merge_with_left(storage, child_index, l, child)?;
                } else {
                    self.merge_with_right(storage, child_index, child, r)?;
                }
            }
            (Some(l), None) => self.merge_with_left(storage, child_index, l, child)?,
            (None, Some(r)) => self.merge_with_right(storage, child_index, child, r)?,
            (None, None) => {
                // Sole child; nothing to balance against.
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
        mut left: ArraySlab,
        child: ArraySlab,
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
        mut child: ArraySlab,
        right: ArraySlab,
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
// Oversize element handling
// ---------------------------------------------------------------------------

/// Store `value` in its own slab when it cannot legally stay inline.
pub(crate) fn externalize_value(
    storage: &mut dyn SlabStore,
    address: Address,
    limits: SlabLimits,
    value: Value,
) -> Result<Value> {
    if value.byte_size() <= limits.max_inline_element_size() {
        return Ok(value);
    }
    let id = storage.allocate(address)?;
    debug!(slab = %id, size = value.byte_size(), "storing oversize element externally");
    storage.store(id, Slab::Storable(StorableSlab { id, value }))?;
    Ok(Value::Ref(id))
}

/// Resolve a displaced element, deleting its external slab if it had one.
pub(crate) fn take_resolved(storage: &mut dyn SlabStore, value: Value) -> Result<Value> {
    if let Value::Ref(id) = value {
        let resolved = resolve_value(storage, Value::Ref(id))?;
        storage.remove(id)?;
        return Ok(resolved);
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// A scalable ordered sequence of values owned by one account.
#[derive(Debug, Clone, Copy)]
pub struct Array {
    root_id: SlabId,
    limits: SlabLimits,
}

impl Array {
    /// Create an empty array owned by `address`.
    pub fn new(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
    ) -> Result<Self> {
        let root_id = storage.allocate(address)?;
        let root = ArrayDataSlab::new_root(root_id, type_info);
        storage.store(root_id, Slab::ArrayData(root))?;
        Ok(Self { root_id, limits })
    }

    /// Re-attach to an existing array rooted at `root_id`.
    pub fn open(storage: &mut dyn SlabStore, root_id: SlabId, limits: SlabLimits) -> Result<Self> {
        let array = Self { root_id, limits };
        // Loading the extra data validates both kind and rootness.
        array.extra(storage)?;
        Ok(array)
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

    /// The size thresholds captured at creation.
    #[must_use]
    pub fn limits(&self) -> SlabLimits {
        self.limits
    }

    fn extra(&self, storage: &mut dyn SlabStore) -> Result<ArrayExtraData> {
        let root = retrieve_expect(storage, self.root_id)?;
        let extra = match root {
            Slab::ArrayData(s) => s.extra,
            Slab::ArrayMeta(s) => s.extra,
            _ => {
                return Err(StrataError::WrongSlabType {
                    id: self.root_id,
                    expected: "array slab",
                });
            }
        };
        extra.ok_or_else(|| StrataError::decoding("array root slab is missing extra data"))
    }

    /// Total number of elements.
    pub fn count(&self, storage: &mut dyn SlabStore) -> Result<u64> {
        Ok(self.extra(storage)?.count)
    }

    /// The user type tag recorded at creation.
    pub fn type_info(&self, storage: &mut dyn SlabStore) -> Result<TypeInfo> {
        Ok(self.extra(storage)?.type_info)
    }

    /// O(log n) random access. External elements are dereferenced
    /// transparently.
    pub fn get(&self, storage: &mut dyn SlabStore, index: u64) -> Result<Value> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(StrataError::IndexOutOfBounds { index, max: count });
        }
        let mut id = self.root_id;
        let mut index = index;
        loop {
            let (next_id, next_index, found) = match retrieve_expect(storage, id)? {
                Slab::ArrayData(slab) => {
                    let value = slab.elements.get(index as usize).cloned().ok_or(
                        StrataError::IndexOutOfBounds {
                            index,
                            max: slab.elements.len() as u64,
                        },
                    )?;
                    (SlabId::UNDEFINED, 0, Some(value))
                }
                Slab::ArrayMeta(slab) => {
                    let (child, local) = slab.child_for(index)?;
                    (slab.children[child].id, local, None)
                }
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id,
                        expected: "array slab",
                    });
                }
            };
            if let Some(value) = found {
                return resolve_value(storage, value);
            }
            id = next_id;
            index = next_index;
        }
    }

    /// Replace the element at `index`, returning the previous value.
    pub fn set(&mut self, storage: &mut dyn SlabStore, index: u64, value: Value) -> Result<Value> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(StrataError::IndexOutOfBounds { index, max: count });
        }
        let value = externalize_value(storage, self.address(), self.limits, value)?;
        let mut root = load_array_slab(storage, self.root_id)?;
        let old = root.set(storage, self.limits, index, value)?;
        self.store_root(storage, root)?;
        take_resolved(storage, old)
    }

    /// Insert at `index`, shifting later elements.
    pub fn insert(
        &mut self,
        storage: &mut dyn SlabStore,
        index: u64,
        value: Value,
    ) -> Result<()> {
        let count = self.count(storage)?;
        if index > count {
            return Err(StrataError::IndexOutOfBounds { index, max: count });
        }
        if count >= MAX_ARRAY_LEN {
            return Err(StrataError::CapacityExceeded {
                what: "array length",
                max: MAX_ARRAY_LEN,
            });
        }
        let value = externalize_value(storage, self.address(), self.limits, value)?;
        let mut root = load_array_slab(storage, self.root_id)?;
        root.insert(storage, self.limits, index, value)?;
        if let Some(extra) = root.extra_mut() {
            extra.count = count + 1;
        }
        self.store_root(storage, root)
    }

    /// Append at the end.
    pub fn append(&mut self, storage: &mut dyn SlabStore, value: Value) -> Result<()> {
        let count = self.count(storage)?;
        self.insert(storage, count, value)
    }

    /// Remove the element at `index`, returning it.
    pub fn remove(&mut self, storage: &mut dyn SlabStore, index: u64) -> Result<Value> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(StrataError::IndexOutOfBounds { index, max: count });
        }
        let mut root = load_array_slab(storage, self.root_id)?;
        let value = root.remove(storage, self.limits, index)?;
        if let Some(extra) = root.extra_mut() {
            extra.count = count - 1;
        }
        self.store_root(storage, root)?;
        take_resolved(storage, value)
    }

    /// Persist a mutated root, splitting or collapsing it as needed.
    fn store_root(&self, storage: &mut dyn SlabStore, root: ArraySlab) -> Result<()> {
        if root.is_full(self.limits) {
            return self.split_root(storage, root);
        }
        if let ArraySlab::Meta(meta) = &root {
            if meta.children.len() == 1 {
                return self.promote_sole_child(storage, root);
            }
        }
        storage.store(self.root_id, root.into_slab())
    }

    /// Push the root's content down one level and split it; the root handle
    /// stays stable and becomes a meta slab over the two halves.
    fn split_root(&self, storage: &mut dyn SlabStore, mut root: ArraySlab) -> Result<()> {
        let address = self.address();
        let extra = root.take_extra();
        let left_id = storage.allocate(address)?;
        root.set_id(left_id);
        let mut left = root;
        let mut right = left.split_off(self.limits)?;
        let right_id = storage.allocate(address)?;
        right.set_id(right_id);
        if let ArraySlab::Data(slab) = &mut left {
            slab.next = right_id;
        }
        debug!(root = %self.root_id, %left_id, %right_id, "array root split");
        let mut new_root = ArrayMetaSlab::new(self.root_id, vec![left.header(), right.header()]);
        new_root.extra = extra;
        storage.store(left_id, left.into_slab())?;
        storage.store(right_id, right.into_slab())?;
        storage.store(self.root_id, Slab::ArrayMeta(new_root))
    }

    /// Replace a single-child meta root with its child.
    fn promote_sole_child(&self, storage: &mut dyn SlabStore, mut root: ArraySlab) -> Result<()> {
        let extra = root.take_extra();
        let ArraySlab::Meta(meta) = root else {
            return Err(StrataError::SlabSizeInvalid {
                detail: format!("root {} is not a meta slab", self.root_id),
            });
        };
        let child_id = meta.children[0].id;
        let mut child = load_array_slab(storage, child_id)?;
        storage.remove(child_id)?;
        child.set_id(self.root_id);
        child.set_extra(extra);
        debug!(root = %self.root_id, %child_id, "array root collapsed into sole child");
        storage.store(self.root_id, child.into_slab())
    }

    /// Handle of the leftmost data slab.
    pub(crate) fn first_data_slab_id(&self, storage: &mut dyn SlabStore) -> Result<SlabId> {
        let mut id = self.root_id;
        loop {
            id = match retrieve_expect(storage, id)? {
                Slab::ArrayData(_) => return Ok(id),
                Slab::ArrayMeta(slab) => slab.children[0].id,
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id,
                        expected: "array slab",
                    });
                }
            };
        }
    }

    /// A cursor over the leaf chain, in index order.
    pub fn iterator(&self, storage: &mut dyn SlabStore) -> Result<ArrayIterator> {
        Ok(ArrayIterator {
            current: self.first_data_slab_id(storage)?,
            buffered: VecDeque::new(),
        })
    }

    /// Visit every element in index order. The visitor returns `false` to
    /// stop early.
    pub fn iterate<F>(&self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<bool>,
    {
        let mut iter = self.iterator(storage)?;
        while let Some(value) = iter.next(storage)? {
            if !f(value)? {
                break;
            }
        }
        Ok(())
    }

    /// Yield every element in index order while tearing the tree down. The
    /// array ends as a single empty root data slab.
    pub fn pop_iterate<F>(&mut self, storage: &mut dyn SlabStore, mut f: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<()>,
    {
        let extra = self.extra(storage)?;

        // Collect the meta spine before consuming leaves.
        let mut meta_ids = Vec::new();
        let mut frontier = vec![self.root_id];
        while let Some(id) = frontier.pop() {
            if let Slab::ArrayMeta(slab) = retrieve_expect(storage, id)? {
                meta_ids.push(id);
                frontier.extend(slab.children.iter().map(|c| c.id));
            }
        }

        let mut leaf = self.first_data_slab_id(storage)?;
        while !leaf.is_undefined() {
            let slab = match retrieve_expect(storage, leaf)? {
                Slab::ArrayData(slab) => slab.clone(),
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id: leaf,
                        expected: "array data slab",
                    });
                }
            };
            for value in slab.elements {
                let value = take_resolved(storage, value)?;
                f(value)?;
            }
            storage.remove(leaf)?;
            leaf = slab.next;
        }
        for id in meta_ids {
            storage.remove(id)?;
        }

        let mut root = ArrayDataSlab::new(self.root_id);
        root.extra = Some(ArrayExtraData {
            type_info: extra.type_info,
            count: 0,
        });
        storage.store(self.root_id, Slab::ArrayData(root))
    }

    /// Build a dense array bottom-up from a value sequence.
    ///
    /// Leaves are filled to the size ceiling, linked, and meta levels built
    /// the same way; the result is denser than repeated [`Array::append`].
    pub fn from_batch<I>(
        storage: &mut dyn SlabStore,
        address: Address,
        type_info: TypeInfo,
        limits: SlabLimits,
        values: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut total = 0u64;
        let mut leaf_headers: Vec<ArraySlabHeader> = Vec::new();
        let mut current = ArrayDataSlab::new(storage.allocate(address)?);
        let mut sealed: Option<ArrayDataSlab> = None;

        let seal =
            |storage: &mut dyn SlabStore,
             sealed: &mut Option<ArrayDataSlab>,
             headers: &mut Vec<ArraySlabHeader>,
             mut finished: ArrayDataSlab,
             next: SlabId|
             -> Result<()> {
                finished.next = next;
                if let Some(previous) = sealed.take() {
                    headers.push(previous.header);
                    storage.store(previous.header.id, Slab::ArrayData(previous))?;
                }
                *sealed = Some(finished);
                Ok(())
            };

        for value in values {
            if total >= MAX_ARRAY_LEN {
                return Err(StrataError::CapacityExceeded {
                    what: "array length",
                    max: MAX_ARRAY_LEN,
                });
            }
            let value = externalize_value(storage, address, limits, value)?;
            if !current.elements.is_empty()
                && current.header.size + value.byte_size() > limits.max_threshold()
            {
                let replacement = ArrayDataSlab::new(storage.allocate(address)?);
                let finished = std::mem::replace(&mut current, replacement);
                seal(
                    storage,
                    &mut sealed,
                    &mut leaf_headers,
                    finished,
                    current.header.id,
                )?;
            }
            current.insert_local(current.elements.len(), value);
            total += 1;
        }

        // Rebalance the tail so every non-root leaf is legal.
        if current.header.size < limits.min_threshold() {
            if let Some(mut previous) = sealed.take() {
                let mut left = ArraySlab::Data(previous.clone());
                let mut right = ArraySlab::Data(current.clone());
                if left.header().size + current.content_size() <= limits.max_threshold() {
                    left.merge(right)?;
                    let ArraySlab::Data(merged) = left else { unreachable!() };
                    current = merged;
                    sealed = None;
                } else {
                    left.redistribute(&mut right, limits)?;
                    let (ArraySlab::Data(l), ArraySlab::Data(r)) = (left, right) else {
                        unreachable!()
                    };
                    previous = l;
                    current = r;
                    sealed = Some(previous);
                }
            }
        }
        if let Some(previous) = sealed.take() {
            leaf_headers.push(previous.header);
            storage.store(previous.header.id, Slab::ArrayData(previous))?;
        }
        let last_header = current.header;
        let last_id = last_header.id;
        let single_leaf = leaf_headers.is_empty();
        if single_leaf {
            current.extra = Some(ArrayExtraData { type_info, count: total });
            storage.store(last_id, Slab::ArrayData(current))?;
            return Ok(Self {
                root_id: last_id,
                limits,
            });
        }
        leaf_headers.push(last_header);
        storage.store(last_id, Slab::ArrayData(current))?;

        // Build meta levels until a single node remains.
        let mut level = leaf_headers;
        loop {
            let mut next_level: Vec<ArraySlabHeader> = Vec::new();
            let mut group: Vec<ArraySlabHeader> = Vec::new();
            let mut groups: Vec<Vec<ArraySlabHeader>> = Vec::new();
            for header in level {
                let group_size =
                    ARRAY_META_PREFIX_SIZE + ARRAY_META_CHILD_SIZE * (group.len() as u32 + 1);
                if !group.is_empty() && group_size > limits.max_threshold() {
                    groups.push(std::mem::take(&mut group));
                }
                group.push(header);
            }
            if !group.is_empty() {
                groups.push(group);
            }
            // A trailing singleton meta is illegal; steal a child.
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
                let mut meta = ArrayMetaSlab::new(id, children);
                if single {
                    meta.extra = Some(ArrayExtraData { type_info, count: total });
                }
                next_level.push(meta.header);
                storage.store(id, Slab::ArrayMeta(meta))?;
            }
            if single {
                return Ok(Self {
                    root_id: next_level[0].id,
                    limits,
                });
            }
            level = next_level;
        }
    }
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

/// Stateful cursor over an array's leaf chain.
///
/// Advance may fail with a storage error; the cursor is then unusable.
pub struct ArrayIterator {
    current: SlabId,
    buffered: VecDeque<Value>,
}

impl ArrayIterator {
    /// The next element in index order, or `None` when exhausted.
    pub fn next(&mut self, storage: &mut dyn SlabStore) -> Result<Option<Value>> {
        loop {
            if let Some(value) = self.buffered.pop_front() {
                return resolve_value(storage, value).map(Some);
            }
            if self.current.is_undefined() {
                return Ok(None);
            }
            match retrieve_expect(storage, self.current)? {
                Slab::ArrayData(slab) => {
                    self.buffered = slab.elements.iter().cloned().collect();
                    self.current = slab.next;
                }
                _ => {
                    return Err(StrataError::WrongSlabType {
                        id: self.current,
                        expected: "array data slab",
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BasicSlabStorage;

    fn small_limits() -> SlabLimits {
        SlabLimits::new(128)
    }

    fn test_array(storage: &mut BasicSlabStorage) -> Array {
        Array::new(storage, Address::from(0x42), TypeInfo(7), small_limits()).unwrap()
    }

    fn collect(array: &Array, storage: &mut BasicSlabStorage) -> Vec<Value> {
        let mut out = Vec::new();
        array
            .iterate(storage, |v| {
                out.push(v);
                Ok(true)
            })
            .unwrap();
        out
    }

    #[test]
    fn append_get_count() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..500u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        assert_eq!(array.count(&mut storage).unwrap(), 500);
        for i in (0..500).step_by(37) {
            assert_eq!(array.get(&mut storage, i).unwrap(), Value::U64(i));
        }
        assert_eq!(array.type_info(&mut storage).unwrap(), TypeInfo(7));
    }

    #[test]
    fn get_out_of_bounds() {
        let mut storage = BasicSlabStorage::new();
        let array = test_array(&mut storage);
        assert!(matches!(
            array.get(&mut storage, 0),
            Err(StrataError::IndexOutOfBounds { index: 0, max: 0 })
        ));
    }

    #[test]
    fn insert_front_and_middle_preserves_order() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..100u64 {
            array.insert(&mut storage, 0, Value::U64(i)).unwrap();
        }
        // Inserted in reverse at the front: expect 99..0.
        let values = collect(&array, &mut storage);
        for (offset, value) in values.iter().enumerate() {
            assert_eq!(*value, Value::U64(99 - offset as u64));
        }

        array.insert(&mut storage, 50, Value::Str("mid".into())).unwrap();
        assert_eq!(
            array.get(&mut storage, 50).unwrap(),
            Value::Str("mid".into())
        );
        assert_eq!(array.count(&mut storage).unwrap(), 101);
    }

    #[test]
    fn set_returns_previous_value() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..50u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        let old = array.set(&mut storage, 17, Value::Bool(true)).unwrap();
        assert_eq!(old, Value::U64(17));
        assert_eq!(array.get(&mut storage, 17).unwrap(), Value::Bool(true));
    }

    #[test]
    fn remove_until_empty_leaves_single_empty_root() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..300u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        assert!(storage.count() > 1);
        while array.count(&mut storage).unwrap() > 0 {
            let count = array.count(&mut storage).unwrap();
            array.remove(&mut storage, count / 2).unwrap();
        }
        assert_eq!(array.count(&mut storage).unwrap(), 0);
        // All structural slabs reclaimed; only the empty root remains.
        assert_eq!(storage.count(), 1);
        match storage.retrieve(array.slab_id()).unwrap().unwrap() {
            Slab::ArrayData(slab) => {
                assert!(slab.elements.is_empty());
                assert!(slab.next.is_undefined());
            }
            other => panic!("unexpected root kind {}", other.kind_name()),
        }
    }

    #[test]
    fn remove_returns_value_in_index_order() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..200u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        let removed = array.remove(&mut storage, 0).unwrap();
        assert_eq!(removed, Value::U64(0));
        assert_eq!(array.get(&mut storage, 0).unwrap(), Value::U64(1));
        assert_eq!(array.count(&mut storage).unwrap(), 199);
    }

    #[test]
    fn oversize_element_goes_external_and_reads_back() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        let big = Value::Bytes(vec![0xAB; 300]);
        array.append(&mut storage, big.clone()).unwrap();

        // The inline slot holds a handle.
        let root = storage.retrieve(array.slab_id()).unwrap().unwrap();
        match root {
            Slab::ArrayData(slab) => assert!(slab.elements[0].is_ref()),
            other => panic!("unexpected root kind {}", other.kind_name()),
        }
        // Reads dereference transparently.
        assert_eq!(array.get(&mut storage, 0).unwrap(), big);

        // Removal returns the payload and reclaims the external slab.
        let removed = array.remove(&mut storage, 0).unwrap();
        assert_eq!(removed, big);
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn iterate_stops_when_visitor_returns_false() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..50u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        let mut seen = 0u64;
        array
            .iterate(&mut storage, |_| {
                seen += 1;
                Ok(seen < 10)
            })
            .unwrap();
        assert_eq!(seen, 10);
    }

    #[test]
    fn iteration_matches_random_access() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..400u64 {
            array.append(&mut storage, Value::U64(i * 3)).unwrap();
        }
        let values = collect(&array, &mut storage);
        assert_eq!(values.len(), 400);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, array.get(&mut storage, i as u64).unwrap());
        }
    }

    #[test]
    fn pop_iterate_drains_and_resets() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..250u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        let mut popped = Vec::new();
        array
            .pop_iterate(&mut storage, |v| {
                popped.push(v);
                Ok(())
            })
            .unwrap();
        assert_eq!(popped.len(), 250);
        for (i, value) in popped.iter().enumerate() {
            assert_eq!(*value, Value::U64(i as u64));
        }
        assert_eq!(array.count(&mut storage).unwrap(), 0);
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn from_batch_matches_appends() {
        let mut storage = BasicSlabStorage::new();
        let values: Vec<Value> = (0..333u64).map(Value::U64).collect();
        let array = Array::from_batch(
            &mut storage,
            Address::from(0x42),
            TypeInfo(7),
            small_limits(),
            values.clone(),
        )
        .unwrap();
        assert_eq!(array.count(&mut storage).unwrap(), 333);
        assert_eq!(collect(&array, &mut storage), values);
        for i in [0u64, 1, 100, 332] {
            assert_eq!(array.get(&mut storage, i).unwrap(), Value::U64(i));
        }
    }

    #[test]
    fn from_batch_small_input_stays_single_slab() {
        let mut storage = BasicSlabStorage::new();
        let array = Array::from_batch(
            &mut storage,
            Address::from(0x42),
            TypeInfo(7),
            small_limits(),
            vec![Value::U64(1), Value::U64(2)],
        )
        .unwrap();
        assert_eq!(array.count(&mut storage).unwrap(), 2);
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn every_slab_reencodes_identically() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..400u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        array
            .append(&mut storage, Value::Bytes(vec![9; 300]))
            .unwrap();
        array
            .append(&mut storage, Value::Str("tail".into()))
            .unwrap();

        for (id, data) in storage.encode_all().unwrap() {
            let decoded = crate::slab::Slab::decode(
                id,
                &data,
                crate::value::decode_storable,
                crate::value::decode_type_info,
            )
            .unwrap();
            assert_eq!(decoded.encode().unwrap(), data, "slab {id} changed shape");
            assert_eq!(decoded.id(), id);
        }
    }

    #[test]
    fn open_rejects_non_root() {
        let mut storage = BasicSlabStorage::new();
        let mut array = test_array(&mut storage);
        for i in 0..300u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        // A leaf is not a root.
        let leaf = array.first_data_slab_id(&mut storage).unwrap();
        assert_ne!(leaf, array.slab_id());
        assert!(Array::open(&mut storage, leaf, small_limits()).is_err());
        // The real root opens fine.
        let reopened = Array::open(&mut storage, array.slab_id(), small_limits()).unwrap();
        assert_eq!(reopened.count(&mut storage).unwrap(), 300);
    }
}
