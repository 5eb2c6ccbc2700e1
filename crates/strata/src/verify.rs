//! Structural validators and slab-count statistics, consumed by the test
//! suites.
//!
//! The checks mirror the persisted invariants: slab fill bounds, cached
//! header counts and sizes against recomputation, child-header agreement,
//! leaf-chain ordering, and (for maps) digest consistency inside collision
//! groups. Violations surface as [`StrataError::SlabSizeInvalid`] with a
//! description of the failing slab.

use crate::array::{
    ARRAY_DATA_PREFIX_SIZE, ARRAY_META_CHILD_SIZE, ARRAY_META_PREFIX_SIZE, Array, ArraySlabHeader,
};
use crate::map::{
    INLINE_GROUP_PREFIX_SIZE, MAP_DATA_PREFIX_SIZE, MAP_META_CHILD_SIZE, MAP_META_PREFIX_SIZE,
    MapDataSlab, MapElement, MapElements, MapSlabHeader, OrderedMap,
};
use crate::slab::Slab;
use crate::storage::{SlabStore, retrieve_expect};
use crate::value::{HashInputFn, Value};
use strata_error::{Result, StrataError};
use strata_types::{Digest, SlabId, SlabLimits};

fn invalid(detail: String) -> StrataError {
    StrataError::SlabSizeInvalid { detail }
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

/// Slab-count statistics of an array tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayStats {
    pub levels: u64,
    pub element_count: u64,
    pub data_slab_count: u64,
    pub meta_slab_count: u64,
    pub storable_slab_count: u64,
}

/// Walk an array tree breadth-first and count slabs per kind.
pub fn array_stats(storage: &mut dyn SlabStore, array: &Array) -> Result<ArrayStats> {
    let mut stats = ArrayStats {
        element_count: array.count(storage)?,
        ..ArrayStats::default()
    };
    let mut level_ids = vec![array.slab_id()];
    while !level_ids.is_empty() {
        stats.levels += 1;
        let mut next_level = Vec::new();
        for id in level_ids {
            match retrieve_expect(storage, id)? {
                Slab::ArrayData(slab) => {
                    stats.data_slab_count += 1;
                    stats.storable_slab_count +=
                        slab.elements.iter().filter(|e| e.is_ref()).count() as u64;
                }
                Slab::ArrayMeta(slab) => {
                    stats.meta_slab_count += 1;
                    next_level.extend(slab.children.iter().map(|c| c.id));
                }
                other => {
                    return Err(invalid(format!(
                        "array tree contains a {} slab at {id}",
                        other.kind_name()
                    )));
                }
            }
        }
        level_ids = next_level;
    }
    Ok(stats)
}

/// Check every structural invariant of an array tree.
pub fn verify_array(storage: &mut dyn SlabStore, array: &Array) -> Result<()> {
    let limits = array.limits();
    let expected_count = array.count(storage)?;
    let mut leaves = Vec::new();
    let count = verify_array_slab(storage, array.slab_id(), limits, 0, &mut leaves)?;
    if count != expected_count {
        return Err(invalid(format!(
            "array root records {expected_count} elements, tree holds {count}"
        )));
    }
    verify_leaf_chain(storage, &leaves, |slab| match slab {
        Slab::ArrayData(s) => Ok(s.next),
        other => Err(invalid(format!(
            "array leaf chain contains {}",
            other.kind_name()
        ))),
    })
}

fn verify_array_slab(
    storage: &mut dyn SlabStore,
    id: SlabId,
    limits: SlabLimits,
    depth: usize,
    leaves: &mut Vec<SlabId>,
) -> Result<u64> {
    enum Node {
        Data {
            header: ArraySlabHeader,
            computed_size: u32,
            element_count: usize,
            has_extra: bool,
        },
        Meta {
            header: ArraySlabHeader,
            children: Vec<ArraySlabHeader>,
            has_extra: bool,
        },
    }

    let node = match retrieve_expect(storage, id)? {
        Slab::ArrayData(slab) => Node::Data {
            header: slab.header,
            computed_size: ARRAY_DATA_PREFIX_SIZE
                + slab.elements.iter().map(Value::byte_size).sum::<u32>(),
            element_count: slab.elements.len(),
            has_extra: slab.extra.is_some(),
        },
        Slab::ArrayMeta(slab) => Node::Meta {
            header: slab.header,
            children: slab.children.clone(),
            has_extra: slab.extra.is_some(),
        },
        other => {
            return Err(invalid(format!(
                "array tree contains a {} slab at {id}",
                other.kind_name()
            )));
        }
    };

    let root = depth == 0;
    match node {
        Node::Data {
            header,
            computed_size,
            element_count,
            has_extra,
        } => {
            if has_extra != root {
                return Err(invalid(format!("extra data misplaced on slab {id}")));
            }
            if header.count as usize != element_count {
                return Err(invalid(format!(
                    "data slab {id} records count {} but holds {element_count}",
                    header.count
                )));
            }
            if header.size != computed_size {
                return Err(invalid(format!(
                    "data slab {id} records size {} but encodes to {computed_size}",
                    header.size
                )));
            }
            verify_fill(id, header.size, element_count, root, limits)?;
            leaves.push(id);
            Ok(u64::from(header.count))
        }
        Node::Meta {
            header,
            children,
            has_extra,
        } => {
            if has_extra != root {
                return Err(invalid(format!("extra data misplaced on slab {id}")));
            }
            if children.len() < 2 {
                return Err(invalid(format!(
                    "meta slab {id} has {} children",
                    children.len()
                )));
            }
            let computed_size =
                ARRAY_META_PREFIX_SIZE + ARRAY_META_CHILD_SIZE * children.len() as u32;
            if header.size != computed_size {
                return Err(invalid(format!(
                    "meta slab {id} records size {} but encodes to {computed_size}",
                    header.size
                )));
            }
            if !root && (header.size < limits.min_threshold() || header.size > limits.max_threshold())
            {
                return Err(invalid(format!(
                    "meta slab {id} size {} outside [{}, {}]",
                    header.size,
                    limits.min_threshold(),
                    limits.max_threshold()
                )));
            }
            let mut sum = 0u64;
            for child in &children {
                let actual = verify_array_slab(storage, child.id, limits, depth + 1, leaves)?;
                if actual != u64::from(child.count) {
                    return Err(invalid(format!(
                        "meta slab {id} records child {} count {} but subtree holds {actual}",
                        child.id, child.count
                    )));
                }
                let actual_size = retrieve_expect(storage, child.id)?.byte_size();
                if actual_size != child.size {
                    return Err(invalid(format!(
                        "meta slab {id} records child {} size {} but slab is {actual_size}",
                        child.id, child.size
                    )));
                }
                sum += actual;
            }
            if sum != u64::from(header.count) {
                return Err(invalid(format!(
                    "meta slab {id} records count {} but children hold {sum}",
                    header.count
                )));
            }
            Ok(sum)
        }
    }
}

fn verify_fill(
    id: SlabId,
    size: u32,
    element_count: usize,
    root: bool,
    limits: SlabLimits,
) -> Result<()> {
    if root {
        return Ok(());
    }
    if size < limits.min_threshold() {
        return Err(invalid(format!(
            "data slab {id} size {size} under min threshold {}",
            limits.min_threshold()
        )));
    }
    // A single oversize element is the one legal overflow.
    if size > limits.max_threshold() && element_count > 1 {
        return Err(invalid(format!(
            "data slab {id} size {size} over max threshold {}",
            limits.max_threshold()
        )));
    }
    Ok(())
}

fn verify_leaf_chain(
    storage: &mut dyn SlabStore,
    leaves: &[SlabId],
    next_of: impl Fn(&Slab) -> Result<SlabId>,
) -> Result<()> {
    for (i, id) in leaves.iter().enumerate() {
        let next = next_of(retrieve_expect(storage, *id)?)?;
        let expected = leaves.get(i + 1).copied().unwrap_or(SlabId::UNDEFINED);
        if next != expected {
            return Err(invalid(format!(
                "leaf {id} links to {next}, expected {expected}"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Slab-count statistics of a map tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub levels: u64,
    pub element_count: u64,
    pub data_slab_count: u64,
    pub meta_slab_count: u64,
    pub collision_slab_count: u64,
    pub storable_slab_count: u64,
}

/// Walk a map tree breadth-first and count slabs per kind, descending into
/// external collision groups.
pub fn map_stats(storage: &mut dyn SlabStore, map: &OrderedMap) -> Result<MapStats> {
    let mut stats = MapStats {
        element_count: map.count(storage)?,
        ..MapStats::default()
    };
    let mut level_ids = vec![map.slab_id()];
    while !level_ids.is_empty() {
        stats.levels += 1;
        let mut next_level = Vec::new();
        for id in level_ids {
            match retrieve_expect(storage, id)? {
                Slab::MapData(slab) => {
                    if slab.collision_group {
                        stats.collision_slab_count += 1;
                    } else {
                        stats.data_slab_count += 1;
                    }
                    count_element_refs(&slab.elements.clone(), &mut stats, &mut next_level);
                }
                Slab::MapMeta(slab) => {
                    stats.meta_slab_count += 1;
                    next_level.extend(slab.children.iter().map(|c| c.id));
                }
                other => {
                    return Err(invalid(format!(
                        "map tree contains a {} slab at {id}",
                        other.kind_name()
                    )));
                }
            }
        }
        level_ids = next_level;
    }
    Ok(stats)
}

fn count_element_refs(elements: &MapElements, stats: &mut MapStats, frontier: &mut Vec<SlabId>) {
    match elements {
        MapElements::Hashed(h) => {
            for element in &h.elements {
                match element {
                    MapElement::Single { key, value } => {
                        stats.storable_slab_count +=
                            u64::from(key.is_ref()) + u64::from(value.is_ref());
                    }
                    MapElement::InlineGroup(group) => {
                        count_element_refs(group, stats, frontier);
                    }
                    MapElement::ExternalGroup(id) => frontier.push(*id),
                }
            }
        }
        MapElements::List(l) => {
            for (key, value) in &l.entries {
                stats.storable_slab_count += u64::from(key.is_ref()) + u64::from(value.is_ref());
            }
        }
    }
}

/// Check every structural invariant of a map tree, including digest
/// consistency of collision groups under the map's own digester.
pub fn verify_map(
    storage: &mut dyn SlabStore,
    map: &OrderedMap,
    hash_input: HashInputFn,
) -> Result<()> {
    let limits = map.limits();
    let expected_count = map.count(storage)?;
    let mut leaves = Vec::new();
    let count = verify_map_slab(storage, map, map.slab_id(), limits, 0, &mut leaves)?;
    if count != expected_count {
        return Err(invalid(format!(
            "map root records {expected_count} entries, tree holds {count}"
        )));
    }
    verify_leaf_first_keys(storage, &leaves)?;
    verify_leaf_chain(storage, &leaves, |slab| match slab {
        Slab::MapData(s) => Ok(s.next),
        other => Err(invalid(format!(
            "map leaf chain contains {}",
            other.kind_name()
        ))),
    })?;
    verify_map_digests(storage, map, hash_input)
}

fn verify_map_slab(
    storage: &mut dyn SlabStore,
    map: &OrderedMap,
    id: SlabId,
    limits: SlabLimits,
    depth: usize,
    leaves: &mut Vec<SlabId>,
) -> Result<u64> {
    let root = depth == 0;
    enum Node {
        Data(MapDataSlab),
        Meta {
            header: MapSlabHeader,
            children: Vec<MapSlabHeader>,
            has_extra: bool,
        },
    }
    let node = match retrieve_expect(storage, id)? {
        Slab::MapData(slab) => Node::Data(slab.clone()),
        Slab::MapMeta(slab) => Node::Meta {
            header: slab.header,
            children: slab.children.clone(),
            has_extra: slab.extra.is_some(),
        },
        other => {
            return Err(invalid(format!(
                "map tree contains a {} slab at {id}",
                other.kind_name()
            )));
        }
    };

    match node {
        Node::Data(slab) => {
            if slab.extra.is_some() != root {
                return Err(invalid(format!("extra data misplaced on slab {id}")));
            }
            if slab.collision_group {
                return Err(invalid(format!(
                    "collision group slab {id} linked into the spine"
                )));
            }
            verify_elements(storage, &slab.elements, 0, limits)?;
            let computed = MAP_DATA_PREFIX_SIZE + slab.elements.recomputed_size();
            if slab.header.size != computed {
                return Err(invalid(format!(
                    "data slab {id} records size {} but encodes to {computed}",
                    slab.header.size
                )));
            }
            if !root {
                if slab.header.size < limits.min_threshold() {
                    return Err(invalid(format!(
                        "data slab {id} size {} under min threshold {}",
                        slab.header.size,
                        limits.min_threshold()
                    )));
                }
                if slab.header.size > limits.max_threshold() && slab.elements.slot_count() > 1 {
                    return Err(invalid(format!(
                        "data slab {id} size {} over max threshold {}",
                        slab.header.size,
                        limits.max_threshold()
                    )));
                }
            }
            leaves.push(id);
            count_entries(storage, &slab.elements)
        }
        Node::Meta {
            header,
            children,
            has_extra,
        } => {
            if has_extra != root {
                return Err(invalid(format!("extra data misplaced on slab {id}")));
            }
            if children.len() < 2 {
                return Err(invalid(format!(
                    "meta slab {id} has {} children",
                    children.len()
                )));
            }
            let computed = MAP_META_PREFIX_SIZE + MAP_META_CHILD_SIZE * children.len() as u32;
            if header.size != computed {
                return Err(invalid(format!(
                    "meta slab {id} records size {} but encodes to {computed}",
                    header.size
                )));
            }
            let mut previous: Option<Digest> = None;
            let mut sum = 0u64;
            for child in &children {
                if previous.is_some_and(|p| p > child.first_key) {
                    return Err(invalid(format!(
                        "meta slab {id} children not ordered by first hkey"
                    )));
                }
                previous = Some(child.first_key);
                let actual_size = retrieve_expect(storage, child.id)?.byte_size();
                if actual_size != child.size {
                    return Err(invalid(format!(
                        "meta slab {id} records child {} size {} but slab is {actual_size}",
                        child.id, child.size
                    )));
                }
                sum += verify_map_slab(storage, map, child.id, limits, depth + 1, leaves)?;
            }
            Ok(sum)
        }
    }
}

/// Structural checks on one element set: level agreement, hkey ordering,
/// cached sizes, and nested group shape.
fn verify_elements(
    storage: &mut dyn SlabStore,
    elements: &MapElements,
    level: u8,
    limits: SlabLimits,
) -> Result<()> {
    match elements {
        MapElements::Hashed(h) => {
            if h.level != level {
                return Err(StrataError::DigestLevelMismatch {
                    got: h.level,
                    expected: level,
                });
            }
            if h.hkeys.len() != h.elements.len() {
                return Err(invalid(format!(
                    "{} hkeys but {} elements at level {level}",
                    h.hkeys.len(),
                    h.elements.len()
                )));
            }
            for window in h.hkeys.windows(2) {
                if window[0] >= window[1] {
                    return Err(invalid(format!("hkeys out of order at level {level}")));
                }
            }
            for element in &h.elements {
                match element {
                    MapElement::Single { .. } => {}
                    MapElement::InlineGroup(group) => {
                        if count_entries(storage, group)? < 2 {
                            return Err(invalid(format!(
                                "inline collision group at level {} holds fewer than 2 entries",
                                level + 1
                            )));
                        }
                        // The promotion bound applies only to groups held
                        // directly by a spine slab.
                        if h.level == 0
                            && INLINE_GROUP_PREFIX_SIZE + group.size()
                                > limits.max_inline_element_size()
                        {
                            return Err(invalid(format!(
                                "inline collision group at level {} exceeds the promotion bound",
                                level + 1
                            )));
                        }
                        verify_elements(storage, group, level + 1, limits)?;
                    }
                    MapElement::ExternalGroup(group_id) => {
                        let group = match retrieve_expect(storage, *group_id)? {
                            Slab::MapData(slab) if slab.collision_group => slab.clone(),
                            _ => {
                                return Err(StrataError::WrongSlabType {
                                    id: *group_id,
                                    expected: "collision group",
                                });
                            }
                        };
                        let computed = MAP_DATA_PREFIX_SIZE + group.elements.recomputed_size();
                        if group.header.size != computed {
                            return Err(invalid(format!(
                                "collision slab {group_id} records size {} but encodes to {computed}",
                                group.header.size
                            )));
                        }
                        verify_elements(storage, &group.elements, level + 1, limits)?;
                    }
                }
            }
            let recomputed = elements.recomputed_size();
            if recomputed != elements.size() {
                return Err(invalid(format!(
                    "cached element size {} disagrees with recomputation {recomputed} at level {level}",
                    elements.size()
                )));
            }
            Ok(())
        }
        MapElements::List(l) => {
            if l.level != level {
                return Err(StrataError::DigestLevelMismatch {
                    got: l.level,
                    expected: level,
                });
            }
            let recomputed = elements.recomputed_size();
            if recomputed != elements.size() {
                return Err(invalid(format!(
                    "cached list size {} disagrees with recomputation {recomputed}",
                    elements.size()
                )));
            }
            Ok(())
        }
    }
}

/// Count user entries, descending through external collision groups.
fn count_entries(storage: &mut dyn SlabStore, elements: &MapElements) -> Result<u64> {
    let mut total = 0u64;
    let mut externals = Vec::new();
    match elements {
        MapElements::Hashed(h) => {
            for element in &h.elements {
                match element {
                    MapElement::Single { .. } => total += 1,
                    MapElement::InlineGroup(group) => total += group.inline_entry_count(),
                    MapElement::ExternalGroup(id) => externals.push(*id),
                }
            }
        }
        MapElements::List(l) => total += l.entries.len() as u64,
    }
    for id in externals {
        let group = match retrieve_expect(storage, id)? {
            Slab::MapData(slab) if slab.collision_group => slab.elements.clone(),
            _ => {
                return Err(StrataError::WrongSlabType {
                    id,
                    expected: "collision group",
                });
            }
        };
        total += count_entries(storage, &group)?;
    }
    Ok(total)
}

fn verify_leaf_first_keys(storage: &mut dyn SlabStore, leaves: &[SlabId]) -> Result<()> {
    let mut previous: Option<Digest> = None;
    for id in leaves {
        let first = match retrieve_expect(storage, *id)? {
            Slab::MapData(slab) => slab.elements.first_hkey(),
            other => {
                return Err(invalid(format!(
                    "map leaf chain contains {}",
                    other.kind_name()
                )));
            }
        };
        if let (Some(p), Some(f)) = (previous, first) {
            if p >= f {
                return Err(invalid(format!("leaf {id} first hkey out of order")));
            }
        }
        if first.is_some() {
            previous = first;
        }
    }
    Ok(())
}

/// Every stored key must digest, under the map's own builder, to the hkeys
/// recorded along its path.
fn verify_map_digests(
    storage: &mut dyn SlabStore,
    map: &OrderedMap,
    hash_input: HashInputFn,
) -> Result<()> {
    let mut frontier = vec![map.slab_id()];
    while let Some(id) = frontier.pop() {
        let elements = match retrieve_expect(storage, id)? {
            Slab::MapData(slab) => slab.elements.clone(),
            Slab::MapMeta(slab) => {
                frontier.extend(slab.children.iter().map(|c| c.id));
                continue;
            }
            other => {
                return Err(invalid(format!(
                    "map tree contains a {} slab at {id}",
                    other.kind_name()
                )));
            }
        };
        verify_digests_in_elements(storage, map, &elements, hash_input, &mut frontier)?;
    }
    Ok(())
}

fn verify_digests_in_elements(
    storage: &mut dyn SlabStore,
    map: &OrderedMap,
    elements: &MapElements,
    hash_input: HashInputFn,
    frontier: &mut Vec<SlabId>,
) -> Result<()> {
    let MapElements::Hashed(h) = elements else {
        // List mode carries no hkeys to check.
        return Ok(());
    };
    for (hkey, element) in h.hkeys.iter().zip(&h.elements) {
        match element {
            MapElement::Single { key, .. } => {
                let mut scratch = Vec::new();
                hash_input(key, &mut scratch)?;
                let mut digester = map.digester_builder().digest(&scratch)?;
                let expected = digester.digest(h.level)?;
                digester.recycle();
                if expected != *hkey {
                    return Err(invalid(format!(
                        "key {key:?} digests to {expected} at level {}, slab records {hkey}",
                        h.level
                    )));
                }
            }
            MapElement::InlineGroup(group) => {
                verify_digests_in_elements(storage, map, group, hash_input, frontier)?;
            }
            MapElement::ExternalGroup(id) => frontier.push(*id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BasicSlabStorage;
    use crate::value::{default_compare, default_hash_input};
    use strata_types::{Address, TypeInfo};

    use proptest::prelude::*;

    fn limits() -> SlabLimits {
        SlabLimits::new(128)
    }

    #[test]
    fn fresh_array_verifies() {
        let mut storage = BasicSlabStorage::new();
        let array = Array::new(&mut storage, Address::from(1), TypeInfo(0), limits()).unwrap();
        verify_array(&mut storage, &array).unwrap();
        let stats = array_stats(&mut storage, &array).unwrap();
        assert_eq!(stats.data_slab_count, 1);
        assert_eq!(stats.meta_slab_count, 0);
        assert_eq!(stats.levels, 1);
    }

    #[test]
    fn grown_array_verifies_and_counts() {
        let mut storage = BasicSlabStorage::new();
        let mut array = Array::new(&mut storage, Address::from(1), TypeInfo(0), limits()).unwrap();
        for i in 0..1_000u64 {
            array.append(&mut storage, crate::value::Value::U64(i)).unwrap();
        }
        verify_array(&mut storage, &array).unwrap();
        let stats = array_stats(&mut storage, &array).unwrap();
        assert_eq!(stats.element_count, 1_000);
        assert!(stats.meta_slab_count >= 1);
        assert!(stats.levels >= 2);
        assert_eq!(
            (stats.data_slab_count + stats.meta_slab_count) as usize,
            storage.count()
        );
    }

    #[test]
    fn grown_map_verifies() {
        let mut storage = BasicSlabStorage::new();
        let mut map =
            OrderedMap::new(&mut storage, Address::from(1), TypeInfo(0), limits()).unwrap();
        for i in 0..1_000u64 {
            map.set(
                &mut storage,
                default_compare,
                default_hash_input,
                crate::value::Value::U64(i),
                crate::value::Value::U64(i),
            )
            .unwrap();
        }
        verify_map(&mut storage, &map, default_hash_input).unwrap();
        let stats = map_stats(&mut storage, &map).unwrap();
        assert_eq!(stats.element_count, 1_000);
        assert!(stats.meta_slab_count >= 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Arbitrary insert/remove sequences keep every array invariant.
        #[test]
        fn array_random_ops_hold_invariants(ops in proptest::collection::vec(0u8..3, 1..200)) {
            let mut storage = BasicSlabStorage::new();
            let mut array =
                Array::new(&mut storage, Address::from(1), TypeInfo(0), limits()).unwrap();
            let mut model: Vec<u64> = Vec::new();
            let mut counter = 0u64;
            for op in ops {
                match op {
                    0 => {
                        array.append(&mut storage, crate::value::Value::U64(counter)).unwrap();
                        model.push(counter);
                        counter += 1;
                    }
                    1 => {
                        let index = model.len() as u64 / 2;
                        array
                            .insert(&mut storage, index, crate::value::Value::U64(counter))
                            .unwrap();
                        model.insert(index as usize, counter);
                        counter += 1;
                    }
                    _ => {
                        if !model.is_empty() {
                            let index = model.len() as u64 - 1;
                            let removed = array.remove(&mut storage, index).unwrap();
                            prop_assert_eq!(
                                removed,
                                crate::value::Value::U64(model.remove(index as usize))
                            );
                        }
                    }
                }
            }
            verify_array(&mut storage, &array).unwrap();
            prop_assert_eq!(array.count(&mut storage).unwrap(), model.len() as u64);
            for (i, expected) in model.iter().enumerate() {
                prop_assert_eq!(
                    array.get(&mut storage, i as u64).unwrap(),
                    crate::value::Value::U64(*expected)
                );
            }
        }

        /// Arbitrary set/remove sequences keep every map invariant.
        #[test]
        fn map_random_ops_hold_invariants(ops in proptest::collection::vec((0u8..2, 0u64..64), 1..150)) {
            let mut storage = BasicSlabStorage::new();
            let mut map =
                OrderedMap::new(&mut storage, Address::from(1), TypeInfo(0), limits()).unwrap();
            let mut model = std::collections::BTreeMap::new();
            for (op, k) in ops {
                let key = crate::value::Value::U64(k);
                if op == 0 {
                    map.set(
                        &mut storage,
                        default_compare,
                        default_hash_input,
                        key,
                        crate::value::Value::U64(k * 10),
                    )
                    .unwrap();
                    model.insert(k, k * 10);
                } else if model.remove(&k).is_some() {
                    map.remove(&mut storage, default_compare, default_hash_input, &key)
                        .unwrap();
                }
            }
            verify_map(&mut storage, &map, default_hash_input).unwrap();
            prop_assert_eq!(map.count(&mut storage).unwrap(), model.len() as u64);
            for (k, v) in model {
                prop_assert_eq!(
                    map.get(
                        &mut storage,
                        default_compare,
                        default_hash_input,
                        &crate::value::Value::U64(k)
                    )
                    .unwrap(),
                    crate::value::Value::U64(v)
                );
            }
        }
    }
}
