//! The slab cache layer: deltas + cache over a base byte store.
//!
//! All tree mutations land in an in-memory delta map; nothing touches the
//! base store until [`PersistentSlabStorage::commit`]. Dropping the deltas
//! aborts every uncommitted mutation, which is what makes arbitrary aborts
//! between commits safe.
//!
//! Commit is **at-least-once, not atomic**: base-store calls are issued in
//! strictly ascending (address, index) order, and an I/O failure mid-commit
//! leaves a prefix of writes applied with the delta map intact, so a retry
//! re-attempts the full set. Callers that need atomic commit must layer a
//! write-ahead log beneath the base store.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::ledger::BaseStorage;
use crate::slab::Slab;
use crate::value::{DecodeStorableFn, DecodeTypeInfoFn, decode_storable, decode_type_info};
use strata_error::{Result, StrataError};
use strata_types::{Address, SlabId, SlabIndex};

// ---------------------------------------------------------------------------
// SlabStore
// ---------------------------------------------------------------------------

/// Slab-level storage consumed by the tree engines.
pub trait SlabStore {
    /// Fetch a slab. Absence is `Ok(None)`.
    fn retrieve(&mut self, id: SlabId) -> Result<Option<&Slab>>;

    /// Record a slab under `id`, replacing any previous content.
    fn store(&mut self, id: SlabId, slab: Slab) -> Result<()>;

    /// Delete the slab under `id`.
    fn remove(&mut self, id: SlabId) -> Result<()>;

    /// Allocate a fresh handle under `address`.
    fn allocate(&mut self, address: Address) -> Result<SlabId>;

    /// Number of live slabs visible through this store.
    fn count(&self) -> usize;
}

/// Fetch a slab that must exist; absence is the fatal
/// [`StrataError::SlabNotFound`].
pub(crate) fn retrieve_expect<'a>(
    storage: &'a mut dyn SlabStore,
    id: SlabId,
) -> Result<&'a Slab> {
    storage
        .retrieve(id)?
        .ok_or(StrataError::SlabNotFound { id })
}

// ---------------------------------------------------------------------------
// BasicSlabStorage
// ---------------------------------------------------------------------------

/// Plain in-memory slab map with no persistence; unit-test scaffolding.
#[derive(Default)]
pub struct BasicSlabStorage {
    slabs: HashMap<SlabId, Slab>,
    indices: HashMap<Address, SlabIndex>,
}

impl BasicSlabStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all stored slabs, unordered.
    pub fn ids(&self) -> impl Iterator<Item = SlabId> + '_ {
        self.slabs.keys().copied()
    }

    /// Encode every stored slab, keyed by id.
    pub fn encode_all(&self) -> Result<HashMap<SlabId, Vec<u8>>> {
        self.slabs
            .iter()
            .map(|(id, slab)| Ok((*id, slab.encode()?)))
            .collect()
    }
}

impl SlabStore for BasicSlabStorage {
    fn retrieve(&mut self, id: SlabId) -> Result<Option<&Slab>> {
        Ok(self.slabs.get(&id))
    }

    fn store(&mut self, id: SlabId, slab: Slab) -> Result<()> {
        self.slabs.insert(id, slab);
        Ok(())
    }

    fn remove(&mut self, id: SlabId) -> Result<()> {
        self.slabs.remove(&id);
        Ok(())
    }

    fn allocate(&mut self, address: Address) -> Result<SlabId> {
        let entry = self.indices.entry(address).or_insert(SlabIndex::UNDEFINED);
        *entry = entry.next();
        Ok(SlabId::new(address, *entry))
    }

    fn count(&self) -> usize {
        self.slabs.len()
    }
}

// ---------------------------------------------------------------------------
// PersistentSlabStorage
// ---------------------------------------------------------------------------

/// The deltas/cache/base layering giving commit semantics to slab mutations.
///
/// - `deltas`: pending writes; `None` is a deletion tombstone.
/// - `cache`: read-through copy of committed slabs.
/// - temporary allocations (undefined address) are handed out from a local
///   counter and are never persisted; commit skips them.
pub struct PersistentSlabStorage<B: BaseStorage> {
    base: B,
    cache: HashMap<SlabId, Slab>,
    deltas: HashMap<SlabId, Option<Slab>>,
    temp_index: u64,
    auto_commit: bool,
    decode_storable: DecodeStorableFn,
    decode_type_info: DecodeTypeInfoFn,
}

impl<B: BaseStorage> PersistentSlabStorage<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            cache: HashMap::new(),
            deltas: HashMap::new(),
            temp_index: 0,
            auto_commit: false,
            decode_storable,
            decode_type_info,
        }
    }

    /// Install custom payload decode hooks.
    #[must_use]
    pub fn with_decoders(
        mut self,
        decode_storable: DecodeStorableFn,
        decode_type_info: DecodeTypeInfoFn,
    ) -> Self {
        self.decode_storable = decode_storable;
        self.decode_type_info = decode_type_info;
        self
    }

    /// Write through to the base store on every `store`/`remove`.
    ///
    /// This disables the abort-on-drop property; only for write-through
    /// callers that never roll back.
    #[must_use]
    pub fn with_auto_commit(mut self) -> Self {
        self.auto_commit = true;
        self
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    /// Number of pending deltas (tombstones included).
    #[must_use]
    pub fn delta_count(&self) -> usize {
        self.deltas.len()
    }

    /// Number of slabs in the read cache.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Evict the read cache. Subsequent reads decode from the base store.
    pub fn drop_cache(&mut self) {
        self.cache.clear();
    }

    /// Abort: discard every pending mutation.
    pub fn drop_deltas(&mut self) {
        self.deltas.clear();
    }

    /// Pending delta ids owned by real accounts, in commit order.
    fn sorted_owned_delta_ids(&self) -> Vec<SlabId> {
        let mut ids: Vec<SlabId> = self
            .deltas
            .keys()
            .filter(|id| !id.address.is_undefined())
            .copied()
            .collect();
        // SlabId orders by (address, index); this is the commit order the
        // replay/audit contract depends on.
        ids.sort_unstable();
        ids
    }

    fn finish_commit(&mut self, ids: &[SlabId]) {
        let temp_dropped = self.deltas.len() - ids.len();
        if temp_dropped > 0 {
            debug!(
                count = temp_dropped,
                "dropping uncommitted temporary-address deltas"
            );
        }
        for (id, entry) in self.deltas.drain() {
            if id.address.is_undefined() {
                continue;
            }
            match entry {
                Some(slab) => {
                    self.cache.insert(id, slab);
                }
                None => {
                    self.cache.remove(&id);
                }
            }
        }
    }

    /// Persist all pending deltas in ascending (address, index) order.
    ///
    /// At-least-once: on error, already-applied base calls are not rolled
    /// back and the delta map is left untouched for retry. On success the
    /// deltas move into the read cache. Temporary-address deltas are never
    /// persisted.
    pub fn commit(&mut self) -> Result<()> {
        let ids = self.sorted_owned_delta_ids();
        trace!(deltas = ids.len(), "commit start");
        for id in &ids {
            match self.deltas.get(id).and_then(Option::as_ref) {
                None => self.base.remove(*id)?,
                Some(slab) => {
                    let data = slab.encode()?;
                    self.base.store(*id, data)?;
                }
            }
        }
        self.finish_commit(&ids);
        trace!("commit done");
        Ok(())
    }

    /// [`Self::commit`] with slab encoding spread over `workers` threads.
    ///
    /// Only the encoding is parallel; base-store calls are issued by the
    /// caller thread in the same deterministic order as `commit`.
    pub fn fast_commit(&mut self, workers: usize) -> Result<()> {
        let ids = self.sorted_owned_delta_ids();
        if ids.len() < 2 || workers < 2 {
            return self.commit();
        }
        trace!(deltas = ids.len(), workers, "fast commit start");

        let jobs: Vec<Option<&Slab>> = ids
            .iter()
            .map(|id| self.deltas.get(id).and_then(Option::as_ref))
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| StrataError::storage(format!("encode pool: {e}")))?;
        let encoded: Result<Vec<Option<Vec<u8>>>> = pool.install(|| {
            jobs.par_iter()
                .map(|slab| slab.map(Slab::encode).transpose())
                .collect()
        });
        let encoded = encoded?;

        for (id, data) in ids.iter().zip(encoded) {
            match data {
                None => self.base.remove(*id)?,
                Some(data) => self.base.store(*id, data)?,
            }
        }
        self.finish_commit(&ids);
        trace!("fast commit done");
        Ok(())
    }
}

impl<B: BaseStorage> SlabStore for PersistentSlabStorage<B> {
    fn retrieve(&mut self, id: SlabId) -> Result<Option<&Slab>> {
        // Deltas first: a tombstone hides any older copy.
        if self.deltas.contains_key(&id) {
            return Ok(self.deltas.get(&id).and_then(Option::as_ref));
        }
        if !self.cache.contains_key(&id) {
            let Some(data) = self.base.retrieve(id)? else {
                return Ok(None);
            };
            let slab = Slab::decode(id, &data, self.decode_storable, self.decode_type_info)
                .inspect_err(|error| {
                    warn!(slab = %id, bytes = data.len(), %error, "stored slab failed to decode");
                })?;
            self.cache.insert(id, slab);
        }
        Ok(self.cache.get(&id))
    }

    fn store(&mut self, id: SlabId, slab: Slab) -> Result<()> {
        if self.auto_commit && !id.address.is_undefined() {
            let data = slab.encode()?;
            self.base.store(id, data)?;
            self.cache.insert(id, slab);
            return Ok(());
        }
        self.deltas.insert(id, Some(slab));
        Ok(())
    }

    fn remove(&mut self, id: SlabId) -> Result<()> {
        if self.auto_commit && !id.address.is_undefined() {
            self.base.remove(id)?;
            self.cache.remove(&id);
            return Ok(());
        }
        self.deltas.insert(id, None);
        Ok(())
    }

    fn allocate(&mut self, address: Address) -> Result<SlabId> {
        if address.is_undefined() {
            // Purely in-memory handle; never persisted.
            self.temp_index += 1;
            return Ok(SlabId::new(address, SlabIndex::from(self.temp_index)));
        }
        self.base.allocate(address)
    }

    fn count(&self) -> usize {
        let mut count = self.cache.len();
        for (id, entry) in &self.deltas {
            let cached = self.cache.contains_key(id);
            match (entry, cached) {
                (Some(_), false) => count += 1,
                (None, true) => count -= 1,
                _ => {}
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemBaseStorage;
    use crate::slab::StorableSlab;
    use crate::value::Value;

    fn storable(id: SlabId, v: u64) -> Slab {
        Slab::Storable(StorableSlab {
            id,
            value: Value::U64(v),
        })
    }

    fn value_of(slab: &Slab) -> u64 {
        match slab {
            Slab::Storable(StorableSlab {
                value: Value::U64(v),
                ..
            }) => *v,
            other => panic!("unexpected slab {}", other.kind_name()),
        }
    }

    #[test]
    fn deltas_hide_base_until_commit() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::new());
        let id = storage.allocate(Address::from(1)).unwrap();
        storage.store(id, storable(id, 7)).unwrap();

        assert_eq!(storage.base().segment_count(), 0);
        assert_eq!(value_of(storage.retrieve(id).unwrap().unwrap()), 7);

        storage.commit().unwrap();
        assert_eq!(storage.base().segment_count(), 1);
        assert_eq!(storage.delta_count(), 0);

        // Survives a cache drop by decoding from base.
        storage.drop_cache();
        assert_eq!(value_of(storage.retrieve(id).unwrap().unwrap()), 7);
    }

    #[test]
    fn drop_deltas_aborts_pending_mutations() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::new());
        let id = storage.allocate(Address::from(1)).unwrap();
        storage.store(id, storable(id, 1)).unwrap();
        storage.commit().unwrap();

        storage.store(id, storable(id, 2)).unwrap();
        storage.drop_deltas();
        assert_eq!(value_of(storage.retrieve(id).unwrap().unwrap()), 1);
    }

    #[test]
    fn tombstone_hides_cached_slab_and_commits_removal() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::new());
        let id = storage.allocate(Address::from(1)).unwrap();
        storage.store(id, storable(id, 1)).unwrap();
        storage.commit().unwrap();

        storage.remove(id).unwrap();
        assert!(storage.retrieve(id).unwrap().is_none());

        storage.commit().unwrap();
        assert_eq!(storage.base().segment_count(), 0);
        assert!(storage.retrieve(id).unwrap().is_none());
    }

    #[test]
    fn commit_order_is_address_then_index() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::recording());
        let a2 = storage.allocate(Address::from(2)).unwrap();
        let a1 = storage.allocate(Address::from(1)).unwrap();
        let a1b = storage.allocate(Address::from(1)).unwrap();
        // Store in scrambled order.
        storage.store(a2, storable(a2, 1)).unwrap();
        storage.store(a1b, storable(a1b, 2)).unwrap();
        storage.store(a1, storable(a1, 3)).unwrap();
        storage.commit().unwrap();

        let committed: Vec<SlabId> = storage
            .base()
            .ops()
            .iter()
            .map(|op| match op {
                crate::ledger::RecordedOp::Store(id, _) => *id,
                crate::ledger::RecordedOp::Remove(id) => *id,
            })
            .collect();
        assert_eq!(committed, vec![a1, a1b, a2]);
    }

    #[test]
    fn fast_commit_matches_commit_byte_for_byte() {
        let build = |storage: &mut PersistentSlabStorage<InMemBaseStorage>| {
            for i in 0..20u64 {
                let id = storage.allocate(Address::from(1 + i % 3)).unwrap();
                storage.store(id, storable(id, i)).unwrap();
            }
        };

        let mut slow = PersistentSlabStorage::new(InMemBaseStorage::recording());
        build(&mut slow);
        slow.commit().unwrap();

        let mut fast = PersistentSlabStorage::new(InMemBaseStorage::recording());
        build(&mut fast);
        fast.fast_commit(4).unwrap();

        assert_eq!(slow.base().ops(), fast.base().ops());
    }

    #[test]
    fn temporary_allocations_are_never_persisted() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::new());
        let temp = storage.allocate(Address::UNDEFINED).unwrap();
        assert!(temp.address.is_undefined());
        storage.store(temp, storable(temp, 9)).unwrap();

        storage.commit().unwrap();
        assert_eq!(storage.base().segment_count(), 0);
        // Dropped at commit, not kept in cache either.
        assert!(storage.retrieve(temp).unwrap().is_none());
    }

    #[test]
    fn auto_commit_writes_through() {
        let mut storage =
            PersistentSlabStorage::new(InMemBaseStorage::new()).with_auto_commit();
        let id = storage.allocate(Address::from(1)).unwrap();
        storage.store(id, storable(id, 5)).unwrap();
        assert_eq!(storage.base().segment_count(), 1);
        assert_eq!(storage.delta_count(), 0);
        storage.remove(id).unwrap();
        assert_eq!(storage.base().segment_count(), 0);
    }

    #[test]
    fn count_reflects_deltas_and_tombstones() {
        let mut storage = PersistentSlabStorage::new(InMemBaseStorage::new());
        let a = storage.allocate(Address::from(1)).unwrap();
        let b = storage.allocate(Address::from(1)).unwrap();
        storage.store(a, storable(a, 1)).unwrap();
        storage.store(b, storable(b, 2)).unwrap();
        storage.commit().unwrap();
        assert_eq!(storage.count(), 2);

        storage.remove(a).unwrap();
        assert_eq!(storage.count(), 1);
        let c = storage.allocate(Address::from(1)).unwrap();
        storage.store(c, storable(c, 3)).unwrap();
        assert_eq!(storage.count(), 2);
    }
}
