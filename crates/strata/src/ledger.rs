//! The base byte store: raw slab persistence keyed by handle.
//!
//! [`BaseStorage`] is the only seam the cache layer writes through. The
//! production implementation is [`LedgerBaseStorage`], an adapter over an
//! account [`Ledger`]; [`InMemBaseStorage`] backs tests and records its call
//! sequence so commit determinism can be asserted byte for byte.

use std::collections::{BTreeMap, HashMap};

use strata_error::{Result, StrataError};
use strata_types::{Address, SlabId, SlabIndex};

/// Prefix byte of every slab key in the ledger namespace.
pub const SLAB_KEY_PREFIX: u8 = b'$';

/// Ledger key for a slab: `"$" || index_bytes`, 9 bytes.
#[must_use]
pub fn slab_key(index: SlabIndex) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = SLAB_KEY_PREFIX;
    key[1..].copy_from_slice(&index.0);
    key
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Account-scoped key/value persistence consumed by [`LedgerBaseStorage`].
///
/// Setting an empty value is equivalent to deletion.
pub trait Ledger {
    fn get_value(&self, owner: Address, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set_value(&mut self, owner: Address, key: &[u8], value: &[u8]) -> Result<()>;
    fn value_exists(&self, owner: Address, key: &[u8]) -> Result<bool>;
    fn allocate_index(&mut self, owner: Address) -> Result<SlabIndex>;
}

/// Raw byte persistence for slabs, keyed by handle.
///
/// The interface does not interpret bytes. Absence is `Ok(None)`, never an
/// error; I/O faults surface as [`StrataError::StorageFailed`].
pub trait BaseStorage {
    fn retrieve(&mut self, id: SlabId) -> Result<Option<Vec<u8>>>;
    fn store(&mut self, id: SlabId, data: Vec<u8>) -> Result<()>;
    fn remove(&mut self, id: SlabId) -> Result<()>;
    /// Allocate a fresh handle under `address`; per-address indices are
    /// strictly monotone.
    fn allocate(&mut self, address: Address) -> Result<SlabId>;
}

// ---------------------------------------------------------------------------
// LedgerBaseStorage
// ---------------------------------------------------------------------------

/// [`BaseStorage`] over an account ledger. Removal writes an empty value.
pub struct LedgerBaseStorage<L: Ledger> {
    ledger: L,
    bytes_retrieved: usize,
    bytes_stored: usize,
}

impl<L: Ledger> LedgerBaseStorage<L> {
    pub fn new(ledger: L) -> Self {
        Self {
            ledger,
            bytes_retrieved: 0,
            bytes_stored: 0,
        }
    }

    #[must_use]
    pub fn bytes_retrieved(&self) -> usize {
        self.bytes_retrieved
    }

    #[must_use]
    pub fn bytes_stored(&self) -> usize {
        self.bytes_stored
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }
}

impl<L: Ledger> BaseStorage for LedgerBaseStorage<L> {
    fn retrieve(&mut self, id: SlabId) -> Result<Option<Vec<u8>>> {
        let value = self.ledger.get_value(id.address, &slab_key(id.index))?;
        // An empty value is a deletion marker in the ledger model.
        let value = value.filter(|v| !v.is_empty());
        if let Some(data) = &value {
            self.bytes_retrieved += data.len();
        }
        Ok(value)
    }

    fn store(&mut self, id: SlabId, data: Vec<u8>) -> Result<()> {
        self.bytes_stored += data.len();
        self.ledger.set_value(id.address, &slab_key(id.index), &data)
    }

    fn remove(&mut self, id: SlabId) -> Result<()> {
        self.ledger.set_value(id.address, &slab_key(id.index), &[])
    }

    fn allocate(&mut self, address: Address) -> Result<SlabId> {
        let index = self.ledger.allocate_index(address)?;
        Ok(SlabId::new(address, index))
    }
}

// ---------------------------------------------------------------------------
// InMemBaseStorage
// ---------------------------------------------------------------------------

/// One recorded base-store mutation, for determinism assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Store(SlabId, Vec<u8>),
    Remove(SlabId),
}

/// In-memory [`BaseStorage`] with usage accounting, for tests.
#[derive(Default)]
pub struct InMemBaseStorage {
    segments: BTreeMap<SlabId, Vec<u8>>,
    indices: HashMap<Address, SlabIndex>,
    bytes_retrieved: usize,
    bytes_stored: usize,
    recording: bool,
    ops: Vec<RecordedOp>,
}

impl InMemBaseStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every `store`/`remove` call for later inspection.
    #[must_use]
    pub fn recording() -> Self {
        Self {
            recording: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn total_size(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn bytes_retrieved(&self) -> usize {
        self.bytes_retrieved
    }

    #[must_use]
    pub fn bytes_stored(&self) -> usize {
        self.bytes_stored
    }

    /// The recorded mutation sequence, in call order.
    #[must_use]
    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    /// Ids of all stored segments, in (address, index) order.
    pub fn ids(&self) -> impl Iterator<Item = SlabId> + '_ {
        self.segments.keys().copied()
    }
}

impl BaseStorage for InMemBaseStorage {
    fn retrieve(&mut self, id: SlabId) -> Result<Option<Vec<u8>>> {
        let segment = self.segments.get(&id).cloned();
        if let Some(data) = &segment {
            self.bytes_retrieved += data.len();
        }
        Ok(segment)
    }

    fn store(&mut self, id: SlabId, data: Vec<u8>) -> Result<()> {
        self.bytes_stored += data.len();
        if self.recording {
            self.ops.push(RecordedOp::Store(id, data.clone()));
        }
        self.segments.insert(id, data);
        Ok(())
    }

    fn remove(&mut self, id: SlabId) -> Result<()> {
        if self.recording {
            self.ops.push(RecordedOp::Remove(id));
        }
        self.segments.remove(&id);
        Ok(())
    }

    fn allocate(&mut self, address: Address) -> Result<SlabId> {
        if address.is_undefined() {
            return Err(StrataError::storage(
                "cannot allocate a persistent index under the undefined address",
            ));
        }
        let entry = self.indices.entry(address).or_insert(SlabIndex::UNDEFINED);
        *entry = entry.next();
        Ok(SlabId::new(address, *entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ledger over nested maps, mirroring how an embedder's account
    /// store would look.
    #[derive(Default)]
    struct MemLedger {
        values: HashMap<(Address, Vec<u8>), Vec<u8>>,
        indices: HashMap<Address, SlabIndex>,
    }

    impl Ledger for MemLedger {
        fn get_value(&self, owner: Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.values.get(&(owner, key.to_vec())).cloned())
        }

        fn set_value(&mut self, owner: Address, key: &[u8], value: &[u8]) -> Result<()> {
            if value.is_empty() {
                self.values.remove(&(owner, key.to_vec()));
            } else {
                self.values.insert((owner, key.to_vec()), value.to_vec());
            }
            Ok(())
        }

        fn value_exists(&self, owner: Address, key: &[u8]) -> Result<bool> {
            Ok(self.values.contains_key(&(owner, key.to_vec())))
        }

        fn allocate_index(&mut self, owner: Address) -> Result<SlabIndex> {
            let entry = self.indices.entry(owner).or_insert(SlabIndex::UNDEFINED);
            *entry = entry.next();
            Ok(*entry)
        }
    }

    #[test]
    fn slab_key_layout() {
        let key = slab_key(SlabIndex::from(0x0102));
        assert_eq!(key[0], b'$');
        assert_eq!(key.len(), 9);
        assert_eq!(u64::from_be_bytes(key[1..].try_into().unwrap()), 0x0102);
    }

    #[test]
    fn ledger_storage_roundtrip_and_remove() {
        let mut storage = LedgerBaseStorage::new(MemLedger::default());
        let owner = Address::from(0xEE);
        let id = storage.allocate(owner).unwrap();
        assert_eq!(id.address, owner);
        assert_eq!(id.index.as_u64(), 1);

        storage.store(id, b"slab bytes".to_vec()).unwrap();
        assert_eq!(storage.retrieve(id).unwrap().unwrap(), b"slab bytes");

        // Empty write is deletion.
        storage.remove(id).unwrap();
        assert_eq!(storage.retrieve(id).unwrap(), None);
        assert!(
            !storage
                .ledger()
                .value_exists(owner, &slab_key(id.index))
                .unwrap()
        );
    }

    #[test]
    fn ledger_allocation_is_monotone_per_address() {
        let mut storage = LedgerBaseStorage::new(MemLedger::default());
        let a = Address::from(1);
        let b = Address::from(2);
        let first = storage.allocate(a).unwrap();
        let second = storage.allocate(a).unwrap();
        let other = storage.allocate(b).unwrap();
        assert!(second.index.as_u64() > first.index.as_u64());
        assert_eq!(other.index.as_u64(), 1);
    }

    #[test]
    fn in_mem_storage_accounting() {
        let mut storage = InMemBaseStorage::new();
        let id = storage.allocate(Address::from(9)).unwrap();
        storage.store(id, vec![0u8; 100]).unwrap();
        assert_eq!(storage.segment_count(), 1);
        assert_eq!(storage.total_size(), 100);
        assert_eq!(storage.bytes_stored(), 100);
        storage.retrieve(id).unwrap();
        assert_eq!(storage.bytes_retrieved(), 100);
        storage.remove(id).unwrap();
        assert_eq!(storage.segment_count(), 0);
        assert_eq!(storage.retrieve(id).unwrap(), None);
    }

    #[test]
    fn in_mem_storage_records_ops_in_order() {
        let mut storage = InMemBaseStorage::recording();
        let id = storage.allocate(Address::from(9)).unwrap();
        storage.store(id, vec![1, 2]).unwrap();
        storage.remove(id).unwrap();
        assert_eq!(
            storage.ops(),
            &[
                RecordedOp::Store(id, vec![1, 2]),
                RecordedOp::Remove(id),
            ]
        );
    }

    #[test]
    fn undefined_address_allocation_is_refused() {
        let mut storage = InMemBaseStorage::new();
        assert!(storage.allocate(Address::UNDEFINED).is_err());
    }
}
