//! End-to-end scenarios over the persistent storage stack: every tree here
//! runs through `PersistentSlabStorage` and an in-memory base store, with
//! commits, cache drops, and reloads in the loop.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use strata::verify::{map_stats, verify_array, verify_map};
use strata::{
    Address, Array, BasicSlabStorage, Digest, Digester, DigesterBuilder, InMemBaseStorage,
    OrderedMap, PersistentSlabStorage, Result, SlabLimits, SlabStore, TypeInfo, Value,
    default_compare, default_hash_input,
};

fn persistent() -> PersistentSlabStorage<InMemBaseStorage> {
    PersistentSlabStorage::new(InMemBaseStorage::new())
}

fn recording() -> PersistentSlabStorage<InMemBaseStorage> {
    PersistentSlabStorage::new(InMemBaseStorage::recording())
}

const OWNER: Address = Address([0, 0, 0, 0, 0, 0, 0, 0x2A]);

// ---------------------------------------------------------------------------
// S1: array append/get at scale, across a commit and cache drop
// ---------------------------------------------------------------------------

#[test]
fn s1_array_append_get_across_commit() {
    const N: u64 = 1_000_000;
    let mut storage = persistent();
    let mut array =
        Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::default()).unwrap();
    for i in 0..N {
        array.append(&mut storage, Value::U64(i)).unwrap();
    }
    assert_eq!(array.count(&mut storage).unwrap(), N);
    assert_eq!(array.get(&mut storage, 123_456).unwrap(), Value::U64(123_456));

    storage.commit().unwrap();
    storage.drop_cache();

    let reopened = Array::open(&mut storage, array.slab_id(), SlabLimits::default()).unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), N);
    assert_eq!(
        reopened.get(&mut storage, 123_456).unwrap(),
        Value::U64(123_456)
    );
}

// ---------------------------------------------------------------------------
// S2: array stays balanced while shrinking to empty
// ---------------------------------------------------------------------------

#[test]
fn s2_array_remove_balance() {
    const N: u64 = 100_000;
    let mut rng = StdRng::seed_from_u64(0xA11CE);
    let mut storage = persistent();
    let mut array =
        Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::default()).unwrap();
    for _ in 0..N {
        array.append(&mut storage, Value::U64(rng.next_u64())).unwrap();
    }
    verify_array(&mut storage, &array).unwrap();

    let mut remaining = N;
    while remaining > 0 {
        let index = rng.random_range(0..remaining);
        array.remove(&mut storage, index).unwrap();
        remaining -= 1;
        // Full validation every step is quadratic at this scale; validate
        // on a stride and continuously through the final stretch.
        if remaining % 2_048 == 0 || remaining < 256 {
            verify_array(&mut storage, &array).unwrap();
        }
    }

    assert_eq!(array.count(&mut storage).unwrap(), 0);
    storage.commit().unwrap();
    assert_eq!(storage.base().segment_count(), 1);
}

// ---------------------------------------------------------------------------
// S3: map with unique string keys; digest-ordered iteration
// ---------------------------------------------------------------------------

fn random_key(rng: &mut StdRng) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..16)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[test]
fn s3_map_set_get_unique_keys() {
    const N: u64 = 65_536;
    let mut rng = StdRng::seed_from_u64(0xBEE5);
    let mut storage = persistent();
    let mut map =
        OrderedMap::new(&mut storage, OWNER, TypeInfo(2), SlabLimits::default()).unwrap();

    let mut keys = Vec::with_capacity(N as usize);
    let mut seen = std::collections::HashSet::new();
    while keys.len() < N as usize {
        let key = random_key(&mut rng);
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    for (i, key) in keys.iter().enumerate() {
        let old = map
            .set(
                &mut storage,
                default_compare,
                default_hash_input,
                Value::Str(key.clone()),
                Value::U64(i as u64),
            )
            .unwrap();
        assert!(old.is_none());
    }
    assert_eq!(map.count(&mut storage).unwrap(), N);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(
            map.get(
                &mut storage,
                default_compare,
                default_hash_input,
                &Value::Str(key.clone())
            )
            .unwrap(),
            Value::U64(i as u64)
        );
    }

    // Iteration yields every entry, ordered by the level-0 digest.
    let (k0, k1) = map.seed();
    let mut builder = strata::Xxh3Sha256DigesterBuilder::new();
    builder.set_seed(k0, k1);
    let mut previous: Option<Digest> = None;
    let mut yielded = 0u64;
    map.iterate_keys(&mut storage, |key| {
        let mut scratch = Vec::new();
        default_hash_input(&key, &mut scratch)?;
        let mut digester = builder.digest(&scratch)?;
        let hkey = digester.digest(0)?;
        digester.recycle();
        if let Some(p) = previous {
            assert!(p <= hkey, "iteration left digest order");
        }
        previous = Some(hkey);
        yielded += 1;
        Ok(true)
    })
    .unwrap();
    assert_eq!(yielded, N);

    verify_map(&mut storage, &map, default_hash_input).unwrap();
}

// ---------------------------------------------------------------------------
// S4: deterministic collisions through a stub digester
// ---------------------------------------------------------------------------

/// Cycles keys over eight distinct 4-tuples; keys mapping to the same
/// tuple collide at every digest level and end up in list mode.
struct CyclingBuilder;

struct CyclingDigester {
    digests: [Digest; 4],
}

impl DigesterBuilder for CyclingBuilder {
    fn set_seed(&mut self, _k0: u64, _k1: u64) {}

    fn digest(&self, msg: &[u8]) -> Result<Box<dyn Digester>> {
        // Keys are u64 values; the payload is the trailing 8 bytes.
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&msg[msg.len() - 8..]);
        let tuple = u64::from_be_bytes(raw) % 8;
        Ok(Box::new(CyclingDigester {
            digests: [
                Digest(tuple),
                Digest(tuple.wrapping_mul(1_000_003)),
                Digest(tuple.wrapping_mul(998_244_353)),
                Digest(tuple.wrapping_mul(179_424_673)),
            ],
        }))
    }
}

impl Digester for CyclingDigester {
    fn digest(&mut self, level: u8) -> Result<Digest> {
        Ok(self
            .digests
            .get(level as usize)
            .copied()
            .unwrap_or(Digest(0)))
    }

    fn levels(&self) -> u8 {
        4
    }

    fn reset(&mut self) {}
}

#[test]
fn s4_map_deterministic_collisions() {
    const N: u64 = 2_048;
    let mut storage = persistent();
    let mut map = OrderedMap::new_with_digester_builder(
        &mut storage,
        OWNER,
        TypeInfo(2),
        SlabLimits::default(),
        Box::new(CyclingBuilder),
    )
    .unwrap();
    for i in 0..N {
        map.set(
            &mut storage,
            default_compare,
            default_hash_input,
            Value::U64(i),
            Value::U64(i * 7),
        )
        .unwrap();
    }
    assert_eq!(map.count(&mut storage).unwrap(), N);
    for i in 0..N {
        assert_eq!(
            map.get(
                &mut storage,
                default_compare,
                default_hash_input,
                &Value::U64(i)
            )
            .unwrap(),
            Value::U64(i * 7)
        );
    }

    // One collision slab per distinct 4-tuple, and nothing unaccounted.
    let stats = map_stats(&mut storage, &map).unwrap();
    assert_eq!(stats.collision_slab_count, 8);
    assert_eq!(
        storage.count() as u64,
        stats.data_slab_count + stats.meta_slab_count + stats.collision_slab_count
    );
}

// ---------------------------------------------------------------------------
// S5: oversize value lives in its own storable slab
// ---------------------------------------------------------------------------

#[test]
fn s5_map_overflow_value() {
    let limits = SlabLimits::new(512);
    let mut storage = persistent();
    let mut map = OrderedMap::new(&mut storage, OWNER, TypeInfo(2), limits).unwrap();
    let large = Value::Bytes(vec![0xCD; 600]);
    map.set(
        &mut storage,
        default_compare,
        default_hash_input,
        Value::Str("large".into()),
        large.clone(),
    )
    .unwrap();

    // The root slab's flag byte records the external reference, and the
    // payload sits in a storable slab of its own.
    storage.commit().unwrap();
    storage.drop_cache();
    let root_id = {
        let ids: Vec<_> = storage.base().ids().collect();
        assert_eq!(ids.len(), 2, "expected root + storable slab");
        ids.into_iter()
            .find(|id| *id == map.slab_id())
            .expect("root slab persisted")
    };
    let reopened = OrderedMap::open(&mut storage, root_id, limits).unwrap();
    assert_eq!(
        reopened.get(
            &mut storage,
            default_compare,
            default_hash_input,
            &Value::Str("large".into())
        )
        .unwrap(),
        large
    );
}

// ---------------------------------------------------------------------------
// S6: identical operations produce identical base-store call sequences
// ---------------------------------------------------------------------------

#[test]
fn s6_commit_determinism() {
    let run = |fast: bool| {
        let mut storage = recording();
        let mut array =
            Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::default()).unwrap();
        for i in 0..10_000u64 {
            array.append(&mut storage, Value::U64(i)).unwrap();
        }
        for i in 0..1_000u64 {
            array.remove(&mut storage, i * 3).unwrap();
        }
        if fast {
            storage.fast_commit(4).unwrap();
        } else {
            storage.commit().unwrap();
        }
        storage
    };
    let slow = run(false);
    let fast = run(true);
    assert!(!slow.base().ops().is_empty());
    assert_eq!(slow.base().ops(), fast.base().ops());
}

// ---------------------------------------------------------------------------
// Cross-cutting: random-access equivalence and batch parity
// ---------------------------------------------------------------------------

#[test]
fn array_random_access_matches_iteration() {
    let mut storage = persistent();
    let mut array =
        Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::new(256)).unwrap();
    for i in 0..5_000u64 {
        array.append(&mut storage, Value::U64(i * 13)).unwrap();
    }
    let mut values = Vec::new();
    array
        .iterate(&mut storage, |value| {
            values.push(value);
            Ok(true)
        })
        .unwrap();
    for (i, value) in values.iter().enumerate() {
        assert_eq!(*value, array.get(&mut storage, i as u64).unwrap());
    }
}

#[test]
fn from_batch_survives_commit_and_reload() {
    let mut storage = persistent();
    let values: Vec<Value> = (0..20_000u64).map(Value::U64).collect();
    let array = Array::from_batch(
        &mut storage,
        OWNER,
        TypeInfo(1),
        SlabLimits::default(),
        values.clone(),
    )
    .unwrap();
    verify_array(&mut storage, &array).unwrap();
    storage.commit().unwrap();
    storage.drop_cache();

    let reopened = Array::open(&mut storage, array.slab_id(), SlabLimits::default()).unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), 20_000);
    assert_eq!(reopened.get(&mut storage, 19_999).unwrap(), Value::U64(19_999));
    verify_array(&mut storage, &reopened).unwrap();
}

#[test]
fn map_survives_commit_reload_and_drain() {
    let mut storage = persistent();
    let mut map =
        OrderedMap::new(&mut storage, OWNER, TypeInfo(2), SlabLimits::new(512)).unwrap();
    for i in 0..4_000u64 {
        map.set(
            &mut storage,
            default_compare,
            default_hash_input,
            Value::Str(format!("entry-{i}")),
            Value::U64(i),
        )
        .unwrap();
    }
    storage.commit().unwrap();
    storage.drop_cache();

    let mut reopened = OrderedMap::open(&mut storage, map.slab_id(), SlabLimits::new(512)).unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), 4_000);
    verify_map(&mut storage, &reopened, default_hash_input).unwrap();

    let mut drained = 0u64;
    reopened
        .pop_iterate(&mut storage, |_, _| {
            drained += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(drained, 4_000);
    storage.commit().unwrap();
    assert_eq!(storage.base().segment_count(), 1);
}

#[test]
fn abort_by_dropping_deltas_restores_committed_state() {
    let mut storage = persistent();
    let mut array =
        Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::default()).unwrap();
    for i in 0..1_000u64 {
        array.append(&mut storage, Value::U64(i)).unwrap();
    }
    storage.commit().unwrap();

    // Uncommitted mutations vanish with the deltas.
    for _ in 0..500 {
        array.remove(&mut storage, 0).unwrap();
    }
    storage.drop_deltas();

    let reopened = Array::open(&mut storage, array.slab_id(), SlabLimits::default()).unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), 1_000);
    assert_eq!(reopened.get(&mut storage, 0).unwrap(), Value::U64(0));
    verify_array(&mut storage, &reopened).unwrap();
}

// ---------------------------------------------------------------------------
// Ledger seam: a file-per-key ledger behind the full stack
// ---------------------------------------------------------------------------

/// Toy ledger persisting each `(owner, key)` as a file, enough to prove the
/// byte-store seam carries a real backend.
struct FsLedger {
    root: std::path::PathBuf,
    indices: std::collections::HashMap<Address, strata::SlabIndex>,
}

impl FsLedger {
    fn path_for(&self, owner: Address, key: &[u8]) -> std::path::PathBuf {
        let mut name = format!("{:016x}-", owner.as_u64());
        for byte in key {
            name.push_str(&format!("{byte:02x}"));
        }
        self.root.join(name)
    }
}

impl strata::Ledger for FsLedger {
    fn get_value(&self, owner: Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(owner, key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(strata::StrataError::storage(e.to_string())),
        }
    }

    fn set_value(&mut self, owner: Address, key: &[u8], value: &[u8]) -> Result<()> {
        let path = self.path_for(owner, key);
        if value.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(strata::StrataError::storage(e.to_string())),
            }
        } else {
            std::fs::write(&path, value).map_err(|e| strata::StrataError::storage(e.to_string()))
        }
    }

    fn value_exists(&self, owner: Address, key: &[u8]) -> Result<bool> {
        Ok(self.path_for(owner, key).exists())
    }

    fn allocate_index(&mut self, owner: Address) -> Result<strata::SlabIndex> {
        let entry = self
            .indices
            .entry(owner)
            .or_insert(strata::SlabIndex::UNDEFINED);
        *entry = entry.next();
        Ok(*entry)
    }
}

#[test]
fn file_backed_ledger_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FsLedger {
        root: dir.path().to_path_buf(),
        indices: std::collections::HashMap::new(),
    };
    let mut storage =
        PersistentSlabStorage::new(strata::LedgerBaseStorage::new(ledger));
    let mut array =
        Array::new(&mut storage, OWNER, TypeInfo(1), SlabLimits::default()).unwrap();
    for i in 0..2_000u64 {
        array.append(&mut storage, Value::U64(i)).unwrap();
    }
    storage.commit().unwrap();
    storage.drop_cache();

    let reopened = Array::open(&mut storage, array.slab_id(), SlabLimits::default()).unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), 2_000);
    assert_eq!(reopened.get(&mut storage, 1_234).unwrap(), Value::U64(1_234));

    // Shrinking below a slab boundary deletes ledger entries on commit.
    let mut reopened = reopened;
    for _ in 0..1_500 {
        reopened.remove(&mut storage, 0).unwrap();
    }
    storage.commit().unwrap();
    assert_eq!(reopened.count(&mut storage).unwrap(), 500);
}

#[test]
fn basic_and_persistent_storage_agree() {
    let mut basic = BasicSlabStorage::new();
    let mut persistent = persistent();
    let mut a = Array::new(&mut basic, OWNER, TypeInfo(1), SlabLimits::new(256)).unwrap();
    let mut b = Array::new(&mut persistent, OWNER, TypeInfo(1), SlabLimits::new(256)).unwrap();
    for i in 0..2_000u64 {
        a.append(&mut basic, Value::U64(i)).unwrap();
        b.append(&mut persistent, Value::U64(i)).unwrap();
    }
    for i in (0..2_000u64).step_by(97) {
        assert_eq!(
            a.get(&mut basic, i).unwrap(),
            b.get(&mut persistent, i).unwrap()
        );
    }
}
