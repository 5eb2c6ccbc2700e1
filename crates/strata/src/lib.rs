//! Persistent, content-addressed slab collections.
//!
//! Two on-disk collections — a scalable ordered sequence ([`Array`]) and a
//! scalable ordered mapping ([`OrderedMap`]) — implemented as shallow
//! B+-tree-like structures whose nodes ("slabs") are independently
//! serialized blobs identified by opaque 16-byte handles and persisted
//! through a pluggable byte store (the "ledger").
//!
//! The layering, bottom up:
//!
//! - [`ledger`]: the raw byte store ([`BaseStorage`]) and its ledger-backed
//!   adapter.
//! - [`codec`]: the self-describing binary slab framing.
//! - [`storage`]: the delta/cache layer ([`PersistentSlabStorage`]) that
//!   gives mutations abort-on-drop semantics and a deterministic commit.
//! - [`array`] / [`map`]: the tree engines and their public facades.
//!
//! A collection instance and its storage are single-writer; see the crate
//! documentation on [`PersistentSlabStorage::commit`] for the at-least-once
//! commit contract.

#![forbid(unsafe_code)]

pub mod array;
pub mod codec;
pub mod ledger;
pub mod map;
pub mod slab;
pub mod storage;
pub mod value;
pub mod verify;

pub use array::{Array, ArrayIterator};
pub use ledger::{BaseStorage, InMemBaseStorage, Ledger, LedgerBaseStorage};
pub use map::{MapIterator, OrderedMap};
pub use slab::{Slab, StorableSlab};
pub use storage::{BasicSlabStorage, PersistentSlabStorage, SlabStore};
pub use value::{
    HashInputFn, KeyCompareFn, Value, default_compare, default_hash_input,
};

pub use strata_digest::{DIGEST_LEVELS, Digester, DigesterBuilder, Xxh3Sha256DigesterBuilder};
pub use strata_error::{Result, StrataError};
pub use strata_types::{Address, Digest, SLAB_ID_SIZE, SlabId, SlabIndex, SlabLimits, TypeInfo};
