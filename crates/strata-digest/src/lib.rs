//! Staged, lazily computed multi-level hashing for the Map engine.
//!
//! A Map key is digested at up to [`DIGEST_LEVELS`] levels:
//!
//! - Level 0: a fast seeded xxh3-64 over the key's canonical bytes. This is
//!   the hkey ordering the top of every Map tree.
//! - Levels 1–3: three 64-bit words drawn from a single SHA-256 of the same
//!   bytes, computed lazily on the first request above level 0 and memoized.
//!   Collision groups descend one level per nesting depth.
//! - Level ≥ 4: a zero sentinel. The Map switches the collision group into
//!   an insertion-ordered list, which terminates regardless of how
//!   pathological the collisions are.
//!
//! Builders work over the canonical hash-input bytes, not over user values;
//! the engine applies its `hash_input` callback before calling
//! [`DigesterBuilder::digest`]. This keeps the crate value-model agnostic
//! and makes deterministic test stubs trivial.
//!
//! Digesters are pool-allocated. [`Digester::recycle`] returns an instance
//! to a process-wide free list; reuse is an optimization, not a correctness
//! requirement.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use strata_error::{Result, StrataError};
use strata_types::Digest;
use xxhash_rust::xxh3::Xxh3;

/// Number of real digest levels; level `DIGEST_LEVELS` and above are the
/// list-mode sentinel.
pub const DIGEST_LEVELS: u8 = 4;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A digester computes the staged digests of one key.
pub trait Digester: Send {
    /// The digest at `level`. Levels at or above [`Digester::levels`] return
    /// the zero sentinel that switches collision groups into list mode.
    fn digest(&mut self, level: u8) -> Result<Digest>;

    /// The digests at levels `0..level`. Requesting a prefix beyond
    /// [`Digester::levels`] is a [`StrataError::DigestLevelMismatch`].
    fn digest_prefix(&mut self, level: u8) -> Result<Vec<Digest>> {
        if level > self.levels() {
            return Err(StrataError::DigestLevelMismatch {
                got: level,
                expected: self.levels(),
            });
        }
        (0..level).map(|l| self.digest(l)).collect()
    }

    /// Number of real digest levels (fixed at [`DIGEST_LEVELS`] for the
    /// default digester).
    fn levels(&self) -> u8;

    /// Clear instance state for reuse.
    fn reset(&mut self);

    /// Return the instance to its pool, if it has one. The default
    /// implementation just drops it.
    fn recycle(self: Box<Self>) {}
}

/// Builds digesters for one tree's seed.
pub trait DigesterBuilder {
    /// Install the tree's seed pair. The seed comes from the Map root's
    /// extra data and must not change across commits.
    fn set_seed(&mut self, k0: u64, k1: u64);

    /// Build a digester over the canonical hash-input bytes of a key.
    fn digest(&self, msg: &[u8]) -> Result<Box<dyn Digester>>;
}

// ---------------------------------------------------------------------------
// Default implementation
// ---------------------------------------------------------------------------

/// The default digester: seeded xxh3 at level 0, SHA-256 words at levels 1–3.
#[derive(Default)]
pub struct Xxh3Sha256Digester {
    k0: u64,
    k1: u64,
    level0: u64,
    crypto: Option<[u64; 3]>,
    msg: Vec<u8>,
}

impl Xxh3Sha256Digester {
    fn prime(&mut self, k0: u64, k1: u64, msg: &[u8]) {
        self.k0 = k0;
        self.k1 = k1;
        self.msg.clear();
        self.msg.extend_from_slice(msg);
        self.crypto = None;

        let mut hasher = Xxh3::with_seed(k0);
        hasher.update(&k1.to_be_bytes());
        hasher.update(msg);
        self.level0 = hasher.digest();
    }

    fn crypto_words(&mut self) -> [u64; 3] {
        if let Some(words) = self.crypto {
            return words;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.k0.to_be_bytes());
        hasher.update(self.k1.to_be_bytes());
        hasher.update(&self.msg);
        let sum = hasher.finalize();
        let word = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&sum[i * 8..i * 8 + 8]);
            u64::from_be_bytes(bytes)
        };
        let words = [word(0), word(1), word(2)];
        self.crypto = Some(words);
        words
    }
}

impl Digester for Xxh3Sha256Digester {
    fn digest(&mut self, level: u8) -> Result<Digest> {
        match level {
            0 => Ok(Digest(self.level0)),
            1..=3 => Ok(Digest(self.crypto_words()[level as usize - 1])),
            // List-mode sentinel.
            _ => Ok(Digest(0)),
        }
    }

    fn levels(&self) -> u8 {
        DIGEST_LEVELS
    }

    fn reset(&mut self) {
        self.k0 = 0;
        self.k1 = 0;
        self.level0 = 0;
        self.crypto = None;
        self.msg.clear();
    }

    fn recycle(mut self: Box<Self>) {
        self.reset();
        let mut pool = DIGESTER_POOL.lock();
        if pool.len() < POOL_CAP {
            pool.push(*self);
        }
    }
}

/// Builder for [`Xxh3Sha256Digester`]; one per tree, seeded from the root.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Sha256DigesterBuilder {
    k0: u64,
    k1: u64,
}

impl Xxh3Sha256DigesterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DigesterBuilder for Xxh3Sha256DigesterBuilder {
    fn set_seed(&mut self, k0: u64, k1: u64) {
        self.k0 = k0;
        self.k1 = k1;
    }

    fn digest(&self, msg: &[u8]) -> Result<Box<dyn Digester>> {
        if self.k0 == 0 && self.k1 == 0 {
            return Err(StrataError::HashSeedUninitialized);
        }
        let mut digester = acquire();
        digester.prime(self.k0, self.k1, msg);
        Ok(Box::new(digester))
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

const POOL_CAP: usize = 64;

static DIGESTER_POOL: Mutex<Vec<Xxh3Sha256Digester>> = Mutex::new(Vec::new());

fn acquire() -> Xxh3Sha256Digester {
    DIGESTER_POOL.lock().pop().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_builder() -> Xxh3Sha256DigesterBuilder {
        let mut builder = Xxh3Sha256DigesterBuilder::new();
        builder.set_seed(0x1234_5678_9ABC_DEF0, 0x0FED_CBA9_8765_4321);
        builder
    }

    #[test]
    fn zero_seed_pair_is_rejected() {
        let builder = Xxh3Sha256DigesterBuilder::new();
        assert!(matches!(
            builder.digest(b"key"),
            Err(StrataError::HashSeedUninitialized)
        ));
    }

    #[test]
    fn digests_are_deterministic() {
        let builder = seeded_builder();
        let mut a = builder.digest(b"hello").unwrap();
        let mut b = builder.digest(b"hello").unwrap();
        for level in 0..DIGEST_LEVELS {
            assert_eq!(a.digest(level).unwrap(), b.digest(level).unwrap());
        }
    }

    #[test]
    fn distinct_seeds_change_level0() {
        let mut b1 = Xxh3Sha256DigesterBuilder::new();
        b1.set_seed(1, 2);
        let mut b2 = Xxh3Sha256DigesterBuilder::new();
        b2.set_seed(3, 4);
        let d1 = b1.digest(b"k").unwrap().digest(0).unwrap();
        let d2 = b2.digest(b"k").unwrap().digest(0).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn level_four_is_zero_sentinel() {
        let mut digester = seeded_builder().digest(b"k").unwrap();
        assert_eq!(digester.digest(4).unwrap(), Digest(0));
        assert_eq!(digester.digest(200).unwrap(), Digest(0));
    }

    #[test]
    fn prefix_returns_leading_levels() {
        let mut digester = seeded_builder().digest(b"k").unwrap();
        let prefix = digester.digest_prefix(3).unwrap();
        assert_eq!(prefix.len(), 3);
        for (level, digest) in prefix.iter().enumerate() {
            assert_eq!(*digest, digester.digest(level as u8).unwrap());
        }
        assert!(digester.digest_prefix(0).unwrap().is_empty());
    }

    #[test]
    fn prefix_beyond_levels_errors() {
        let mut digester = seeded_builder().digest(b"k").unwrap();
        assert!(matches!(
            digester.digest_prefix(5),
            Err(StrataError::DigestLevelMismatch { got: 5, expected: 4 })
        ));
    }

    #[test]
    fn crypto_levels_are_memoized_and_stable() {
        let mut digester = seeded_builder().digest(b"stable").unwrap();
        let first = digester.digest(2).unwrap();
        let second = digester.digest(2).unwrap();
        assert_eq!(first, second);
        // Level 1..3 come from one 256-bit hash; they differ in general.
        let l1 = digester.digest(1).unwrap();
        let l3 = digester.digest(3).unwrap();
        assert_ne!(l1, l3);
    }

    #[test]
    fn recycle_then_rebuild_matches_fresh() {
        let builder = seeded_builder();
        let mut fresh = builder.digest(b"again").unwrap();
        let expected = fresh.digest(1).unwrap();
        fresh.recycle();

        let mut reused = builder.digest(b"again").unwrap();
        assert_eq!(reused.digest(1).unwrap(), expected);
        reused.recycle();
    }
}
