// rust/shard-cache/src/permutation.rs

//! Stateless pseudo-random permutations of `[0, length)`.
//!
//! A [`Permutation`] is the affine map `p(x) = (a * x + b) mod length` with
//! `gcd(a, length) == 1`, which makes it a bijection. It needs O(1) memory and
//! O(1) work per index regardless of dataset size. It is not a strong
//! pseudo-random permutation, only one that is cheap and reproducible.
//!
//! Randomness is threaded explicitly through [`PrngKey`] values: every draw
//! consumes a key and splitting a key yields two fresh, independent keys.
//!
//! # Example
//!
//! ```
//! use shard_cache::permutation::{Permutation, PrngKey};
//!
//! let perm = Permutation::new(10, PrngKey::new(0)).unwrap();
//! let shuffled = perm.apply_all(&(0u64..10).collect::<Vec<_>>()).unwrap();
//!
//! let mut sorted = shuffled.clone();
//! sorted.sort_unstable();
//! assert_eq!(sorted, (0u64..10).collect::<Vec<_>>());
//! assert!(perm.apply(10u64).is_err());
//! ```

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// An explicit random key. Keys are consumed by draws and split to derive new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Returns the raw seed value of this key.
    pub fn seed(&self) -> u64 {
        self.0
    }

    /// Derives two independent keys from this one.
    pub fn split(self) -> (PrngKey, PrngKey) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        // Skip the stream used by `randint` so a split child never equals a draw.
        rng.set_stream(1);
        (PrngKey(rng.next_u64()), PrngKey(rng.next_u64()))
    }

    /// Draws a uniform integer from `[lo, hi)`.
    ///
    /// An empty range yields `lo`.
    pub fn randint(self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        rng.gen_range(lo..hi)
    }
}

impl From<u64> for PrngKey {
    fn from(seed: u64) -> Self {
        Self::new(seed)
    }
}

/// Integer types that can be used as permutation indices.
///
/// Conversions are lossless: values that do not fit in `u64` (negative ones)
/// are reported by `to_index` returning `None`.
pub trait PermutationIndex: Copy {
    fn to_index(self) -> Option<u64>;
    fn from_index(index: u64) -> Self;
    fn as_wide(self) -> i128;
}

macro_rules! impl_permutation_index {
    ($($t:ty),*) => {
        $(
            impl PermutationIndex for $t {
                fn to_index(self) -> Option<u64> {
                    u64::try_from(self).ok()
                }

                // Only called on results < length, where length came from a
                // value of the same type via `check_bounds`.
                fn from_index(index: u64) -> Self {
                    index as $t
                }

                fn as_wide(self) -> i128 {
                    self as i128
                }
            }
        )*
    };
}

impl_permutation_index!(u32, u64, usize, i32, i64);

/// A pseudo-random permutation `p(x) = (a * x + b) mod length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permutation {
    length: u64,
    a: u64,
    b: u64,
}

impl Permutation {
    /// Builds the permutation of `[0, length)` determined by `key`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `length` is zero.
    pub fn new(length: u64, key: PrngKey) -> Result<Self> {
        if length == 0 {
            return Err(CacheError::config("permutation length must be positive"));
        }

        let (a_key, b_key) = key.split();
        let mut a = a_key.randint(1, length);
        let b = b_key.randint(0, length);

        // gcd(a, 1) == 1 for every a, so length 1 never enters the loop.
        let mut key = a_key;
        while gcd(a, length) != 1 {
            let (this_key, next_key) = key.split();
            a = this_key.randint(1, length);
            key = next_key;
        }

        Ok(Self { length, a, b })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The multiplier `a`; always invertible modulo `len()`.
    pub fn multiplier(&self) -> u64 {
        self.a
    }

    /// The additive offset `b`.
    pub fn offset(&self) -> u64 {
        self.b
    }

    /// Verifies that every index lies in `[0, length)`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` naming the first offending index.
    pub fn check_bounds<I: PermutationIndex>(&self, indices: &[I]) -> Result<()> {
        for &index in indices {
            match index.to_index() {
                Some(i) if i < self.length => {}
                _ => return Err(CacheError::out_of_range(index.as_wide(), self.length)),
            }
        }
        Ok(())
    }

    /// Maps one index.
    pub fn apply<I: PermutationIndex>(&self, index: I) -> Result<I> {
        self.check_bounds(std::slice::from_ref(&index))?;
        Ok(self.map_unchecked(index))
    }

    /// Maps a sequence of indices, preserving order and length.
    ///
    /// Nothing is computed unless every index is in bounds.
    pub fn apply_all<I: PermutationIndex>(&self, indices: &[I]) -> Result<Vec<I>> {
        self.check_bounds(indices)?;
        Ok(indices.iter().map(|&i| self.map_unchecked(i)).collect())
    }

    fn map_unchecked<I: PermutationIndex>(&self, index: I) -> I {
        let x = index.to_index().unwrap_or_default() as u128;
        let mapped = (self.a as u128 * x + self.b as u128) % self.length as u128;
        I::from_index(mapped as u64)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
