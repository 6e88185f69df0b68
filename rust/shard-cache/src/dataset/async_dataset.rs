// rust/shard-cache/src/dataset/async_dataset.rs

//! The async random-access dataset contract and combinators over it.

use async_trait::async_trait;

use crate::error::{CacheError, Result};
use crate::permutation::{Permutation, PrngKey};

/// Length reported by datasets that never end.
pub const UNBOUNDED_LEN: u64 = u64::MAX;

/// A random-access dataset whose contents may still be arriving.
///
/// `get_batch` returns items in the order of `indices`; duplicates and
/// unsorted indices are allowed.
#[async_trait]
pub trait AsyncDataset: Send + Sync {
    type Item: Send;

    /// Waits until the final length is known and returns it.
    ///
    /// Unbounded datasets return [`UNBOUNDED_LEN`] immediately.
    async fn async_len(&self) -> Result<u64>;

    fn final_length_is_known(&self) -> bool;

    /// Best-effort number of items available right now.
    fn current_len(&self) -> Option<u64>;

    fn is_finite(&self) -> bool;

    /// Fetches `indices`, waiting for any that are not yet available.
    ///
    /// # Errors
    ///
    /// `OutOfRange` for an index at or beyond a final length.
    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<Self::Item>>;

    async fn get(&self, index: u64) -> Result<Self::Item> {
        self.get_batch(&[index])
            .await?
            .pop()
            .ok_or_else(|| CacheError::out_of_range(index, self.current_len().unwrap_or(0)))
    }
}

/// A shuffled view of a finite dataset.
///
/// Index `i` of the view reads `inner[p(i)]` for a fixed [`Permutation`] `p`.
pub struct PermutedDataset<D> {
    inner: D,
    permutation: Permutation,
}

impl<D: AsyncDataset> PermutedDataset<D> {
    /// Waits for the inner length, then fixes the permutation.
    ///
    /// # Errors
    ///
    /// Fails for unbounded or empty datasets.
    pub async fn new(inner: D, key: PrngKey) -> Result<Self> {
        if !inner.is_finite() {
            return Err(CacheError::dataset(
                "permuted",
                "cannot permute an unbounded dataset",
            ));
        }
        let length = inner.async_len().await?;
        let permutation = Permutation::new(length, key)?;
        Ok(Self { inner, permutation })
    }

    pub fn permutation(&self) -> &Permutation {
        &self.permutation
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

#[async_trait]
impl<D: AsyncDataset> AsyncDataset for PermutedDataset<D> {
    type Item = D::Item;

    async fn async_len(&self) -> Result<u64> {
        Ok(self.permutation.len())
    }

    fn final_length_is_known(&self) -> bool {
        true
    }

    fn current_len(&self) -> Option<u64> {
        Some(self.permutation.len())
    }

    fn is_finite(&self) -> bool {
        true
    }

    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<Self::Item>> {
        let mapped = self.permutation.apply_all(indices)?;
        self.inner.get_batch(&mapped).await
    }
}

/// Applies `f` to every item fetched from the inner dataset.
pub struct MappedDataset<D, F> {
    inner: D,
    f: F,
}

impl<D, F> MappedDataset<D, F> {
    pub fn new(inner: D, f: F) -> Self {
        Self { inner, f }
    }
}

#[async_trait]
impl<D, F, U> AsyncDataset for MappedDataset<D, F>
where
    D: AsyncDataset,
    F: Fn(D::Item) -> U + Send + Sync,
    U: Send,
{
    type Item = U;

    async fn async_len(&self) -> Result<u64> {
        self.inner.async_len().await
    }

    fn final_length_is_known(&self) -> bool {
        self.inner.final_length_is_known()
    }

    fn current_len(&self) -> Option<u64> {
        self.inner.current_len()
    }

    fn is_finite(&self) -> bool {
        self.inner.is_finite()
    }

    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<U>> {
        let items = self.inner.get_batch(indices).await?;
        Ok(items.into_iter().map(&self.f).collect())
    }
}

/// A fixed in-memory dataset. Mostly useful for tests and small tables.
#[derive(Debug, Clone)]
pub struct VecDataset<T> {
    items: Vec<T>,
}

impl<T> VecDataset<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> AsyncDataset for VecDataset<T> {
    type Item = T;

    async fn async_len(&self) -> Result<u64> {
        Ok(self.items.len() as u64)
    }

    fn final_length_is_known(&self) -> bool {
        true
    }

    fn current_len(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }

    fn is_finite(&self) -> bool {
        true
    }

    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<T>> {
        let length = self.items.len() as u64;
        indices
            .iter()
            .map(|&i| {
                usize::try_from(i)
                    .ok()
                    .and_then(|i| self.items.get(i))
                    .cloned()
                    .ok_or_else(|| CacheError::out_of_range(i, length))
            })
            .collect()
    }
}
