// rust/shard-cache/src/dataset/source.rs

//! Sharded raw-data sources consumed by the cache builder.
//!
//! A source is a fixed list of named shards. Each shard can be reopened at any
//! row, which is how an interrupted build resumes without re-reading what it
//! already committed.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::storage::StorageBackend;

use super::iterator::{ShardIterator, DEFAULT_READ_SIZE};
use super::sharding::calculate_shards;
use super::traits::{NewlineDelimitedFormat, RecordFormat, ShardSpec};

/// Blocking iterator over one shard's rows.
pub type ShardRows<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// A dataset split into independently readable shards.
///
/// Iteration is blocking; the cache builder drives it from
/// `spawn_blocking`.
pub trait ShardedDataSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Shard names in a stable order. The cache interleaves in this order.
    fn shard_names(&self) -> Vec<String>;

    /// Opens `shard` positioned at `row`. A row past the end yields nothing.
    ///
    /// # Errors
    ///
    /// `InvalidShard` for an unknown name, or any error opening the data.
    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<ShardRows<Self::Item>>;

    fn open_shard(&self, shard: &str) -> Result<ShardRows<Self::Item>> {
        self.open_shard_at_row(shard, 0)
    }

    /// Lazily applies `f` to every row.
    fn map<F, U>(self, f: F) -> MappedDataSource<Self, F>
    where
        Self: Sized,
        F: Fn(Self::Item) -> U + Send + Sync + 'static,
        U: Send + 'static,
    {
        MappedDataSource {
            inner: self,
            f: Arc::new(f),
        }
    }
}

/// Source returned by [`ShardedDataSource::map`].
pub struct MappedDataSource<S, F> {
    inner: S,
    f: Arc<F>,
}

impl<S, F, U> ShardedDataSource for MappedDataSource<S, F>
where
    S: ShardedDataSource,
    F: Fn(S::Item) -> U + Send + Sync + 'static,
    U: Send + 'static,
{
    type Item = U;

    fn shard_names(&self) -> Vec<String> {
        self.inner.shard_names()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<ShardRows<U>> {
        let rows = self.inner.open_shard_at_row(shard, row)?;
        let f = Arc::clone(&self.f);
        Ok(Box::new(rows.map(move |item| item.map(|v| f(v)))))
    }
}

/// Shards held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource<T> {
    shards: Vec<(String, Arc<Vec<T>>)>,
}

impl<T> InMemorySource<T> {
    pub fn new() -> Self {
        Self { shards: Vec::new() }
    }

    #[must_use]
    pub fn with_shard(mut self, name: impl Into<String>, rows: Vec<T>) -> Self {
        self.shards.push((name.into(), Arc::new(rows)));
        self
    }

    /// Splits `rows` into `num_shards` contiguous shards named `shard-<i>`.
    pub fn from_rows(rows: Vec<T>, num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        let per_shard = rows.len().div_ceil(num_shards).max(1);

        let mut source = Self::new();
        let mut rows = rows.into_iter().peekable();
        let mut idx = 0;
        while rows.peek().is_some() {
            let shard: Vec<T> = rows.by_ref().take(per_shard).collect();
            source = source.with_shard(format!("shard-{idx}"), shard);
            idx += 1;
        }
        source
    }
}

impl<T> Default for InMemorySource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ShardedDataSource for InMemorySource<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;

    fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|(name, _)| name.clone()).collect()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<ShardRows<T>> {
        let rows = self
            .shards
            .iter()
            .find(|(name, _)| name == shard)
            .map(|(_, rows)| Arc::clone(rows))
            .ok_or_else(|| CacheError::invalid_shard(shard, self.shards.len()))?;

        let start = usize::try_from(row).unwrap_or(usize::MAX).min(rows.len());
        Ok(Box::new(
            (start..rows.len()).map(move |i| Ok(rows[i].clone())),
        ))
    }
}

struct JsonlShard {
    name: String,
    path: PathBuf,
    spec: ShardSpec,
}

/// Newline-delimited JSON files, each split into byte-range shards.
///
/// Shards are named `<file>#<n>`. Blank lines are skipped and do not count
/// as rows.
pub struct JsonlFileSource<T> {
    storage: Arc<dyn StorageBackend>,
    shards: Vec<JsonlShard>,
    format: Arc<dyn RecordFormat>,
    read_size: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonlFileSource<T> {
    /// Computes shard boundaries for every file up front.
    ///
    /// # Errors
    ///
    /// Fails if any file cannot be opened or read.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        files: &[PathBuf],
        shards_per_file: u32,
    ) -> Result<Self> {
        let format: Arc<dyn RecordFormat> = Arc::new(NewlineDelimitedFormat::new());
        let mut shards = Vec::new();

        for path in files {
            let mut reader = storage.open_read(path)?;
            let specs = calculate_shards(reader.as_mut(), shards_per_file.max(1), format.as_ref())?;
            debug!(
                path = %path.display(),
                shards = specs.len(),
                bytes = reader.size(),
                "Sharded source file"
            );

            for spec in specs {
                shards.push(JsonlShard {
                    name: format!("{}#{}", path.display(), spec.shard_id),
                    path: path.clone(),
                    spec,
                });
            }
        }

        Ok(Self {
            storage,
            shards,
            format,
            read_size: DEFAULT_READ_SIZE,
            _item: PhantomData,
        })
    }

    #[must_use]
    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

impl<T> ShardedDataSource for JsonlFileSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<ShardRows<T>> {
        let entry = self
            .shards
            .iter()
            .find(|s| s.name == shard)
            .ok_or_else(|| CacheError::invalid_shard(shard, self.shards.len()))?;

        let reader = self.storage.open_read(&entry.path)?;
        let batches = ShardIterator::new(
            reader,
            entry.spec.clone(),
            Arc::clone(&self.format),
            self.read_size,
        );

        let rows = JsonlRows {
            batches,
            format: Arc::clone(&self.format),
            path: entry.path.clone(),
            pending: std::collections::VecDeque::new(),
            done: false,
            _item: PhantomData,
        };
        Ok(Box::new(rows.skip(usize::try_from(row).unwrap_or(usize::MAX))))
    }
}

/// Decodes the records of a shard one line at a time.
struct JsonlRows<T> {
    batches: ShardIterator,
    format: Arc<dyn RecordFormat>,
    path: PathBuf,
    pending: std::collections::VecDeque<Vec<u8>>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonlRows<T> {
    fn decode(path: &Path, line: &[u8]) -> Result<T> {
        serde_json::from_slice(line).map_err(|e| {
            CacheError::dataset(
                path.display().to_string(),
                format!("invalid JSON record: {e}"),
            )
        })
    }
}

impl<T: DeserializeOwned> Iterator for JsonlRows<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Self::decode(&self.path, &line));
            }
            if self.done {
                return None;
            }

            match self.batches.next_batch() {
                Ok(Some(batch)) => {
                    self.pending.extend(
                        self.format
                            .split_records(&batch.data)
                            .into_iter()
                            .map(<[u8]>::to_vec),
                    );
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
