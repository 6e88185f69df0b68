// rust/shard-cache/src/dataset/processor.rs

//! Batch processors turn raw source items into cached records.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Batch size used when a processor does not ask for one.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Compute resources a processor expects per running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHints {
    pub num_cpus: usize,
    pub num_gpus: usize,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_gpus: 0,
        }
    }
}

impl ResourceHints {
    /// Number of batches that may be processed concurrently on this host.
    ///
    /// GPU-bound processors run one batch at a time. CPU-bound processors get
    /// as many slots as the host has cores for them, capped by `max_workers`.
    pub fn worker_count(&self, available_cores: usize, max_workers: usize) -> usize {
        let max_workers = max_workers.max(1);
        if self.num_gpus > 0 {
            return 1;
        }
        (available_cores / self.num_cpus.max(1)).clamp(1, max_workers)
    }
}

/// Converts batches of source items into output records.
///
/// `process` runs on the blocking thread pool and must return exactly one
/// output per input, in input order.
pub trait BatchProcessor: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn process(&self, batch: Vec<Self::Input>) -> Result<Vec<Self::Output>>;

    /// A representative output, used to derive the cache schema.
    fn output_exemplar(&self) -> Self::Output;

    fn resources(&self) -> ResourceHints {
        ResourceHints::default()
    }

    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }
}

/// Runs `processor` and checks the one-output-per-input contract.
///
/// Any failure is reported as [`CacheError::ProcessingFailure`].
pub(crate) fn process_checked<P: BatchProcessor>(
    processor: &P,
    batch: Vec<P::Input>,
) -> Result<Vec<P::Output>> {
    let expected = batch.len();
    let outputs = processor.process(batch).map_err(|e| match e {
        CacheError::ProcessingFailure { .. } => e,
        other => CacheError::processing(other.to_string()),
    })?;

    if outputs.len() != expected {
        return Err(CacheError::processing(format!(
            "processor returned {} outputs for {} inputs",
            outputs.len(),
            expected
        )));
    }

    Ok(outputs)
}

/// Passes items through unchanged.
#[derive(Debug, Clone)]
pub struct IdentityProcessor<T> {
    exemplar: T,
    batch_size: usize,
}

impl<T> IdentityProcessor<T> {
    pub fn new(exemplar: T) -> Self {
        Self {
            exemplar,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl<T> BatchProcessor for IdentityProcessor<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    fn process(&self, batch: Vec<T>) -> Result<Vec<T>> {
        Ok(batch)
    }

    fn output_exemplar(&self) -> T {
        self.exemplar.clone()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Closure-backed processor.
pub struct FnProcessor<I, O, F> {
    f: F,
    exemplar: O,
    batch_size: usize,
    resources: ResourceHints,
    _input: PhantomData<fn(I)>,
}

impl<I, O, F> FnProcessor<I, O, F>
where
    F: Fn(Vec<I>) -> Result<Vec<O>>,
{
    pub fn new(exemplar: O, f: F) -> Self {
        Self {
            f,
            exemplar,
            batch_size: DEFAULT_BATCH_SIZE,
            resources: ResourceHints::default(),
            _input: PhantomData,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceHints) -> Self {
        self.resources = resources;
        self
    }
}

impl<I, O, F> BatchProcessor for FnProcessor<I, O, F>
where
    I: Send + 'static,
    O: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    F: Fn(Vec<I>) -> Result<Vec<O>> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn process(&self, batch: Vec<I>) -> Result<Vec<O>> {
        (self.f)(batch)
    }

    fn output_exemplar(&self) -> O {
        self.exemplar.clone()
    }

    fn resources(&self) -> ResourceHints {
        self.resources
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
