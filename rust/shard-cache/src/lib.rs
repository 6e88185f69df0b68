// rust/shard-cache/src/lib.rs

//! Shard Cache - Core Library
//!
//! Deterministic index permutations, and caches of processed training data
//! that are filled in the background from sharded sources, survive restarts,
//! and can be read by global index while they are still being built.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use storage::{AsyncLocalStorage, AsyncStorageBackend, LocalStorage, StorageBackend};

pub mod permutation;
pub use permutation::{Permutation, PermutationIndex, PrngKey};

pub mod dataset;
pub use dataset::{
    AsyncDataset, BatchProcessor, IdentityProcessor, InMemorySource, JsonlFileSource,
    PermutedDataset, ShardedDataSource,
};

pub mod cache;
pub use cache::{build_or_load_cache, BuildOptions, CacheProgress, CacheStatus, TreeCache};

pub mod audio;
pub use audio::{AudioIoDatasetConfig, AudioTextRecord, BatchAudioProcessor, ProcessedAudioCache};
