// rust/shard-cache/src/storage/mod.rs

//! Storage abstraction for cache directories and raw data files.
//!
//! # Sync vs Async
//!
//! - **Sync traits** (`StorageBackend`, `StorageReader`): read-only access
//!   used by [`JsonlFileSource`](crate::dataset::JsonlFileSource) from
//!   blocking source iterators.
//!
//! - **Async traits** (`AsyncStorageBackend`, `AsyncStorageWriter`): used by
//!   the cache builder and readers for chunk files and the ledger. All
//!   cache writes go through [`AsyncStorageBackend::write_atomic`].
//!
//! # Example
//!
//! ```no_run
//! use shard_cache::storage::{AsyncLocalStorage, AsyncStorageBackend};
//! use std::path::Path;
//!
//! # async fn example() -> shard_cache::Result<()> {
//! let storage = AsyncLocalStorage::rooted_at("/tmp/cache").await?;
//! storage.write_atomic(Path::new("ledger.json"), b"{}").await?;
//! let content = storage.read_all(Path::new("ledger.json")).await?;
//! # Ok(())
//! # }
//! ```

// Sync storage
mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader};

// Async storage
mod async_local;
mod async_traits;

pub use async_local::{AsyncLocalStorage, AsyncLocalWriter};
pub use async_traits::{AsyncStorageBackend, AsyncStorageWriter};
