// rust/shard-cache/src/dataset/mod.rs

//! Dataset contracts: raw sharded sources, batch processors, and async
//! random-access datasets.
//!
//! # Example
//!
//! ```no_run
//! use shard_cache::dataset::{InMemorySource, ShardedDataSource};
//!
//! let source = InMemorySource::from_rows((0..100u32).collect(), 4);
//! for name in source.shard_names() {
//!     for row in source.open_shard(&name)? {
//!         let _value: u32 = row?;
//!     }
//! }
//! # Ok::<(), shard_cache::CacheError>(())
//! ```

mod async_dataset;
mod iterator;
mod processor;
mod sharding;
mod source;
mod traits;

pub use async_dataset::{AsyncDataset, MappedDataset, PermutedDataset, VecDataset, UNBOUNDED_LEN};
pub use iterator::{ShardIterator, DEFAULT_READ_SIZE};
pub(crate) use processor::process_checked;
pub use processor::{
    BatchProcessor, FnProcessor, IdentityProcessor, ResourceHints, DEFAULT_BATCH_SIZE,
};
pub use sharding::calculate_shards;
pub use source::{InMemorySource, JsonlFileSource, MappedDataSource, ShardRows, ShardedDataSource};
pub use traits::{Batch, NewlineDelimitedFormat, RecordFormat, ShardSpec};
