// rust/shard-cache/src/cache/mod.rs

//! On-disk cache of processed records.
//!
//! A cache directory holds a `ledger.json` plus one file per committed chunk:
//!
//! ```text
//! <cache>/
//!   ledger.json
//!   chunks/<shard>/chunk-<n>.bin
//! ```

mod builder;
mod format;
mod ledger;
mod monitor;
mod tree_cache;

pub use builder::{build_or_load_cache, BuildOptions};
pub use format::{decode_chunk, decode_header, encode_chunk, ChunkHeader, Compression};
pub use ledger::{
    schema_signature, CacheLedger, CacheStatus, ChunkRecord, InterleaveCursor, ShardProgress,
    LEDGER_FILE,
};
pub use monitor::{CacheProgress, CollectingMonitor, LoggingMonitor, MetricsMonitor};
pub use tree_cache::{read_ledger, TreeCache};
