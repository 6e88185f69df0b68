// rust/shard-cache/src/cache/ledger.rs

//! The durable record of what a cache directory contains.
//!
//! The ledger is the only source of truth on restart: chunk files that are
//! not covered by its per-shard counts are ignored and will be overwritten.
//!
//! Only counters are stored. Chunk boundaries follow from them, since every
//! chunk holds `chunk_size` rows except possibly the last one of a shard, and
//! chunks are committed round by round in shard order. The file therefore
//! stays the same size however many chunks a build commits.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::format::Compression;
use crate::error::{CacheError, Result};
use crate::storage::AsyncStorageBackend;

pub const LEDGER_FILE: &str = "ledger.json";
pub const LEDGER_VERSION: u32 = 1;

/// Build state of a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheStatus {
    Building,
    Finished,
    Failed { message: String },
}

impl CacheStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Building)
    }
}

/// One committed chunk, derived from the ledger counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub shard: String,
    /// Position of the shard in source order
    pub shard_index: usize,
    /// Index of this chunk within its shard
    pub chunk_index: u64,
    /// Global index of the chunk's first row
    pub global_start: u64,
    pub num_rows: u64,
    /// Path relative to the cache directory
    pub file: String,
}

impl ChunkRecord {
    pub fn global_end(&self) -> u64 {
        self.global_start + self.num_rows
    }
}

/// Per-shard progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub name: String,
    /// Rows committed so far; the resume position in the source shard
    pub rows: u64,
    /// Chunks committed so far
    pub chunks: u64,
    pub finished: bool,
}

/// Where the round-robin interleave stands.
///
/// Round `r` commits chunk `r` of every unfinished shard in source order;
/// `position` is the next shard to commit in the current round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterleaveCursor {
    pub round: u64,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLedger {
    pub version: u32,
    pub build_id: Uuid,
    pub status: CacheStatus,
    /// Number of committed rows
    pub length: u64,
    pub chunk_size: usize,
    pub compression: Compression,
    /// Shape of the cached record type
    pub schema: String,
    pub shards: Vec<ShardProgress>,
    pub cursor: InterleaveCursor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheLedger {
    pub fn new(
        shard_names: Vec<String>,
        chunk_size: usize,
        compression: Compression,
        schema: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: LEDGER_VERSION,
            build_id: Uuid::new_v4(),
            status: CacheStatus::Building,
            length: 0,
            chunk_size,
            compression,
            schema,
            shards: shard_names
                .into_iter()
                .map(|name| ShardProgress {
                    name,
                    rows: 0,
                    chunks: 0,
                    finished: false,
                })
                .collect(),
            cursor: InterleaveCursor::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Relative path of a chunk file.
    pub fn chunk_file(shard_index: usize, chunk_index: u64) -> String {
        format!("chunks/{shard_index}/chunk-{chunk_index}.bin")
    }

    /// Reads and validates the ledger in `storage`'s root.
    ///
    /// # Errors
    ///
    /// `NotFound` when there is no ledger, `Corruption` when it cannot be
    /// parsed or is internally inconsistent.
    pub async fn load(storage: &dyn AsyncStorageBackend, dir: &Path) -> Result<Self> {
        let ledger_path = Path::new(LEDGER_FILE);
        if !storage.exists(ledger_path).await? {
            return Err(CacheError::not_found(dir));
        }

        let bytes = storage.read_all(ledger_path).await?;
        let ledger: Self = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::corruption_with_source(dir, "unreadable ledger", e))?;

        ledger
            .validate()
            .map_err(|message| CacheError::corruption(dir, message))?;
        Ok(ledger)
    }

    /// Atomically replaces the ledger file.
    pub async fn save(&mut self, storage: &dyn AsyncStorageBackend) -> Result<()> {
        self.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CacheError::serialization(format!("failed to encode ledger: {e}")))?;
        storage.write_atomic(Path::new(LEDGER_FILE), &bytes).await
    }

    /// Checks every cross-field invariant.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != LEDGER_VERSION {
            return Err(format!(
                "unsupported ledger version {} (expected {LEDGER_VERSION})",
                self.version
            ));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size is zero".to_string());
        }

        let chunk_size = self.chunk_size as u64;
        let InterleaveCursor { round, position } = self.cursor;
        if position > self.shards.len() {
            return Err(format!(
                "cursor position {position} is past the last of {} shards",
                self.shards.len()
            ));
        }

        let mut total = 0u64;
        for (idx, shard) in self.shards.iter().enumerate() {
            let full = shard.chunks.saturating_sub(1).checked_mul(chunk_size);
            let cap = shard.chunks.checked_mul(chunk_size);
            let rows_fit = match (shard.chunks, full, cap) {
                (0, _, _) => shard.rows == 0,
                (_, Some(full), Some(cap)) => full < shard.rows && shard.rows <= cap,
                _ => false,
            };
            if !rows_fit {
                return Err(format!(
                    "shard '{}' claims {} rows in {} chunks of {chunk_size}",
                    shard.name, shard.rows, shard.chunks
                ));
            }

            let in_round = if idx < position { round.saturating_add(1) } else { round };
            let consistent = if shard.finished {
                shard.chunks <= in_round
            } else {
                shard.chunks == in_round
            };
            if !consistent {
                return Err(format!(
                    "shard '{}' has {} chunks but the interleave is at round {round}, position {position}",
                    shard.name, shard.chunks
                ));
            }

            total = total
                .checked_add(shard.rows)
                .ok_or_else(|| "row count overflows".to_string())?;
        }

        if total != self.length {
            return Err(format!(
                "shards hold {total} rows but length is {}",
                self.length
            ));
        }

        if self.status == CacheStatus::Finished && !self.all_shards_finished() {
            return Err("finished cache has unfinished shards".to_string());
        }

        Ok(())
    }

    /// Total number of committed chunks.
    pub fn num_chunks(&self) -> u64 {
        self.shards.iter().map(|s| s.chunks).sum()
    }

    /// Rows in chunk `chunk_index` of shard `shard_index`.
    fn chunk_rows(&self, shard_index: usize, chunk_index: u64) -> u64 {
        let shard = &self.shards[shard_index];
        let chunk_size = self.chunk_size as u64;
        if chunk_index + 1 == shard.chunks {
            shard.rows - chunk_index * chunk_size
        } else {
            chunk_size
        }
    }

    /// Every committed chunk in global order: round by round, shards in
    /// source order within a round.
    pub fn chunk_records(&self) -> Vec<ChunkRecord> {
        let rounds = self.shards.iter().map(|s| s.chunks).max().unwrap_or(0);
        let mut records = Vec::with_capacity(self.num_chunks() as usize);
        let mut global_start = 0u64;

        for chunk_index in 0..rounds {
            for (shard_index, shard) in self.shards.iter().enumerate() {
                if chunk_index >= shard.chunks {
                    continue;
                }
                let num_rows = self.chunk_rows(shard_index, chunk_index);
                records.push(ChunkRecord {
                    shard: shard.name.clone(),
                    shard_index,
                    chunk_index,
                    global_start,
                    num_rows,
                    file: Self::chunk_file(shard_index, chunk_index),
                });
                global_start += num_rows;
            }
        }
        records
    }

    pub fn all_shards_finished(&self) -> bool {
        self.shards.iter().all(|s| s.finished)
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }

    /// Counts a committed chunk for the shard under the cursor and returns
    /// its record.
    pub fn record_chunk(&mut self, shard_index: usize, num_rows: u64) -> ChunkRecord {
        let shard = &mut self.shards[shard_index];
        let record = ChunkRecord {
            shard: shard.name.clone(),
            shard_index,
            chunk_index: shard.chunks,
            global_start: self.length,
            num_rows,
            file: Self::chunk_file(shard_index, shard.chunks),
        };

        shard.rows += num_rows;
        shard.chunks += 1;
        self.length += num_rows;
        record
    }

    pub fn mark_shard_finished(&mut self, shard_index: usize) {
        self.shards[shard_index].finished = true;
    }
}

/// Describes the JSON shape of `exemplar`: object keys and value kinds.
///
/// Array contents and numeric values are ignored, so any two values of the
/// same record type produce the same signature.
pub fn schema_signature<T: Serialize>(exemplar: &T) -> Result<String> {
    let value = serde_json::to_value(exemplar)
        .map_err(|e| CacheError::serialization(format!("failed to describe exemplar: {e}")))?;
    Ok(shape(&value))
}

fn shape(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(key, v)| format!("{key}:{}", shape(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
    }
}
