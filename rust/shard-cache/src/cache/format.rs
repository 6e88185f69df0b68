// rust/shard-cache/src/cache/format.rs

//! Chunk file format.
//!
//! ```text
//! +----------------------+
//! | Header length (u32)  |  <- little-endian
//! +----------------------+
//! | Header (bincode)     |  <- ChunkHeader
//! +----------------------+
//! | Compressed rows      |  <- bincode Vec<T>, compressed per header
//! +----------------------+
//! ```
//!
//! The checksum covers the uncompressed row payload.

use std::fmt;
use std::hash::Hasher;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{CacheError, Result};

/// Magic bytes for chunk files
pub const CHUNK_MAGIC: [u8; 4] = *b"SCCH";

/// Current chunk format version
pub const CHUNK_VERSION: u32 = 1;

/// Chunk payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl FromStr for Compression {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(CacheError::config(format!(
                "unknown compression '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        })
    }
}

/// Header at the start of every chunk file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub compression: Compression,
    /// Rows stored in this chunk
    pub num_rows: u64,
    /// Size of the row payload before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed payload
    pub checksum: u64,
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn compress(data: &[u8], compression: Compression, level: i32) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd => zstd::encode_all(data, level)
            .map_err(|e| CacheError::serialization(format!("zstd compression failed: {e}"))),
    }
}

fn decompress(path: &Path, data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CacheError::corruption_with_source(path, "lz4 decompression failed", e)),
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|e| CacheError::corruption_with_source(path, "zstd decompression failed", e)),
    }
}

/// Serializes `rows` into a complete chunk file image.
pub fn encode_chunk<T: Serialize>(
    rows: &[T],
    compression: Compression,
    level: i32,
) -> Result<Vec<u8>> {
    let payload = bincode::serialize(rows)
        .map_err(|e| CacheError::serialization(format!("failed to serialize rows: {e}")))?;

    let header = ChunkHeader {
        magic: CHUNK_MAGIC,
        version: CHUNK_VERSION,
        compression,
        num_rows: rows.len() as u64,
        uncompressed_size: payload.len() as u64,
        checksum: checksum(&payload),
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| CacheError::serialization(format!("failed to serialize header: {e}")))?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| CacheError::serialization("chunk header too large"))?;

    let body = compress(&payload, compression, level)?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + body.len());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses and verifies only the header of a chunk file image.
pub fn decode_header(path: &Path, data: &[u8]) -> Result<(ChunkHeader, usize)> {
    let len_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CacheError::corruption(path, "chunk file too small"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_bytes = data
        .get(4..4 + header_len)
        .ok_or_else(|| CacheError::corruption(path, "chunk truncated: header incomplete"))?;

    let header: ChunkHeader = bincode::deserialize(header_bytes)
        .map_err(|e| CacheError::corruption_with_source(path, "unreadable chunk header", e))?;

    if header.magic != CHUNK_MAGIC {
        return Err(CacheError::corruption(
            path,
            format!("invalid magic bytes {:?}", header.magic),
        ));
    }
    if header.version != CHUNK_VERSION {
        return Err(CacheError::corruption(
            path,
            format!(
                "unsupported chunk version {} (expected {CHUNK_VERSION})",
                header.version
            ),
        ));
    }

    Ok((header, 4 + header_len))
}

/// Decodes a chunk file image, verifying size, checksum and row count.
pub fn decode_chunk<T: DeserializeOwned>(path: &Path, data: &[u8]) -> Result<Vec<T>> {
    let (header, body_start) = decode_header(path, data)?;
    let payload = decompress(path, &data[body_start..], header.compression)?;

    if payload.len() as u64 != header.uncompressed_size {
        return Err(CacheError::corruption(
            path,
            format!(
                "size mismatch: expected {} bytes, got {}",
                header.uncompressed_size,
                payload.len()
            ),
        ));
    }

    let computed = checksum(&payload);
    if computed != header.checksum {
        return Err(CacheError::corruption(
            path,
            format!(
                "checksum mismatch: expected {:#x}, got {computed:#x}",
                header.checksum
            ),
        ));
    }

    let rows: Vec<T> = bincode::deserialize(&payload)
        .map_err(|e| CacheError::corruption_with_source(path, "unreadable chunk rows", e))?;

    if rows.len() as u64 != header.num_rows {
        return Err(CacheError::corruption(
            path,
            format!("header says {} rows, found {}", header.num_rows, rows.len()),
        ));
    }

    Ok(rows)
}
