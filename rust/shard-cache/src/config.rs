// rust/shard-cache/src/config.rs

//! Configuration management for cache construction and reading.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CacheError, Result};

/// Compression codecs accepted for chunk files.
pub const VALID_COMPRESSION: [&str; 3] = ["none", "lz4", "zstd"];

// Top-level cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub storage: StorageConfig,
    pub build: BuildConfig,
    pub shuffle: ShuffleConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path that relative cache and source paths resolve against.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for source files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Background build options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Rows per committed chunk. Zero means "use the processor's batch size".
    pub chunk_size: usize,
    /// Upper bound on concurrently processed chunks.
    pub max_workers: usize,
    /// Chunk compression: "none", "lz4", or "zstd".
    pub compression: String,
    /// Compression level (zstd only).
    pub compression_level: i32,
    /// Number of decoded chunks kept in memory per reader.
    pub read_cache_chunks: usize,
}

/// Shuffling options applied on top of a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    pub enabled: bool,
    pub seed: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_workers: 8,
            compression: "lz4".to_string(),
            compression_level: 1,
            read_cache_chunks: 16,
        }
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 0,
        }
    }
}

impl FromStr for CacheConfig {
    type Err = CacheError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CacheError::config_with_source("failed to parse TOML config", e))
    }
}

impl CacheConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SHC_` and use underscores
    // to separate nested fields. For example:
    // - `SHC_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `SHC_BUILD_CHUNK_SIZE` overrides `build.chunk_size`
    // - `SHC_SHUFFLE_SEED` overrides `shuffle.seed`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("SHC_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHC_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Build overrides
        if let Ok(val) = std::env::var("SHC_BUILD_CHUNK_SIZE") {
            if let Ok(v) = val.parse() {
                self.build.chunk_size = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_MAX_WORKERS") {
            if let Ok(v) = val.parse() {
                self.build.max_workers = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_COMPRESSION") {
            self.build.compression = val;
        }
        if let Ok(val) = std::env::var("SHC_BUILD_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.build.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_READ_CACHE_CHUNKS") {
            if let Ok(v) = val.parse() {
                self.build.read_cache_chunks = v;
            }
        }

        // Shuffle overrides
        if let Ok(val) = std::env::var("SHC_SHUFFLE_ENABLED") {
            if let Ok(v) = val.parse() {
                self.shuffle.enabled = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_SHUFFLE_SEED") {
            if let Ok(v) = val.parse() {
                self.shuffle.seed = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(CacheError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        self.build.validate()
    }

    /// Resolves a path relative to `storage.base_path`.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.storage.base_path.join(path)
        }
    }
}

impl BuildConfig {
    /// Validate build options on their own.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CacheError::config(
                "build.max_workers must be greater than 0",
            ));
        }

        if !VALID_COMPRESSION.contains(&self.compression.as_str()) {
            return Err(CacheError::config(format!(
                "build.compression must be one of: {}",
                VALID_COMPRESSION.join(", ")
            )));
        }

        if self.read_cache_chunks == 0 {
            return Err(CacheError::config(
                "build.read_cache_chunks must be greater than 0",
            ));
        }

        Ok(())
    }
}
