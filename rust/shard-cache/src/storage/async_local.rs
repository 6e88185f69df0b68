// rust/shard-cache/src/storage/async_local.rs

//! Async local filesystem storage backend implementation.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::async_traits::{AsyncStorageBackend, AsyncStorageWriter};
use crate::config::StorageConfig;
use crate::error::{CacheError, Result};

/// Async local filesystem storage backend.
///
/// Relative paths resolve against `base_path`; absolute paths are used as-is.
pub struct AsyncLocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
}

impl AsyncLocalStorage {
    /// Creates a new `AsyncLocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !fs::try_exists(&base_path).await.unwrap_or(false) {
            fs::create_dir_all(&base_path).await.map_err(|e| {
                CacheError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
        })
    }

    /// Storage rooted at `base_path` with default buffering.
    pub async fn rooted_at(base_path: impl Into<PathBuf>) -> Result<Self> {
        let config = StorageConfig {
            base_path: base_path.into(),
            ..Default::default()
        };
        Self::new(&config).await
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    /// Flushes the directory entry of `full_path` so a completed rename
    /// survives a crash.
    #[cfg(unix)]
    async fn sync_parent(full_path: &Path) -> Result<()> {
        let parent = match full_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dir = File::open(parent).await.map_err(|e| {
            CacheError::storage_with_source(parent, "failed to open directory for sync", e)
        })?;
        dir.sync_all().await.map_err(|e| {
            CacheError::storage_with_source(parent, "failed to sync directory", e)
        })
    }

    #[cfg(not(unix))]
    async fn sync_parent(_full_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    CacheError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncStorageBackend for AsyncLocalStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let full_path = self.resolve_path(path);
        fs::try_exists(&full_path).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to check existence", e)
        })
    }

    async fn read_all(&self, path: &Path) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to read file", e)
        })?;
        Ok(Bytes::from(data))
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn AsyncStorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .await
            .map_err(|e| {
                CacheError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(AsyncLocalWriter::new(file, full_path, self.buffer_size)))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path).await?;

        fs::rename(&from_path, &to_path).await.map_err(|e| {
            CacheError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })?;

        Self::sync_parent(&to_path).await
    }
}

/// Async buffered file writer that syncs to disk on `finish`.
pub struct AsyncLocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: AtomicU64,
}

impl AsyncLocalWriter {
    fn new(file: File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
            bytes_written: AtomicU64::new(0),
        }
    }
}

impl AsyncWrite for AsyncLocalWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.writer).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncStorageWriter for AsyncLocalWriter {
    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().await.map_err(|e| {
            CacheError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().await.map_err(|e| {
            CacheError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }

    async fn write_all_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await.map_err(|e| {
            CacheError::storage_with_source(&self.path, "failed to write data", e)
        })?;
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}
