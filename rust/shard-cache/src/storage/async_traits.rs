// rust/shard-cache/src/storage/async_traits.rs

//! Async storage traits used by cache builders and readers.
//!
//! Cache directories are written by one builder and read by many tasks, so
//! the backend exposes whole-object reads plus a crash-safe
//! [`AsyncStorageBackend::write_atomic`] primitive on top of plain writers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::error::Result;

/// A handle for async writing to storage.
#[async_trait]
pub trait AsyncStorageWriter: AsyncWrite + Send + Sync + Unpin {
    /// Flushes buffered data and syncs it to durable storage.
    ///
    /// The writer must not be used after `finish`.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Writes all data from a bytes slice.
    async fn write_all_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Returns the number of bytes written so far.
    fn bytes_written(&self) -> u64;
}

/// The async storage backend behind cache directories.
#[async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Reads a whole object into memory.
    async fn read_all(&self, path: &Path) -> Result<Bytes>;

    /// Opens an object for writing, truncating any previous content.
    ///
    /// Parent directories are created if they don't exist.
    async fn open_write(&self, path: &Path) -> Result<Box<dyn AsyncStorageWriter>>;

    /// Renames an object, replacing any existing destination.
    ///
    /// The rename itself is durable once this returns.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Writes `data` so that readers see either the old object or the complete
    /// new one, never a prefix.
    ///
    /// The data goes to a hidden sibling temp file which is synced and then
    /// renamed over `path`; the parent directory is synced by `rename`.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = temp_sibling(path);

        let mut writer = self.open_write(&temp_path).await?;
        writer.write_all_bytes(data).await?;
        writer.finish().await?;

        self.rename(&temp_path, path).await
    }
}

/// Returns `dir/.name.tmp` for `dir/name`.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_sibling() {
        assert_eq!(
            temp_sibling(Path::new("cache/ledger.json")),
            PathBuf::from("cache/.ledger.json.tmp")
        );
        assert_eq!(temp_sibling(Path::new("x.bin")), PathBuf::from(".x.bin.tmp"));
    }
}
