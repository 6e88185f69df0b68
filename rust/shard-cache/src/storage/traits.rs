// rust/shard-cache/src/storage/traits.rs

//! Blocking storage traits used by data sources.
//!
//! Source iteration runs inside `spawn_blocking`, so shard readers use plain
//! `Read + Seek` handles rather than the async backend.

use std::io::{Read, Seek};
use std::path::Path;

use crate::error::Result;

/// A handle for reading from storage.
///
/// Extends `Read` and `Seek` with random access by byte range.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads up to `length` bytes starting at `start`.
    ///
    /// The returned buffer is shorter than `length` only when the range runs
    /// past the end of the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or `start` is past the end.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// Read-only storage backend.
///
/// Object-safe, so sources hold an `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;
}
