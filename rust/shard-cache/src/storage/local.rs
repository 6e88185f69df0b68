// rust/shard-cache/src/storage/local.rs

//! Local filesystem storage backend for raw data files.
//!
//! Large files are memory-mapped when enabled; everything else goes through a
//! buffered reader.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader};
use crate::config::StorageConfig;
use crate::error::{CacheError, Result};

/// Local filesystem storage backend.
pub struct LocalStorage {
    /// Base path for relative lookups.
    base_path: PathBuf,
    /// Buffer size for buffered I/O operations.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// Unlike the async backend this never creates `base_path`: the sync side
    /// only reads existing files.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| CacheError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                CacheError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        // Zero-length files cannot be mapped on every platform.
        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long as
            // the reader. Concurrent truncation by another process is not
            // supported for source files.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                CacheError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader::new(mmap, full_path)))
        } else {
            Ok(Box::new(LocalReader::new(file, size, full_path, self.buffer_size)))
        }
    }
}

/// Buffered file reader.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl LocalReader {
    fn new(file: File, size: u64, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            path,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        if start > self.size {
            return Err(CacheError::storage(
                &self.path,
                format!("read offset {start} exceeds file size {}", self.size),
            ));
        }

        self.seek(SeekFrom::Start(start)).map_err(|e| {
            CacheError::storage_with_source(&self.path, format!("failed to seek to {start}"), e)
        })?;

        let available = (self.size - start).min(length as u64) as usize;
        let mut buf = vec![0u8; available];
        self.read_exact(&mut buf).map_err(|e| {
            CacheError::storage_with_source(
                &self.path,
                format!("failed to read {available} bytes at {start}"),
                e,
            )
        })?;

        Ok(buf)
    }
}

/// Memory-mapped file reader.
struct MmapReader {
    mmap: Mmap,
    position: u64,
    path: PathBuf,
}

impl MmapReader {
    fn new(mmap: Mmap, path: PathBuf) -> Self {
        Self {
            mmap,
            position: 0,
            path,
        }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = (self.position as usize).min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let len = self.mmap.len();
        let start = start as usize;

        if start > len {
            return Err(CacheError::storage(
                &self.path,
                format!("read offset {start} exceeds file size {len}"),
            ));
        }

        let end = start.saturating_add(length).min(len);
        Ok(self.mmap[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    fn storage(dir: &TempDir, use_mmap: bool, mmap_threshold: u64) -> LocalStorage {
        LocalStorage::new(&StorageConfig {
            base_path: dir.path().to_path_buf(),
            buffer_size: 16,
            use_mmap,
            mmap_threshold,
        })
    }

    #[test]
    fn test_exists() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.jsonl", b"{}\n");
        let storage = storage(&dir, false, 0);

        assert!(storage.exists(Path::new("a.jsonl")).unwrap());
        assert!(!storage.exists(Path::new("b.jsonl")).unwrap());
        assert_eq!(storage.open_read(Path::new("a.jsonl")).unwrap().size(), 3);
    }

    #[test]
    fn test_buffered_read_range() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "data.bin", b"0123456789");
        let storage = storage(&dir, false, 0);

        let mut reader = storage.open_read(Path::new("data.bin")).unwrap();
        assert_eq!(reader.size(), 10);
        assert_eq!(reader.read_range(2, 3).unwrap(), b"234");
        // Short read at end of file
        assert_eq!(reader.read_range(8, 5).unwrap(), b"89");
        assert!(reader.read_range(10, 1).unwrap().is_empty());
        assert!(reader.read_range(11, 1).is_err());
    }

    #[test]
    fn test_mmap_read_range_matches_buffered() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        write_file(&dir, "big.bin", &data);

        let mut mapped = storage(&dir, true, 1024)
            .open_read(Path::new("big.bin"))
            .unwrap();
        let mut buffered = storage(&dir, false, 1024)
            .open_read(Path::new("big.bin"))
            .unwrap();

        for (start, len) in [(0u64, 10usize), (1000, 300), (4090, 100)] {
            assert_eq!(
                mapped.read_range(start, len).unwrap(),
                buffered.read_range(start, len).unwrap()
            );
        }
        assert!(mapped.read_range(5000, 1).is_err());
    }

    #[test]
    fn test_mmap_read_and_seek() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "f.bin", b"abcdef");
        let mut reader = storage(&dir, true, 1).open_read(Path::new("f.bin")).unwrap();

        reader.seek(SeekFrom::End(-2)).unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ef");
        assert!(reader.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn test_empty_file_is_not_mapped() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "empty", b"");
        let mut reader = storage(&dir, true, 0).open_read(Path::new("empty")).unwrap();
        assert_eq!(reader.size(), 0);
        assert!(reader.read_range(0, 8).unwrap().is_empty());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(storage(&dir, false, 0).open_read(Path::new("nope")).is_err());
    }
}
