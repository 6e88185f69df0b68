// rust/shard-cache/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {

    #[error("index {index} out of range for length {length}")]
    OutOfRange {
        index: i128,
        length: u64,
    },

    #[error("no cache ledger found at '{path}'")]
    NotFound {
        path: PathBuf,
    },

    #[error("cache at '{path}' is not complete")]
    Incomplete {
        path: PathBuf,
    },

    #[error("cache at '{path}' is already being built by another writer")]
    AlreadyBuilding {
        path: PathBuf,
    },

    #[error("corrupt cache at '{path}': {message}")]
    Corruption {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("processing failed: {message}")]
    ProcessingFailure {
        message: String,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Shard '{shard}' not found (available shards: {available})")]
    InvalidShard {
        shard: String,
        available: usize,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

// Convenience constructors
impl CacheError {

    pub fn out_of_range(index: impl Into<i128>, length: u64) -> Self {
        Self::OutOfRange {
            index: index.into(),
            length,
        }
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn incomplete(path: impl Into<PathBuf>) -> Self {
        Self::Incomplete { path: path.into() }
    }

    pub fn already_building(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyBuilding { path: path.into() }
    }

    pub fn corruption(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn corruption_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Corruption {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::ProcessingFailure {
            message: message.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_shard(shard: impl Into<String>, available: usize) -> Self {
        Self::InvalidShard {
            shard: shard.into(),
            available,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for errors that describe a permanently out-of-range index.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }

    /// Returns true when no ledger exists at the requested location.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true when a ledger exists but its build has not finished.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    /// Returns true when another build holds the cache directory.
    pub fn is_already_building(&self) -> bool {
        matches!(self, Self::AlreadyBuilding { .. })
    }

    /// Returns true when a ledger or chunk exists but cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Returns true when background processing aborted the build.
    pub fn is_processing_failure(&self) -> bool {
        matches!(self, Self::ProcessingFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = CacheError::out_of_range(-3i64, 10);
        assert!(err.is_out_of_range());
        assert_eq!(err.to_string(), "index -3 out of range for length 10");
    }

    #[test]
    fn test_kind_predicates_are_distinct() {
        let not_found = CacheError::not_found("/tmp/cache");
        let corrupt = CacheError::corruption("/tmp/cache", "bad ledger");
        let failed = CacheError::processing("boom");

        assert!(not_found.is_not_found() && !not_found.is_corruption());
        assert!(corrupt.is_corruption() && !corrupt.is_not_found());
        assert!(failed.is_processing_failure() && !failed.is_out_of_range());

        let partial = CacheError::incomplete("/tmp/cache");
        assert!(partial.is_incomplete() && !partial.is_not_found());
        assert_eq!(partial.to_string(), "cache at '/tmp/cache' is not complete");

        let busy = CacheError::already_building("/tmp/cache");
        assert!(busy.is_already_building() && !busy.is_incomplete());
    }

    #[test]
    fn test_corruption_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated");
        let err = CacheError::corruption_with_source("ledger.json", "unreadable ledger", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
