// rust/shard-cache/src/cache/tree_cache.rs

//! Read side of a cache directory.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use super::format::decode_chunk;
use super::ledger::{schema_signature, CacheLedger, CacheStatus, ChunkRecord, LEDGER_FILE};
use super::monitor::CacheProgress;
use crate::config::{CacheConfig, StorageConfig};
use crate::dataset::AsyncDataset;
use crate::error::{CacheError, Result};
use crate::storage::{AsyncLocalStorage, AsyncStorageBackend};

pub(crate) async fn open_storage(
    dir: &Path,
    config: &CacheConfig,
) -> Result<Arc<dyn AsyncStorageBackend>> {
    let storage_config = StorageConfig {
        base_path: dir.to_path_buf(),
        ..config.storage.clone()
    };
    Ok(Arc::new(AsyncLocalStorage::new(&storage_config).await?))
}

/// Reads the ledger of the cache at `dir` without opening the cache.
///
/// # Errors
///
/// `NotFound` if `dir` holds no ledger, `Corruption` if it is unreadable.
pub async fn read_ledger(dir: impl AsRef<Path>) -> Result<CacheLedger> {
    let dir = dir.as_ref();
    if !tokio::fs::try_exists(dir.join(LEDGER_FILE))
        .await
        .unwrap_or(false)
    {
        return Err(CacheError::not_found(dir));
    }
    let storage = AsyncLocalStorage::rooted_at(dir).await?;
    CacheLedger::load(&storage, dir).await
}

/// Decoded chunks, least recently used first.
struct ChunkCache<T> {
    capacity: usize,
    chunks: HashMap<usize, Arc<Vec<T>>>,
    order: VecDeque<usize>,
}

impl<T> ChunkCache<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chunks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, position: usize) -> Option<Arc<Vec<T>>> {
        let rows = self.chunks.get(&position).cloned()?;
        self.order.retain(|&p| p != position);
        self.order.push_back(position);
        Some(rows)
    }

    fn insert(&mut self, position: usize, rows: Arc<Vec<T>>) {
        if self.chunks.insert(position, rows).is_none() {
            self.order.push_back(position);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.chunks.remove(&evicted);
            }
        }
    }
}

/// A cache of processed records addressed by global index.
///
/// Reads may run while the cache is still being built: indices that are not
/// committed yet wait for the builder instead of failing.
pub struct TreeCache<T> {
    dir: PathBuf,
    storage: Arc<dyn AsyncStorageBackend>,
    /// Committed chunks in global order; only ever appended to
    index: Arc<RwLock<Vec<ChunkRecord>>>,
    progress: watch::Receiver<CacheProgress>,
    /// Keeps the channel open for caches with no builder
    _progress_tx: Option<watch::Sender<CacheProgress>>,
    builder: Option<JoinHandle<()>>,
    chunk_cache: Mutex<ChunkCache<T>>,
}

impl<T> TreeCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Opens a finished cache.
    ///
    /// # Errors
    ///
    /// - `NotFound` if there is no ledger at `path`;
    /// - `Incomplete` if the ledger exists but its build has not finished;
    /// - `Corruption` if the ledger is unreadable or describes another record
    ///   shape than `exemplar`.
    pub async fn load(path: impl AsRef<Path>, exemplar: &T) -> Result<Self> {
        Self::load_with_config(path, exemplar, &CacheConfig::default()).await
    }

    pub async fn load_with_config(
        path: impl AsRef<Path>,
        exemplar: &T,
        config: &CacheConfig,
    ) -> Result<Self> {
        let dir = config.resolve(path);
        if !tokio::fs::try_exists(dir.join(LEDGER_FILE))
            .await
            .unwrap_or(false)
        {
            return Err(CacheError::not_found(&dir));
        }

        let storage = open_storage(&dir, config).await?;
        let ledger = CacheLedger::load(storage.as_ref(), &dir).await?;

        let schema = schema_signature(exemplar)?;
        if ledger.schema != schema {
            return Err(CacheError::corruption(
                &dir,
                format!(
                    "cache holds records shaped {} but {schema} was requested",
                    ledger.schema
                ),
            ));
        }
        if ledger.status != CacheStatus::Finished {
            return Err(CacheError::incomplete(&dir));
        }

        debug!(cache = %dir.display(), rows = ledger.length, "Loaded cache");
        Ok(Self::finished(
            dir,
            storage,
            ledger,
            config.build.read_cache_chunks,
        ))
    }
}

impl<T> TreeCache<T> {
    pub(crate) fn finished(
        dir: PathBuf,
        storage: Arc<dyn AsyncStorageBackend>,
        ledger: CacheLedger,
        read_cache_chunks: usize,
    ) -> Self {
        let (tx, rx) = watch::channel(CacheProgress::from_ledger(&ledger));
        Self {
            dir,
            storage,
            index: Arc::new(RwLock::new(ledger.chunk_records())),
            progress: rx,
            _progress_tx: Some(tx),
            builder: None,
            chunk_cache: Mutex::new(ChunkCache::new(read_cache_chunks)),
        }
    }

    pub(crate) fn building(
        dir: PathBuf,
        storage: Arc<dyn AsyncStorageBackend>,
        index: Arc<RwLock<Vec<ChunkRecord>>>,
        progress: watch::Receiver<CacheProgress>,
        builder: JoinHandle<()>,
        read_cache_chunks: usize,
    ) -> Self {
        Self {
            dir,
            storage,
            index,
            progress,
            _progress_tx: None,
            builder: Some(builder),
            chunk_cache: Mutex::new(ChunkCache::new(read_cache_chunks)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> CacheProgress {
        self.progress.borrow().clone()
    }

    /// A receiver that sees every future progress update.
    pub fn subscribe(&self) -> watch::Receiver<CacheProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().is_finished()
    }

    /// True while a background build attached to this handle is running.
    pub fn is_building(&self) -> bool {
        self.builder.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits for the build to finish.
    ///
    /// # Errors
    ///
    /// `ProcessingFailure` if the build failed or stopped unexpectedly.
    pub async fn await_finished(&self) -> Result<()> {
        let mut rx = self.progress.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                match &current.status {
                    CacheStatus::Finished => return Ok(()),
                    CacheStatus::Failed { message } => {
                        return Err(CacheError::processing(message.clone()))
                    }
                    CacheStatus::Building => {}
                }
            }
            if rx.changed().await.is_err() {
                return match &rx.borrow().status {
                    CacheStatus::Finished => Ok(()),
                    CacheStatus::Failed { message } => Err(CacheError::processing(message.clone())),
                    CacheStatus::Building => Err(CacheError::processing(
                        "cache builder stopped before finishing",
                    )),
                };
            }
        }
    }

    /// Waits until row `index` is committed.
    async fn wait_for_index(&self, index: u64) -> Result<()> {
        let mut rx = self.progress.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.length > index {
                    return Ok(());
                }
                match &current.status {
                    CacheStatus::Finished => {
                        return Err(CacheError::out_of_range(index, current.length))
                    }
                    CacheStatus::Failed { message } => {
                        return Err(CacheError::processing(message.clone()))
                    }
                    CacheStatus::Building => {}
                }
            }
            if rx.changed().await.is_err() {
                if rx.borrow().length > index {
                    return Ok(());
                }
                return Err(CacheError::processing(
                    "cache builder stopped before the index was committed",
                ));
            }
        }
    }
}

impl<T> TreeCache<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn load_chunk(&self, position: usize, record: &ChunkRecord) -> Result<Arc<Vec<T>>> {
        if let Some(rows) = self.chunk_cache.lock().await.get(position) {
            return Ok(rows);
        }

        let path = self.dir.join(&record.file);
        let bytes = self
            .storage
            .read_all(Path::new(&record.file))
            .await
            .map_err(|e| CacheError::corruption_with_source(&path, "committed chunk is unreadable", e))?;

        let decode_path = path.clone();
        let rows: Vec<T> = tokio::task::spawn_blocking(move || decode_chunk(&decode_path, &bytes))
            .await
            .map_err(|e| CacheError::processing(format!("chunk decode task failed: {e}")))??;

        if rows.len() as u64 != record.num_rows {
            return Err(CacheError::corruption(
                &path,
                format!(
                    "ledger lists {} rows, chunk holds {}",
                    record.num_rows,
                    rows.len()
                ),
            ));
        }

        let rows = Arc::new(rows);
        self.chunk_cache
            .lock()
            .await
            .insert(position, Arc::clone(&rows));
        Ok(rows)
    }
}

/// Position of the committed chunk holding `index`.
fn chunk_position(chunks: &[ChunkRecord], index: u64) -> Option<usize> {
    let position = chunks
        .partition_point(|c| c.global_start <= index)
        .checked_sub(1)?;
    (index < chunks[position].global_end()).then_some(position)
}

#[async_trait]
impl<T> AsyncDataset for TreeCache<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Item = T;

    async fn async_len(&self) -> Result<u64> {
        self.await_finished().await?;
        Ok(self.progress.borrow().length)
    }

    fn final_length_is_known(&self) -> bool {
        self.is_finished()
    }

    fn current_len(&self) -> Option<u64> {
        Some(self.progress.borrow().length)
    }

    fn is_finite(&self) -> bool {
        true
    }

    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<T>> {
        let Some(&max_index) = indices.iter().max() else {
            return Ok(Vec::new());
        };
        self.wait_for_index(max_index).await?;

        let (positions, records) = {
            let chunks = self.index.read().await;
            let mut records: HashMap<usize, ChunkRecord> = HashMap::new();
            let mut positions = Vec::with_capacity(indices.len());
            for &index in indices {
                let position = chunk_position(&chunks, index).ok_or_else(|| {
                    CacheError::corruption(
                        &self.dir,
                        format!("index {index} is committed but not covered by any chunk"),
                    )
                })?;
                records
                    .entry(position)
                    .or_insert_with(|| chunks[position].clone());
                positions.push(position);
            }
            (positions, records)
        };

        let loaded: HashMap<usize, Arc<Vec<T>>> = try_join_all(
            records
                .iter()
                .map(|(&position, record)| async move {
                    self.load_chunk(position, record)
                        .await
                        .map(|rows| (position, rows))
                }),
        )
        .await?
        .into_iter()
        .collect();

        indices
            .iter()
            .zip(positions)
            .map(|(&index, position)| {
                let record = &records[&position];
                let rows = &loaded[&position];
                Ok(rows[(index - record.global_start) as usize].clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::builder::{build_or_load_cache, BuildOptions};
    use crate::cache::monitor::CollectingMonitor;
    use crate::config::CacheConfig;
    use crate::dataset::{FnProcessor, IdentityProcessor, InMemorySource, ShardedDataSource};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Three shards of five rows: a = 0..5, b = 100..105, c = 200..205.
    fn three_by_five() -> InMemorySource<u64> {
        InMemorySource::new()
            .with_shard("a", (0..5).collect())
            .with_shard("b", (100..105).collect())
            .with_shard("c", (200..205).collect())
    }

    /// Round-robin order for `three_by_five` with chunks of two rows.
    fn interleaved() -> Vec<u64> {
        vec![
            0, 1, 100, 101, 200, 201, //
            2, 3, 102, 103, 202, 203, //
            4, 104, 204,
        ]
    }

    /// `three_by_five` whose last row of shard c cannot be read until `gate`
    /// opens. Gives up after ten seconds so a failed test cannot hang.
    fn gated(gate: Arc<AtomicBool>) -> impl ShardedDataSource<Item = u64> {
        three_by_five().map(move |x| {
            if x == 204 {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !gate.load(Ordering::Acquire) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            x
        })
    }

    fn options() -> BuildOptions {
        let mut config = CacheConfig::default();
        config.build.chunk_size = 2;
        config.build.max_workers = 2;
        BuildOptions::new(config)
    }

    fn all_indices(n: u64) -> Vec<u64> {
        (0..n).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_shards_interleave_round_robin() {
        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(CollectingMonitor::new());

        let cache = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().monitor(monitor.clone()).await_finished(true),
        )
        .await
        .unwrap();

        assert!(cache.is_finished());
        assert_eq!(cache.async_len().await.unwrap(), 15);
        assert_eq!(cache.get_batch(&all_indices(15)).await.unwrap(), interleaved());

        let lengths: Vec<u64> = monitor.snapshots().iter().map(|p| p.length).collect();
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lengths.last(), Some(&15));
        assert!(monitor.snapshots().last().unwrap().is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_wait_for_background_commits() {
        let dir = TempDir::new().unwrap();
        let slow = FnProcessor::new(0u64, |batch: Vec<u64>| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(batch)
        })
        .with_batch_size(2);

        let cache = build_or_load_cache(dir.path(), three_by_five(), slow, options())
            .await
            .unwrap();

        // Out of order with duplicates, issued before the build is done.
        let values = cache.get_batch(&[14, 0, 14, 6]).await.unwrap();
        assert_eq!(values, vec![204, 0, 204, 2]);

        cache.await_finished().await.unwrap();
        assert!(cache.final_length_is_known());
        assert_eq!(cache.current_len(), Some(15));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_after_build_and_beyond_end() {
        let dir = TempDir::new().unwrap();
        build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        let cache = TreeCache::load(dir.path(), &0u64).await.unwrap();
        assert!(cache.final_length_is_known());
        assert_eq!(cache.async_len().await.unwrap(), 15);
        assert_eq!(cache.get_batch(&[3, 2]).await.unwrap(), vec![101, 100]);

        let err = cache.get_batch(&[15]).await.unwrap_err();
        assert!(err.is_out_of_range());
        assert!(cache.get_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finished_cache_is_not_recomputed() {
        let dir = TempDir::new().unwrap();
        build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        let exploding = FnProcessor::new(0u64, |_batch: Vec<u64>| {
            Err(CacheError::processing("must not run"))
        });
        let cache = build_or_load_cache(dir.path(), three_by_five(), exploding, options())
            .await
            .unwrap();
        assert!(cache.is_finished());
        assert!(!cache.is_building());
        assert_eq!(cache.get_batch(&all_indices(15)).await.unwrap(), interleaved());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_then_resume_keeps_numbering() {
        let dir = TempDir::new().unwrap();
        let failing = FnProcessor::new(0u64, |batch: Vec<u64>| {
            if batch.contains(&203) {
                return Err(CacheError::processing("bad row 203"));
            }
            Ok(batch)
        })
        .with_batch_size(2);

        let err = build_or_load_cache(
            dir.path(),
            three_by_five(),
            failing,
            options().await_finished(true),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_processing_failure());
        assert!(err.to_string().contains("bad row 203"));

        let ledger = read_ledger(dir.path()).await.unwrap();
        assert!(matches!(ledger.status, CacheStatus::Failed { .. }));
        // Chunk 1 of shard c never commits, so nothing past it can.
        assert!(ledger.length <= 10);
        let committed = ledger.length;

        let err = TreeCache::load(dir.path(), &0u64).await.err().unwrap();
        assert!(err.is_incomplete());

        let cache = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        let values = cache.get_batch(&all_indices(15)).await.unwrap();
        assert_eq!(values, interleaved());
        assert_eq!(
            &values[..committed as usize],
            &interleaved()[..committed as usize]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_see_processing_failure() {
        let dir = TempDir::new().unwrap();
        let failing = FnProcessor::new(0u64, |batch: Vec<u64>| {
            if batch.contains(&104) {
                return Err(CacheError::processing("bad row 104"));
            }
            Ok(batch)
        })
        .with_batch_size(2);

        let cache = build_or_load_cache(dir.path(), three_by_five(), failing, options())
            .await
            .unwrap();

        let err = cache.get_batch(&[14]).await.unwrap_err();
        assert!(err.is_processing_failure());
        assert!(cache.async_len().await.unwrap_err().is_processing_failure());

        // Everything committed before the failure stays readable.
        let committed = cache.progress().length;
        assert!(committed <= 13);
        let values = cache.get_batch(&all_indices(committed)).await.unwrap();
        assert_eq!(values, &interleaved()[..committed as usize]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_committed_rows_readable_while_building() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(AtomicBool::new(false));

        let cache = build_or_load_cache(
            dir.path(),
            gated(Arc::clone(&gate)),
            IdentityProcessor::new(0u64),
            options(),
        )
        .await
        .unwrap();

        // Every chunk but the last one of shard c can commit.
        let values = cache.get_batch(&all_indices(14)).await.unwrap();
        assert_eq!(values, &interleaved()[..14]);
        assert!(!cache.is_finished());
        assert!(!cache.final_length_is_known());
        assert_eq!(cache.current_len(), Some(14));

        gate.store(true, Ordering::Release);
        cache.await_finished().await.unwrap();
        assert_eq!(cache.get_batch(&[14]).await.unwrap(), vec![204]);
        assert_eq!(cache.async_len().await.unwrap(), 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_writer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(AtomicBool::new(false));

        let (first, second) = tokio::join!(
            build_or_load_cache(
                dir.path(),
                gated(Arc::clone(&gate)),
                IdentityProcessor::new(0u64),
                options(),
            ),
            build_or_load_cache(
                dir.path(),
                gated(Arc::clone(&gate)),
                IdentityProcessor::new(0u64),
                options(),
            ),
        );
        let (cache, err) = match (first, second) {
            (Ok(cache), Err(err)) | (Err(err), Ok(cache)) => (cache, err),
            (Ok(_), Ok(_)) => panic!("two builders own the same directory"),
            (Err(a), Err(b)) => panic!("both builds failed: {a}; {b}"),
        };
        assert!(err.is_already_building(), "{err}");

        let again = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options(),
        )
        .await
        .err()
        .unwrap();
        assert!(again.is_already_building());

        gate.store(true, Ordering::Release);
        cache.await_finished().await.unwrap();

        let reopened = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options(),
        )
        .await
        .unwrap();
        assert!(reopened.is_finished());
        assert_eq!(reopened.get_batch(&all_indices(15)).await.unwrap(), interleaved());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_building_ledger_ignores_stray_chunk_files() {
        let dir = TempDir::new().unwrap();
        let failing = FnProcessor::new(0u64, |batch: Vec<u64>| {
            if batch.contains(&203) {
                return Err(CacheError::processing("bad row 203"));
            }
            Ok(batch)
        })
        .with_batch_size(2);
        build_or_load_cache(
            dir.path(),
            three_by_five(),
            failing,
            options().await_finished(true),
        )
        .await
        .err()
        .unwrap();

        // Leave the ledger as a crash mid-build would: still building.
        let ledger_path = dir.path().join(LEDGER_FILE);
        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&ledger_path).unwrap()).unwrap();
        raw["status"] = serde_json::json!({ "state": "building" });
        std::fs::write(&ledger_path, serde_json::to_vec_pretty(&raw).unwrap()).unwrap();

        let before = read_ledger(dir.path()).await.unwrap();
        assert_eq!(before.status, CacheStatus::Building);
        for (shard, progress) in before.shards.iter().enumerate() {
            if progress.finished {
                continue;
            }
            for chunk in progress.chunks..progress.chunks + 2 {
                let stray = dir.path().join(CacheLedger::chunk_file(shard, chunk));
                std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
                std::fs::write(&stray, b"half-written garbage").unwrap();
            }
        }

        let cache = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();
        assert_eq!(cache.get_batch(&all_indices(15)).await.unwrap(), interleaved());

        let after = read_ledger(dir.path()).await.unwrap();
        assert_eq!(after.status, CacheStatus::Finished);
        assert_eq!(after.build_id, before.build_id);
        assert_eq!(
            &after.chunk_records()[..before.chunk_records().len()],
            &before.chunk_records()[..]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_out_of_range_reports_requested_index() {
        let dir = TempDir::new().unwrap();
        let cache = build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        for index in [15, u64::MAX] {
            match cache.get_batch(&[0, index]).await.unwrap_err() {
                CacheError::OutOfRange { index: reported, length } => {
                    assert_eq!(reported, i128::from(index));
                    assert_eq!(length, 15);
                }
                other => panic!("expected out of range, got {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_load_errors_are_distinct() {
        let dir = TempDir::new().unwrap();

        let missing = TreeCache::<u64>::load(dir.path().join("nope"), &0)
            .await
            .err()
            .unwrap();
        assert!(missing.is_not_found());

        std::fs::write(dir.path().join(LEDGER_FILE), b"][").unwrap();
        let garbage = TreeCache::<u64>::load(dir.path(), &0).await.err().unwrap();
        assert!(garbage.is_corruption());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schema_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        let err = TreeCache::load(dir.path(), &String::new()).await.err().unwrap();
        assert!(err.is_corruption());

        let strings = three_by_five().map(|x| x.to_string());
        let err = build_or_load_cache(
            dir.path(),
            strings,
            IdentityProcessor::new(String::new()),
            options(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_corruption());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_damaged_chunk_is_corruption() {
        let dir = TempDir::new().unwrap();
        build_or_load_cache(
            dir.path(),
            three_by_five(),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        let chunk = dir.path().join(CacheLedger::chunk_file(0, 0));
        let mut bytes = std::fs::read(&chunk).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&chunk, bytes).unwrap();

        let cache = TreeCache::load(dir.path(), &0u64).await.unwrap();
        assert!(cache.get_batch(&[0]).await.unwrap_err().is_corruption());
        assert_eq!(cache.get_batch(&[2]).await.unwrap(), vec![100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_source_finishes_empty() {
        let dir = TempDir::new().unwrap();
        let cache = build_or_load_cache(
            dir.path(),
            InMemorySource::<u64>::new().with_shard("empty", vec![]),
            IdentityProcessor::new(0u64),
            options().await_finished(true),
        )
        .await
        .unwrap();

        assert_eq!(cache.async_len().await.unwrap(), 0);
        assert!(cache.get_batch(&[0]).await.unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_chunk_position() {
        let mut ledger = CacheLedger::new(
            vec!["a".into(), "b".into()],
            2,
            crate::cache::format::Compression::None,
            "number".into(),
        );
        ledger.record_chunk(0, 2);
        ledger.record_chunk(1, 1);
        let chunks = ledger.chunk_records();

        assert_eq!(chunk_position(&chunks, 0), Some(0));
        assert_eq!(chunk_position(&chunks, 1), Some(0));
        assert_eq!(chunk_position(&chunks, 2), Some(1));
        assert_eq!(chunk_position(&chunks, 3), None);
        assert_eq!(chunk_position(&[], 0), None);
    }

    #[test]
    fn test_chunk_cache_evicts_least_recent() {
        let mut cache = ChunkCache::new(2);
        cache.insert(0, Arc::new(vec![0]));
        cache.insert(1, Arc::new(vec![1]));
        assert!(cache.get(0).is_some());
        cache.insert(2, Arc::new(vec![2]));

        assert!(cache.get(1).is_none());
        assert!(cache.get(0).is_some());
        assert!(cache.get(2).is_some());
    }
}
