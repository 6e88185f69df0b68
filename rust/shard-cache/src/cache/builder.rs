// rust/shard-cache/src/cache/builder.rs

//! Background population of a cache directory.
//!
//! One worker task per unfinished shard reads rows, runs the processor and
//! writes chunk files. A single sequencer task owns the ledger: it commits
//! chunks in round-robin order, so global indices never depend on which
//! worker happened to finish first.
//!
//! At most one build per directory runs in a process; a second caller gets
//! `AlreadyBuilding` until the first build reaches a terminal state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::format::{encode_chunk, Compression};
use super::ledger::{schema_signature, CacheLedger, CacheStatus, ChunkRecord, InterleaveCursor};
use super::monitor::{CacheProgress, MetricsMonitor};
use super::tree_cache::{open_storage, TreeCache};
use crate::config::CacheConfig;
use crate::dataset::{process_checked, BatchProcessor, ShardRows, ShardedDataSource};
use crate::error::{CacheError, Result};
use crate::storage::AsyncStorageBackend;

/// How far, in interleave rounds, a worker may run ahead of the commit point.
const MAX_ROUNDS_AHEAD: u64 = 2;

/// Capacity of the worker → sequencer event channel.
const EVENT_BUFFER: usize = 256;

/// Directories with a build running in this process, by canonical path.
fn active_builds() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(Mutex::default)
}

/// Exclusive claim on a cache directory, released on drop.
#[derive(Debug)]
struct BuildLock {
    key: PathBuf,
}

impl BuildLock {
    async fn acquire(dir: &Path) -> Result<Self> {
        let key = tokio::fs::canonicalize(dir).await.map_err(|e| {
            CacheError::storage_with_source(dir, "failed to resolve cache directory", e)
        })?;
        let claimed = active_builds()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !claimed {
            return Err(CacheError::already_building(dir));
        }
        Ok(Self { key })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        active_builds()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Options for [`build_or_load_cache`].
#[derive(Clone, Default)]
pub struct BuildOptions {
    pub config: CacheConfig,
    /// Block until the build reaches a terminal state before returning.
    pub await_finished: bool,
    pub monitors: Vec<Arc<dyn MetricsMonitor>>,
}

impl BuildOptions {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn await_finished(mut self, await_finished: bool) -> Self {
        self.await_finished = await_finished;
        self
    }

    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn MetricsMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }
}

/// Opens the cache at `path`, building or resuming it in the background when
/// it is not finished.
///
/// - finished ledger: opened as is, nothing is recomputed;
/// - building or failed ledger: resumed from its per-shard row counts;
/// - no ledger: a fresh build.
///
/// # Errors
///
/// `AlreadyBuilding` if another build of the same directory is running in
/// this process. `Corruption` if an existing ledger is unreadable, was built
/// for another record shape, or lists different shards than `source`. With
/// `await_finished`, a failed build is returned as `ProcessingFailure`.
pub async fn build_or_load_cache<S, P>(
    path: impl AsRef<Path>,
    source: S,
    processor: P,
    options: BuildOptions,
) -> Result<TreeCache<P::Output>>
where
    S: ShardedDataSource<Item = P::Input>,
    P: BatchProcessor,
{
    let config = &options.config;
    config.validate()?;

    let dir = config.resolve(path);
    let storage = open_storage(&dir, config).await?;
    let lock = BuildLock::acquire(&dir).await?;
    let schema = schema_signature(&processor.output_exemplar())?;
    let shard_names = source.shard_names();

    let mut ledger = match CacheLedger::load(storage.as_ref(), &dir).await {
        Ok(mut ledger) => {
            if ledger.schema != schema {
                return Err(CacheError::corruption(
                    &dir,
                    format!(
                        "cache holds records shaped {} but processor produces {schema}",
                        ledger.schema
                    ),
                ));
            }

            if ledger.status == CacheStatus::Finished {
                info!(cache = %dir.display(), rows = ledger.length, "Cache is complete");
                let progress = CacheProgress::from_ledger(&ledger);
                for monitor in &options.monitors {
                    monitor.on_progress(&progress);
                }
                return Ok(TreeCache::finished(
                    dir,
                    storage,
                    ledger,
                    config.build.read_cache_chunks,
                ));
            }

            if ledger.shard_names() != shard_names {
                return Err(CacheError::corruption(
                    &dir,
                    "source shards do not match the shards recorded in the ledger",
                ));
            }

            if let CacheStatus::Failed { message } = &ledger.status {
                warn!(cache = %dir.display(), previous_error = %message, "Retrying failed cache build");
            }
            info!(
                cache = %dir.display(),
                rows = ledger.length,
                chunks = ledger.num_chunks(),
                "Resuming cache build"
            );
            ledger.status = CacheStatus::Building;
            ledger
        }
        Err(e) if e.is_not_found() => {
            let chunk_size = match config.build.chunk_size {
                0 => processor.batch_size().max(1),
                n => n,
            };
            let compression: Compression = config.build.compression.parse()?;
            info!(
                cache = %dir.display(),
                shards = shard_names.len(),
                chunk_size,
                %compression,
                "Starting cache build"
            );
            CacheLedger::new(shard_names, chunk_size, compression, schema)
        }
        Err(e) => return Err(e),
    };

    ledger.save(storage.as_ref()).await?;

    let available_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = processor
        .resources()
        .worker_count(available_cores, config.build.max_workers);

    let ctx = Arc::new(BuildContext {
        source: Arc::new(source),
        processor: Arc::new(processor),
        storage: Arc::clone(&storage),
        chunk_size: ledger.chunk_size,
        compression: ledger.compression,
        compression_level: config.build.compression_level,
        permits: Arc::new(Semaphore::new(workers)),
    });

    let (progress_tx, progress_rx) = watch::channel(CacheProgress::from_ledger(&ledger));
    let index = Arc::new(RwLock::new(ledger.chunk_records()));

    debug!(cache = %dir.display(), workers, "Spawning shard workers");
    let handle = spawn_build(
        ctx,
        ledger,
        lock,
        dir.clone(),
        Arc::clone(&index),
        progress_tx,
        options.monitors.clone(),
    );

    let cache = TreeCache::building(
        dir,
        storage,
        index,
        progress_rx,
        handle,
        config.build.read_cache_chunks,
    );

    if options.await_finished {
        cache.await_finished().await?;
    }
    Ok(cache)
}

struct BuildContext<S, P> {
    source: Arc<S>,
    processor: Arc<P>,
    storage: Arc<dyn AsyncStorageBackend>,
    chunk_size: usize,
    compression: Compression,
    compression_level: i32,
    /// Bounds concurrently processed chunks across all shards
    permits: Arc<Semaphore>,
}

#[derive(Debug)]
enum WorkerEvent {
    /// A chunk file is durable and waiting to be committed.
    Chunk {
        shard: usize,
        chunk_index: u64,
        num_rows: u64,
    },
    /// The shard produced exactly `chunks` chunks in total.
    Exhausted { shard: usize, chunks: u64 },
    Failed { shard: usize, error: CacheError },
}

fn spawn_build<S, P>(
    ctx: Arc<BuildContext<S, P>>,
    ledger: CacheLedger,
    lock: BuildLock,
    dir: PathBuf,
    index: Arc<RwLock<Vec<ChunkRecord>>>,
    progress: watch::Sender<CacheProgress>,
    monitors: Vec<Arc<dyn MetricsMonitor>>,
) -> JoinHandle<()>
where
    S: ShardedDataSource<Item = P::Input>,
    P: BatchProcessor,
{
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut workers = JoinSet::new();

    for (shard, progress_entry) in ledger.shards.iter().enumerate() {
        if progress_entry.finished {
            continue;
        }
        workers.spawn(run_worker(
            Arc::clone(&ctx),
            shard,
            progress_entry.name.clone(),
            progress_entry.rows,
            progress_entry.chunks,
            events_tx.clone(),
            progress.subscribe(),
        ));
    }
    drop(events_tx);

    let sequencer = Sequencer {
        storage: Arc::clone(&ctx.storage),
        ledger,
        lock: Some(lock),
        dir,
        index,
        progress,
        monitors,
        events: events_rx,
        workers,
        ready: HashMap::new(),
        exhausted: HashMap::new(),
    };

    tokio::spawn(sequencer.run())
}

/// Runs `f` on the blocking pool, flattening its result.
async fn blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::processing(format!("blocking task failed: {e}")))?
}

/// Waits until chunk `chunk_index` is within reach of the commit point.
///
/// Returns false once the build is over or the sequencer is gone.
async fn wait_for_round(progress: &mut watch::Receiver<CacheProgress>, chunk_index: u64) -> bool {
    loop {
        {
            let current = progress.borrow_and_update();
            if current.is_terminal() {
                return false;
            }
            if current.round + MAX_ROUNDS_AHEAD >= chunk_index {
                return true;
            }
        }
        if progress.changed().await.is_err() {
            return false;
        }
    }
}

/// Pulls up to `n` rows. The flag is true when the shard ran out.
fn read_rows<T>(mut rows: ShardRows<T>, n: usize) -> Result<(ShardRows<T>, Vec<T>, bool)> {
    let mut items = Vec::with_capacity(n);
    while items.len() < n {
        match rows.next() {
            Some(item) => items.push(item?),
            None => return Ok((rows, items, true)),
        }
    }
    Ok((rows, items, false))
}

async fn run_worker<S, P>(
    ctx: Arc<BuildContext<S, P>>,
    shard: usize,
    name: String,
    start_row: u64,
    start_chunk: u64,
    events: mpsc::Sender<WorkerEvent>,
    progress: watch::Receiver<CacheProgress>,
) where
    S: ShardedDataSource<Item = P::Input>,
    P: BatchProcessor,
{
    let event = match shard_loop(&ctx, shard, &name, start_row, start_chunk, &events, progress).await
    {
        Ok(Some(chunks)) => {
            debug!(shard = %name, chunks, "Shard exhausted");
            WorkerEvent::Exhausted { shard, chunks }
        }
        Ok(None) => return,
        Err(error) => {
            error!(shard = %name, %error, "Shard worker failed");
            WorkerEvent::Failed { shard, error }
        }
    };
    // A closed channel means the build already ended.
    let _ = events.send(event).await;
}

/// Returns the shard's total chunk count once it is exhausted, or `None` if
/// the build stopped first.
async fn shard_loop<S, P>(
    ctx: &BuildContext<S, P>,
    shard: usize,
    name: &str,
    start_row: u64,
    mut chunk_index: u64,
    events: &mpsc::Sender<WorkerEvent>,
    mut progress: watch::Receiver<CacheProgress>,
) -> Result<Option<u64>>
where
    S: ShardedDataSource<Item = P::Input>,
    P: BatchProcessor,
{
    let source = Arc::clone(&ctx.source);
    let shard_name = name.to_string();
    let mut rows = blocking(move || source.open_shard_at_row(&shard_name, start_row)).await?;

    loop {
        if !wait_for_round(&mut progress, chunk_index).await {
            return Ok(None);
        }

        let chunk_size = ctx.chunk_size;
        let (returned, items, exhausted) = blocking(move || read_rows(rows, chunk_size)).await?;
        rows = returned;

        if !items.is_empty() {
            let num_rows = items.len() as u64;

            let permit = Arc::clone(&ctx.permits)
                .acquire_owned()
                .await
                .map_err(|_| CacheError::processing("worker pool closed"))?;

            let processor = Arc::clone(&ctx.processor);
            let (compression, level) = (ctx.compression, ctx.compression_level);
            let bytes = blocking(move || {
                let batch_size = processor.batch_size().max(1);
                let mut outputs = Vec::with_capacity(items.len());
                let mut items = items.into_iter();
                loop {
                    let batch: Vec<_> = items.by_ref().take(batch_size).collect();
                    if batch.is_empty() {
                        break;
                    }
                    outputs.extend(process_checked(processor.as_ref(), batch)?);
                }
                encode_chunk(&outputs, compression, level)
            })
            .await?;
            drop(permit);

            let file = CacheLedger::chunk_file(shard, chunk_index);
            ctx.storage.write_atomic(Path::new(&file), &bytes).await?;
            debug!(shard = %name, chunk_index, num_rows, bytes = bytes.len(), "Chunk written");

            let ready = WorkerEvent::Chunk {
                shard,
                chunk_index,
                num_rows,
            };
            if events.send(ready).await.is_err() {
                return Ok(None);
            }
            chunk_index += 1;
        }

        if exhausted {
            return Ok(Some(chunk_index));
        }
    }
}

enum Step {
    Event(Option<WorkerEvent>),
    Joined(std::result::Result<(), tokio::task::JoinError>),
}

/// Single writer of the ledger.
struct Sequencer {
    storage: Arc<dyn AsyncStorageBackend>,
    ledger: CacheLedger,
    /// Released before the terminal state is published
    lock: Option<BuildLock>,
    dir: PathBuf,
    index: Arc<RwLock<Vec<ChunkRecord>>>,
    progress: watch::Sender<CacheProgress>,
    monitors: Vec<Arc<dyn MetricsMonitor>>,
    events: mpsc::Receiver<WorkerEvent>,
    workers: JoinSet<()>,
    /// Durable chunks not yet committed, keyed by (shard, chunk index)
    ready: HashMap<(usize, u64), u64>,
    /// Final chunk counts of exhausted shards not yet marked finished
    exhausted: HashMap<usize, u64>,
}

impl Sequencer {
    async fn run(mut self) {
        let outcome = self.drive().await;
        self.workers.abort_all();

        if let Err(error) = outcome {
            error!(cache = %self.dir.display(), %error, rows = self.ledger.length, "Cache build failed");
            self.ledger.status = CacheStatus::Failed {
                message: error.to_string(),
            };
            if let Err(e) = self.ledger.save(self.storage.as_ref()).await {
                error!(cache = %self.dir.display(), error = %e, "Failed to persist failed ledger");
            }
            drop(self.lock.take());
            self.publish();
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.advance().await?;

            if self.ledger.all_shards_finished() {
                self.ledger.status = CacheStatus::Finished;
                self.ledger.save(self.storage.as_ref()).await?;
                info!(
                    cache = %self.dir.display(),
                    rows = self.ledger.length,
                    chunks = self.ledger.num_chunks(),
                    "Cache build finished"
                );
                drop(self.lock.take());
                self.publish();
                return Ok(());
            }

            let step = tokio::select! {
                event = self.events.recv() => Step::Event(event),
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    Step::Joined(joined)
                }
            };

            match step {
                Step::Event(Some(WorkerEvent::Chunk {
                    shard,
                    chunk_index,
                    num_rows,
                })) => {
                    self.ready.insert((shard, chunk_index), num_rows);
                }
                Step::Event(Some(WorkerEvent::Exhausted { shard, chunks })) => {
                    self.exhausted.insert(shard, chunks);
                }
                Step::Event(Some(WorkerEvent::Failed { shard, error })) => {
                    let name = self
                        .ledger
                        .shards
                        .get(shard)
                        .map(|s| s.name.clone())
                        .unwrap_or_default();
                    return Err(match error {
                        CacheError::ProcessingFailure { message } => {
                            CacheError::processing(format!("shard '{name}': {message}"))
                        }
                        other => CacheError::processing(format!("shard '{name}': {other}")),
                    });
                }
                Step::Event(None) => {
                    return Err(CacheError::processing(
                        "shard workers exited before the cache finished",
                    ));
                }
                Step::Joined(Err(e)) if e.is_panic() => {
                    return Err(CacheError::processing(format!("shard worker panicked: {e}")));
                }
                Step::Joined(_) => {}
            }
        }
    }

    /// Commits everything that is next in interleave order.
    async fn advance(&mut self) -> Result<()> {
        let num_shards = self.ledger.shards.len();

        while !self.ledger.all_shards_finished() {
            let InterleaveCursor { round, position } = self.ledger.cursor;

            if position >= num_shards {
                self.ledger.cursor = InterleaveCursor {
                    round: round + 1,
                    position: 0,
                };
                self.progress.send_modify(|p| p.round = round + 1);
                continue;
            }

            if self.ledger.shards[position].finished {
                self.ledger.cursor.position += 1;
                continue;
            }

            if let Some(num_rows) = self.ready.remove(&(position, round)) {
                let record = self.ledger.record_chunk(position, num_rows);
                self.ledger.cursor.position += 1;
                self.ledger.save(self.storage.as_ref()).await?;
                self.index.write().await.push(record);
                self.publish();
                continue;
            }

            if self.exhausted.get(&position) == Some(&round) {
                self.exhausted.remove(&position);
                self.ledger.mark_shard_finished(position);
                self.ledger.cursor.position += 1;
                self.ledger.save(self.storage.as_ref()).await?;
                debug!(shard = %self.ledger.shards[position].name, "Shard finished");
                self.publish();
                continue;
            }

            break;
        }
        Ok(())
    }

    /// Monitors hear about a snapshot before any waiting reader is woken.
    fn publish(&self) {
        let snapshot = CacheProgress::from_ledger(&self.ledger);
        for monitor in &self.monitors {
            monitor.on_progress(&snapshot);
        }
        self.progress.send_replace(snapshot);
    }
}
