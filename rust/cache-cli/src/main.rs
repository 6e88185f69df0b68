//! Shard Cache command-line tool
//!
//! Inspects cache directories, builds caches from JSONL files and prints
//! deterministic permutations.
//!
//! # Usage
//!
//! ```bash
//! # Build a cache from two JSONL files, four shards each
//! shard-cache build-jsonl /data/cache a.jsonl b.jsonl --shards 4
//!
//! # Show the ledger of a cache
//! shard-cache inspect /data/cache
//!
//! # Read rows 0..10 in shuffled order
//! shard-cache read /data/cache --shuffle --seed 7 0 1 2 3 4 5 6 7 8 9
//!
//! # Where do indices 3 and 5 go in a permutation of 10?
//! shard-cache permute --length 10 --seed 0 3 5
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shard_cache::cache::{read_ledger, LoggingMonitor};
use shard_cache::dataset::{AsyncDataset, PermutedDataset, ShardedDataSource};
use shard_cache::{
    build_or_load_cache, BuildOptions, CacheConfig, IdentityProcessor, JsonlFileSource,
    LocalStorage, Permutation, PrngKey, StorageBackend, TreeCache,
};

/// Shard cache tool
#[derive(Parser, Debug)]
#[command(name = "shard-cache")]
#[command(about = "Build, inspect and read shard caches")]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ledger summary of a cache directory
    Inspect {
        dir: PathBuf,

        /// Also list every committed chunk
        #[arg(long)]
        chunks: bool,
    },

    /// Build (or resume) a cache holding the lines of JSONL files
    BuildJsonl {
        dir: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Shards per input file
        #[arg(long, default_value = "1")]
        shards: u32,

        /// Rows per chunk, overriding the config
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Print rows of a finished JSONL cache
    Read {
        dir: PathBuf,

        indices: Vec<u64>,

        /// Read through a seeded permutation
        #[arg(long)]
        shuffle: bool,

        /// Permutation seed, defaults to `shuffle.seed` from the config
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print permuted indices
    Permute {
        #[arg(long)]
        length: u64,

        /// Defaults to `shuffle.seed` from the config
        #[arg(long)]
        seed: Option<u64>,

        /// Indices to map; all of them when empty
        indices: Vec<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> shard_cache::Result<CacheConfig> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Inspect { dir, chunks } => {
            let ledger = read_ledger(config.resolve(&dir)).await?;
            let mut summary = json!({
                "build_id": ledger.build_id,
                "status": ledger.status,
                "length": ledger.length,
                "chunk_size": ledger.chunk_size,
                "compression": ledger.compression,
                "schema": ledger.schema,
                "num_chunks": ledger.num_chunks(),
                "shards": ledger.shards,
                "created_at": ledger.created_at,
                "updated_at": ledger.updated_at,
            });
            if chunks {
                summary["chunks"] = serde_json::to_value(ledger.chunk_records())?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::BuildJsonl {
            dir,
            files,
            shards,
            chunk_size,
        } => {
            let mut config = config;
            if let Some(chunk_size) = chunk_size {
                config.build.chunk_size = chunk_size;
            }

            let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage));
            let files: Vec<PathBuf> = files.iter().map(|f| config.resolve(f)).collect();
            let source = JsonlFileSource::<Value>::new(storage, &files, shards)?
                .map(|line: Value| line.to_string());

            tracing::info!("Building cache from {} file(s)", files.len());
            let options = BuildOptions::new(config)
                .await_finished(true)
                .monitor(Arc::new(LoggingMonitor::new(dir.display().to_string())));
            let cache = build_or_load_cache(&dir, source, IdentityProcessor::new(String::new()), options)
                .await?;

            println!(
                "{}",
                json!({ "dir": cache.dir(), "length": cache.async_len().await? })
            );
        }

        Command::Read {
            dir,
            indices,
            shuffle,
            seed,
        } => {
            let cache = TreeCache::load_with_config(&dir, &String::new(), &config).await?;
            let rows = if shuffle || config.shuffle.enabled {
                let key = PrngKey::new(seed.unwrap_or(config.shuffle.seed));
                PermutedDataset::new(cache, key).await?.get_batch(&indices).await?
            } else {
                cache.get_batch(&indices).await?
            };
            for row in rows {
                println!("{row}");
            }
        }

        Command::Permute {
            length,
            seed,
            indices,
        } => {
            let key = PrngKey::new(seed.unwrap_or(config.shuffle.seed));
            let permutation = Permutation::new(length, key)?;
            let indices = if indices.is_empty() {
                (0..length).collect()
            } else {
                indices
            };
            for (index, mapped) in indices.iter().zip(permutation.apply_all(&indices)?) {
                println!("{index}\t{mapped}");
            }
        }
    }

    Ok(())
}
