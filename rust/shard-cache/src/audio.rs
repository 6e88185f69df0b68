// rust/shard-cache/src/audio.rs

//! Speech-to-text preprocessing on top of the cache.
//!
//! Raw `(audio, sampling rate, transcript)` samples are turned into model
//! inputs by a [`BatchAudioProcessor`] and stored in a [`ProcessedAudioCache`].
//! Feature extraction and tokenization are pluggable through
//! [`FeatureExtractor`] and [`TextTokenizer`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::cache::{
    build_or_load_cache, BuildOptions, CacheProgress, LoggingMonitor, MetricsMonitor, TreeCache,
};
use crate::config::CacheConfig;
use crate::dataset::{
    AsyncDataset, BatchProcessor, JsonlFileSource, ResourceHints, ShardRows, ShardedDataSource,
    DEFAULT_BATCH_SIZE,
};
use crate::error::{CacheError, Result};
use crate::storage::{LocalStorage, StorageBackend};

/// Default token budget per transcript.
pub const DEFAULT_MAX_LENGTH: usize = 448;

/// Default sampling rate of source audio, in Hz.
pub const DEFAULT_SAMPLING_RATE: u32 = 16_000;

/// One raw training sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTextSample {
    pub audio: Vec<f32>,
    pub sampling_rate: u32,
    pub text: String,
}

/// One processed sample as stored in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioTextRecord {
    /// Feature frames, one row per frame
    pub input_features: Vec<Vec<f32>>,
    pub input_ids: Vec<i32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<i32>,
}

impl AudioTextRecord {
    /// The record used to derive the cache schema.
    pub fn exemplar() -> Self {
        Self {
            input_features: vec![vec![0.0]],
            input_ids: Vec::new(),
            attention_mask: Vec::new(),
        }
    }
}

/// Turns raw audio into feature frames.
pub trait FeatureExtractor: Send + Sync + 'static {
    /// Returns one feature matrix per clip, in input order.
    fn extract(&self, audio: &[&[f32]], sampling_rate: u32) -> Result<Vec<Vec<Vec<f32>>>>;
}

pub trait TextTokenizer: Send + Sync + 'static {
    fn encode(&self, text: &str) -> Result<Vec<i32>>;

    fn bos_token_id(&self) -> Option<i32>;

    fn eos_token_id(&self) -> Option<i32>;

    fn pad_token_id(&self) -> i32;
}

/// Extracts audio features and tokenizes transcripts in one pass.
///
/// Every sample in a batch must share one sampling rate.
pub struct BatchAudioProcessor<E, K> {
    extractor: E,
    tokenizer: K,
    enforce_bos: bool,
    enforce_eos: bool,
    max_length: usize,
    padding: bool,
    batch_size: usize,
    resources: Option<ResourceHints>,
}

impl<E, K> BatchAudioProcessor<E, K>
where
    E: FeatureExtractor,
    K: TextTokenizer,
{
    pub fn new(extractor: E, tokenizer: K) -> Self {
        Self {
            extractor,
            tokenizer,
            enforce_bos: true,
            enforce_eos: true,
            max_length: DEFAULT_MAX_LENGTH,
            padding: true,
            batch_size: DEFAULT_BATCH_SIZE,
            resources: None,
        }
    }

    /// Prepend BOS when the tokenizer did not.
    #[must_use]
    pub fn enforce_bos(mut self, enforce: bool) -> Self {
        self.enforce_bos = enforce;
        self
    }

    /// Append EOS when the tokenizer did not.
    #[must_use]
    pub fn enforce_eos(mut self, enforce: bool) -> Self {
        self.enforce_eos = enforce;
        self
    }

    #[must_use]
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length.max(1);
        self
    }

    /// Pad every transcript to `max_length`.
    #[must_use]
    pub fn padding(mut self, padding: bool) -> Self {
        self.padding = padding;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn override_resources(mut self, resources: ResourceHints) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Token ids and attention mask for one transcript.
    fn tokenize(&self, text: &str) -> Result<(Vec<i32>, Vec<i32>)> {
        let mut ids = self.tokenizer.encode(text)?;

        if self.enforce_bos {
            if let Some(bos) = self.tokenizer.bos_token_id() {
                if ids.first() != Some(&bos) {
                    ids.insert(0, bos);
                }
            }
        }
        let eos = self
            .tokenizer
            .eos_token_id()
            .filter(|_| self.enforce_eos);
        if let Some(eos) = eos {
            if ids.last() != Some(&eos) {
                ids.push(eos);
            }
        }

        if ids.len() > self.max_length {
            ids.truncate(self.max_length);
            // A truncated transcript still ends the sequence.
            if let (Some(eos), Some(last)) = (eos, ids.last_mut()) {
                *last = eos;
            }
        }

        let mut mask = vec![1; ids.len()];
        if self.padding {
            let pad = self.tokenizer.pad_token_id();
            ids.resize(self.max_length, pad);
            mask.resize(self.max_length, 0);
        }
        Ok((ids, mask))
    }
}

impl<E, K> BatchProcessor for BatchAudioProcessor<E, K>
where
    E: FeatureExtractor,
    K: TextTokenizer,
{
    type Input = AudioTextSample;
    type Output = AudioTextRecord;

    fn process(&self, batch: Vec<AudioTextSample>) -> Result<Vec<AudioTextRecord>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let rates: BTreeSet<u32> = batch.iter().map(|s| s.sampling_rate).collect();
        if rates.len() != 1 {
            return Err(CacheError::processing(format!(
                "sampling rates should be standardized, batch has {rates:?}"
            )));
        }
        let sampling_rate = batch[0].sampling_rate;

        let clips: Vec<&[f32]> = batch.iter().map(|s| s.audio.as_slice()).collect();
        let features = self.extractor.extract(&clips, sampling_rate)?;
        if features.len() != batch.len() {
            return Err(CacheError::processing(format!(
                "feature extractor returned {} results for {} clips",
                features.len(),
                batch.len()
            )));
        }

        batch
            .iter()
            .zip(features)
            .map(|(sample, input_features)| {
                let (input_ids, attention_mask) = self.tokenize(&sample.text)?;
                Ok(AudioTextRecord {
                    input_features,
                    input_ids,
                    attention_mask,
                })
            })
            .collect()
    }

    fn output_exemplar(&self) -> AudioTextRecord {
        AudioTextRecord::exemplar()
    }

    fn resources(&self) -> ResourceHints {
        self.resources.unwrap_or_default()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// A cache of processed audio/text records.
pub struct ProcessedAudioCache {
    cache: TreeCache<AudioTextRecord>,
}

impl ProcessedAudioCache {
    pub async fn build_or_load<S, E, K>(
        path: impl AsRef<Path>,
        source: S,
        processor: BatchAudioProcessor<E, K>,
        options: BuildOptions,
    ) -> Result<Self>
    where
        S: ShardedDataSource<Item = AudioTextSample>,
        E: FeatureExtractor,
        K: TextTokenizer,
    {
        let path = path.as_ref();
        let cache = build_or_load_cache(path, source, processor, options).await?;
        if cache.is_finished() {
            info!(cache = %path.display(), "Cache is complete");
        } else {
            info!(
                cache = %path.display(),
                "Cache is incomplete, reads block until their rows are committed"
            );
        }
        Ok(Self { cache })
    }

    /// Opens a finished cache.
    ///
    /// # Errors
    ///
    /// `Incomplete` when `path` holds no finished cache.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_config(path, &CacheConfig::default()).await
    }

    pub async fn load_with_config(path: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        let path = path.as_ref();
        match TreeCache::load_with_config(path, &AudioTextRecord::exemplar(), config).await {
            Ok(cache) => Ok(Self { cache }),
            Err(e) if e.is_not_found() || e.is_incomplete() => {
                Err(CacheError::incomplete(config.resolve(path)))
            }
            Err(e) => {
                error!(cache = %path.display(), error = %e, "Error loading cache");
                Err(e)
            }
        }
    }

    pub fn cache(&self) -> &TreeCache<AudioTextRecord> {
        &self.cache
    }

    pub fn progress(&self) -> CacheProgress {
        self.cache.progress()
    }

    pub async fn await_finished(&self) -> Result<()> {
        self.cache.await_finished().await
    }

    pub fn into_inner(self) -> TreeCache<AudioTextRecord> {
        self.cache
    }
}

#[async_trait]
impl AsyncDataset for ProcessedAudioCache {
    type Item = AudioTextRecord;

    async fn async_len(&self) -> Result<u64> {
        self.cache.async_len().await
    }

    fn final_length_is_known(&self) -> bool {
        self.cache.final_length_is_known()
    }

    fn current_len(&self) -> Option<u64> {
        self.cache.current_len()
    }

    fn is_finite(&self) -> bool {
        self.cache.is_finite()
    }

    async fn get_batch(&self, indices: &[u64]) -> Result<Vec<AudioTextRecord>> {
        self.cache.get_batch(indices).await
    }
}

/// Where the raw samples of each split live.
///
/// URLs are local JSONL paths. They may use brace expansion (`{a,b}`,
/// `{0..3}`) and `*` or `?` wildcards in the file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDatasetSourceConfig {
    pub text_key: String,
    pub audio_key: String,
    pub sampling_rate: u32,
    pub train_urls: Vec<String>,
    pub validation_urls: Vec<String>,
    /// Byte-range shards per source file
    pub shards_per_file: u32,
}

impl Default for AudioDatasetSourceConfig {
    fn default() -> Self {
        Self {
            text_key: "text".to_string(),
            audio_key: "audio".to_string(),
            sampling_rate: DEFAULT_SAMPLING_RATE,
            train_urls: Vec::new(),
            validation_urls: Vec::new(),
            shards_per_file: 1,
        }
    }
}

impl AudioDatasetSourceConfig {
    /// Expanded file list of `split` (`train` or `validation`).
    pub fn urls_for_split(&self, split: &str) -> Result<Vec<PathBuf>> {
        let patterns = match split {
            "train" => &self.train_urls,
            "validation" => &self.validation_urls,
            other => return Err(CacheError::config(format!("unknown split '{other}'"))),
        };

        let mut urls = Vec::new();
        for pattern in patterns {
            for url in expand_braces(pattern) {
                urls.extend(expand_wildcards(&url)?);
            }
        }
        Ok(urls)
    }

    /// Source over the files of `split`, or `None` if it has no files.
    pub fn shard_source(&self, split: &str) -> Result<Option<AudioJsonlSource>> {
        let urls = self.urls_for_split(split)?;
        if urls.is_empty() {
            return Ok(None);
        }

        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::default());
        let inner = JsonlFileSource::new(storage, &urls, self.shards_per_file)?;
        Ok(Some(AudioJsonlSource {
            inner,
            fields: Arc::new(AudioFields {
                text_key: self.text_key.clone(),
                audio_key: self.audio_key.clone(),
                sampling_rate: self.sampling_rate,
            }),
        }))
    }
}

/// JSONL rows decoded into [`AudioTextSample`]s.
///
/// The audio field is either an array of samples at the configured rate or
/// an object `{"array": [...], "sampling_rate": n}`.
pub struct AudioJsonlSource {
    inner: JsonlFileSource<Value>,
    fields: Arc<AudioFields>,
}

struct AudioFields {
    text_key: String,
    audio_key: String,
    sampling_rate: u32,
}

impl AudioFields {
    fn decode(&self, shard: &str, row: &Value) -> Result<AudioTextSample> {
        let text = row
            .get(&self.text_key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CacheError::dataset(shard, format!("record has no string '{}'", self.text_key))
            })?
            .to_string();

        let audio_value = row.get(&self.audio_key).ok_or_else(|| {
            CacheError::dataset(shard, format!("record has no '{}'", self.audio_key))
        })?;
        let (samples, sampling_rate) = match audio_value {
            Value::Object(fields) => {
                let rate = match fields.get("sampling_rate") {
                    Some(v) => v
                        .as_u64()
                        .and_then(|r| u32::try_from(r).ok())
                        .ok_or_else(|| CacheError::dataset(shard, "invalid sampling_rate"))?,
                    None => self.sampling_rate,
                };
                (fields.get("array"), rate)
            }
            other => (Some(other), self.sampling_rate),
        };

        let audio = samples
            .and_then(Value::as_array)
            .ok_or_else(|| CacheError::dataset(shard, "audio must be an inline array of samples"))?
            .iter()
            .map(|v| v.as_f64().map(|x| x as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| CacheError::dataset(shard, "audio samples must be numbers"))?;

        Ok(AudioTextSample {
            audio,
            sampling_rate,
            text,
        })
    }
}

impl ShardedDataSource for AudioJsonlSource {
    type Item = AudioTextSample;

    fn shard_names(&self) -> Vec<String> {
        self.inner.shard_names()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<ShardRows<AudioTextSample>> {
        let rows = self.inner.open_shard_at_row(shard, row)?;
        let fields = Arc::clone(&self.fields);
        let shard = shard.to_string();
        Ok(Box::new(rows.map(move |value| {
            value.and_then(|v| fields.decode(&shard, &v))
        })))
    }
}

/// Everything needed to build the audio caches of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioIoDatasetConfig {
    #[serde(flatten)]
    pub source: AudioDatasetSourceConfig,
    /// Each split is cached in `<cache_dir>/<split>`
    pub cache_dir: PathBuf,
    pub train_split: String,
    pub validation_split: String,
    pub enforce_bos: bool,
    pub enforce_eos: bool,
    pub max_length: usize,
    pub padding: bool,
    pub cache: CacheConfig,
}

impl Default for AudioIoDatasetConfig {
    fn default() -> Self {
        Self {
            source: AudioDatasetSourceConfig::default(),
            cache_dir: PathBuf::from("cache"),
            train_split: "train".to_string(),
            validation_split: "validation".to_string(),
            enforce_bos: true,
            enforce_eos: true,
            max_length: DEFAULT_MAX_LENGTH,
            padding: true,
            cache: CacheConfig::default(),
        }
    }
}

impl AudioIoDatasetConfig {
    /// Processor configured from this config.
    pub fn processor<E, K>(
        &self,
        extractor: E,
        tokenizer: K,
        batch_size: usize,
    ) -> BatchAudioProcessor<E, K>
    where
        E: FeatureExtractor,
        K: TextTokenizer,
    {
        BatchAudioProcessor::new(extractor, tokenizer)
            .enforce_bos(self.enforce_bos)
            .enforce_eos(self.enforce_eos)
            .max_length(self.max_length)
            .padding(self.padding)
            .batch_size(batch_size)
    }

    /// Loads the finished cache of `split`, or starts building it.
    ///
    /// Returns `None` when the split has no source files. Validation caches are
    /// built to completion before returning; training caches fill in the
    /// background. `monitors` defaults to a [`LoggingMonitor`].
    pub async fn build_or_load_cache<E, K>(
        &self,
        split: &str,
        extractor: E,
        tokenizer: K,
        batch_size: usize,
        monitors: Option<Vec<Arc<dyn MetricsMonitor>>>,
    ) -> Result<Option<ProcessedAudioCache>>
    where
        E: FeatureExtractor,
        K: TextTokenizer,
    {
        let split_dir = self.cache_dir.join(split);

        match ProcessedAudioCache::load_with_config(&split_dir, &self.cache).await {
            Ok(cache) => return Ok(Some(cache)),
            Err(e) if e.is_incomplete() => {}
            Err(e) => return Err(e),
        }

        let Some(source) = self.source.shard_source(split)? else {
            info!(split, "No data for split");
            return Ok(None);
        };

        info!(split, shards = source.shard_names().len(), "Building cache");
        let name = self
            .cache_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let monitors = monitors.unwrap_or_else(|| {
            vec![Arc::new(LoggingMonitor::new(format!("{name}/{split}"))) as Arc<dyn MetricsMonitor>]
        });

        let options = BuildOptions {
            config: self.cache.clone(),
            await_finished: split == "validation",
            monitors,
        };
        let processor = self.processor(extractor, tokenizer, batch_size);
        ProcessedAudioCache::build_or_load(&split_dir, source, processor, options)
            .await
            .map(Some)
    }

    /// # Errors
    ///
    /// `Config` if there is no training data.
    pub async fn train_set<E, K>(
        &self,
        extractor: E,
        tokenizer: K,
        batch_size: usize,
    ) -> Result<ProcessedAudioCache>
    where
        E: FeatureExtractor,
        K: TextTokenizer,
    {
        let split = self.train_split.clone();
        self.build_or_load_cache(&split, extractor, tokenizer, batch_size, None)
            .await?
            .ok_or_else(|| CacheError::config("no training set"))
    }

    pub async fn validation_set<E, K>(
        &self,
        extractor: E,
        tokenizer: K,
    ) -> Result<Option<ProcessedAudioCache>>
    where
        E: FeatureExtractor,
        K: TextTokenizer,
    {
        let split = self.validation_split.clone();
        self.build_or_load_cache(&split, extractor, tokenizer, DEFAULT_BATCH_SIZE, None)
            .await
    }
}

/// Expands shell-style braces: `a{1,2}b` and numeric ranges `{0..3}`.
///
/// Ranges are inclusive and keep zero padding (`{08..10}` gives `08 09 10`).
/// Unbalanced or single-item braces are kept literally.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = matching_brace(pattern, open) else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let inner = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let alternatives = split_top_level(inner);
    let items = if alternatives.len() > 1 {
        alternatives
    } else if let Some(range) = numeric_range(inner) {
        range
    } else {
        return expand_braces(suffix)
            .into_iter()
            .map(|tail| format!("{}{tail}", &pattern[..=close]))
            .collect();
    };

    items
        .iter()
        .flat_map(|item| expand_braces(&format!("{item}{suffix}")))
        .map(|tail| format!("{prefix}{tail}"))
        .collect()
}

fn matching_brace(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices().skip_while(|&(i, _)| i < open) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(inner: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

fn numeric_range(inner: &str) -> Option<Vec<String>> {
    let (lo, hi) = inner.split_once("..")?;
    let (start, end): (i64, i64) = (lo.parse().ok()?, hi.parse().ok()?);
    let padded = |s: &str| s.trim_start_matches('-').len() > 1 && s.trim_start_matches('-').starts_with('0');
    let width = if padded(lo) || padded(hi) {
        lo.len().max(hi.len())
    } else {
        0
    };

    let values: Vec<i64> = if start <= end {
        (start..=end).collect()
    } else {
        (end..=start).rev().collect()
    };
    Some(values.iter().map(|v| format!("{v:0width$}")).collect())
}

/// Expands `*` and `?` in the file name of `url` against the local directory.
fn expand_wildcards(url: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(url);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !name.contains(['*', '?']) {
        return Ok(vec![path.to_path_buf()]);
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| CacheError::storage_with_source(&dir, "failed to list directory", e))?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| CacheError::storage_with_source(&dir, "failed to list directory", e))?;
        let candidate = entry.file_name().to_string_lossy().into_owned();
        if wildcard_match(&name, &candidate) {
            matches.push(dir.join(candidate));
        }
    }
    matches.sort();
    Ok(matches)
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CollectingMonitor;
    use crate::dataset::InMemorySource;
    use tempfile::TempDir;

    /// Splits audio into frames of `frame_len`, zero-padding the last one.
    struct Framer {
        frame_len: usize,
    }

    impl FeatureExtractor for Framer {
        fn extract(&self, audio: &[&[f32]], _sampling_rate: u32) -> Result<Vec<Vec<Vec<f32>>>> {
            Ok(audio
                .iter()
                .map(|clip| {
                    clip.chunks(self.frame_len)
                        .map(|frame| {
                            let mut frame = frame.to_vec();
                            frame.resize(self.frame_len, 0.0);
                            frame
                        })
                        .collect()
                })
                .collect())
        }
    }

    /// One token per character; BOS 1, EOS 2, PAD 0.
    struct CharTokenizer {
        add_special: bool,
    }

    impl TextTokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<i32>> {
            let mut ids: Vec<i32> = text.chars().map(|c| c as i32).collect();
            if self.add_special {
                ids.insert(0, 1);
                ids.push(2);
            }
            Ok(ids)
        }

        fn bos_token_id(&self) -> Option<i32> {
            Some(1)
        }

        fn eos_token_id(&self) -> Option<i32> {
            Some(2)
        }

        fn pad_token_id(&self) -> i32 {
            0
        }
    }

    fn processor() -> BatchAudioProcessor<Framer, CharTokenizer> {
        BatchAudioProcessor::new(Framer { frame_len: 2 }, CharTokenizer { add_special: false })
            .max_length(6)
    }

    fn sample(text: &str, rate: u32) -> AudioTextSample {
        AudioTextSample {
            audio: vec![0.5, -0.5, 0.25],
            sampling_rate: rate,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_process_pads_and_masks() {
        let out = processor().process(vec![sample("ab", 16_000)]).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].input_features, vec![vec![0.5, -0.5], vec![0.25, 0.0]]);
        assert_eq!(out[0].input_ids, vec![1, 97, 98, 2, 0, 0]);
        assert_eq!(out[0].attention_mask, vec![1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_special_tokens_are_not_doubled() {
        let p = BatchAudioProcessor::new(Framer { frame_len: 2 }, CharTokenizer { add_special: true })
            .padding(false);
        let out = p.process(vec![sample("a", 16_000)]).unwrap();
        assert_eq!(out[0].input_ids, vec![1, 97, 2]);
        assert_eq!(out[0].attention_mask, vec![1, 1, 1]);

        let bare = processor().enforce_bos(false).enforce_eos(false).padding(false);
        let out = bare.process(vec![sample("a", 16_000)]).unwrap();
        assert_eq!(out[0].input_ids, vec![97]);
    }

    #[test]
    fn test_truncation_keeps_eos() {
        let out = processor().process(vec![sample("abcdefgh", 16_000)]).unwrap();
        assert_eq!(out[0].input_ids, vec![1, 97, 98, 99, 100, 2]);
        assert_eq!(out[0].attention_mask, vec![1; 6]);
    }

    #[test]
    fn test_mixed_sampling_rates_fail() {
        let err = processor()
            .process(vec![sample("a", 16_000), sample("b", 8_000)])
            .unwrap_err();
        assert!(err.is_processing_failure());
        assert!(processor().process(vec![]).unwrap().is_empty());
    }

    #[test]
    fn test_expand_braces() {
        assert_eq!(expand_braces("a.jsonl"), vec!["a.jsonl"]);
        assert_eq!(expand_braces("x{a,b}y"), vec!["xay", "xby"]);
        assert_eq!(
            expand_braces("s{0..2}.jsonl"),
            vec!["s0.jsonl", "s1.jsonl", "s2.jsonl"]
        );
        assert_eq!(expand_braces("{08..10}"), vec!["08", "09", "10"]);
        assert_eq!(expand_braces("{2..0}"), vec!["2", "1", "0"]);
        assert_eq!(
            expand_braces("{a,b}-{1,2}"),
            vec!["a-1", "a-2", "b-1", "b-2"]
        );
        assert_eq!(expand_braces("{a,{b,c}}"), vec!["a", "b", "c"]);
        assert_eq!(expand_braces("{x}{1,2}"), vec!["{x}1", "{x}2"]);
        assert_eq!(expand_braces("open{a,b"), vec!["open{a,b"]);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.jsonl", "train.jsonl"));
        assert!(wildcard_match("part-??.jsonl", "part-07.jsonl"));
        assert!(wildcard_match("a*b*c", "aXXbYc"));
        assert!(!wildcard_match("*.jsonl", "train.json"));
        assert!(!wildcard_match("part-?.jsonl", "part-07.jsonl"));
    }

    #[test]
    fn test_urls_for_split() {
        let dir = TempDir::new().unwrap();
        for name in ["b.jsonl", "a.jsonl", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let config = AudioDatasetSourceConfig {
            train_urls: vec![format!("{}/*.jsonl", dir.path().display())],
            validation_urls: vec!["/data/val-{0..1}.jsonl".to_string()],
            ..Default::default()
        };

        let train = config.urls_for_split("train").unwrap();
        assert_eq!(
            train,
            vec![dir.path().join("a.jsonl"), dir.path().join("b.jsonl")]
        );
        let validation = config.urls_for_split("validation").unwrap();
        assert_eq!(
            validation,
            vec![
                PathBuf::from("/data/val-0.jsonl"),
                PathBuf::from("/data/val-1.jsonl")
            ]
        );
        assert!(config.urls_for_split("test").is_err());
    }

    #[test]
    fn test_jsonl_source_decodes_both_audio_forms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"text\": \"hi\", \"audio\": [0.5, 1]}\n",
                "{\"text\": \"yo\", \"audio\": {\"array\": [0.25], \"sampling_rate\": 8000}}\n",
            ),
        )
        .unwrap();

        let config = AudioDatasetSourceConfig {
            train_urls: vec![path.display().to_string()],
            ..Default::default()
        };
        let source = config.shard_source("train").unwrap().unwrap();
        let names = source.shard_names();
        assert_eq!(names.len(), 1);

        let rows: Vec<AudioTextSample> = source
            .open_shard(&names[0])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows[0].audio, vec![0.5, 1.0]);
        assert_eq!(rows[0].sampling_rate, DEFAULT_SAMPLING_RATE);
        assert_eq!(rows[1].sampling_rate, 8000);
        assert_eq!(rows[1].text, "yo");

        assert!(config.shard_source("validation").unwrap().is_none());
    }

    #[test]
    fn test_jsonl_source_rejects_missing_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"audio\": [0.5]}\n").unwrap();

        let config = AudioDatasetSourceConfig {
            validation_urls: vec![path.display().to_string()],
            ..Default::default()
        };
        let source = config.shard_source("validation").unwrap().unwrap();
        let shard = source.shard_names().remove(0);
        let first = source.open_shard(&shard).unwrap().next().unwrap();
        assert!(first.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processed_cache_build_and_load() {
        let dir = TempDir::new().unwrap();
        let source = InMemorySource::from_rows(
            (0..6).map(|i| sample(&format!("t{i}"), 16_000)).collect(),
            2,
        );
        let monitor = Arc::new(CollectingMonitor::new());
        let options = BuildOptions::default().await_finished(true).monitor(monitor.clone());

        let cache = ProcessedAudioCache::build_or_load(dir.path(), source, processor(), options)
            .await
            .unwrap();
        assert_eq!(cache.async_len().await.unwrap(), 6);
        assert!(monitor.snapshots().last().unwrap().is_finished());

        let loaded = ProcessedAudioCache::load(dir.path()).await.unwrap();
        let all = loaded.get_batch(&[0, 1, 2, 3, 4, 5]).await.unwrap();
        let mut texts: Vec<Vec<i32>> = all.iter().map(|r| r.input_ids[1..3].to_vec()).collect();
        texts.sort();
        let expected: Vec<Vec<i32>> = (0..6).map(|i| vec![116, 48 + i]).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_load_missing_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let err = ProcessedAudioCache::load(dir.path().join("nothing"))
            .await
            .err()
            .unwrap();
        assert!(err.is_incomplete());
        assert!(err.to_string().contains("not complete"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_io_config_builds_validation_then_loads() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("val.jsonl");
        std::fs::write(
            &data,
            "{\"text\": \"a\", \"audio\": [0.1]}\n{\"text\": \"b\", \"audio\": [0.2]}\n",
        )
        .unwrap();

        let config = AudioIoDatasetConfig {
            source: AudioDatasetSourceConfig {
                validation_urls: vec![data.display().to_string()],
                ..Default::default()
            },
            cache_dir: dir.path().join("caches"),
            max_length: 4,
            ..Default::default()
        };
        let tokenizer = || CharTokenizer { add_special: false };

        let built = config
            .validation_set(Framer { frame_len: 1 }, tokenizer())
            .await
            .unwrap()
            .unwrap();
        assert!(built.cache().is_finished());
        assert_eq!(built.async_len().await.unwrap(), 2);
        assert!(dir.path().join("caches/validation/ledger.json").exists());

        let reloaded = config
            .build_or_load_cache("validation", Framer { frame_len: 1 }, tokenizer(), 8, Some(vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reloaded.get(1).await.unwrap().input_ids,
            vec![1, 98, 2, 0]
        );

        let none = config
            .build_or_load_cache("train", Framer { frame_len: 1 }, tokenizer(), 8, None)
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(config
            .train_set(Framer { frame_len: 1 }, tokenizer(), 8)
            .await
            .is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: AudioIoDatasetConfig = toml::from_str(
            r#"
            text_key = "sentence"
            train_urls = ["/data/train-{0..3}.jsonl"]
            cache_dir = "/tmp/audio"
            max_length = 128

            [cache.build]
            compression = "zstd"
            "#,
        )
        .unwrap();

        assert_eq!(config.source.text_key, "sentence");
        assert_eq!(config.source.audio_key, "audio");
        assert_eq!(config.max_length, 128);
        assert_eq!(config.cache.build.compression, "zstd");
        assert_eq!(config.source.urls_for_split("train").unwrap().len(), 4);
    }
}
