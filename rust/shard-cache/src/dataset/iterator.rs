// rust/shard-cache/src/dataset/iterator.rs

use std::sync::Arc;

use crate::error::Result;
use crate::storage::StorageReader;

use super::traits::{Batch, RecordFormat, ShardSpec};

/// Default number of bytes read per batch
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Reads a shard's byte range in batches that end on record boundaries.
///
/// The reader stays open for the lifetime of the iterator. A record longer
/// than the read size grows the read window until the record fits.
pub struct ShardIterator {
    reader: Box<dyn StorageReader>,
    shard: ShardSpec,
    format: Arc<dyn RecordFormat>,
    read_size: usize,
    current_offset: u64,
    batch_index: u64,
}

impl ShardIterator {
    pub fn new(
        reader: Box<dyn StorageReader>,
        shard: ShardSpec,
        format: Arc<dyn RecordFormat>,
        read_size: usize,
    ) -> Self {
        Self {
            reader,
            current_offset: shard.byte_start,
            shard,
            format,
            read_size: read_size.max(1),
            batch_index: 0,
        }
    }

    /// Read the next batch of whole records.
    ///
    /// Returns `Ok(None)` once the shard is exhausted. The final batch may end
    /// without a delimiter when the file does.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.current_offset >= self.shard.byte_end {
            return Ok(None);
        }

        let remaining = (self.shard.byte_end - self.current_offset) as usize;
        let mut read_size = self.read_size.min(remaining);
        let mut data = self.reader.read_range(self.current_offset, read_size)?;

        if data.is_empty() {
            return Ok(None);
        }

        let mut batch_end = self.find_batch_end(&data);

        while batch_end == 0 && read_size < remaining {
            read_size = read_size.saturating_mul(2).min(remaining);
            data = self.reader.read_range(self.current_offset, read_size)?;
            batch_end = self.find_batch_end(&data);
        }

        if batch_end > 0 {
            data.truncate(batch_end);
        }

        let batch = Batch {
            offset: self.current_offset,
            shard_id: self.shard.shard_id,
            batch_index: self.batch_index,
            data,
        };

        self.current_offset += batch.data.len() as u64;
        self.batch_index += 1;

        Ok(Some(batch))
    }

    /// Offset just past the last complete record in `data`, or 0 if none.
    fn find_batch_end(&self, data: &[u8]) -> usize {
        let mut last_record_end = 0;

        while let Some(record_end) = self.format.find_record_end(data, last_record_end) {
            last_record_end = record_end;
        }

        last_record_end
    }

    /// Fraction of the shard consumed so far, between 0.0 and 1.0.
    pub fn progress(&self) -> f64 {
        let total = self.shard.size();
        if total == 0 {
            return 1.0;
        }

        let processed = self.current_offset - self.shard.byte_start;
        (processed as f64 / total as f64).min(1.0)
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    pub fn shard(&self) -> &ShardSpec {
        &self.shard
    }
}

impl Iterator for ShardIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::sharding::tests::MockReader;

    use super::super::traits::NewlineDelimitedFormat;

    fn iterator(data: &[u8], read_size: usize) -> ShardIterator {
        let shard = ShardSpec {
            shard_id: 0,
            total_shards: 1,
            byte_start: 0,
            byte_end: data.len() as u64,
        };
        ShardIterator::new(
            Box::new(MockReader::new(data.to_vec())),
            shard,
            Arc::new(NewlineDelimitedFormat::new()),
            read_size,
        )
    }

    #[test]
    fn test_batches_end_on_record_boundaries() {
        let data = b"line1\nline2\nline3\nline4\nline5\n";
        let batches: Vec<Batch> = iterator(data, 12).map(|b| b.unwrap()).collect();

        assert!(batches.len() > 1);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.batch_index, i as u64);
            assert_eq!(*batch.data.last().unwrap(), b'\n');
        }

        let joined: Vec<u8> = batches.into_iter().flat_map(|b| b.data).collect();
        assert_eq!(joined, data.to_vec());
    }

    #[test]
    fn test_long_record_grows_read_window() {
        let data = b"a-very-long-record-indeed\nshort\n";
        let mut iter = iterator(data, 4);

        let first = iter.next_batch().unwrap().unwrap();
        assert!(first.data.starts_with(b"a-very-long-record-indeed\n"));
        assert_eq!(*first.data.last().unwrap(), b'\n');

        let mut joined = first.data;
        while let Some(batch) = iter.next_batch().unwrap() {
            joined.extend(batch.data);
        }
        assert_eq!(joined, data.to_vec());
    }

    #[test]
    fn test_trailing_record_without_newline() {
        let data = b"one\ntwo";
        let batches: Vec<Batch> = iterator(data, 1024).map(|b| b.unwrap()).collect();
        let joined: Vec<u8> = batches.into_iter().flat_map(|b| b.data).collect();
        assert_eq!(joined, data.to_vec());
    }

    #[test]
    fn test_iterator_exhausts_and_reports_progress() {
        let data = b"line1\nline2\n";
        let mut iter = iterator(data, 1024);
        assert_eq!(iter.progress(), 0.0);

        let batches: Vec<_> = iter.by_ref().collect();
        assert_eq!(batches.len(), 1);
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
        assert_eq!(iter.progress(), 1.0);
        assert_eq!(iter.current_offset(), data.len() as u64);
    }
}
