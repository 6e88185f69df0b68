// rust/shard-cache/src/dataset/sharding.rs

use crate::error::Result;
use crate::storage::StorageReader;

use super::traits::{RecordFormat, ShardSpec};

/// Bytes scanned past an approximate split point when looking for a record end
const ALIGNMENT_BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// Split a file into at most `total_shards` contiguous byte ranges.
///
/// Every boundary except the file end sits right after a record delimiter, so
/// each shard can be decoded without looking at its neighbours. Shards cover
/// the file with no gaps or overlap and are renumbered to the actual count.
///
/// # Errors
///
/// Returns an error if reading from storage fails.
pub fn calculate_shards(
    reader: &mut dyn StorageReader,
    total_shards: u32,
    format: &dyn RecordFormat,
) -> Result<Vec<ShardSpec>> {
    let file_size = reader.size();

    if file_size == 0 || total_shards == 0 {
        return Ok(vec![]);
    }

    let effective_shards = total_shards.min(u32::try_from(file_size).unwrap_or(u32::MAX));
    let bytes_per_shard = file_size / u64::from(effective_shards);

    let mut shards = Vec::with_capacity(effective_shards as usize);
    let mut current_start = 0u64;

    for shard_id in 0..effective_shards {
        let is_last_shard = shard_id == effective_shards - 1;

        let byte_end = if is_last_shard {
            file_size
        } else {
            align_to_record_boundary(reader, current_start + bytes_per_shard, format)?
        };

        if byte_end > current_start {
            shards.push(ShardSpec {
                shard_id,
                total_shards: effective_shards,
                byte_start: current_start,
                byte_end,
            });
            current_start = byte_end;
        }

        if current_start >= file_size {
            break;
        }
    }

    let actual_count = shards.len() as u32;
    for (idx, shard) in shards.iter_mut().enumerate() {
        shard.shard_id = idx as u32;
        shard.total_shards = actual_count;
    }

    Ok(shards)
}

/// Move `offset` forward to just past the end of the record containing it.
///
/// Falls back to the file end when no delimiter shows up within the scan
/// window; the current shard then absorbs the rest of the file.
fn align_to_record_boundary(
    reader: &mut dyn StorageReader,
    offset: u64,
    format: &dyn RecordFormat,
) -> Result<u64> {
    let file_size = reader.size();

    if offset >= file_size {
        return Ok(file_size);
    }

    let read_size = ALIGNMENT_BUFFER_SIZE.min((file_size - offset) as usize);
    let data = reader.read_range(offset, read_size)?;

    match format.find_record_end(&data, 0) {
        Some(record_end) => Ok(offset + record_end as u64),
        None => Ok(file_size),
    }
}
