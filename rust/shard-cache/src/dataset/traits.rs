// rust/shard-cache/src/dataset/traits.rs

/// Byte range of one shard within a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub shard_id: u32,
    pub total_shards: u32,
    pub byte_start: u64,
    pub byte_end: u64,
}

impl ShardSpec {
    /// Returns the size of this shard in bytes
    pub fn size(&self) -> u64 {
        self.byte_end.saturating_sub(self.byte_start)
    }
}

/// A block of whole records read from a shard
#[derive(Debug)]
pub struct Batch {
    pub data: Vec<u8>,
    pub offset: u64,
    pub shard_id: u32,
    pub batch_index: u64,
}

/// Describes how to find record boundaries
pub trait RecordFormat: Send + Sync {
    /// Find the end of the record that starts at or after `offset` in `data`.
    /// Returns the byte position after the record ends (exclusive end).
    /// Returns None if no complete record is found.
    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize>;

    /// Splits a block of whole records into record bodies, without delimiters.
    fn split_records<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]>;

    /// Name of this record format
    fn name(&self) -> &'static str;
}

/// Newline-delimited records (JSONL)
#[derive(Debug, Clone, Default)]
pub struct NewlineDelimitedFormat;

impl NewlineDelimitedFormat {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFormat for NewlineDelimitedFormat {
    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize> {
        if offset >= data.len() {
            return None;
        }

        data[offset..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map(|i| offset + i + 1) // Include the newline
    }

    fn split_records<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        data.split(|&byte| byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
            .collect()
    }

    fn name(&self) -> &'static str {
        "newline-delimited"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newline_format_boundary() {
        let format = NewlineDelimitedFormat::new();

        let data = b"hello\nworld\n";
        assert_eq!(format.find_record_end(data, 0), Some(6)); // "hello\n"
        assert_eq!(format.find_record_end(data, 6), Some(12)); // "world\n"

        // Starting in the middle of a line
        assert_eq!(format.find_record_end(data, 3), Some(6));

        assert_eq!(format.find_record_end(b"hello world", 0), None);
        assert_eq!(format.find_record_end(data, 12), None);
    }

    #[test]
    fn test_split_records_skips_blank_lines() {
        let format = NewlineDelimitedFormat::new();
        let records = format.split_records(b"{\"a\":1}\r\n\n  \n{\"a\":2}");
        assert_eq!(records, vec![&b"{\"a\":1}"[..], &b"{\"a\":2}"[..]]);
        assert!(format.split_records(b"").is_empty());
    }

    #[test]
    fn test_shard_spec_size() {
        let shard = ShardSpec {
            shard_id: 0,
            total_shards: 4,
            byte_start: 100,
            byte_end: 250,
        };
        assert_eq!(shard.size(), 150);

        let empty_shard = ShardSpec {
            shard_id: 0,
            total_shards: 1,
            byte_start: 100,
            byte_end: 100,
        };
        assert_eq!(empty_shard.size(), 0);
    }
}
