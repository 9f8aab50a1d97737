//! SSTable (Sorted String Table) implementation
//!
//! SSTables are immutable files holding internal-key-ordered entries in
//! prefix-compressed blocks, followed by an optional bloom filter over user
//! keys, an index block mapping the last key of each data block to its
//! location, and a fixed footer.

mod block;
mod bloom;
mod builder;
mod format;
mod reader;

pub use block::{Block, BlockBuilder, BlockIterator};
pub use bloom::BloomFilter;
pub use builder::TableBuilder;
pub use format::{BlockHandle, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE, TABLE_MAGIC};
pub use reader::Table;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::iterator::InternalIterator;
    use crate::options::{CompressionType, Options, ReadOptions};
    use crate::types::{
        extract_user_key, BytewiseComparator, InternalKey, InternalKeyComparator, LookupKey,
        ValueType,
    };
    use crate::TideError;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{:05}", i).into_bytes()
    }

    fn write_table(path: &Path, count: usize, options: &Options) -> u64 {
        let mut builder = TableBuilder::create(path, options, icmp()).unwrap();
        for i in 0..count {
            let ikey = InternalKey::new(&key(i), i as u64 + 1, ValueType::Value);
            builder.add(ikey.encode(), format!("value-{}", i).as_bytes()).unwrap();
        }
        assert_eq!(builder.num_entries(), count as u64);
        builder.finish().unwrap()
    }

    fn small_block_options() -> Options {
        let mut options = Options::default();
        options.set_block_size(256).set_block_restart_interval(4);
        options
    }

    #[test]
    fn test_sstable_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.sst");
        let size = write_table(&path, 1000, &small_block_options());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        let cache = Arc::new(Cache::new_lru(1 << 20));
        let table = Table::open(&path, size, icmp(), Some(cache.clone())).unwrap();
        let read = ReadOptions::default();

        for i in [0usize, 1, 499, 999] {
            let lookup = LookupKey::new(&key(i), u64::MAX >> 8);
            let (found, value) = table.get(&read, lookup.internal_key()).unwrap().unwrap();
            assert_eq!(extract_user_key(&found), key(i).as_slice());
            assert_eq!(value, format!("value-{}", i).into_bytes());
        }

        // A second pass is served from the block cache
        let misses = cache.misses();
        let lookup = LookupKey::new(&key(499), u64::MAX >> 8);
        table.get(&read, lookup.internal_key()).unwrap();
        assert_eq!(cache.misses(), misses);
        assert!(cache.hits() > 0);
    }

    #[test]
    fn test_sstable_iteration_both_directions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000002.sst");
        let size = write_table(&path, 300, &small_block_options());
        let table = Arc::new(Table::open(&path, size, icmp(), None).unwrap());

        let mut iter = table.iter(&ReadOptions::default());
        iter.seek_to_first();
        let mut i = 0;
        while iter.valid() {
            assert_eq!(extract_user_key(iter.key()), key(i).as_slice());
            i += 1;
            iter.next();
        }
        assert_eq!(i, 300);

        iter.seek_to_last();
        while iter.valid() {
            i -= 1;
            assert_eq!(extract_user_key(iter.key()), key(i).as_slice());
            iter.prev();
        }
        assert_eq!(i, 0);

        iter.seek(InternalKey::new(b"key00150x", 0, ValueType::Value).encode());
        assert_eq!(extract_user_key(iter.key()), key(151).as_slice());
    }

    #[test]
    fn test_sstable_lz4_compression() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.sst");
        let lz4_path = temp_dir.path().join("lz4.sst");

        let mut options = Options::default();
        let plain = write_table(&plain_path, 2000, &options);
        options.set_compression(CompressionType::Lz4);
        let compressed = write_table(&lz4_path, 2000, &options);
        assert!(compressed < plain);

        let table = Arc::new(Table::open(&lz4_path, compressed, icmp(), None).unwrap());
        let mut iter = table.iter(&ReadOptions::default());
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 2000);
    }

    #[test]
    fn test_filter_rules_out_missing_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000003.sst");
        let size = write_table(&path, 100, &Options::default());
        let table = Table::open(&path, size, icmp(), None).unwrap();

        let lookup = LookupKey::new(b"absent", 1000);
        let result = table.get(&ReadOptions::default(), lookup.internal_key()).unwrap();
        assert!(result.map_or(true, |(k, _)| extract_user_key(&k) != b"absent"));
    }

    #[test]
    fn test_checksum_failure_fails_single_access() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000004.sst");
        let size = write_table(&path, 50, &Options::default());

        // Flip a byte inside the first data block
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let table = Arc::new(Table::open(&path, size, icmp(), None).unwrap());
        let mut verify = ReadOptions::default();
        verify.set_verify_checksums(true);

        let lookup = LookupKey::new(&key(10), 1000);
        assert!(matches!(
            table.get(&verify, lookup.internal_key()),
            Err(TideError::ChecksumMismatch { .. })
        ));

        let mut iter = table.iter(&verify);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());

        let mut readable = 0;
        let bad = table
            .scan_readable(|_, _| {
                readable += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(bad, 1);
        assert_eq!(readable, 0);
    }

    #[test]
    fn test_open_rejects_non_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("junk.sst");
        std::fs::write(&path, vec![7u8; 100]).unwrap();
        assert!(Table::open(&path, 100, icmp(), None).unwrap_err().is_corruption());

        std::fs::write(&path, b"tiny").unwrap();
        assert!(Table::open(&path, 4, icmp(), None).unwrap_err().is_corruption());
    }

    #[test]
    fn test_approximate_offsets_increase() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000005.sst");
        let size = write_table(&path, 1000, &small_block_options());
        let table = Table::open(&path, size, icmp(), None).unwrap();

        let start = table.approximate_offset_of(InternalKey::new(&key(0), 0, ValueType::Value).encode());
        let middle = table.approximate_offset_of(InternalKey::new(&key(500), 0, ValueType::Value).encode());
        let end = table.approximate_offset_of(InternalKey::new(b"zzz", 0, ValueType::Value).encode());
        assert_eq!(start, 0);
        assert!(middle > start);
        assert!(end > middle && end <= size);
    }
}
