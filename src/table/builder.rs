//! Table writer — builds one immutable table file from a sorted entry
//! stream.
//!
//! Entries must arrive in strict internal-key order.  The builder cuts
//! data blocks near [`super::BLOCK_TARGET_SIZE`], computes shortened
//! index separators between blocks, collects user keys for the bloom
//! filter, and finishes with the filter, properties, and index blocks
//! plus the fixed footer.  `finish` fsyncs before returning, so a
//! returned `TableProperties` means the bytes are durable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::encoding::{put_fixed64, put_length_prefixed_slice, put_varint32, put_varint64};
use crate::keys::{InternalKeyComparator, parse_internal_key};

use super::{
    BLOCK_TARGET_SIZE, BLOOM_FALSE_POSITIVE_RATE, BlockHandle, FOOTER_SIZE, IndexEntry,
    TABLE_MAGIC, TableError, TableProperties, block_separator, block_successor,
};

/// Streaming builder for one table file.
pub struct TableWriter {
    file: File,
    path: PathBuf,
    icmp: InternalKeyComparator,

    /// Bytes written so far.
    offset: u64,
    /// Entries of the block under construction.
    block_buf: Vec<u8>,
    /// First key of the block under construction.
    block_first_key: Option<Vec<u8>>,

    /// Finished blocks whose separators are already fixed.
    index: Vec<IndexEntry>,
    /// Last flushed block awaiting its separator (needs the next key).
    pending: Option<(Vec<u8>, BlockHandle)>,

    /// Distinct user keys, for the bloom filter.  Entries arrive
    /// sorted, so adjacent dedup suffices.
    user_keys: Vec<Vec<u8>>,

    num_entries: u64,
    num_deletions: u64,
    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    smallest_seq: u64,
    largest_seq: u64,
}

impl TableWriter {
    /// Creates the output file (truncating any stale leftover under the
    /// same number).
    pub fn new(path: impl AsRef<Path>, icmp: InternalKeyComparator) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            icmp,
            offset: 0,
            block_buf: Vec::with_capacity(BLOCK_TARGET_SIZE + 256),
            block_first_key: None,
            index: Vec::new(),
            pending: None,
            user_keys: Vec::new(),
            num_entries: 0,
            num_deletions: 0,
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            smallest_seq: u64::MAX,
            largest_seq: 0,
        })
    }

    /// Appends one entry.  Keys must arrive in strict internal-key
    /// order.
    pub fn add(&mut self, ikey: &[u8], value: &[u8]) -> Result<(), TableError> {
        let parsed = parse_internal_key(ikey).map_err(|e| TableError::Corruption {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        if !self.largest_key.is_empty()
            && self.icmp.compare(&self.largest_key, ikey) != std::cmp::Ordering::Less
        {
            return Err(TableError::Internal(format!(
                "out-of-order table add ({} entries in)",
                self.num_entries
            )));
        }

        // A freshly flushed block gets its separator once the next key
        // is known.
        if let Some((last_key, handle)) = self.pending.take() {
            let separator = block_separator(&self.icmp, &last_key, ikey);
            self.index.push(IndexEntry {
                separator,
                handle,
            });
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(ikey.to_vec());
        }
        put_varint32(&mut self.block_buf, ikey.len() as u32);
        self.block_buf.extend_from_slice(ikey);
        put_varint64(&mut self.block_buf, value.len() as u64);
        self.block_buf.extend_from_slice(value);

        if self.smallest_key.is_empty() {
            self.smallest_key = ikey.to_vec();
        }
        self.largest_key = ikey.to_vec();
        self.smallest_seq = self.smallest_seq.min(parsed.sequence);
        self.largest_seq = self.largest_seq.max(parsed.sequence);
        self.num_entries += 1;
        if parsed.value_type == crate::keys::ValueType::Deletion {
            self.num_deletions += 1;
        }

        if self
            .user_keys
            .last()
            .is_none_or(|prev| prev.as_slice() != parsed.user_key)
        {
            self.user_keys.push(parsed.user_key.to_vec());
        }

        if self.block_buf.len() >= BLOCK_TARGET_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written plus the block under construction — the size the
    /// file will have, give or take trailing metadata.
    pub fn estimated_file_size(&self) -> u64 {
        self.offset + self.block_buf.len() as u64
    }

    fn flush_block(&mut self) -> Result<(), TableError> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let handle = self.write_raw_block_buf()?;
        let last_key = self.largest_key.clone();
        self.pending = Some((last_key, handle));
        self.block_first_key = None;
        Ok(())
    }

    fn write_raw_block_buf(&mut self) -> Result<BlockHandle, TableError> {
        let handle = write_checksummed_block(&mut self.file, &mut self.offset, &self.block_buf)?;
        self.block_buf.clear();
        Ok(handle)
    }

    /// Finishes the table: final block, filter, properties, index,
    /// footer, fsync.  Returns the table's properties.
    pub fn finish(mut self) -> Result<TableProperties, TableError> {
        if self.num_entries == 0 {
            return Err(TableError::Internal("finishing an empty table".into()));
        }

        self.flush_block()?;
        if let Some((last_key, handle)) = self.pending.take() {
            let separator = block_successor(&self.icmp, &last_key);
            self.index.push(IndexEntry { separator, handle });
        }

        let data_size = self.offset;

        // Filter block.
        let filter_handle = {
            let mut bloom: Bloom<[u8]> =
                Bloom::new_for_fp_rate(self.user_keys.len().max(1), BLOOM_FALSE_POSITIVE_RATE)
                    .map_err(|e| TableError::Internal(e.to_string()))?;
            for key in &self.user_keys {
                bloom.set(key);
            }
            let bytes = bloom.as_slice().to_vec();
            write_checksummed_block(&mut self.file, &mut self.offset, &bytes)?
        };

        // Properties block.
        let properties = TableProperties {
            num_entries: self.num_entries,
            num_deletions: self.num_deletions,
            data_size,
            smallest_key: self.smallest_key.clone(),
            largest_key: self.largest_key.clone(),
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
        };
        let props_handle = {
            let mut bytes = Vec::new();
            properties.encode(&mut bytes);
            write_checksummed_block(&mut self.file, &mut self.offset, &bytes)?
        };

        // Index block.
        let index_handle = {
            let mut bytes = Vec::new();
            for entry in &self.index {
                put_length_prefixed_slice(&mut bytes, &entry.separator);
                put_fixed64(&mut bytes, entry.handle.offset);
                put_fixed64(&mut bytes, entry.handle.size);
            }
            write_checksummed_block(&mut self.file, &mut self.offset, &bytes)?
        };

        // Footer.
        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        put_fixed64(&mut footer, index_handle.offset);
        put_fixed64(&mut footer, index_handle.size);
        put_fixed64(&mut footer, filter_handle.offset);
        put_fixed64(&mut footer, filter_handle.size);
        put_fixed64(&mut footer, props_handle.offset);
        put_fixed64(&mut footer, props_handle.size);
        put_fixed64(&mut footer, TABLE_MAGIC);
        debug_assert_eq!(footer.len(), FOOTER_SIZE);
        self.file.write_all(&footer)?;

        self.file.sync_all()?;
        debug!(
            path = %self.path.display(),
            entries = self.num_entries,
            blocks = self.index.len(),
            "table finished"
        );
        Ok(properties)
    }
}

fn write_checksummed_block(
    file: &mut File,
    offset: &mut u64,
    data: &[u8],
) -> Result<BlockHandle, TableError> {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();

    file.write_all(data)?;
    file.write_all(&crc.to_le_bytes())?;

    let handle = BlockHandle {
        offset: *offset,
        size: data.len() as u64,
    };
    *offset += data.len() as u64 + super::BLOCK_CRC_SIZE as u64;
    Ok(handle)
}
