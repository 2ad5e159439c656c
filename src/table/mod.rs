//! Table files — immutable, sorted, on-disk key-value files.
//!
//! This module realizes the `TableReader`/`TableWriter` contract the
//! engine core builds on.  Entries are `(internal key, value)` pairs in
//! internal-key order.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK_BYTES][CRC32_LE]          repeated
//! [FILTER_BLOCK_BYTES][CRC32_LE]        bloom filter over user keys
//! [PROPERTIES_BLOCK_BYTES][CRC32_LE]
//! [INDEX_BLOCK_BYTES][CRC32_LE]
//! [FOOTER: 56 bytes]
//! ```
//!
//! - **Data block entry** — `varint32 klen | internal key | varint32
//!   vlen | value`.
//! - **Index entry** — `varint32 sep_len | separator internal key |
//!   fixed64 offset | fixed64 size`, one per data block.  Separators
//!   are shortened with the comparator's shortest-separator helper.
//! - **Footer** — fixed64 offsets/sizes of index, filter, and
//!   properties blocks, then an 8-byte magic.
//!
//! # Concurrency model
//!
//! Tables are immutable; readers are lock-free over a shared `Mmap`
//! and may be used from any thread.  Corruption detected by a block
//! checksum fails that single read with a corruption error and leaves
//! the reader usable for other blocks.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::TableWriter;
pub use iterator::TableIterator;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::encoding::{
    get_fixed64, get_length_prefixed_slice, get_varint32, get_varint64,
};
use crate::error::DbError;
use crate::keys::{
    InternalKeyComparator, SequenceNumber, VALUE_TYPE_FOR_SEEK, extract_user_key,
    make_internal_key, parse_internal_key,
};
use crate::lookup::GetContext;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"BSLTTBL1");
pub(crate) const FOOTER_SIZE: usize = 56;
pub(crate) const BLOCK_TARGET_SIZE: usize = 4096;
pub(crate) const BLOCK_CRC_SIZE: usize = 4;
pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table reading and writing.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structurally invalid or checksum-failing table content.
    #[error("table corruption in {path}: {reason}")]
    Corruption {
        /// Offending file.
        path: String,
        /// What failed.
        reason: String,
    },

    /// Internal invariant violation.
    #[error("internal table error: {0}")]
    Internal(String),
}

impl From<TableError> for DbError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Io(e) => DbError::Io(e),
            TableError::Corruption { path, reason } => {
                DbError::Corruption(format!("{path}: {reason}"))
            }
            TableError::Internal(msg) => DbError::Internal(msg),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Properties
// ------------------------------------------------------------------------------------------------

/// Table metadata persisted in the properties block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableProperties {
    /// Number of entries in the table.
    pub num_entries: u64,
    /// Number of deletion entries among them.
    pub num_deletions: u64,
    /// Total bytes of data blocks.
    pub data_size: u64,
    /// Smallest internal key.
    pub smallest_key: Vec<u8>,
    /// Largest internal key.
    pub largest_key: Vec<u8>,
    /// Smallest sequence number of any entry.
    pub smallest_seq: SequenceNumber,
    /// Largest sequence number of any entry.
    pub largest_seq: SequenceNumber,
}

impl TableProperties {
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        use crate::encoding::{put_fixed64, put_length_prefixed_slice};
        put_fixed64(buf, self.num_entries);
        put_fixed64(buf, self.num_deletions);
        put_fixed64(buf, self.data_size);
        put_length_prefixed_slice(buf, &self.smallest_key);
        put_length_prefixed_slice(buf, &self.largest_key);
        put_fixed64(buf, self.smallest_seq);
        put_fixed64(buf, self.largest_seq);
    }

    pub(crate) fn decode(mut input: &[u8]) -> Result<Self, crate::encoding::EncodingError> {
        let input = &mut input;
        Ok(Self {
            num_entries: get_fixed64(input)?,
            num_deletions: get_fixed64(input)?,
            data_size: get_fixed64(input)?,
            smallest_key: get_length_prefixed_slice(input)?.to_vec(),
            largest_key: get_length_prefixed_slice(input)?.to_vec(),
            smallest_seq: get_fixed64(input)?,
            largest_seq: get_fixed64(input)?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Block handles and index
// ------------------------------------------------------------------------------------------------

/// Location of one block inside the file (size excludes the trailing
/// CRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    /// Separator internal key: ≥ every key in the block, < every key in
    /// the next.
    pub separator: Vec<u8>,
    pub handle: BlockHandle,
}

// ------------------------------------------------------------------------------------------------
// TableReader
// ------------------------------------------------------------------------------------------------

/// Mmap-backed reader for one immutable table file.
pub struct TableReader {
    mmap: Mmap,
    path: PathBuf,
    icmp: InternalKeyComparator,
    index: Vec<IndexEntry>,
    bloom: Option<Bloom<[u8]>>,
    /// Decoded properties block.
    pub properties: TableProperties,
}

impl TableReader {
    /// Opens and validates a table file.
    ///
    /// Reads the footer, then the index, filter, and properties blocks
    /// (each checksum-verified).  Data blocks are verified lazily on
    /// first access.
    pub fn open(path: impl AsRef<Path>, icmp: InternalKeyComparator) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Safety: the mapping is read-only and tables are immutable
        // once installed; the engine never truncates a live table.
        let mmap = unsafe { Mmap::map(&file)? };

        let corrupt = |reason: String| TableError::Corruption {
            path: path.display().to_string(),
            reason,
        };

        if mmap.len() < FOOTER_SIZE {
            return Err(corrupt(format!("file too short ({} bytes)", mmap.len())));
        }

        let mut footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let footer = &mut footer;
        let index_handle = BlockHandle {
            offset: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
            size: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
        };
        let filter_handle = BlockHandle {
            offset: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
            size: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
        };
        let props_handle = BlockHandle {
            offset: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
            size: get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?,
        };
        let magic = get_fixed64(footer).map_err(|e| corrupt(e.to_string()))?;
        if magic != TABLE_MAGIC {
            return Err(corrupt(format!("bad magic 0x{magic:016x}")));
        }

        let index_data = Self::checked_block(&mmap, &path, index_handle)?;
        let index = Self::decode_index(index_data).map_err(&corrupt)?;

        let props_data = Self::checked_block(&mmap, &path, props_handle)?;
        let properties =
            TableProperties::decode(props_data).map_err(|e| corrupt(e.to_string()))?;

        let bloom = if filter_handle.size > 0 {
            let filter_data = Self::checked_block(&mmap, &path, filter_handle)?;
            match Bloom::from_slice(filter_data) {
                Ok(bloom) => Some(bloom),
                // A filter that fails to deserialize costs accuracy,
                // not correctness.
                Err(_) => None,
            }
        } else {
            None
        };

        debug!(
            path = %path.display(),
            entries = properties.num_entries,
            blocks = index.len(),
            "table opened"
        );

        Ok(Self {
            mmap,
            path,
            icmp,
            index,
            bloom,
            properties,
        })
    }

    fn decode_index(mut data: &[u8]) -> Result<Vec<IndexEntry>, String> {
        let input = &mut data;
        let mut index = Vec::new();
        while !input.is_empty() {
            let separator = get_length_prefixed_slice(input)
                .map_err(|e| e.to_string())?
                .to_vec();
            let offset = get_fixed64(input).map_err(|e| e.to_string())?;
            let size = get_fixed64(input).map_err(|e| e.to_string())?;
            index.push(IndexEntry {
                separator,
                handle: BlockHandle { offset, size },
            });
        }
        Ok(index)
    }

    fn checked_block<'m>(
        mmap: &'m Mmap,
        path: &Path,
        handle: BlockHandle,
    ) -> Result<&'m [u8], TableError> {
        let start = handle.offset as usize;
        let end = start + handle.size as usize;
        let crc_end = end + BLOCK_CRC_SIZE;
        if crc_end > mmap.len() {
            return Err(TableError::Corruption {
                path: path.display().to_string(),
                reason: format!("block handle {handle:?} outside file"),
            });
        }
        let data = &mmap[start..end];
        let stored = u32::from_le_bytes([mmap[end], mmap[end + 1], mmap[end + 2], mmap[end + 3]]);
        let mut hasher = Crc32::new();
        hasher.update(data);
        if hasher.finalize() != stored {
            return Err(TableError::Corruption {
                path: path.display().to_string(),
                reason: format!("block checksum mismatch at offset {}", handle.offset),
            });
        }
        Ok(data)
    }

    /// Reads and verifies the data block at `block_index`.
    pub(crate) fn block_data(&self, block_index: usize) -> Result<&[u8], TableError> {
        let handle = self.index[block_index].handle;
        Self::checked_block(&self.mmap, &self.path, handle)
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Path of the table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// True when the bloom filter cannot rule the user key out.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(user_key),
            None => true,
        }
    }

    /// Index of the first block whose separator is ≥ `target` (an
    /// encoded internal key), or `num_blocks()` when every separator is
    /// smaller.
    fn find_block(&self, target: &[u8]) -> usize {
        self.index
            .partition_point(|entry| self.icmp.compare(&entry.separator, target) == Ordering::Less)
    }

    /// Probes this table for `user_key` at `snapshot`, feeding visible
    /// versions into `ctx`.  Returns `true` once the lookup concluded.
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
        ctx: &mut GetContext<'_>,
    ) -> Result<bool, TableError> {
        if !self.may_contain(user_key) {
            return Ok(false);
        }

        let target = make_internal_key(user_key, snapshot, VALUE_TYPE_FOR_SEEK)
            .map_err(|e| TableError::Internal(e.to_string()))?;
        let mut block_index = self.find_block(&target);

        while block_index < self.index.len() {
            let mut data = self.block_data(block_index)?;
            let input = &mut data;
            while !input.is_empty() {
                let (ikey, value) = decode_block_entry(input, &self.path)?;
                let parsed = parse_internal_key(ikey).map_err(|e| TableError::Corruption {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })?;

                match self
                    .icmp
                    .user_comparator()
                    .compare(parsed.user_key, user_key)
                {
                    Ordering::Less => continue,
                    Ordering::Greater => return Ok(false),
                    Ordering::Equal => {
                        if parsed.sequence > snapshot {
                            continue;
                        }
                        if ctx.observe(parsed.sequence, parsed.value_type, value) {
                            return Ok(true);
                        }
                    }
                }
            }
            // The key's versions may spill into the next block.
            block_index += 1;
        }
        Ok(false)
    }

    /// Newest sequence of any entry for `user_key` in this table, or
    /// `None`.  Used by transaction conflict validation.
    pub fn latest_sequence_for_key(
        &self,
        user_key: &[u8],
    ) -> Result<Option<SequenceNumber>, TableError> {
        if !self.may_contain(user_key) {
            return Ok(None);
        }
        let target = make_internal_key(user_key, crate::keys::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)
            .map_err(|e| TableError::Internal(e.to_string()))?;
        let block_index = self.find_block(&target);
        if block_index >= self.index.len() {
            return Ok(None);
        }
        let mut data = self.block_data(block_index)?;
        let input = &mut data;
        while !input.is_empty() {
            let (ikey, _) = decode_block_entry(input, &self.path)?;
            let parsed = parse_internal_key(ikey).map_err(|e| TableError::Corruption {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
            match self
                .icmp
                .user_comparator()
                .compare(parsed.user_key, user_key)
            {
                Ordering::Less => continue,
                Ordering::Greater => return Ok(None),
                Ordering::Equal => return Ok(Some(parsed.sequence)),
            }
        }
        Ok(None)
    }

    /// Streaming iterator over all entries, in internal-key order.
    ///
    /// Takes the shared handle so the iterator keeps the table alive.
    pub fn iter(self: Arc<Self>) -> TableIterator {
        TableIterator::new(self)
    }
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("path", &self.path)
            .field("entries", &self.properties.num_entries)
            .finish_non_exhaustive()
    }
}

/// Decodes one `klen | key | vlen | value` entry, advancing the cursor.
pub(crate) fn decode_block_entry<'a>(
    input: &mut &'a [u8],
    path: &Path,
) -> Result<(&'a [u8], &'a [u8]), TableError> {
    let corrupt = |reason: String| TableError::Corruption {
        path: path.display().to_string(),
        reason,
    };
    let klen = get_varint32(input).map_err(|e| corrupt(e.to_string()))? as usize;
    if input.len() < klen {
        return Err(corrupt("entry key overruns block".into()));
    }
    let (key, rest) = input.split_at(klen);
    *input = rest;
    let vlen = get_varint64(input).map_err(|e| corrupt(e.to_string()))? as usize;
    if input.len() < vlen {
        return Err(corrupt("entry value overruns block".into()));
    }
    let (value, rest) = input.split_at(vlen);
    *input = rest;
    Ok((key, value))
}

// ------------------------------------------------------------------------------------------------
// Separator helpers (shared with the builder)
// ------------------------------------------------------------------------------------------------

/// Index separator between `last_key` (end of a block) and `next_key`
/// (start of the following block): shortened where the user-key
/// comparator allows, otherwise `last_key` itself.
pub(crate) fn block_separator(
    icmp: &InternalKeyComparator,
    last_key: &[u8],
    next_key: &[u8],
) -> Vec<u8> {
    let user_start = extract_user_key(last_key);
    let user_limit = extract_user_key(next_key);
    let mut shortened = user_start.to_vec();
    icmp.user_comparator()
        .find_shortest_separator(&mut shortened, user_limit);

    if shortened.len() < user_start.len()
        && icmp.user_comparator().compare(user_start, &shortened) == Ordering::Less
    {
        // Strictly-greater short user key: pair it with the maximal
        // trailer so it still sorts before the next block's first key.
        make_internal_key(&shortened, crate::keys::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)
            .unwrap_or_else(|_| last_key.to_vec())
    } else {
        last_key.to_vec()
    }
}

/// Index separator after the final block.
pub(crate) fn block_successor(icmp: &InternalKeyComparator, last_key: &[u8]) -> Vec<u8> {
    let user_key = extract_user_key(last_key);
    let mut successor = user_key.to_vec();
    icmp.user_comparator().find_short_successor(&mut successor);

    if successor.len() < user_key.len()
        && icmp.user_comparator().compare(user_key, &successor) == Ordering::Less
    {
        make_internal_key(&successor, crate::keys::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)
            .unwrap_or_else(|_| last_key.to_vec())
    } else {
        last_key.to_vec()
    }
}
