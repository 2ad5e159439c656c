//! Versions — the on-disk state machine of each column family.
//!
//! A [`Version`] is an immutable snapshot of which table files belong
//! to which level.  Versions are produced by applying
//! [`VersionEdit`]s through [`VersionSet::log_and_apply`], which also
//! appends the edit to the MANIFEST so that the state machine is
//! crash-safe.  Readers (iterators, compactions) hold `Arc<Version>`
//! references; a version's files become deletion candidates only when
//! no reference remains.
//!
//! ## Level invariants
//!
//! - Level 0 files may overlap; they are ordered newest-first by
//!   largest sequence and probed in that order.
//! - Levels ≥ 1 hold files with pairwise-disjoint user-key ranges,
//!   stored in ascending key order, so a point lookup binary-searches
//!   to at most one candidate file.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod edit;
pub mod set;

#[cfg(test)]
mod tests;

pub use builder::VersionBuilder;
pub use edit::{NewFileEntry, VersionEdit};
pub use set::{ColumnFamilyState, VersionSet};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::error::DbError;
use crate::keys::{
    InternalKey, InternalKeyComparator, SequenceNumber, VALUE_TYPE_FOR_SEEK, extract_user_key,
    make_internal_key,
};
use crate::lookup::GetContext;
use crate::options::ColumnFamilyOptions;
use crate::table_cache::TableCache;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by version bookkeeping and MANIFEST handling.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structurally invalid MANIFEST or version state.
    #[error("version corruption: {0}")]
    Corruption(String),

    /// Configuration mismatch (comparator, levels, column families).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation.
    #[error("internal version error: {0}")]
    Internal(String),
}

impl From<VersionError> for DbError {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::Io(e) => DbError::Io(e),
            VersionError::Corruption(msg) => DbError::Corruption(msg),
            VersionError::InvalidArgument(msg) => DbError::InvalidArgument(msg),
            VersionError::Internal(msg) => DbError::Internal(msg),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FileMetadata
// ------------------------------------------------------------------------------------------------

/// Metadata of one table file, shared by all versions that contain it.
///
/// The `Arc` wrapping this struct is the file's reference count: the
/// obsolete-file sweep deletes the physical file only once the count
/// shows no live version, iterator, or compaction still uses it.
#[derive(Debug)]
pub struct FileMetadata {
    /// Database-wide monotonic file number.
    pub number: u64,
    /// Path id of the directory holding the file.
    pub path_id: u32,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest: InternalKey,
    /// Largest internal key in the file.
    pub largest: InternalKey,
    /// Smallest sequence number in the file.
    pub smallest_seq: SequenceNumber,
    /// Largest sequence number in the file.
    pub largest_seq: SequenceNumber,
    /// Reserved by a running compaction.
    pub being_compacted: AtomicBool,
}

impl FileMetadata {
    pub(crate) fn from_edit(entry: &NewFileEntry) -> Self {
        Self {
            number: entry.number,
            path_id: entry.path_id,
            file_size: entry.file_size,
            smallest: entry.smallest.clone(),
            largest: entry.largest.clone(),
            smallest_seq: entry.smallest_seq,
            largest_seq: entry.largest_seq,
            being_compacted: AtomicBool::new(false),
        }
    }

    /// True when the file's user-key range may contain `user_key`.
    pub fn range_contains(&self, icmp: &InternalKeyComparator, user_key: &[u8]) -> bool {
        let user = icmp.user_comparator();
        user.compare(user_key, extract_user_key(self.smallest.encoded())) != Ordering::Less
            && user.compare(user_key, extract_user_key(self.largest.encoded())) != Ordering::Greater
    }
}

// ------------------------------------------------------------------------------------------------
// VersionStorageInfo
// ------------------------------------------------------------------------------------------------

/// Per-column-family placement of files in levels, plus the derived
/// compaction indices.  Immutable after publication.
#[derive(Debug)]
pub struct VersionStorageInfo {
    num_levels: usize,
    files: Vec<Vec<Arc<FileMetadata>>>,

    /// Best compaction candidate, computed at publication: level and
    /// its score (≥ 1.0 means compaction is due).
    pub compaction_score: f64,
    /// Level owning `compaction_score`.
    pub compaction_level: usize,
}

impl VersionStorageInfo {
    /// An empty placement with `num_levels` levels.
    pub fn new(num_levels: usize) -> Self {
        Self {
            num_levels,
            files: vec![Vec::new(); num_levels],
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    pub(crate) fn with_files(num_levels: usize, files: Vec<Vec<Arc<FileMetadata>>>) -> Self {
        debug_assert_eq!(files.len(), num_levels);
        Self {
            num_levels,
            files,
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    /// Number of levels.
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Files at `level`.
    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    /// Number of files at `level`.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Total bytes at `level`.
    pub fn total_file_size(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    /// Deepest level holding any file.
    pub fn max_populated_level(&self) -> usize {
        (0..self.num_levels)
            .rev()
            .find(|level| !self.files[*level].is_empty())
            .unwrap_or(0)
    }

    /// Computes the compaction score per §score rules: level 0 by file
    /// count against the trigger, deeper levels by byte budget.
    pub fn compute_compaction_score(&mut self, options: &ColumnFamilyOptions) {
        let mut best_score = 0.0_f64;
        let mut best_level = 0usize;

        let l0_score = self.files[0].len() as f64
            / options.level0_file_num_compaction_trigger as f64;
        if l0_score > best_score {
            best_score = l0_score;
            best_level = 0;
        }

        // The bottommost populated level has nowhere to push data.
        for level in 1..self.num_levels.saturating_sub(1) {
            let score =
                self.total_file_size(level) as f64 / options.max_bytes_for_level(level) as f64;
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        self.compaction_score = best_score;
        self.compaction_level = best_level;
    }

    /// Index of the first file at `level` (≥ 1) whose largest key is ≥
    /// `target` (an encoded internal key).
    pub fn find_file(&self, icmp: &InternalKeyComparator, level: usize, target: &[u8]) -> usize {
        self.files[level].partition_point(|file| {
            icmp.compare(file.largest.encoded(), target) == Ordering::Less
        })
    }

    /// All files at `level` whose user-key range intersects
    /// `[begin, end]` (both inclusive; `None` = unbounded).
    ///
    /// At level 0 the search range grows transitively: overlapping
    /// files may themselves widen the range, and every file touching
    /// the widened range must be included (they may stack versions of
    /// the same keys).
    pub fn overlapping_inputs(
        &self,
        icmp: &InternalKeyComparator,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetadata>> {
        let user = icmp.user_comparator();
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());

        let mut inputs: Vec<Arc<FileMetadata>> = Vec::new();
        let mut idx = 0;
        while idx < self.files[level].len() {
            let file = &self.files[level][idx];
            idx += 1;
            let file_start = extract_user_key(file.smallest.encoded());
            let file_limit = extract_user_key(file.largest.encoded());

            let before = begin
                .as_deref()
                .is_some_and(|b| user.compare(file_limit, b) == Ordering::Less);
            let after = end
                .as_deref()
                .is_some_and(|e| user.compare(file_start, e) == Ordering::Greater);
            if before || after {
                continue;
            }

            inputs.push(Arc::clone(file));

            if level == 0 {
                // Level-0 files overlap each other; widen and restart.
                let mut widened = false;
                if let Some(b) = begin.as_deref()
                    && user.compare(file_start, b) == Ordering::Less
                {
                    begin = Some(file_start.to_vec());
                    widened = true;
                }
                if let Some(e) = end.as_deref()
                    && user.compare(file_limit, e) == Ordering::Greater
                {
                    end = Some(file_limit.to_vec());
                    widened = true;
                }
                if widened {
                    inputs.clear();
                    idx = 0;
                }
            }
        }
        inputs
    }

    /// True when no file at any level deeper than `level` overlaps
    /// `user_key` — the bottommost-key test used for tombstone drops.
    pub fn is_bottommost_for_key(
        &self,
        icmp: &InternalKeyComparator,
        level: usize,
        user_key: &[u8],
    ) -> bool {
        for deeper in (level + 1)..self.num_levels {
            for file in &self.files[deeper] {
                if file.range_contains(icmp, user_key) {
                    return false;
                }
            }
        }
        true
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable published placement of one column family's files.
#[derive(Debug)]
pub struct Version {
    /// Owning column family.
    pub cf_id: u32,
    /// File placement and derived indices.
    pub storage: VersionStorageInfo,
}

impl Version {
    /// An empty version for a fresh column family.
    pub fn empty(cf_id: u32, num_levels: usize) -> Self {
        Self {
            cf_id,
            storage: VersionStorageInfo::new(num_levels),
        }
    }

    /// Probes the version's files for `user_key` at `snapshot`,
    /// newest-first: level 0 by descending largest sequence, then each
    /// deeper level's single candidate file.
    ///
    /// Returns `true` once the lookup concluded.
    pub fn get(
        &self,
        icmp: &InternalKeyComparator,
        cache: &TableCache,
        user_key: &[u8],
        snapshot: SequenceNumber,
        ctx: &mut GetContext<'_>,
    ) -> Result<bool, DbError> {
        // Level 0: overlapping files, newest first.
        let mut l0: Vec<&Arc<FileMetadata>> = self
            .storage
            .files(0)
            .iter()
            .filter(|f| f.range_contains(icmp, user_key))
            .collect();
        l0.sort_by(|a, b| b.largest_seq.cmp(&a.largest_seq));
        for file in l0 {
            let reader = cache.get(file.number, icmp)?;
            if reader.get(user_key, snapshot, ctx)? {
                return Ok(true);
            }
        }

        // Levels ≥ 1: binary search to the single candidate.
        let target = make_internal_key(user_key, snapshot, VALUE_TYPE_FOR_SEEK)?;
        for level in 1..self.storage.num_levels() {
            if self.storage.num_level_files(level) == 0 {
                continue;
            }
            let idx = self.storage.find_file(icmp, level, &target);
            if idx >= self.storage.num_level_files(level) {
                continue;
            }
            let file = &self.storage.files(level)[idx];
            if !file.range_contains(icmp, user_key) {
                continue;
            }
            let reader = cache.get(file.number, icmp)?;
            if reader.get(user_key, snapshot, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every file in the version.
    pub fn all_files(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        (0..self.storage.num_levels()).flat_map(|level| self.storage.files(level).iter())
    }
}
