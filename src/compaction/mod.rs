//! Compaction — choosing inputs and merging them down the level
//! hierarchy.
//!
//! The picker selects inputs for **leveled compaction**: the level with
//! the highest score contributes files (all overlapping files at level
//! 0, one cursor-advanced file plus boundary expansion at deeper
//! levels), every overlapping file at the next level joins them, and
//! grandparent files bound the output cut points.  Files joining a
//! compaction are reserved through their `being_compacted` flag, so
//! concurrent pickers select disjoint work.
//!
//! A picked [`Compaction`] either executes as a **trivial move**
//! (metadata-only re-level of a single file) or runs through
//! [`job::CompactionJob`], which merges the inputs with
//! snapshot-aware retention and writes new output files.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod job;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;

use tracing::debug;

use crate::keys::{InternalKeyComparator, extract_user_key};
use crate::version::{ColumnFamilyState, FileMetadata, Version};

// ------------------------------------------------------------------------------------------------
// CompactionFilter
// ------------------------------------------------------------------------------------------------

/// Decision returned by a [`CompactionFilter`] for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionFilterDecision {
    /// Keep the entry unchanged.
    Keep,
    /// Drop the entry from the output.
    Remove,
    /// Keep the entry but replace its value.
    Change(Vec<u8>),
}

/// User hook consulted for each surviving value during compaction.
///
/// The filter sees only the newest surviving `Value` entry of a user
/// key that no live snapshot protects; deletions and merge operands
/// are never offered.
pub trait CompactionFilter: Send + Sync {
    /// Identifies the filter for diagnostics.
    fn name(&self) -> &str;

    /// Decides the fate of one entry.
    fn filter(&self, level: usize, user_key: &[u8], value: &[u8]) -> CompactionFilterDecision;
}

// ------------------------------------------------------------------------------------------------
// Compaction — a picked unit of work
// ------------------------------------------------------------------------------------------------

/// A selected compaction: inputs at two adjacent levels, the pinned
/// version they came from, and the grandparent files used to bound
/// output sizes.
pub struct Compaction {
    /// Column family being compacted.
    pub cf_id: u32,
    /// Input level.
    pub level: usize,
    /// Output level (`level + 1`).
    pub output_level: usize,
    /// Inputs: `[files at level, files at output_level]`.
    pub inputs: [Vec<Arc<FileMetadata>>; 2],
    /// Files at `output_level + 1` intersecting the compaction range.
    pub grandparents: Vec<Arc<FileMetadata>>,
    /// Version the inputs were picked from; pinned for the duration.
    pub input_version: Arc<Version>,
    /// Target size of one output file.
    pub max_output_file_size: u64,
    /// Output-cut threshold of crossed grandparent bytes.
    pub max_grandparent_overlap_bytes: u64,
    /// True for `compact_range`-initiated work.
    pub is_manual: bool,
    /// User-key range covered by the inputs.
    pub smallest_user_key: Vec<u8>,
    /// Upper end of the covered user-key range.
    pub largest_user_key: Vec<u8>,
}

impl Compaction {
    /// All input files across both levels.
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        self.inputs[0].iter().chain(self.inputs[1].iter())
    }

    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|f| f.file_size).sum()
    }

    /// A metadata-only move: one input file, nothing at the output
    /// level, bounded grandparent overlap, and no compression or path
    /// change.  Level-0 files never move trivially (their sequence
    /// ranges overlap siblings).
    pub fn is_trivial_move(&self) -> bool {
        self.level >= 1
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && self.inputs[0][0].path_id == 0
            && self
                .grandparents
                .iter()
                .map(|f| f.file_size)
                .sum::<u64>()
                <= self.max_grandparent_overlap_bytes
    }

    /// Releases the `being_compacted` reservation on every input.
    pub fn release_inputs(&self) {
        for file in self.all_inputs() {
            file.being_compacted.store(false, AtomicOrdering::SeqCst);
        }
    }

    fn reserve_inputs(&self) {
        for file in self.all_inputs() {
            file.being_compacted.store(true, AtomicOrdering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("cf_id", &self.cf_id)
            .field("level", &self.level)
            .field("output_level", &self.output_level)
            .field(
                "inputs",
                &[self.inputs[0].len(), self.inputs[1].len()],
            )
            .field("grandparents", &self.grandparents.len())
            .field("is_manual", &self.is_manual)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Picker
// ------------------------------------------------------------------------------------------------

fn any_being_compacted(files: &[Arc<FileMetadata>]) -> bool {
    files
        .iter()
        .any(|f| f.being_compacted.load(AtomicOrdering::SeqCst))
}

fn user_key_range(
    icmp: &InternalKeyComparator,
    files: &[&[Arc<FileMetadata>]],
) -> Option<(Vec<u8>, Vec<u8>)> {
    let user = icmp.user_comparator();
    let mut smallest: Option<Vec<u8>> = None;
    let mut largest: Option<Vec<u8>> = None;
    for level in files {
        for file in level.iter() {
            let lo = extract_user_key(file.smallest.encoded());
            let hi = extract_user_key(file.largest.encoded());
            if smallest
                .as_deref()
                .is_none_or(|s| user.compare(lo, s) == Ordering::Less)
            {
                smallest = Some(lo.to_vec());
            }
            if largest
                .as_deref()
                .is_none_or(|l| user.compare(hi, l) == Ordering::Greater)
            {
                largest = Some(hi.to_vec());
            }
        }
    }
    smallest.zip(largest)
}

/// Picks the best automatic compaction for a column family, or `None`
/// when no level's score reaches 1.0 or the candidates are already
/// reserved by another compaction.
///
/// On success every input file is reserved via `being_compacted`.
pub fn pick_compaction(cf: &ColumnFamilyState) -> Option<Compaction> {
    let version = Arc::clone(&cf.current);
    let storage = &version.storage;
    if storage.compaction_score < 1.0 {
        return None;
    }
    let level = storage.compaction_level;
    let output_level = level + 1;
    if output_level >= storage.num_levels() {
        return None;
    }

    let icmp = &cf.icmp;
    let mut inputs0: Vec<Arc<FileMetadata>>;

    if level == 0 {
        // Level-0 files overlap arbitrarily; compact them all.
        inputs0 = storage.files(0).to_vec();
    } else {
        // Round-robin: first file past the cursor, wrapping.
        let files = storage.files(level);
        let cursor = cf.compact_pointer[level].as_ref();
        let start = match cursor {
            Some(pointer) => files
                .iter()
                .position(|f| icmp.compare(f.largest.encoded(), pointer.encoded()) == Ordering::Greater)
                .unwrap_or(0),
            None => 0,
        };
        let seed = Arc::clone(files.get(start)?);
        // Pull in any files sharing a boundary user key with the seed.
        let (lo, hi) = user_key_range(icmp, &[&[seed][..]])?;
        inputs0 = storage.overlapping_inputs(icmp, level, Some(&lo), Some(&hi));
    }

    if inputs0.is_empty() || any_being_compacted(&inputs0) {
        return None;
    }

    let (lo, hi) = user_key_range(icmp, &[&inputs0[..]])?;
    let mut inputs1 = storage.overlapping_inputs(icmp, output_level, Some(&lo), Some(&hi));
    if any_being_compacted(&inputs1) {
        return None;
    }

    // Try growing the input-level set to everything inside the union
    // range, as long as that does not pull more files into the output
    // level.
    if !inputs1.is_empty() {
        let (union_lo, union_hi) = user_key_range(icmp, &[&inputs0[..], &inputs1[..]])?;
        let expanded0 =
            storage.overlapping_inputs(icmp, level, Some(&union_lo), Some(&union_hi));
        if expanded0.len() > inputs0.len() && !any_being_compacted(&expanded0) {
            let (new_lo, new_hi) = user_key_range(icmp, &[&expanded0[..]])?;
            let expanded1 =
                storage.overlapping_inputs(icmp, output_level, Some(&new_lo), Some(&new_hi));
            if expanded1.len() == inputs1.len() {
                debug!(
                    level,
                    from = inputs0.len(),
                    to = expanded0.len(),
                    "compaction input set expanded"
                );
                inputs0 = expanded0;
                inputs1 = expanded1;
            }
        }
    }

    let (smallest, largest) = user_key_range(icmp, &[&inputs0[..], &inputs1[..]])?;
    let grandparents = if output_level + 1 < storage.num_levels() {
        storage.overlapping_inputs(icmp, output_level + 1, Some(&smallest), Some(&largest))
    } else {
        Vec::new()
    };

    let compaction = Compaction {
        cf_id: cf.id,
        level,
        output_level,
        inputs: [inputs0, inputs1],
        grandparents,
        input_version: version,
        max_output_file_size: cf.options.max_output_file_size,
        max_grandparent_overlap_bytes: cf.options.max_grandparent_overlap_bytes,
        is_manual: false,
        smallest_user_key: smallest,
        largest_user_key: largest,
    };
    compaction.reserve_inputs();
    Some(compaction)
}

/// Picks a manual compaction of `level` restricted to `[begin, end]`
/// user keys (`None` = unbounded).  Returns `None` when the range holds
/// no files at that level or the candidates are reserved.
pub fn pick_range_compaction(
    cf: &ColumnFamilyState,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Option<Compaction> {
    let version = Arc::clone(&cf.current);
    let storage = &version.storage;
    let output_level = level + 1;
    if output_level >= storage.num_levels() {
        return None;
    }
    let icmp = &cf.icmp;

    let inputs0 = storage.overlapping_inputs(icmp, level, begin, end);
    if inputs0.is_empty() || any_being_compacted(&inputs0) {
        return None;
    }

    let (lo, hi) = user_key_range(icmp, &[&inputs0[..]])?;
    let inputs1 = storage.overlapping_inputs(icmp, output_level, Some(&lo), Some(&hi));
    if any_being_compacted(&inputs1) {
        return None;
    }

    let (smallest, largest) = user_key_range(icmp, &[&inputs0[..], &inputs1[..]])?;
    let grandparents = if output_level + 1 < storage.num_levels() {
        storage.overlapping_inputs(icmp, output_level + 1, Some(&smallest), Some(&largest))
    } else {
        Vec::new()
    };

    let compaction = Compaction {
        cf_id: cf.id,
        level,
        output_level,
        inputs: [inputs0, inputs1],
        grandparents,
        input_version: version,
        max_output_file_size: cf.options.max_output_file_size,
        max_grandparent_overlap_bytes: cf.options.max_grandparent_overlap_bytes,
        is_manual: true,
        smallest_user_key: smallest,
        largest_user_key: largest,
    };
    compaction.reserve_inputs();
    Some(compaction)
}

// ------------------------------------------------------------------------------------------------
// MergingIterator — heap-based k-way merge in internal-key order
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
    icmp: InternalKeyComparator,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the smallest internal key pops first.
        // Source index breaks ties deterministically.
        self.icmp
            .compare(&self.key, &other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

/// Merges multiple internal-key-ordered `(key, value)` streams into a
/// single globally ordered stream.
///
/// Shared by the compaction job and the read-path iterators.  The
/// lifetime `'a` bounds borrowed state inside the sources; pass
/// `'static` when they own their data.
pub struct MergingIterator<'a> {
    iters: Vec<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>>,
    heap: BinaryHeap<HeapEntry>,
    icmp: InternalKeyComparator,
}

impl<'a> MergingIterator<'a> {
    /// Builds the merge over `iters`, priming the heap with each
    /// source's first entry.
    pub fn new(
        icmp: InternalKeyComparator,
        mut iters: Vec<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>>,
    ) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iter) in iters.iter_mut().enumerate() {
            if let Some((key, value)) = iter.next() {
                heap.push(HeapEntry {
                    key,
                    value,
                    source,
                    icmp: icmp.clone(),
                });
            }
        }
        Self { iters, heap, icmp }
    }
}

impl Iterator for MergingIterator<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        if let Some((key, value)) = self.iters[entry.source].next() {
            self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
                icmp: self.icmp.clone(),
            });
        }
        Some((entry.key, entry.value))
    }
}
