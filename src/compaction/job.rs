//! Compaction job — executes one picked compaction.
//!
//! Inputs are merged in internal-key order; for each user key the full
//! version stack is collected and the retention policy applied:
//!
//! - Per live-snapshot interval, only the newest entry survives.
//! - A trailing tombstone is dropped when the key is bottommost and no
//!   live snapshot could still see an older version.
//! - Contiguous merge operands fold into their base when the fold stays
//!   inside one snapshot interval, and fold completely when the key is
//!   bottommost.
//! - The compaction filter sees the newest unprotected surviving value
//!   and may drop or rewrite it.
//!
//! Outputs are cut at `max_output_file_size` and whenever the crossed
//! grandparent bytes exceed the configured bound, preventing output
//! files that would make future compactions at the next level
//! expensive.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::filename::table_file_name;
use crate::keys::{
    InternalKey, InternalKeyComparator, SequenceNumber, ValueType, make_internal_key,
    parse_internal_key,
};
use crate::merge::MergeOperator;
use crate::table::TableWriter;
use crate::table_cache::TableCache;

use super::{Compaction, CompactionFilter, CompactionFilterDecision, MergingIterator};

// ------------------------------------------------------------------------------------------------
// Output metadata
// ------------------------------------------------------------------------------------------------

/// One finished output file of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutput {
    /// File number of the output.
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key.
    pub smallest: InternalKey,
    /// Largest internal key.
    pub largest: InternalKey,
    /// Smallest sequence in the file.
    pub smallest_seq: SequenceNumber,
    /// Largest sequence in the file.
    pub largest_seq: SequenceNumber,
}

// ------------------------------------------------------------------------------------------------
// CompactionJob
// ------------------------------------------------------------------------------------------------

/// Executes one compaction against a pinned input version.
pub struct CompactionJob<'a> {
    /// The picked work unit.
    pub compaction: &'a Compaction,
    /// Comparator of the owning column family.
    pub icmp: InternalKeyComparator,
    /// Live snapshot sequences, ascending.
    pub snapshots: Vec<SequenceNumber>,
    /// Merge operator of the column family, if any.
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    /// Compaction filter of the column family, if any.
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
    /// Cooperative cancellation flag.
    pub shutdown: &'a AtomicBool,
}

struct OutputState {
    writer: TableWriter,
    number: u64,
    path: std::path::PathBuf,
    smallest: Option<Vec<u8>>,
    largest: Vec<u8>,
    smallest_seq: SequenceNumber,
    largest_seq: SequenceNumber,
}

impl<'a> CompactionJob<'a> {
    /// Runs the compaction, returning metadata for every output file.
    ///
    /// `allocate_file_number` reserves output numbers (and registers
    /// them as pending) under the engine lock.  On error, files already
    /// written are removed before returning.
    pub fn run(
        &self,
        db_path: &Path,
        table_cache: &TableCache,
        allocate_file_number: &mut dyn FnMut() -> u64,
    ) -> Result<Vec<CompactionOutput>, DbError> {
        let earliest_snapshot = self
            .snapshots
            .first()
            .copied()
            .unwrap_or(crate::keys::MAX_SEQUENCE_NUMBER);

        info!(
            cf = self.compaction.cf_id,
            level = self.compaction.level,
            output_level = self.compaction.output_level,
            inputs = self.compaction.inputs[0].len() + self.compaction.inputs[1].len(),
            input_bytes = self.compaction.input_bytes(),
            snapshots = self.snapshots.len(),
            "compaction started"
        );

        // Stream every input file through the merging iterator.
        let mut sources: Vec<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>> = Vec::new();
        for file in self.compaction.all_inputs() {
            let reader = table_cache.get(file.number, &self.icmp)?;
            sources.push(Box::new(reader.iter()));
        }
        let mut merged = MergingIterator::new(self.icmp.clone(), sources).peekable();

        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut current: Option<OutputState> = None;
        let mut grandparent_index = 0usize;
        let mut overlapped_bytes = 0u64;
        let mut seen_key = false;

        let result = (|| -> Result<(), DbError> {
            loop {
                if self.shutdown.load(AtomicOrdering::SeqCst) {
                    return Err(DbError::ShutdownInProgress);
                }

                // Collect the full version stack of the next user key.
                let Some((first_key, _)) = merged.peek() else {
                    break;
                };
                let user_key = crate::keys::extract_user_key(first_key).to_vec();
                let mut group: Vec<(SequenceNumber, ValueType, Vec<u8>)> = Vec::new();
                while let Some((key, _)) = merged.peek() {
                    if crate::keys::extract_user_key(key) != user_key.as_slice() {
                        break;
                    }
                    let (key, value) = merged.next().expect("peeked entry vanished");
                    let parsed = parse_internal_key(&key)?;
                    group.push((parsed.sequence, parsed.value_type, value));
                }

                let survivors = self.process_user_key(&user_key, group, earliest_snapshot)?;
                if survivors.is_empty() {
                    continue;
                }

                // Output files may only be cut between user keys:
                // splitting one key's version stack across two files at
                // the same level would break the one-candidate-file
                // invariant of point lookups.
                let boundary_ikey =
                    make_internal_key(&user_key, survivors[0].0, survivors[0].1)?;
                let grandparent_cut = Self::crossed_grandparents(
                    &self.icmp,
                    &self.compaction.grandparents,
                    &boundary_ikey,
                    &mut grandparent_index,
                    &mut overlapped_bytes,
                    &mut seen_key,
                    self.compaction.max_grandparent_overlap_bytes,
                );
                let should_cut = match &current {
                    Some(state) => {
                        state.writer.estimated_file_size()
                            >= self.compaction.max_output_file_size
                            || grandparent_cut
                    }
                    None => false,
                };
                if should_cut {
                    if let Some(state) = current.take() {
                        outputs.push(Self::finish_output(state)?);
                    }
                    overlapped_bytes = 0;
                }

                for (seq, ty, value) in survivors {
                    let ikey = make_internal_key(&user_key, seq, ty)?;

                    let state = match &mut current {
                        Some(state) => state,
                        None => {
                            let number = allocate_file_number();
                            let path = table_file_name(db_path, number);
                            current = Some(OutputState {
                                writer: TableWriter::new(&path, self.icmp.clone())?,
                                number,
                                path,
                                smallest: None,
                                largest: Vec::new(),
                                smallest_seq: u64::MAX,
                                largest_seq: 0,
                            });
                            current.as_mut().expect("just inserted")
                        }
                    };

                    state.writer.add(&ikey, &value)?;
                    if state.smallest.is_none() {
                        state.smallest = Some(ikey.clone());
                    }
                    state.largest = ikey;
                    state.smallest_seq = state.smallest_seq.min(seq);
                    state.largest_seq = state.largest_seq.max(seq);
                }
            }

            if let Some(state) = current.take() {
                outputs.push(Self::finish_output(state)?);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!(
                    cf = self.compaction.cf_id,
                    outputs = outputs.len(),
                    output_bytes = outputs.iter().map(|o| o.file_size).sum::<u64>(),
                    "compaction finished"
                );
                Ok(outputs)
            }
            Err(err) => {
                // Remove everything this job managed to write.
                for output in &outputs {
                    let path = table_file_name(db_path, output.number);
                    if let Err(remove_err) = std::fs::remove_file(&path) {
                        warn!(
                            number = output.number,
                            error = %remove_err,
                            "failed to remove partial compaction output"
                        );
                    }
                    table_cache.evict(output.number);
                }
                Err(err)
            }
        }
    }

    fn finish_output(state: OutputState) -> Result<CompactionOutput, DbError> {
        let number = state.number;
        let smallest = state.smallest.clone().unwrap_or_default();
        let largest = state.largest.clone();
        let smallest_seq = state.smallest_seq;
        let largest_seq = state.largest_seq;
        let path = state.path.clone();
        let properties = state.writer.finish()?;
        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(properties.data_size);
        debug!(number, entries = properties.num_entries, file_size, "compaction output finished");
        Ok(CompactionOutput {
            number,
            file_size,
            smallest: InternalKey::from_encoded(smallest),
            largest: InternalKey::from_encoded(largest),
            smallest_seq,
            largest_seq,
        })
    }

    /// Advances the grandparent cursor past `ikey`, accumulating the
    /// bytes of fully crossed files.  Returns `true` when the crossed
    /// bytes exceed the bound (the caller cuts and resets).
    #[allow(clippy::too_many_arguments)]
    fn crossed_grandparents(
        icmp: &InternalKeyComparator,
        grandparents: &[Arc<crate::version::FileMetadata>],
        ikey: &[u8],
        grandparent_index: &mut usize,
        overlapped_bytes: &mut u64,
        seen_key: &mut bool,
        max_overlap: u64,
    ) -> bool {
        while *grandparent_index < grandparents.len()
            && icmp.compare(ikey, grandparents[*grandparent_index].largest.encoded())
                == std::cmp::Ordering::Greater
        {
            if *seen_key {
                *overlapped_bytes += grandparents[*grandparent_index].file_size;
            }
            *grandparent_index += 1;
        }
        *seen_key = true;
        *overlapped_bytes > max_overlap
    }

    /// Applies the retention policy to one user key's version stack
    /// (newest first).  Returns the surviving entries, still newest
    /// first.
    fn process_user_key(
        &self,
        user_key: &[u8],
        group: Vec<(SequenceNumber, ValueType, Vec<u8>)>,
        earliest_snapshot: SequenceNumber,
    ) -> Result<Vec<(SequenceNumber, ValueType, Vec<u8>)>, DbError> {
        let bottommost = self.compaction.input_version.storage.is_bottommost_for_key(
            &self.icmp,
            self.compaction.output_level,
            user_key,
        );

        // Snapshot bucket of a sequence: index of the smallest live
        // snapshot that can see it, or `snapshots.len()` for entries
        // newer than every snapshot.
        let bucket_of = |seq: SequenceNumber| self.snapshots.partition_point(|s| *s < seq);

        // Pass 1: per-bucket retention — within one visibility
        // interval only the newest entry can ever be observed.  Merge
        // operands are exempt: they stack rather than shadow.
        let mut retained: Vec<(SequenceNumber, ValueType, Vec<u8>)> = Vec::new();
        let mut last_concluded_bucket: Option<usize> = None;
        for (seq, ty, value) in group {
            let bucket = bucket_of(seq);
            // Anything in a bucket already concluded by a newer value
            // or tombstone is invisible at every snapshot.
            if last_concluded_bucket == Some(bucket) {
                continue;
            }
            if ty == ValueType::Merge {
                // Operands stack instead of shadowing; they do not
                // conclude their bucket.
                retained.push((seq, ty, value));
                continue;
            }
            last_concluded_bucket = Some(bucket);
            retained.push((seq, ty, value));
        }

        // Pass 2: fold merge runs.
        let folded = self.fold_merge_runs(user_key, retained, bucket_of, bottommost)?;

        // Pass 3: tombstone drop and compaction filter.
        let mut survivors: Vec<(SequenceNumber, ValueType, Vec<u8>)> = Vec::new();
        for (idx, (seq, ty, value)) in folded.into_iter().enumerate() {
            if ty == ValueType::Deletion && bottommost && seq <= earliest_snapshot {
                // Nothing deeper can hold the key and no snapshot can
                // see past the tombstone.
                continue;
            }
            if ty == ValueType::Value
                && idx == 0
                && seq <= earliest_snapshot
                && let Some(filter) = &self.compaction_filter
            {
                match filter.filter(self.compaction.level, user_key, &value) {
                    CompactionFilterDecision::Keep => survivors.push((seq, ty, value)),
                    CompactionFilterDecision::Remove => continue,
                    CompactionFilterDecision::Change(new_value) => {
                        survivors.push((seq, ty, new_value));
                    }
                }
                continue;
            }
            survivors.push((seq, ty, value));
        }
        Ok(survivors)
    }

    /// Folds contiguous merge operands into their base where visibility
    /// allows.
    fn fold_merge_runs(
        &self,
        user_key: &[u8],
        entries: Vec<(SequenceNumber, ValueType, Vec<u8>)>,
        bucket_of: impl Fn(SequenceNumber) -> usize,
        bottommost: bool,
    ) -> Result<Vec<(SequenceNumber, ValueType, Vec<u8>)>, DbError> {
        if !entries.iter().any(|(_, ty, _)| *ty == ValueType::Merge) {
            return Ok(entries);
        }
        let Some(op) = self.merge_operator.as_deref() else {
            // No operator: leave the operands untouched for the reader
            // to complain about.
            return Ok(entries);
        };

        let mut out: Vec<(SequenceNumber, ValueType, Vec<u8>)> = Vec::new();
        let mut idx = 0;
        while idx < entries.len() {
            let (seq, ty, _) = &entries[idx];
            if *ty != ValueType::Merge {
                out.push(entries[idx].clone());
                idx += 1;
                continue;
            }

            // Collect the contiguous run of operands in one bucket.
            let run_bucket = bucket_of(*seq);
            let run_start = idx;
            while idx < entries.len()
                && entries[idx].1 == ValueType::Merge
                && bucket_of(entries[idx].0) == run_bucket
            {
                idx += 1;
            }
            let run: Vec<Vec<u8>> = entries[run_start..idx]
                .iter()
                .map(|(_, _, v)| v.clone())
                .collect();
            let run_seqs: Vec<SequenceNumber> =
                entries[run_start..idx].iter().map(|(s, _, _)| *s).collect();
            let run_seq = entries[run_start].0;

            // A base in the same bucket lets the run flatten to a
            // single value.
            let base_here = entries
                .get(idx)
                .filter(|(base_seq, base_ty, _)| {
                    *base_ty != ValueType::Merge && bucket_of(*base_seq) == run_bucket
                })
                .cloned();

            let folded = if let Some((_, base_ty, base_value)) = &base_here {
                let existing = match base_ty {
                    ValueType::Value => Some(base_value.as_slice()),
                    _ => None,
                };
                crate::merge::fold_operands(op, user_key, existing, &run)
            } else if idx == entries.len() && bottommost {
                // No base anywhere deeper: fold onto an absent base.
                crate::merge::fold_operands(op, user_key, None, &run)
            } else {
                None
            };

            match folded {
                Some(value) => {
                    out.push((run_seq, ValueType::Value, value));
                    if base_here.is_some() {
                        idx += 1; // base consumed by the fold
                    }
                }
                None => {
                    // Cannot flatten: try pairwise partial merges to at
                    // least shrink the run.
                    let mut shrunk: Vec<Vec<u8>> = Vec::new();
                    for operand in run {
                        if let Some(prev) = shrunk.last()
                            && let Some(combined) = op.partial_merge(user_key, operand.as_slice(), prev)
                        {
                            *shrunk.last_mut().expect("non-empty") = combined;
                            continue;
                        }
                        shrunk.push(operand);
                    }
                    // Re-emit operands, keeping the original sequences
                    // of the run (newest-first order preserved).
                    for (operand, seq) in shrunk.into_iter().zip(run_seqs) {
                        out.push((seq, ValueType::Merge, operand));
                    }
                }
            }
        }
        Ok(out)
    }
}
