//! Memtable — the mutable in-memory buffer of one column family.
//!
//! ## Design Invariants
//!
//! - Entries are multi-versioned: a user key maps to its versions
//!   ordered by descending sequence number, and reads resolve the
//!   newest version visible at the caller's snapshot.
//! - The memtable performs no WAL writes itself.  The group committer
//!   appends to the shared WAL first and then inserts here;
//!   [`Memtable::log_number`] records which WAL feeds this memtable so
//!   recovery and archival know when the log is still needed.
//! - Deletes and merges are entries like any other; nothing is removed
//!   in place.
//!
//! ## Flush Semantics
//!
//! [`Memtable::iter_all`] returns every entry in internal-key order
//! (user key ascending, sequence descending) — exactly the order the
//! table writer requires.  Iteration does not mutate the memtable.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    ops::Bound,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

use crate::error::DbError;
use crate::keys::{SequenceNumber, ValueType, make_internal_key};
use crate::lookup::GetContext;

// ------------------------------------------------------------------------------------------------
// Entry types
// ------------------------------------------------------------------------------------------------

/// One version of one user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEntry {
    /// Kind of the entry.
    pub value_type: ValueType,
    /// Value bytes; empty for deletions.
    pub value: Vec<u8>,
}

struct MemtableInner {
    /// Point entries grouped by user key, then ordered by descending
    /// sequence.
    tree: BTreeMap<Vec<u8>, BTreeMap<Reverse<SequenceNumber>, MemEntry>>,

    /// Approximate in-memory footprint in bytes.
    approximate_size: usize,

    /// Number of entries.
    num_entries: usize,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Multi-version ordered buffer for one column family.
///
/// # Concurrency
/// Writers serialize through the group committer; readers proceed
/// concurrently under the interior `RwLock`.
pub struct Memtable {
    inner: RwLock<MemtableInner>,

    /// WAL file that feeds this memtable.
    log_number: u64,

    /// Database sequence at the moment this memtable was created.
    /// Entries strictly newer than this land here (or in a successor),
    /// which is what lets conflict validation reason about how far back
    /// the in-memory history reaches.
    creation_sequence: SequenceNumber,

    /// Smallest sequence inserted (0 until the first insert).
    first_sequence: AtomicU64,

    /// Largest sequence inserted.
    largest_sequence: AtomicU64,
}

impl Memtable {
    /// Creates an empty memtable fed by WAL `log_number`, created when
    /// the database was at `creation_sequence`.
    pub fn new(log_number: u64, creation_sequence: SequenceNumber) -> Self {
        Self {
            inner: RwLock::new(MemtableInner {
                tree: BTreeMap::new(),
                approximate_size: 0,
                num_entries: 0,
            }),
            log_number,
            creation_sequence,
            first_sequence: AtomicU64::new(0),
            largest_sequence: AtomicU64::new(0),
        }
    }

    /// The WAL file number feeding this memtable.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// The database sequence at creation time.
    pub fn creation_sequence(&self) -> SequenceNumber {
        self.creation_sequence
    }

    /// Inserts one entry.  Called by the group committer and by
    /// recovery replay, both of which already assigned the sequence.
    pub fn add(
        &self,
        seq: SequenceNumber,
        ty: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DbError> {
        let record_size = std::mem::size_of::<MemEntry>() + key.len() + value.len();

        let mut guard = self
            .inner
            .write()
            .map_err(|_| DbError::Internal("memtable lock poisoned".into()))?;

        guard.tree.entry(key.to_vec()).or_default().insert(
            Reverse(seq),
            MemEntry {
                value_type: ty,
                value: value.to_vec(),
            },
        );
        guard.approximate_size += record_size;
        guard.num_entries += 1;
        drop(guard);

        self.first_sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                if prev == 0 || seq < prev { Some(seq) } else { None }
            })
            .ok();
        self.largest_sequence.fetch_max(seq, Ordering::SeqCst);

        trace!(seq, ?ty, key_len = key.len(), "memtable add");
        Ok(())
    }

    /// Probes this memtable for `key` at snapshot `snapshot`, feeding
    /// visible versions (newest first) into `ctx`.
    ///
    /// Returns `true` once the lookup concluded here and deeper layers
    /// need not be consulted.
    pub fn get(
        &self,
        key: &[u8],
        snapshot: SequenceNumber,
        ctx: &mut GetContext<'_>,
    ) -> Result<bool, DbError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| DbError::Internal("memtable lock poisoned".into()))?;

        let Some(versions) = guard.tree.get(key) else {
            return Ok(false);
        };

        // Keys are Reverse(seq): ranging from Reverse(snapshot) yields
        // seq ≤ snapshot in descending-sequence order.
        for (Reverse(seq), entry) in
            versions.range((Bound::Included(Reverse(snapshot)), Bound::Unbounded))
        {
            if ctx.observe(*seq, entry.value_type, &entry.value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Newest sequence number of any entry for `key` visible in this
    /// memtable, ignoring snapshots.  Used by transaction conflict
    /// validation.
    pub fn latest_sequence_for_key(&self, key: &[u8]) -> Result<Option<SequenceNumber>, DbError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| DbError::Internal("memtable lock poisoned".into()))?;
        Ok(guard
            .tree
            .get(key)
            .and_then(|versions| versions.keys().next().map(|rev| rev.0)))
    }

    /// Every entry in internal-key order, for flushing to a table.
    pub fn iter_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        self.iter_range(None, None)
    }

    /// Entries whose user key falls in `[lower, upper)`, in
    /// internal-key order.  `None` bounds are open.
    pub fn iter_range(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| DbError::Internal("memtable lock poisoned".into()))?;

        let range = match (lower, upper) {
            (Some(lo), Some(hi)) => guard.tree.range::<[u8], _>((
                Bound::Included(lo),
                Bound::Excluded(hi),
            )),
            (Some(lo), None) => guard
                .tree
                .range::<[u8], _>((Bound::Included(lo), Bound::Unbounded)),
            (None, Some(hi)) => guard
                .tree
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(hi))),
            (None, None) => guard
                .tree
                .range::<[u8], _>((Bound::Unbounded, Bound::Unbounded)),
        };

        let mut out = Vec::new();
        for (user_key, versions) in range {
            for (Reverse(seq), entry) in versions.iter() {
                let ikey = make_internal_key(user_key, *seq, entry.value_type)?;
                out.push((ikey, entry.value.clone()));
            }
        }
        Ok(out)
    }

    /// Approximate bytes held by this memtable.
    pub fn approximate_memory_usage(&self) -> usize {
        self.inner
            .read()
            .map(|guard| guard.approximate_size)
            .unwrap_or(0)
    }

    /// Number of entries.
    pub fn num_entries(&self) -> usize {
        self.inner.read().map(|guard| guard.num_entries).unwrap_or(0)
    }

    /// True when nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Smallest sequence inserted, or 0 when empty.
    pub fn first_sequence(&self) -> SequenceNumber {
        self.first_sequence.load(Ordering::SeqCst)
    }

    /// Largest sequence inserted, or 0 when empty.
    pub fn largest_sequence(&self) -> SequenceNumber {
        self.largest_sequence.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("log_number", &self.log_number)
            .field("entries", &self.num_entries())
            .field("bytes", &self.approximate_memory_usage())
            .finish()
    }
}
