//! Database iterators — a merged, snapshot-consistent ordered view.
//!
//! An iterator pins the memtables and the version it was created from,
//! so the visible set of keys never changes underneath it, regardless
//! of concurrent writes, flushes, or compactions.  The merged
//! internal-key stream is filtered down to user-visible pairs: entries
//! newer than the snapshot are hidden, only the newest visible version
//! of each user key is considered, tombstones suppress their key, and
//! merge chains are folded.
//!
//! Merge-fold failures (for example, no operator configured) end
//! iteration early and park the error in [`DbIterator::status`], the
//! way table iterators surface block corruption.

use std::sync::Arc;

use crate::compaction::MergingIterator;
use crate::error::DbError;
use crate::keys::{Comparator, SequenceNumber, ValueType, parse_internal_key};
use crate::lookup::GetContext;
use crate::memtable::Memtable;
use crate::merge::MergeOperator;
use crate::version::Version;

/// Ordered iterator over the visible `(key, value)` pairs of one
/// column family at one snapshot.
pub struct DbIterator {
    inner: VisibilityIter<MergingIterator<'static>>,
    /// Pins the version's files for the iterator's lifetime.
    _version: Arc<Version>,
    /// Pins the memtables likewise.
    _memtables: Vec<Arc<Memtable>>,
}

impl DbIterator {
    pub(crate) fn new(
        merged: MergingIterator<'static>,
        snapshot: SequenceNumber,
        user_comparator: Arc<dyn Comparator>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
        version: Arc<Version>,
        memtables: Vec<Arc<Memtable>>,
    ) -> Self {
        Self {
            inner: VisibilityIter::new(merged, snapshot, user_comparator, merge_operator),
            _version: version,
            _memtables: memtables,
        }
    }

    /// The error that terminated iteration early, if any.
    pub fn status(&self) -> Result<(), &DbError> {
        match &self.inner.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Iterator for DbIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Visibility filtering
// ------------------------------------------------------------------------------------------------

/// Filters a merged internal-key stream down to visible user pairs.
///
/// The input **must** be ordered by internal key (user key ascending,
/// sequence descending) — the order [`MergingIterator`] produces.
pub(crate) struct VisibilityIter<I>
where
    I: Iterator<Item = (Vec<u8>, Vec<u8>)>,
{
    input: std::iter::Peekable<I>,
    snapshot: SequenceNumber,
    user_comparator: Arc<dyn Comparator>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    error: Option<DbError>,
}

impl<I> VisibilityIter<I>
where
    I: Iterator<Item = (Vec<u8>, Vec<u8>)>,
{
    pub(crate) fn new(
        input: I,
        snapshot: SequenceNumber,
        user_comparator: Arc<dyn Comparator>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> Self {
        Self {
            input: input.peekable(),
            snapshot,
            user_comparator,
            merge_operator,
            error: None,
        }
    }

    /// Consumes every remaining entry of `user_key`.
    fn skip_rest_of_key(&mut self, user_key: &[u8]) {
        while let Some((ikey, _)) = self.input.peek() {
            let same_key = parse_internal_key(ikey)
                .map(|parsed| {
                    self.user_comparator
                        .compare(parsed.user_key, user_key)
                        .is_eq()
                })
                .unwrap_or(false);
            if !same_key {
                break;
            }
            self.input.next();
        }
    }

    /// Resolves one user key starting from its newest visible entry.
    /// Returns `Some` when the key is visible with a value.
    fn resolve_key(
        &mut self,
        user_key: Vec<u8>,
        first_seq: SequenceNumber,
        first_ty: ValueType,
        first_value: Vec<u8>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut ctx = GetContext::new(&user_key, self.merge_operator.as_deref());
        if !ctx.observe(first_seq, first_ty, &first_value) {
            // A merge chain: keep feeding visible entries of this key.
            while let Some((ikey, _)) = self.input.peek() {
                // Copy the header out before consuming the entry; the
                // parsed view borrows the peeked buffer.
                let header = match parse_internal_key(ikey) {
                    Ok(parsed) => {
                        let same_key = self
                            .user_comparator
                            .compare(parsed.user_key, &user_key)
                            .is_eq();
                        (same_key, parsed.sequence, parsed.value_type)
                    }
                    Err(err) => {
                        self.error = Some(err.into());
                        return None;
                    }
                };
                let (same_key, seq, ty) = header;
                if !same_key {
                    break;
                }
                let (_, value) = self.input.next().expect("peeked entry vanished");
                if seq > self.snapshot {
                    continue;
                }
                if ctx.observe(seq, ty, &value) {
                    break;
                }
            }
        }

        while let Some((ikey, _)) = self.input.peek() {
            let same_key = parse_internal_key(ikey)
                .map(|parsed| {
                    self.user_comparator
                        .compare(parsed.user_key, &user_key)
                        .is_eq()
                })
                .unwrap_or(false);
            if !same_key {
                break;
            }
            self.input.next();
        }

        match ctx.finish() {
            Ok(Some(value)) => Some((user_key, value)),
            Ok(None) => None,
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }
}

impl<I> Iterator for VisibilityIter<I>
where
    I: Iterator<Item = (Vec<u8>, Vec<u8>)>,
{
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.error.is_some() {
            return None;
        }
        loop {
            let (ikey, value) = self.input.next()?;
            let parsed = match parse_internal_key(&ikey) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.error = Some(err.into());
                    return None;
                }
            };
            if parsed.sequence > self.snapshot {
                continue;
            }

            let user_key = parsed.user_key.to_vec();
            let resolved =
                self.resolve_key(user_key, parsed.sequence, parsed.value_type, value);
            match resolved {
                Some(pair) => return Some(pair),
                None if self.error.is_some() => return None,
                // Deleted or absent at this snapshot: move to the next
                // user key.
                None => continue,
            }
        }
    }
}
