//! Merge operator — the user-supplied associative fold applied to
//! `Merge` entries at read and compaction time.

/// An associative operator over values of one column family.
///
/// `Merge(key, operand)` writes accumulate until a read or a compaction
/// folds them into the base value.  Operands for a key are always
/// folded oldest-to-newest.
pub trait MergeOperator: Send + Sync {
    /// Identifies the operator for diagnostics.
    fn name(&self) -> &str;

    /// Folds all accumulated operands into the base value.
    ///
    /// `existing` is `None` when the chain bottoms out on a deletion or
    /// on a key that was never written.  `operands` are ordered oldest
    /// first.  Returning `None` signals a merge failure, which surfaces
    /// to the caller as a corruption-class error.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>>;

    /// Combines two adjacent operands into one, if the operator
    /// supports it.  Compaction uses this to shrink merge chains that
    /// cannot yet reach their base value.  Returning `None` leaves the
    /// operands unfolded.
    fn partial_merge(&self, key: &[u8], lhs: &[u8], rhs: &[u8]) -> Option<Vec<u8>>;
}

/// Folds `operands` (ordered newest first, the order layers emit them)
/// into `existing` using `op`.
///
/// Reverses into oldest-first order before calling
/// [`MergeOperator::full_merge`].
pub fn fold_operands(
    op: &dyn MergeOperator,
    key: &[u8],
    existing: Option<&[u8]>,
    operands_newest_first: &[Vec<u8>],
) -> Option<Vec<u8>> {
    let mut oldest_first: Vec<Vec<u8>> = operands_newest_first.to_vec();
    oldest_first.reverse();
    op.full_merge(key, existing, &oldest_first)
}
