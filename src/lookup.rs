//! Point-lookup context shared by the memtable, table, and version
//! probes.
//!
//! A read at snapshot `s` walks the layers newest-to-oldest and feeds
//! every visible entry for the target user key into a [`GetContext`].
//! The context tracks merge operands until a base (value or tombstone)
//! concludes the search, then [`GetContext::finish`] folds the chain.

use crate::error::DbError;
use crate::keys::{SequenceNumber, ValueType};
use crate::merge::{MergeOperator, fold_operands};

enum BaseState {
    /// Still probing deeper layers.
    Searching,
    /// Hit a value; merge operands (if any) fold into it.
    Value(Vec<u8>),
    /// Hit a tombstone; merge operands fold into an empty base.
    Deleted,
}

/// Accumulates per-key lookup state across layers.
pub struct GetContext<'a> {
    user_key: &'a [u8],
    merge_operator: Option<&'a dyn MergeOperator>,
    base: BaseState,
    /// Merge operands, newest first.
    operands: Vec<Vec<u8>>,
}

impl<'a> GetContext<'a> {
    /// Starts a lookup for `user_key`.
    pub fn new(user_key: &'a [u8], merge_operator: Option<&'a dyn MergeOperator>) -> Self {
        Self {
            user_key,
            merge_operator,
            base: BaseState::Searching,
            operands: Vec::new(),
        }
    }

    /// Feeds one visible entry (already filtered to `seq ≤ snapshot`,
    /// newest first).  Returns `true` once the lookup has concluded and
    /// deeper layers need not be probed.
    pub fn observe(&mut self, _seq: SequenceNumber, ty: ValueType, value: &[u8]) -> bool {
        debug_assert!(matches!(self.base, BaseState::Searching));
        match ty {
            ValueType::Value => {
                self.base = BaseState::Value(value.to_vec());
                true
            }
            ValueType::Deletion => {
                self.base = BaseState::Deleted;
                true
            }
            ValueType::Merge => {
                self.operands.push(value.to_vec());
                false
            }
        }
    }

    /// True once [`Self::observe`] returned `true`.
    pub fn is_concluded(&self) -> bool {
        !matches!(self.base, BaseState::Searching)
    }

    /// True when the lookup saw at least one entry.
    pub fn saw_anything(&self) -> bool {
        self.is_concluded() || !self.operands.is_empty()
    }

    /// Resolves the lookup: folds any merge chain and returns the
    /// visible value, `None` for deleted/absent keys.
    pub fn finish(self) -> Result<Option<Vec<u8>>, DbError> {
        let existing: Option<Vec<u8>> = match self.base {
            BaseState::Value(v) => Some(v),
            BaseState::Deleted | BaseState::Searching => None,
        };

        if self.operands.is_empty() {
            return Ok(existing);
        }

        let Some(op) = self.merge_operator else {
            return Err(DbError::MergeInProgress(format!(
                "key has merge operands but no merge operator is configured ({} pending)",
                self.operands.len()
            )));
        };

        match fold_operands(op, self.user_key, existing.as_deref(), &self.operands) {
            Some(folded) => Ok(Some(folded)),
            None => Err(DbError::Corruption(format!(
                "merge operator {} failed to fold {} operands",
                op.name(),
                self.operands.len()
            ))),
        }
    }
}
