//! Write batches — ordered groups of entries applied atomically.
//!
//! # Wire format
//!
//! ```text
//! [sequence: 8 bytes LE][count: 4 bytes LE][record]...
//!
//! record := kind(1)
//!           [cf_id varint32]             -- CF-qualified kinds only
//!           [varint32 klen][key bytes]
//!           [varint32 vlen][value bytes] -- omitted for deletions
//! ```
//!
//! The batch body is exactly what travels through the WAL: the group
//! committer stamps the leading sequence, appends the bytes as one
//! logical record, and the same bytes replay during recovery.
//!
//! Savepoints form a stack of `(byte offset, count)` pairs;
//! [`WriteBatch::rollback_to_save_point`] truncates the body back to
//! the most recent savepoint and restores the entry count.

use crate::encoding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, get_varint32,
    put_length_prefixed_slice, put_varint32,
};
use crate::error::DbError;
use crate::keys::SequenceNumber;

/// Byte length of the `sequence | count` batch header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// Column family id of the default column family.
pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;

// Record kinds.  CF-qualified kinds carry a varint column family id
// directly after the kind byte.
const KIND_DELETION: u8 = 0x00;
const KIND_VALUE: u8 = 0x01;
const KIND_MERGE: u8 = 0x02;
const KIND_CF_DELETION: u8 = 0x04;
const KIND_CF_VALUE: u8 = 0x05;
const KIND_CF_MERGE: u8 = 0x06;

// ------------------------------------------------------------------------------------------------
// Handler — the visitor used to apply a batch
// ------------------------------------------------------------------------------------------------

/// Visitor invoked once per record, in batch order.
///
/// The memtable inserter and recovery replay both implement this.
pub trait BatchHandler {
    /// A `Put` record.
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError>;
    /// A `Delete` record.
    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError>;
    /// A `Merge` record.
    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError>;
}

/// Base operation found for a key inside a batch (see
/// [`WriteBatch::get_from_batch`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchBase {
    /// The newest base operation is a put with this value.
    Value(Vec<u8>),
    /// The newest base operation is a deletion.
    Deleted,
}

#[derive(Debug, Clone, Copy)]
struct SavePoint {
    size: usize,
    count: u32,
}

// ------------------------------------------------------------------------------------------------
// WriteBatch
// ------------------------------------------------------------------------------------------------

/// An ordered sequence of entries applied atomically across one or
/// more column families.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
    save_points: Vec<SavePoint>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        let mut rep = Vec::with_capacity(BATCH_HEADER_SIZE + 64);
        rep.resize(BATCH_HEADER_SIZE, 0);
        Self {
            rep,
            save_points: Vec::new(),
        }
    }

    /// Wraps raw batch bytes recovered from a WAL record.
    pub fn from_data(data: Vec<u8>) -> Result<Self, DbError> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(DbError::Corruption(format!(
                "write batch shorter than header ({} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            rep: data,
            save_points: Vec::new(),
        })
    }

    /// The raw batch bytes, header included.
    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    /// Total encoded size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.rep.len()
    }

    /// Number of entries in the batch.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// The sequence number stamped on the batch header.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[0..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[0..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// True when the batch carries no entries.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Drops all entries and savepoints.
    pub fn clear(&mut self) {
        self.rep.truncate(BATCH_HEADER_SIZE);
        self.rep[..BATCH_HEADER_SIZE].fill(0);
        self.save_points.clear();
    }

    // --------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------

    /// Appends a put to the default column family.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.put_cf(DEFAULT_COLUMN_FAMILY_ID, key, value);
    }

    /// Appends a put to the given column family.
    pub fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) {
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(KIND_VALUE);
        } else {
            self.rep.push(KIND_CF_VALUE);
            put_varint32(&mut self.rep, cf);
        }
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
        self.set_count(self.count() + 1);
    }

    /// Appends a point deletion to the default column family.
    pub fn delete(&mut self, key: &[u8]) {
        self.delete_cf(DEFAULT_COLUMN_FAMILY_ID, key);
    }

    /// Appends a point deletion to the given column family.
    pub fn delete_cf(&mut self, cf: u32, key: &[u8]) {
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(KIND_DELETION);
        } else {
            self.rep.push(KIND_CF_DELETION);
            put_varint32(&mut self.rep, cf);
        }
        put_length_prefixed_slice(&mut self.rep, key);
        self.set_count(self.count() + 1);
    }

    /// Appends a merge operand to the default column family.
    pub fn merge(&mut self, key: &[u8], operand: &[u8]) {
        self.merge_cf(DEFAULT_COLUMN_FAMILY_ID, key, operand);
    }

    /// Appends a merge operand to the given column family.
    pub fn merge_cf(&mut self, cf: u32, key: &[u8], operand: &[u8]) {
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(KIND_MERGE);
        } else {
            self.rep.push(KIND_CF_MERGE);
            put_varint32(&mut self.rep, cf);
        }
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, operand);
        self.set_count(self.count() + 1);
    }

    // --------------------------------------------------------------------
    // Savepoints
    // --------------------------------------------------------------------

    /// Pushes a savepoint capturing the current batch contents.
    pub fn set_save_point(&mut self) {
        self.save_points.push(SavePoint {
            size: self.rep.len(),
            count: self.count(),
        });
    }

    /// Truncates the batch back to the most recent savepoint.
    pub fn rollback_to_save_point(&mut self) -> Result<(), DbError> {
        let Some(sp) = self.save_points.pop() else {
            return Err(DbError::InvalidArgument(
                "no save point to roll back to".into(),
            ));
        };
        self.rep.truncate(sp.size);
        self.set_count(sp.count);
        Ok(())
    }

    /// Pops the most recent savepoint without changing the contents.
    pub fn pop_save_point(&mut self) -> Result<(), DbError> {
        if self.save_points.pop().is_none() {
            return Err(DbError::InvalidArgument("no save point to pop".into()));
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Group-commit support
    // --------------------------------------------------------------------

    /// Appends every record of `other` to this batch.  Used by the
    /// group committer to concatenate follower payloads behind the
    /// leader's.
    pub fn append_batch(&mut self, other: &WriteBatch) {
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
        self.set_count(self.count() + other.count());
    }

    // --------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------

    /// Walks the records in order, invoking `handler` once per record.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<(), DbError> {
        let declared = self.count();
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found: u32 = 0;

        while !input.is_empty() {
            let kind = input[0];
            input = &input[1..];

            let cf = match kind {
                KIND_CF_DELETION | KIND_CF_VALUE | KIND_CF_MERGE => get_varint32(&mut input)?,
                _ => DEFAULT_COLUMN_FAMILY_ID,
            };

            match kind {
                KIND_VALUE | KIND_CF_VALUE => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    let value = get_length_prefixed_slice(&mut input)?;
                    handler.put(cf, key, value)?;
                }
                KIND_DELETION | KIND_CF_DELETION => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    handler.delete(cf, key)?;
                }
                KIND_MERGE | KIND_CF_MERGE => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    let operand = get_length_prefixed_slice(&mut input)?;
                    handler.merge(cf, key, operand)?;
                }
                other => {
                    return Err(DbError::Corruption(format!(
                        "unknown write batch record kind 0x{other:02X}"
                    )));
                }
            }
            found += 1;
        }

        if found != declared {
            return Err(DbError::Corruption(format!(
                "write batch count mismatch: header says {declared}, body has {found}"
            )));
        }
        Ok(())
    }

    /// Resolves the state of `(cf, key)` as written by this batch
    /// alone: the newest base operation (put or delete, if any) and the
    /// merge operands stacked on top of it, oldest first.
    ///
    /// Transactions use this for read-your-own-writes before falling
    /// back to the database.
    pub fn get_from_batch(
        &self,
        cf: u32,
        key: &[u8],
    ) -> Result<(Option<BatchBase>, Vec<Vec<u8>>), DbError> {
        struct Probe<'a> {
            cf: u32,
            key: &'a [u8],
            base: Option<BatchBase>,
            operands: Vec<Vec<u8>>,
        }

        impl BatchHandler for Probe<'_> {
            fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
                if cf == self.cf && key == self.key {
                    self.base = Some(BatchBase::Value(value.to_vec()));
                    self.operands.clear();
                }
                Ok(())
            }

            fn delete(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError> {
                if cf == self.cf && key == self.key {
                    self.base = Some(BatchBase::Deleted);
                    self.operands.clear();
                }
                Ok(())
            }

            fn merge(&mut self, cf: u32, key: &[u8], operand: &[u8]) -> Result<(), DbError> {
                if cf == self.cf && key == self.key {
                    self.operands.push(operand.to_vec());
                }
                Ok(())
            }
        }

        let mut probe = Probe {
            cf,
            key,
            base: None,
            operands: Vec::new(),
        };
        self.iterate(&mut probe)?;
        Ok((probe.base, probe.operands))
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
