//! Key model — user keys, sequence numbers, and internal keys.
//!
//! ## Internal key layout
//!
//! ```text
//! [user key bytes][packed trailer: (sequence << 8) | value_type, 8 bytes LE]
//! ```
//!
//! Internal keys order by **user key ascending**, then **sequence
//! descending**, then type descending.  Scanning in internal-key order
//! therefore visits each user key's most recent version first — the
//! ordering invariant every other subsystem leans on.
//!
//! Sequence numbers occupy 56 bits; the low byte of the trailer holds
//! the [`ValueType`].

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::encoding::{decode_fixed64, put_fixed64};

/// A monotonically increasing per-database write counter.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size in bytes of the packed `(sequence, type)` trailer.
pub const TRAILER_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while packing or parsing internal keys.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The internal key was shorter than the 8-byte trailer.
    #[error("internal key too short ({0} bytes)")]
    TooShort(usize),

    /// The trailer carried an unknown value-type byte.
    #[error("unknown value type byte 0x{0:02X}")]
    UnknownValueType(u8),

    /// The sequence number exceeded the 56-bit ceiling.
    #[error("sequence number {0} exceeds 56-bit limit")]
    SequenceOverflow(u64),
}

// ------------------------------------------------------------------------------------------------
// Value types
// ------------------------------------------------------------------------------------------------

/// Discriminates the kinds of entries stored under an internal key.
///
/// The numeric values are part of the on-disk format and must never
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// Point tombstone.
    Deletion = 0,
    /// Regular value.
    Value = 1,
    /// Merge operand, folded at read time.
    Merge = 2,
}

impl ValueType {
    /// Decodes a trailer type byte.
    pub fn from_u8(byte: u8) -> Result<Self, KeyError> {
        match byte {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            2 => Ok(Self::Merge),
            other => Err(KeyError::UnknownValueType(other)),
        }
    }
}

/// Type used when constructing seek targets: sorts before every real
/// entry at the same `(user_key, sequence)` because the trailer
/// compares descending.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Merge;

// ------------------------------------------------------------------------------------------------
// Packing / parsing
// ------------------------------------------------------------------------------------------------

/// Packs a sequence number and value type into the 8-byte trailer value.
pub fn pack_sequence_and_type(seq: SequenceNumber, ty: ValueType) -> Result<u64, KeyError> {
    if seq > MAX_SEQUENCE_NUMBER {
        return Err(KeyError::SequenceOverflow(seq));
    }
    Ok((seq << 8) | u64::from(ty as u8))
}

/// Appends `user_key` plus the packed trailer to `buf`.
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    seq: SequenceNumber,
    ty: ValueType,
) -> Result<(), KeyError> {
    let packed = pack_sequence_and_type(seq, ty)?;
    buf.extend_from_slice(user_key);
    put_fixed64(buf, packed);
    Ok(())
}

/// Builds a fresh encoded internal key.
pub fn make_internal_key(
    user_key: &[u8],
    seq: SequenceNumber,
    ty: ValueType,
) -> Result<Vec<u8>, KeyError> {
    let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    append_internal_key(&mut buf, user_key, seq, ty)?;
    Ok(buf)
}

/// A borrowed decomposition of an encoded internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-visible key bytes.
    pub user_key: &'a [u8],
    /// Sequence number of the entry.
    pub sequence: SequenceNumber,
    /// Kind of the entry.
    pub value_type: ValueType,
}

/// Splits an encoded internal key into its components.
pub fn parse_internal_key(ikey: &[u8]) -> Result<ParsedInternalKey<'_>, KeyError> {
    if ikey.len() < TRAILER_SIZE {
        return Err(KeyError::TooShort(ikey.len()));
    }
    let split = ikey.len() - TRAILER_SIZE;
    let packed = decode_fixed64(&ikey[split..]);
    let value_type = ValueType::from_u8((packed & 0xFF) as u8)?;
    Ok(ParsedInternalKey {
        user_key: &ikey[..split],
        sequence: packed >> 8,
        value_type,
    })
}

/// Returns the user-key prefix of an encoded internal key.
///
/// The caller guarantees the key carries a trailer.
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len() - TRAILER_SIZE]
}

// ------------------------------------------------------------------------------------------------
// InternalKey — owned encoded key for file metadata
// ------------------------------------------------------------------------------------------------

/// An owned, encoded internal key.  Used in file metadata and version
/// edits where the key outlives any block buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    /// Builds an internal key from components.
    pub fn new(user_key: &[u8], seq: SequenceNumber, ty: ValueType) -> Result<Self, KeyError> {
        Ok(Self(make_internal_key(user_key, seq, ty)?))
    }

    /// Wraps an already-encoded internal key.
    pub fn from_encoded(encoded: Vec<u8>) -> Self {
        Self(encoded)
    }

    /// The encoded bytes.
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// The user-key prefix.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    /// True when no key has been assigned yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Comparators
// ------------------------------------------------------------------------------------------------

/// Total order over user keys, plus the key-shortening helpers used by
/// the table index.
///
/// Implementations must be consistent: `compare` defines a total order,
/// and the shortening helpers must return keys that preserve it.
pub trait Comparator: Send + Sync {
    /// Identifies the comparator.  Persisted in the MANIFEST and
    /// validated on reopen — changing the comparator of an existing
    /// database makes it unopenable by design.
    fn name(&self) -> &str;

    /// Three-way comparison of two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Shortens `start` to a key in `[start, limit)` if a shorter
    /// separator exists.  Used for table index entries.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Shortens `key` to the smallest key ≥ `key`.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Lexicographic byte-order comparator.  The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "basaltdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Find the length of the common prefix.
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }

        if diff >= min_len {
            // One key is a prefix of the other; no shortening possible.
            return;
        }

        let byte = start[diff];
        if byte < 0xFF && byte + 1 < limit[diff] {
            start[diff] = byte + 1;
            start.truncate(diff + 1);
            debug_assert!(start.as_slice() < limit);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        for idx in 0..key.len() {
            if key[idx] != 0xFF {
                key[idx] += 1;
                key.truncate(idx + 1);
                return;
            }
        }
        // Key is a run of 0xFF bytes; leave it unchanged.
    }
}

/// Orders encoded internal keys: user key ascending via the wrapped
/// comparator, then packed `(sequence, type)` descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wraps a user-key comparator.
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// The wrapped user-key comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    /// Three-way comparison of two encoded internal keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let a_num = decode_fixed64(&a[a.len() - TRAILER_SIZE..]);
                let b_num = decode_fixed64(&b[b.len() - TRAILER_SIZE..]);
                // Higher sequence sorts first.
                b_num.cmp(&a_num)
            }
            ord => ord,
        }
    }
}

impl std::fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(user: &[u8], seq: u64, ty: ValueType) -> Vec<u8> {
        make_internal_key(user, seq, ty).unwrap()
    }

    #[test]
    fn pack_parse_round_trip() {
        let encoded = ikey(b"foo", 42, ValueType::Value);
        let parsed = parse_internal_key(&encoded).unwrap();
        assert_eq!(parsed.user_key, b"foo");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, ValueType::Value);
    }

    #[test]
    fn sequence_overflow_rejected() {
        assert!(matches!(
            make_internal_key(b"k", MAX_SEQUENCE_NUMBER + 1, ValueType::Value),
            Err(KeyError::SequenceOverflow(_))
        ));
        // The ceiling itself is representable.
        let encoded = ikey(b"k", MAX_SEQUENCE_NUMBER, ValueType::Value);
        assert_eq!(
            parse_internal_key(&encoded).unwrap().sequence,
            MAX_SEQUENCE_NUMBER
        );
    }

    #[test]
    fn internal_order_user_key_ascending() {
        let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let a = ikey(b"aaa", 1, ValueType::Value);
        let b = ikey(b"bbb", 100, ValueType::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn internal_order_sequence_descending() {
        let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let newer = ikey(b"key", 9, ValueType::Value);
        let older = ikey(b"key", 3, ValueType::Value);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);
        assert_eq!(cmp.compare(&older, &newer), Ordering::Greater);
    }

    #[test]
    fn seek_key_sorts_before_entries() {
        let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let seek = ikey(b"key", 7, VALUE_TYPE_FOR_SEEK);
        let value = ikey(b"key", 7, ValueType::Value);
        assert_eq!(cmp.compare(&seek, &value), Ordering::Less);
    }

    #[test]
    fn shortest_separator_shortens() {
        let cmp = BytewiseComparator;
        let mut start = b"foobar".to_vec();
        cmp.find_shortest_separator(&mut start, b"foxtrot");
        assert_eq!(start, b"fop".to_vec());

        // Prefix relationship: unchanged.
        let mut start = b"foo".to_vec();
        cmp.find_shortest_separator(&mut start, b"foobar");
        assert_eq!(start, b"foo".to_vec());
    }

    #[test]
    fn short_successor() {
        let cmp = BytewiseComparator;
        let mut key = b"abc".to_vec();
        cmp.find_short_successor(&mut key);
        assert_eq!(key, b"b".to_vec());

        let mut all_ff = vec![0xFF, 0xFF];
        cmp.find_short_successor(&mut all_ff);
        assert_eq!(all_ff, vec![0xFF, 0xFF]);
    }
}
