//! Version edits — atomic deltas to the on-disk state machine.
//!
//! An edit is serialized as a sequence of length-prefixed tagged
//! fields and appended to the MANIFEST.  Replaying every edit of a
//! MANIFEST in order reproduces the full version state.

use crate::encoding::{
    EncodingError, get_length_prefixed_slice, get_varint32, get_varint64,
    put_length_prefixed_slice, put_varint32, put_varint64,
};
use crate::keys::{InternalKey, SequenceNumber};

// Field tags.  Part of the MANIFEST format; never renumber.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;
const TAG_COLUMN_FAMILY: u32 = 200;
const TAG_COLUMN_FAMILY_ADD: u32 = 201;
const TAG_COLUMN_FAMILY_DROP: u32 = 202;
const TAG_MAX_COLUMN_FAMILY: u32 = 203;

/// A file added to a level by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileEntry {
    /// Database-wide file number.
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
}

/// An atomic delta applied through [`VersionSet::log_and_apply`]
/// (additions/removals of files, counter advances, column family
/// lifecycle).
///
/// [`VersionSet::log_and_apply`]: super::VersionSet::log_and_apply
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    /// Column family the edit applies to (0 = default).
    pub column_family: u32,

    /// Comparator identity, persisted on column family creation and
    /// validated on recovery.
    pub comparator_name: Option<String>,

    /// Advance of the column family's minimum-needed WAL number.
    pub log_number: Option<u64>,

    /// Advance of the two-phase predecessor WAL number.
    pub prev_log_number: Option<u64>,

    /// Advance of the database-wide file-number counter.
    pub next_file_number: Option<u64>,

    /// Advance of the database-wide last sequence.
    pub last_sequence: Option<SequenceNumber>,

    /// Advance of the column-family id counter.
    pub max_column_family: Option<u32>,

    /// Round-robin compaction cursors, one per recorded level.
    pub compact_pointers: Vec<(usize, InternalKey)>,

    /// Files removed from a level: `(level, file number)`.
    pub deleted_files: Vec<(usize, u64)>,

    /// Files added to a level.
    pub new_files: Vec<(usize, NewFileEntry)>,

    /// Set when the edit creates a column family with this name.
    pub column_family_name: Option<String>,

    /// Set when the edit drops its column family.
    pub is_column_family_drop: bool,
}

impl VersionEdit {
    /// An empty edit addressed to `column_family`.
    pub fn for_column_family(column_family: u32) -> Self {
        Self {
            column_family,
            ..Self::default()
        }
    }

    /// Records a file addition.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        path_id: u32,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
        smallest_seq: SequenceNumber,
        largest_seq: SequenceNumber,
    ) {
        self.new_files.push((
            level,
            NewFileEntry {
                number,
                path_id,
                file_size,
                smallest,
                largest,
                smallest_seq,
                largest_seq,
            },
        ));
    }

    /// Records a file removal.
    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    /// Serializes the edit into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            put_varint32(buf, TAG_COMPARATOR);
            put_length_prefixed_slice(buf, name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            put_varint32(buf, TAG_LOG_NUMBER);
            put_varint64(buf, log_number);
        }
        if let Some(prev) = self.prev_log_number {
            put_varint32(buf, TAG_PREV_LOG_NUMBER);
            put_varint64(buf, prev);
        }
        if let Some(next) = self.next_file_number {
            put_varint32(buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(buf, next);
        }
        if let Some(seq) = self.last_sequence {
            put_varint32(buf, TAG_LAST_SEQUENCE);
            put_varint64(buf, seq);
        }
        if let Some(max_cf) = self.max_column_family {
            put_varint32(buf, TAG_MAX_COLUMN_FAMILY);
            put_varint32(buf, max_cf);
        }

        for (level, key) in &self.compact_pointers {
            put_varint32(buf, TAG_COMPACT_POINTER);
            put_varint32(buf, *level as u32);
            put_length_prefixed_slice(buf, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(buf, TAG_DELETED_FILE);
            put_varint32(buf, *level as u32);
            put_varint64(buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(buf, TAG_NEW_FILE);
            put_varint32(buf, *level as u32);
            put_varint64(buf, file.number);
            put_varint32(buf, file.path_id);
            put_varint64(buf, file.file_size);
            put_length_prefixed_slice(buf, file.smallest.encoded());
            put_length_prefixed_slice(buf, file.largest.encoded());
            put_varint64(buf, file.smallest_seq);
            put_varint64(buf, file.largest_seq);
        }

        // The column family qualifier applies to the whole edit; write
        // it last so decoders see it regardless of field mix.
        if self.column_family != 0 {
            put_varint32(buf, TAG_COLUMN_FAMILY);
            put_varint32(buf, self.column_family);
        }
        if let Some(name) = &self.column_family_name {
            put_varint32(buf, TAG_COLUMN_FAMILY_ADD);
            put_length_prefixed_slice(buf, name.as_bytes());
        }
        if self.is_column_family_drop {
            put_varint32(buf, TAG_COLUMN_FAMILY_DROP);
        }
    }

    /// Decodes an edit from one MANIFEST record.
    pub fn decode(mut input: &[u8]) -> Result<Self, EncodingError> {
        let input = &mut input;
        let mut edit = VersionEdit::default();

        while !input.is_empty() {
            let tag = get_varint32(input)?;
            match tag {
                TAG_COMPARATOR => {
                    let raw = get_length_prefixed_slice(input)?;
                    edit.comparator_name = Some(String::from_utf8_lossy(raw).into_owned());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint64(input)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint64(input)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(input)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(input)?),
                TAG_MAX_COLUMN_FAMILY => edit.max_column_family = Some(get_varint32(input)?),
                TAG_COMPACT_POINTER => {
                    let level = get_varint32(input)? as usize;
                    let key = get_length_prefixed_slice(input)?.to_vec();
                    edit.compact_pointers
                        .push((level, InternalKey::from_encoded(key)));
                }
                TAG_DELETED_FILE => {
                    let level = get_varint32(input)? as usize;
                    let number = get_varint64(input)?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = get_varint32(input)? as usize;
                    let number = get_varint64(input)?;
                    let path_id = get_varint32(input)?;
                    let file_size = get_varint64(input)?;
                    let smallest = get_length_prefixed_slice(input)?.to_vec();
                    let largest = get_length_prefixed_slice(input)?.to_vec();
                    let smallest_seq = get_varint64(input)?;
                    let largest_seq = get_varint64(input)?;
                    edit.new_files.push((
                        level,
                        NewFileEntry {
                            number,
                            path_id,
                            file_size,
                            smallest: InternalKey::from_encoded(smallest),
                            largest: InternalKey::from_encoded(largest),
                            smallest_seq,
                            largest_seq,
                        },
                    ));
                }
                TAG_COLUMN_FAMILY => edit.column_family = get_varint32(input)?,
                TAG_COLUMN_FAMILY_ADD => {
                    let raw = get_length_prefixed_slice(input)?;
                    edit.column_family_name = Some(String::from_utf8_lossy(raw).into_owned());
                }
                TAG_COLUMN_FAMILY_DROP => edit.is_column_family_drop = true,
                unknown => {
                    return Err(EncodingError::InvalidTag {
                        tag: unknown,
                        type_name: "VersionEdit",
                    });
                }
            }
        }
        Ok(edit)
    }
}
