//! VersionEdit encode/decode coverage.

#[cfg(test)]
mod tests {
    use crate::keys::{InternalKey, ValueType};
    use crate::version::edit::VersionEdit;

    fn ikey(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value).unwrap()
    }

    fn round_trip(edit: &VersionEdit) -> VersionEdit {
        let mut buf = Vec::new();
        edit.encode(&mut buf);
        VersionEdit::decode(&buf).unwrap()
    }

    #[test]
    fn empty_edit() {
        let decoded = round_trip(&VersionEdit::default());
        assert_eq!(decoded.column_family, 0);
        assert!(decoded.new_files.is_empty());
        assert!(decoded.deleted_files.is_empty());
        assert!(decoded.comparator_name.is_none());
    }

    #[test]
    fn counters_round_trip() {
        let mut edit = VersionEdit::default();
        edit.comparator_name = Some("basaltdb.BytewiseComparator".into());
        edit.log_number = Some(9);
        edit.prev_log_number = Some(3);
        edit.next_file_number = Some(42);
        edit.last_sequence = Some(0xFFFF_FFFF);
        edit.max_column_family = Some(5);

        let decoded = round_trip(&edit);
        assert_eq!(
            decoded.comparator_name.as_deref(),
            Some("basaltdb.BytewiseComparator")
        );
        assert_eq!(decoded.log_number, Some(9));
        assert_eq!(decoded.prev_log_number, Some(3));
        assert_eq!(decoded.next_file_number, Some(42));
        assert_eq!(decoded.last_sequence, Some(0xFFFF_FFFF));
        assert_eq!(decoded.max_column_family, Some(5));
    }

    #[test]
    fn files_round_trip() {
        let mut edit = VersionEdit::for_column_family(2);
        edit.add_file(0, 10, 0, 4096, ikey(b"a", 1), ikey(b"m", 9), 1, 9);
        edit.add_file(3, 11, 1, 8192, ikey(b"n", 10), ikey(b"z", 20), 10, 20);
        edit.delete_file(2, 7);
        edit.compact_pointers.push((1, ikey(b"cursor", 5)));

        let decoded = round_trip(&edit);
        assert_eq!(decoded.column_family, 2);
        assert_eq!(decoded.deleted_files, vec![(2, 7)]);
        assert_eq!(decoded.new_files.len(), 2);

        let (level, file) = &decoded.new_files[0];
        assert_eq!(*level, 0);
        assert_eq!(file.number, 10);
        assert_eq!(file.file_size, 4096);
        assert_eq!(file.smallest, ikey(b"a", 1));
        assert_eq!(file.largest, ikey(b"m", 9));

        let (level, file) = &decoded.new_files[1];
        assert_eq!(*level, 3);
        assert_eq!(file.path_id, 1);
        assert_eq!(file.smallest_seq, 10);
        assert_eq!(file.largest_seq, 20);

        assert_eq!(decoded.compact_pointers.len(), 1);
        assert_eq!(decoded.compact_pointers[0].0, 1);
    }

    #[test]
    fn column_family_lifecycle_round_trip() {
        let mut add = VersionEdit::for_column_family(4);
        add.column_family_name = Some("metrics".into());
        let decoded = round_trip(&add);
        assert_eq!(decoded.column_family, 4);
        assert_eq!(decoded.column_family_name.as_deref(), Some("metrics"));
        assert!(!decoded.is_column_family_drop);

        let mut drop = VersionEdit::for_column_family(4);
        drop.is_column_family_drop = true;
        let decoded = round_trip(&drop);
        assert!(decoded.is_column_family_drop);
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut buf = Vec::new();
        crate::encoding::put_varint32(&mut buf, 9999);
        assert!(VersionEdit::decode(&buf).is_err());
    }
}
