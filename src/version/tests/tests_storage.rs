//! VersionStorageInfo and VersionBuilder behavior.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::keys::{
        BytewiseComparator, InternalKey, InternalKeyComparator, ValueType,
    };
    use crate::options::ColumnFamilyOptions;
    use crate::version::edit::VersionEdit;
    use crate::version::{Version, VersionBuilder};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value).unwrap()
    }

    fn version_with(edits: &[VersionEdit]) -> Version {
        let base = Arc::new(Version::empty(0, 7));
        let mut builder = VersionBuilder::new(base, icmp());
        for edit in edits {
            builder.apply(edit).unwrap();
        }
        builder.save(0).unwrap().0
    }

    fn add_edit(level: usize, number: u64, lo: &[u8], hi: &[u8], size: u64) -> VersionEdit {
        let mut edit = VersionEdit::default();
        edit.add_file(
            level,
            number,
            0,
            size,
            ikey(lo, number * 10),
            ikey(hi, number * 10 + 5),
            number * 10,
            number * 10 + 5,
        );
        edit
    }

    #[test]
    fn builder_places_and_sorts_files() {
        let version = version_with(&[
            add_edit(1, 3, b"m", b"r", 100),
            add_edit(1, 2, b"a", b"f", 100),
            add_edit(0, 4, b"a", b"z", 100),
        ]);

        assert_eq!(version.storage.num_level_files(0), 1);
        assert_eq!(version.storage.num_level_files(1), 2);
        // Level 1 sorted ascending by smallest key.
        let numbers: Vec<u64> = version
            .storage
            .files(1)
            .iter()
            .map(|f| f.number)
            .collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn builder_rejects_overlap_above_level_zero() {
        let base = Arc::new(Version::empty(0, 7));
        let mut builder = VersionBuilder::new(base, icmp());
        builder.apply(&add_edit(1, 2, b"a", b"m", 100)).unwrap();
        builder.apply(&add_edit(1, 3, b"g", b"z", 100)).unwrap();
        assert!(builder.save(0).is_err());
    }

    #[test]
    fn builder_rejects_phantom_delete() {
        let base = Arc::new(Version::empty(0, 7));
        let mut builder = VersionBuilder::new(base, icmp());
        let mut edit = VersionEdit::default();
        edit.delete_file(1, 99);
        builder.apply(&edit).unwrap();
        assert!(builder.save(0).is_err());
    }

    #[test]
    fn builder_delete_then_save_removes_file() {
        let with_file = Arc::new(version_with(&[add_edit(1, 2, b"a", b"f", 100)]));
        let mut builder = VersionBuilder::new(with_file, icmp());
        let mut edit = VersionEdit::default();
        edit.delete_file(1, 2);
        builder.apply(&edit).unwrap();
        let (version, removed) = builder.save(0).unwrap();
        assert_eq!(version.storage.num_level_files(1), 0);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].number, 2);
    }

    #[test]
    fn level_zero_sorted_newest_first() {
        let version = version_with(&[
            add_edit(0, 2, b"a", b"z", 100),
            add_edit(0, 5, b"a", b"z", 100),
            add_edit(0, 3, b"a", b"z", 100),
        ]);
        let numbers: Vec<u64> = version
            .storage
            .files(0)
            .iter()
            .map(|f| f.number)
            .collect();
        // largest_seq grows with the file number in add_edit.
        assert_eq!(numbers, vec![5, 3, 2]);
    }

    #[test]
    fn compaction_score_level_zero_by_count() {
        let mut version = version_with(&[
            add_edit(0, 2, b"a", b"z", 100),
            add_edit(0, 3, b"a", b"z", 100),
            add_edit(0, 4, b"a", b"z", 100),
            add_edit(0, 5, b"a", b"z", 100),
        ]);
        let options = ColumnFamilyOptions {
            level0_file_num_compaction_trigger: 4,
            ..Default::default()
        };
        version.storage.compute_compaction_score(&options);
        assert_eq!(version.storage.compaction_level, 0);
        assert!(version.storage.compaction_score >= 1.0);
    }

    #[test]
    fn compaction_score_deep_level_by_bytes() {
        let mut version = version_with(&[
            add_edit(1, 2, b"a", b"f", 600),
            add_edit(1, 3, b"g", b"p", 600),
        ]);
        let options = ColumnFamilyOptions {
            max_bytes_for_level_base: 1000,
            ..Default::default()
        };
        version.storage.compute_compaction_score(&options);
        assert_eq!(version.storage.compaction_level, 1);
        assert!(version.storage.compaction_score > 1.0);
    }

    #[test]
    fn overlapping_inputs_basic() {
        let version = version_with(&[
            add_edit(1, 2, b"a", b"c", 100),
            add_edit(1, 3, b"e", b"g", 100),
            add_edit(1, 4, b"i", b"k", 100),
        ]);
        let hits = version
            .storage
            .overlapping_inputs(&icmp(), 1, Some(b"b"), Some(b"f"));
        let numbers: Vec<u64> = hits.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);

        let all = version.storage.overlapping_inputs(&icmp(), 1, None, None);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn overlapping_inputs_widens_at_level_zero() {
        // File 2 covers [a,f], file 3 covers [e,m]: asking for [f,f]
        // must pull in both, since file 3 overlaps f and file 2
        // overlaps file 3's range.
        let version = version_with(&[
            add_edit(0, 2, b"a", b"f", 100),
            add_edit(0, 3, b"e", b"m", 100),
        ]);
        let hits = version
            .storage
            .overlapping_inputs(&icmp(), 0, Some(b"f"), Some(b"f"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn bottommost_check() {
        let version = version_with(&[
            add_edit(1, 2, b"a", b"f", 100),
            add_edit(3, 3, b"d", b"m", 100),
        ]);
        // "e" appears at level 3 below level 1.
        assert!(!version.storage.is_bottommost_for_key(&icmp(), 1, b"e"));
        // Nothing below level 3.
        assert!(version.storage.is_bottommost_for_key(&icmp(), 3, b"e"));
        // "z" is outside every deeper file.
        assert!(version.storage.is_bottommost_for_key(&icmp(), 1, b"z"));
    }
}
