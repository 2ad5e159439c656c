//! Build-then-read coverage: point gets, iteration order, properties,
//! multi-block tables.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::keys::{
        BytewiseComparator, InternalKeyComparator, MAX_SEQUENCE_NUMBER, ValueType,
        make_internal_key, parse_internal_key,
    };
    use crate::lookup::GetContext;
    use crate::table::{TableReader, TableWriter};
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn build_table(
        path: &std::path::Path,
        entries: &[(&[u8], u64, ValueType, &[u8])],
    ) -> TableReader {
        let mut writer = TableWriter::new(path, icmp()).unwrap();
        for (user_key, seq, ty, value) in entries {
            let ikey = make_internal_key(user_key, *seq, *ty).unwrap();
            writer.add(&ikey, value).unwrap();
        }
        writer.finish().unwrap();
        TableReader::open(path, icmp()).unwrap()
    }

    fn get(reader: &TableReader, key: &[u8], snapshot: u64) -> Option<Vec<u8>> {
        let mut ctx = GetContext::new(key, None);
        reader.get(key, snapshot, &mut ctx).unwrap();
        ctx.finish().unwrap()
    }

    #[test]
    fn point_lookup_hits_and_misses() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let reader = build_table(
            &path,
            &[
                (b"apple", 3, ValueType::Value, b"red"),
                (b"banana", 5, ValueType::Value, b"yellow"),
                (b"cherry", 7, ValueType::Deletion, b""),
            ],
        );

        assert_eq!(get(&reader, b"apple", MAX_SEQUENCE_NUMBER), Some(b"red".to_vec()));
        assert_eq!(
            get(&reader, b"banana", MAX_SEQUENCE_NUMBER),
            Some(b"yellow".to_vec())
        );
        assert_eq!(get(&reader, b"cherry", MAX_SEQUENCE_NUMBER), None);
        assert_eq!(get(&reader, b"durian", MAX_SEQUENCE_NUMBER), None);
    }

    #[test]
    fn snapshot_filters_newer_versions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        // Same user key, three versions, sequence descending as the
        // internal-key order requires.
        let reader = build_table(
            &path,
            &[
                (b"k", 30, ValueType::Value, b"v30"),
                (b"k", 20, ValueType::Value, b"v20"),
                (b"k", 10, ValueType::Value, b"v10"),
            ],
        );

        assert_eq!(get(&reader, b"k", MAX_SEQUENCE_NUMBER), Some(b"v30".to_vec()));
        assert_eq!(get(&reader, b"k", 29), Some(b"v20".to_vec()));
        assert_eq!(get(&reader, b"k", 15), Some(b"v10".to_vec()));
        assert_eq!(get(&reader, b"k", 9), None);
    }

    #[test]
    fn properties_reflect_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let reader = build_table(
            &path,
            &[
                (b"a", 11, ValueType::Value, b"1"),
                (b"b", 12, ValueType::Deletion, b""),
                (b"c", 13, ValueType::Value, b"3"),
            ],
        );

        let props = &reader.properties;
        assert_eq!(props.num_entries, 3);
        assert_eq!(props.num_deletions, 1);
        assert_eq!(props.smallest_seq, 11);
        assert_eq!(props.largest_seq, 13);
        assert_eq!(
            parse_internal_key(&props.smallest_key).unwrap().user_key,
            b"a"
        );
        assert_eq!(
            parse_internal_key(&props.largest_key).unwrap().user_key,
            b"c"
        );
    }

    #[test]
    fn multi_block_table_iterates_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");

        // ~200 entries of 100-byte values: several 4 KiB blocks.
        let mut writer = TableWriter::new(&path, icmp()).unwrap();
        let mut expected = Vec::new();
        for i in 0..200u64 {
            let user_key = format!("key-{i:05}").into_bytes();
            let value = vec![b'v'; 100];
            let ikey = make_internal_key(&user_key, 1000 + i, ValueType::Value).unwrap();
            writer.add(&ikey, &value).unwrap();
            expected.push(user_key);
        }
        writer.finish().unwrap();

        let reader = Arc::new(TableReader::open(&path, icmp()).unwrap());
        let collected: Vec<Vec<u8>> = Arc::clone(&reader)
            .iter()
            .map(|(ikey, _)| parse_internal_key(&ikey).unwrap().user_key.to_vec())
            .collect();
        assert_eq!(collected, expected);

        // Random-access lookups across block boundaries.
        for i in (0..200u64).step_by(17) {
            let user_key = format!("key-{i:05}").into_bytes();
            assert_eq!(
                get(&reader, &user_key, MAX_SEQUENCE_NUMBER),
                Some(vec![b'v'; 100]),
                "key-{i:05}"
            );
        }
    }

    #[test]
    fn out_of_order_add_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let mut writer = TableWriter::new(&path, icmp()).unwrap();
        let later = make_internal_key(b"m", 1, ValueType::Value).unwrap();
        let earlier = make_internal_key(b"a", 1, ValueType::Value).unwrap();
        writer.add(&later, b"x").unwrap();
        assert!(writer.add(&earlier, b"y").is_err());
    }

    #[test]
    fn bloom_filter_rules_out_absent_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let reader = build_table(
            &path,
            &[
                (b"present-a", 1, ValueType::Value, b"1"),
                (b"present-b", 2, ValueType::Value, b"2"),
            ],
        );
        assert!(reader.may_contain(b"present-a"));
        assert!(reader.may_contain(b"present-b"));
        // With a 1% target false-positive rate, 100 misses should
        // mostly be filtered; require at least one definite exclusion
        // to prove the filter is live.
        let excluded = (0..100)
            .filter(|i| !reader.may_contain(format!("absent-{i}").as_bytes()))
            .count();
        assert!(excluded > 50, "bloom filter excluded only {excluded}/100");
    }

    #[test]
    fn latest_sequence_for_key() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let reader = build_table(
            &path,
            &[
                (b"k", 42, ValueType::Value, b"new"),
                (b"k", 17, ValueType::Value, b"old"),
            ],
        );
        assert_eq!(reader.latest_sequence_for_key(b"k").unwrap(), Some(42));
        assert_eq!(reader.latest_sequence_for_key(b"zzz").unwrap(), None);
    }
}
