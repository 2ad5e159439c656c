//! Merge operator behavior through the full stack.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::db::Db;
    use crate::db::tests::helpers::*;
    use crate::merge::MergeOperator;
    use crate::options::ColumnFamilyOptions;
    use tempfile::TempDir;

    /// A little-endian u64 counter.
    struct CounterOperator;

    fn decode(bytes: Option<&[u8]>) -> u64 {
        bytes
            .filter(|b| b.len() == 8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(0)
    }

    impl MergeOperator for CounterOperator {
        fn name(&self) -> &str {
            "u64-add"
        }

        fn full_merge(
            &self,
            _key: &[u8],
            existing: Option<&[u8]>,
            operands: &[Vec<u8>],
        ) -> Option<Vec<u8>> {
            let mut total = decode(existing);
            for operand in operands {
                total += decode(Some(operand));
            }
            Some(total.to_le_bytes().to_vec())
        }

        fn partial_merge(&self, _key: &[u8], lhs: &[u8], rhs: &[u8]) -> Option<Vec<u8>> {
            let total = decode(Some(lhs)) + decode(Some(rhs));
            Some(total.to_le_bytes().to_vec())
        }
    }

    fn counter_db(path: &std::path::Path) -> Db {
        let cf = ColumnFamilyOptions {
            merge_operator: Some(Arc::new(CounterOperator)),
            ..memtable_only_cf()
        };
        Db::open_cf(path, db_options(), descriptors(cf)).unwrap()
    }

    fn read_counter(db: &Db, key: &[u8]) -> u64 {
        decode(db.get(key).unwrap().as_deref())
    }

    #[test]
    fn merges_fold_in_memtable() {
        let tmp = TempDir::new().unwrap();
        let db = counter_db(tmp.path());

        db.merge(b"hits", &5u64.to_le_bytes()).unwrap();
        db.merge(b"hits", &7u64.to_le_bytes()).unwrap();
        assert_eq!(read_counter(&db, b"hits"), 12);

        db.put(b"hits", &100u64.to_le_bytes()).unwrap();
        db.merge(b"hits", &1u64.to_le_bytes()).unwrap();
        assert_eq!(read_counter(&db, b"hits"), 101);
        db.close().unwrap();
    }

    #[test]
    fn merges_fold_across_flush_boundary() {
        let tmp = TempDir::new().unwrap();
        let db = counter_db(tmp.path());

        db.put(b"n", &10u64.to_le_bytes()).unwrap();
        db.flush().unwrap();
        db.merge(b"n", &3u64.to_le_bytes()).unwrap();
        db.merge(b"n", &4u64.to_le_bytes()).unwrap();

        // Base in a table, operands in the memtable.
        assert_eq!(read_counter(&db, b"n"), 17);

        db.flush().unwrap();
        assert_eq!(read_counter(&db, b"n"), 17);
        db.close().unwrap();
    }

    #[test]
    fn compaction_flattens_merge_chains() {
        let tmp = TempDir::new().unwrap();
        let db = counter_db(tmp.path());

        db.put(b"n", &1u64.to_le_bytes()).unwrap();
        db.flush().unwrap();
        for _ in 0..5 {
            db.merge(b"n", &2u64.to_le_bytes()).unwrap();
        }
        db.flush().unwrap();
        db.compact_range(0, None, None).unwrap();

        assert_eq!(read_counter(&db, b"n"), 11);
        db.close().unwrap();
    }

    #[test]
    fn deletion_resets_merge_base() {
        let tmp = TempDir::new().unwrap();
        let db = counter_db(tmp.path());

        db.put(b"n", &50u64.to_le_bytes()).unwrap();
        db.delete(b"n").unwrap();
        db.merge(b"n", &5u64.to_le_bytes()).unwrap();
        assert_eq!(read_counter(&db, b"n"), 5);
        db.close().unwrap();
    }

    #[test]
    fn merge_without_operator_errors() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), db_options()).unwrap();

        db.merge(b"k", b"operand").unwrap();
        assert!(matches!(
            db.get(b"k"),
            Err(crate::error::DbError::MergeInProgress(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn reverse_iteration_rejected_with_merge_operator() {
        let tmp = TempDir::new().unwrap();
        let db = counter_db(tmp.path());
        assert!(matches!(
            db.iter_reverse_cf(0, &Default::default()),
            Err(crate::error::DbError::NotSupported(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn merges_survive_recovery() {
        let tmp = TempDir::new().unwrap();
        {
            let db = counter_db(tmp.path());
            db.merge(b"n", &8u64.to_le_bytes()).unwrap();
            db.merge(b"n", &9u64.to_le_bytes()).unwrap();
        }
        let db = counter_db(tmp.path());
        assert_eq!(read_counter(&db, b"n"), 17);
        db.close().unwrap();
    }
}
