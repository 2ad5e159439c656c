//! Optimistic transactions: commit-time validation.

#[cfg(test)]
mod tests {
    use crate::error::DbError;
    use crate::options::DbOptions;
    use crate::txn::OptimisticTransactionDb;
    use tempfile::TempDir;

    fn txn_db(path: &std::path::Path) -> OptimisticTransactionDb {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        OptimisticTransactionDb::open(path, DbOptions::default()).unwrap()
    }

    #[test]
    fn non_conflicting_commit_succeeds() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin();
        txn.put(b"a", b"1").unwrap();
        txn.put(b"b", b"2").unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        txn.commit().unwrap();

        assert_eq!(tdb.db().get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tdb.db().get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn conflicting_writer_fails_second_commit() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());
        tdb.db().put(b"k", b"base").unwrap();

        let mut t1 = tdb.begin();
        let mut t2 = tdb.begin();
        assert_eq!(t1.get_for_update(b"k").unwrap(), Some(b"base".to_vec()));
        assert_eq!(t2.get_for_update(b"k").unwrap(), Some(b"base".to_vec()));
        t1.put(b"k", b"from-t1").unwrap();
        t2.put(b"k", b"from-t2").unwrap();

        // First committer wins.
        t1.commit().unwrap();
        match t2.commit() {
            Err(DbError::Busy(_)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"from-t1".to_vec()));
    }

    #[test]
    fn conflict_on_untouched_key_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin();
        txn.put(b"mine", b"1").unwrap();

        // A foreign write to an unrelated key does not conflict.
        tdb.db().put(b"other", b"x").unwrap();
        txn.commit().unwrap();
        assert_eq!(tdb.db().get(b"mine").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin();
        txn.put(b"k", b"staged").unwrap();
        txn.rollback().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), None);
    }

    #[test]
    fn validation_fails_with_try_again_after_history_flush() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());
        tdb.db().put(b"k", b"base").unwrap();

        let mut txn = tdb.begin();
        txn.get_for_update(b"k").unwrap();
        txn.put(b"k", b"mine").unwrap();

        // A conflicting write followed by a flush removes the memtable
        // history the validation needs.
        tdb.db().put(b"k", b"foreign").unwrap();
        tdb.db().flush().unwrap();
        tdb.db().put(b"unrelated", b"x").unwrap();

        match txn.commit() {
            // Either outcome is a correct refusal: Busy when the
            // conflicting write is still in memory, TryAgain when the
            // history has been flushed away.
            Err(DbError::Busy(_) | DbError::TryAgain(_)) => {}
            other => panic!("expected Busy or TryAgain, got {other:?}"),
        }
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"foreign".to_vec()));
    }
}
