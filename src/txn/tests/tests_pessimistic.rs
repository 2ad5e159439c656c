//! Pessimistic transactions: locking, conflicts, expiration,
//! savepoints.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::DbError;
    use crate::options::{DbOptions, TransactionDbOptions, TransactionOptions};
    use crate::txn::TransactionDb;
    use tempfile::TempDir;

    fn txn_db(path: &std::path::Path) -> TransactionDb {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        TransactionDb::open(
            path,
            DbOptions::default(),
            TransactionDbOptions {
                num_stripes: 16,
                default_lock_timeout: Duration::from_millis(100),
            },
        )
        .unwrap()
    }

    #[test]
    fn commit_applies_rollback_discards() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin(TransactionOptions::default());
        txn.put(b"a", b"1").unwrap();
        txn.put(b"b", b"2").unwrap();
        // Uncommitted writes are invisible outside.
        assert_eq!(tdb.db().get(b"a").unwrap(), None);
        // But visible inside.
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        txn.commit().unwrap();

        assert_eq!(tdb.db().get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tdb.db().get(b"b").unwrap(), Some(b"2".to_vec()));

        let mut txn = tdb.begin(TransactionOptions::default());
        txn.put(b"a", b"overwritten").unwrap();
        txn.rollback().unwrap();
        assert_eq!(tdb.db().get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn conflicting_lock_times_out() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut t1 = tdb.begin(TransactionOptions::default());
        let mut t2 = tdb.begin(TransactionOptions::default());

        t1.get_for_update(b"k").unwrap();
        t1.put(b"k", b"from-t1").unwrap();

        // The second writer cannot take the lock within its timeout.
        match t2.put(b"k", b"from-t2") {
            Err(DbError::TimedOut(_)) => {}
            other => panic!("expected TimedOut, got {other:?}"),
        }

        t1.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"from-t1".to_vec()));

        // After commit the lock is free.
        t2.put(b"k", b"from-t2").unwrap();
        t2.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"from-t2".to_vec()));
    }

    #[test]
    fn lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        {
            let mut abandoned = tdb.begin(TransactionOptions::default());
            abandoned.put(b"k", b"never-committed").unwrap();
            // Dropped here without commit.
        }

        let mut txn = tdb.begin(TransactionOptions::default());
        txn.put(b"k", b"v").unwrap();
        txn.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn expired_transaction_loses_its_locks_and_cannot_commit() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut doomed = tdb.begin(TransactionOptions {
            expiration: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        doomed.put(b"k", b"doomed").unwrap();

        std::thread::sleep(Duration::from_millis(60));

        // A later acquirer steals the expired lock.
        let mut thief = tdb.begin(TransactionOptions::default());
        thief.put(b"k", b"thief").unwrap();
        thief.commit().unwrap();

        // The expired transaction's commit fails.
        match doomed.commit() {
            Err(DbError::Expired(_)) => {}
            other => panic!("expected Expired, got {other:?}"),
        }
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"thief".to_vec()));
    }

    #[test]
    fn snapshot_isolation_reports_busy() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());
        tdb.db().put(b"k", b"base").unwrap();

        let mut txn = tdb.begin(TransactionOptions {
            set_snapshot: true,
            ..Default::default()
        });
        // A foreign write lands after the snapshot.
        tdb.db().put(b"k", b"foreign").unwrap();

        match txn.get_for_update(b"k") {
            Err(DbError::Busy(_)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn get_for_update_without_conflict_succeeds() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());
        tdb.db().put(b"k", b"base").unwrap();

        let mut txn = tdb.begin(TransactionOptions {
            set_snapshot: true,
            ..Default::default()
        });
        assert_eq!(txn.get_for_update(b"k").unwrap(), Some(b"base".to_vec()));
        txn.put(b"k", b"updated").unwrap();
        txn.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"updated".to_vec()));
    }

    #[test]
    fn savepoint_rolls_back_writes_and_releases_locks() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin(TransactionOptions::default());
        txn.put(b"keep", b"1").unwrap();
        txn.set_save_point();
        txn.put(b"discard", b"2").unwrap();
        txn.rollback_to_save_point().unwrap();

        // The lock on "discard" is free for another transaction.
        let mut other = tdb.begin(TransactionOptions::default());
        other.put(b"discard", b"other").unwrap();
        other.commit().unwrap();

        // "keep" is still locked by the first transaction.
        let mut locked_out = tdb.begin(TransactionOptions::default());
        assert!(matches!(
            locked_out.put(b"keep", b"x"),
            Err(DbError::TimedOut(_))
        ));

        txn.commit().unwrap();
        assert_eq!(tdb.db().get(b"keep").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tdb.db().get(b"discard").unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn savepoint_keeps_locks_acquired_before_it() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        let mut txn = tdb.begin(TransactionOptions::default());
        txn.put(b"k", b"first").unwrap();
        txn.set_save_point();
        // Re-touching the same key after the savepoint must not release
        // it on rollback (it was locked before the savepoint).
        txn.put(b"k", b"second").unwrap();
        txn.rollback_to_save_point().unwrap();

        let mut other = tdb.begin(TransactionOptions::default());
        assert!(matches!(other.put(b"k", b"x"), Err(DbError::TimedOut(_))));

        txn.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn untracked_writes_skip_locking_but_roll_back() {
        let tmp = TempDir::new().unwrap();
        let tdb = txn_db(tmp.path());

        // Another transaction holds the lock.
        let mut holder = tdb.begin(TransactionOptions::default());
        holder.put(b"k", b"holder").unwrap();

        // Untracked writes ignore the lock table entirely.
        let mut untracked = tdb.begin(TransactionOptions::default());
        untracked.put_untracked(b"k", b"untracked").unwrap();
        untracked.rollback().unwrap();

        holder.commit().unwrap();
        assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"holder".to_vec()));
    }

    #[test]
    fn contended_increments_serialize() {
        let tmp = TempDir::new().unwrap();
        let tdb = std::sync::Arc::new(txn_db(tmp.path()));
        tdb.db().put(b"counter", b"0").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let tdb = std::sync::Arc::clone(&tdb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    loop {
                        let mut txn = tdb.begin(TransactionOptions {
                            lock_timeout: Some(Duration::from_secs(5)),
                            ..Default::default()
                        });
                        let current: u64 = txn
                            .get_for_update(b"counter")
                            .unwrap()
                            .map(|v| String::from_utf8(v).unwrap().parse().unwrap())
                            .unwrap_or(0);
                        txn.put(b"counter", (current + 1).to_string().as_bytes())
                            .unwrap();
                        if txn.commit().is_ok() {
                            break;
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = String::from_utf8(tdb.db().get(b"counter").unwrap().unwrap())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(total, 100);
    }
}
