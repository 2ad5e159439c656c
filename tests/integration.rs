//! Integration tests for the public `basaltdb` API.
//!
//! These tests exercise the full storage stack (WAL → memtable →
//! tables → compaction → transactions) through the public surface
//! only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, reopen
//! - **CRUD**: put, get, delete, overwrite, nonexistent keys
//! - **Batches**: multi-key atomicity, savepoints
//! - **Iteration**: ordering, snapshot consistency
//! - **Persistence**: data survives close → reopen
//! - **Compaction**: manual compaction preserves data
//! - **Transactions**: pessimistic conflicts, optimistic conflicts
//! - **Concurrency**: multi-thread writers and readers

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use basaltdb::{
    Db, DbError, DbOptions, ReadOptions, TransactionDb, TransactionDbOptions,
    TransactionOptions, WriteBatch,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn open(tmp: &TempDir) -> Db {
    Db::open(tmp.path(), DbOptions::default()).unwrap()
}

// ------------------------------------------------------------------------------------------------
// Lifecycle
// ------------------------------------------------------------------------------------------------

#[test]
fn open_close_reopen() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();
    db.close().unwrap(); // idempotent
    drop(db);

    let db = open(&tmp);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// CRUD
// ------------------------------------------------------------------------------------------------

#[test]
fn crud_round_trip() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);

    db.put(b"fruit", b"apple").unwrap();
    assert_eq!(db.get(b"fruit").unwrap(), Some(b"apple".to_vec()));

    db.put(b"fruit", b"pear").unwrap();
    assert_eq!(db.get(b"fruit").unwrap(), Some(b"pear".to_vec()));

    db.delete(b"fruit").unwrap();
    assert_eq!(db.get(b"fruit").unwrap(), None);
    assert_eq!(db.get(b"never-written").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn batch_savepoints_shape_the_commit() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);

    let mut batch = WriteBatch::new();
    batch.put(b"kept", b"1");
    batch.set_save_point();
    batch.put(b"discarded", b"2");
    batch.rollback_to_save_point().unwrap();
    db.write(batch).unwrap();

    assert_eq!(db.get(b"kept").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"discarded").unwrap(), None);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Iteration and snapshots
// ------------------------------------------------------------------------------------------------

#[test]
fn iteration_is_ordered_and_snapshot_consistent() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);

    for i in (0..50u32).rev() {
        db.put(format!("key-{i:03}").as_bytes(), b"x").unwrap();
    }

    let snapshot = db.snapshot();
    let read = ReadOptions {
        snapshot: Some(snapshot.sequence()),
    };

    // Concurrent mutation is invisible to the pinned view.
    db.put(b"key-999", b"late").unwrap();

    let keys: Vec<Vec<u8>> = db.iter(&read).unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 50);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(!keys.contains(&b"key-999".to_vec()));
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Compaction
// ------------------------------------------------------------------------------------------------

#[test]
fn manual_compaction_preserves_all_data() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);

    for i in 0..300u32 {
        db.put(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    db.flush().unwrap();
    for i in 0..100u32 {
        db.delete(format!("k{i:04}").as_bytes()).unwrap();
    }
    db.compact_range(0, None, None).unwrap();

    for i in 0..100u32 {
        assert_eq!(db.get(format!("k{i:04}").as_bytes()).unwrap(), None);
    }
    for i in 100..300u32 {
        assert_eq!(
            db.get(format!("k{i:04}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Transactions
// ------------------------------------------------------------------------------------------------

#[test]
fn pessimistic_conflict_loses_with_timed_out() {
    let tmp = TempDir::new().unwrap();
    let tdb = TransactionDb::open(
        tmp.path(),
        DbOptions::default(),
        TransactionDbOptions {
            default_lock_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .unwrap();

    let mut winner = tdb.begin(TransactionOptions::default());
    let mut loser = tdb.begin(TransactionOptions::default());

    winner.get_for_update(b"k").unwrap();
    winner.put(b"k", b"winner").unwrap();

    match loser.get_for_update(b"k") {
        Err(DbError::TimedOut(_)) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }

    winner.commit().unwrap();
    assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"winner".to_vec()));
}

#[test]
fn optimistic_conflict_loses_with_busy() {
    let tmp = TempDir::new().unwrap();
    let tdb = basaltdb::OptimisticTransactionDb::open(tmp.path(), DbOptions::default()).unwrap();
    tdb.db().put(b"k", b"base").unwrap();

    let mut first = tdb.begin();
    let mut second = tdb.begin();
    first.get_for_update(b"k").unwrap();
    second.get_for_update(b"k").unwrap();
    first.put(b"k", b"first").unwrap();
    second.put(b"k", b"second").unwrap();

    first.commit().unwrap();
    assert!(matches!(second.commit(), Err(DbError::Busy(_))));
    assert_eq!(tdb.db().get(b"k").unwrap(), Some(b"first".to_vec()));
}

// ------------------------------------------------------------------------------------------------
// Concurrency
// ------------------------------------------------------------------------------------------------

#[test]
fn readers_run_alongside_writers() {
    let tmp = TempDir::new().unwrap();
    let db = Arc::new(open(&tmp));

    for i in 0..100u32 {
        db.put(format!("stable-{i}").as_bytes(), b"x").unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..500u32 {
                db.put(format!("hot-{i}").as_bytes(), b"y").unwrap();
            }
        })
    };
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..50 {
                for i in 0..100u32 {
                    assert_eq!(
                        db.get(format!("stable-{i}").as_bytes()).unwrap(),
                        Some(b"x".to_vec())
                    );
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    db.close().unwrap();
}
