//! Transactions — pessimistic and optimistic ACID layers over the
//! engine.
//!
//! Both flavors accumulate writes in a [`WriteBatch`] and commit it
//! through the engine's atomic write path; they differ in conflict
//! detection:
//!
//! - **Pessimistic** ([`TransactionDb`]): every tracked operation
//!   acquires a key lock from the striped [`lock_manager`], with a
//!   timeout and optional expiration.  An expired transaction's locks
//!   can be stolen; its own commit then fails with `Expired`.
//!   `get_for_update` optionally validates against a pinned snapshot,
//!   returning `Busy` on a newer committed write.
//! - **Optimistic** ([`OptimisticTransactionDb`]): no locks; at commit
//!   the engine verifies under the commit lock that no tracked key was
//!   written after the transaction first touched it, failing with
//!   `Busy` (or `TryAgain` when the memtable history needed for the
//!   check was already flushed).
//!
//! Commit-time checks run as a [`WriteCallback`] under the committer
//! lock, before any sequence number is consumed — a failed commit
//! leaves no trace.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub(crate) mod lock_manager;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::batch::{BatchBase, DEFAULT_COLUMN_FAMILY_ID, WriteBatch};
use crate::db::snapshot::Snapshot;
use crate::db::write::WriteCallback;
use crate::db::{Db, DbState};
use crate::error::DbError;
use crate::keys::SequenceNumber;
use crate::options::{DbOptions, ReadOptions, TransactionDbOptions, TransactionOptions, WriteOptions};

use lock_manager::LockManager;

type TrackedKey = (u32, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// TransactionDb — pessimistic
// ------------------------------------------------------------------------------------------------

/// Pessimistic transaction layer over [`Db`].
pub struct TransactionDb {
    db: Db,
    options: TransactionDbOptions,
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU64,
}

impl TransactionDb {
    /// Opens (or creates) a database and layers transactions on top.
    pub fn open(
        path: impl AsRef<Path>,
        db_options: DbOptions,
        options: TransactionDbOptions,
    ) -> Result<Self, DbError> {
        let db = Db::open(path, db_options)?;
        Ok(Self::wrap(db, options))
    }

    /// Layers transactions over an already-opened engine.
    pub fn wrap(db: Db, options: TransactionDbOptions) -> Self {
        let lock_manager = Arc::new(LockManager::new(options.num_stripes));
        Self {
            db,
            options,
            lock_manager,
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// The underlying engine, for non-transactional access.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Begins a transaction.
    pub fn begin(&self, options: TransactionOptions) -> Transaction<'_> {
        let id = self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst);
        let now = Instant::now();
        let expires_at = options.expiration.map(|ttl| now + ttl);
        let snapshot = options.set_snapshot.then(|| self.db.snapshot());
        // Per-operation deadline: the larger of the transaction's own
        // timeout and the database default.
        let lock_timeout = options
            .lock_timeout
            .unwrap_or(Duration::ZERO)
            .max(self.options.default_lock_timeout);
        debug!(txn = id, ?expires_at, "transaction begun");
        Transaction {
            txn_db: self,
            id,
            batch: WriteBatch::new(),
            locked: Vec::new(),
            locked_set: HashSet::new(),
            snapshot,
            expires_at,
            lock_timeout,
            save_points: Vec::new(),
        }
    }
}

impl std::fmt::Debug for TransactionDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionDb").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction — pessimistic
// ------------------------------------------------------------------------------------------------

/// A pessimistic transaction.  Dropped without [`Transaction::commit`],
/// it rolls back: the batch is discarded and every lock released.
pub struct Transaction<'a> {
    txn_db: &'a TransactionDb,
    id: u64,
    batch: WriteBatch,
    /// Keys in acquisition order (each key once, at first acquisition).
    locked: Vec<TrackedKey>,
    locked_set: HashSet<TrackedKey>,
    snapshot: Option<Snapshot>,
    expires_at: Option<Instant>,
    lock_timeout: Duration,
    /// Lock count at each savepoint.
    save_points: Vec<usize>,
}

impl Transaction<'_> {
    /// The transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sequence of the pinned snapshot, if `set_snapshot` was used.
    pub fn snapshot_sequence(&self) -> Option<SequenceNumber> {
        self.snapshot.as_ref().map(Snapshot::sequence)
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn acquire(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError> {
        self.txn_db.lock_manager.try_lock(
            cf,
            key,
            self.id,
            self.lock_timeout,
            self.expires_at,
        )?;
        let tracked: TrackedKey = (cf, key.to_vec());
        if self.locked_set.insert(tracked.clone()) {
            self.locked.push(tracked);
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Tracked mutations
    // --------------------------------------------------------------------

    /// Locks `key` and stages a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.put_cf(DEFAULT_COLUMN_FAMILY_ID, key, value)
    }

    /// Locks `key` in `cf` and stages a put.
    pub fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.acquire(cf, key)?;
        self.batch.put_cf(cf, key, value);
        Ok(())
    }

    /// Locks `key` and stages a deletion.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.delete_cf(DEFAULT_COLUMN_FAMILY_ID, key)
    }

    /// Locks `key` in `cf` and stages a deletion.
    pub fn delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError> {
        self.acquire(cf, key)?;
        self.batch.delete_cf(cf, key);
        Ok(())
    }

    /// Locks `key` and stages a merge operand.
    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> Result<(), DbError> {
        self.acquire(DEFAULT_COLUMN_FAMILY_ID, key)?;
        self.batch.merge(key, operand);
        Ok(())
    }

    // --------------------------------------------------------------------
    // Untracked mutations
    // --------------------------------------------------------------------

    /// Stages a put without acquiring a lock.  The caller asserts that
    /// no conflicting writer exists.
    pub fn put_untracked(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.batch.put(key, value);
        Ok(())
    }

    /// Stages a deletion without acquiring a lock.
    pub fn delete_untracked(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.batch.delete(key);
        Ok(())
    }

    /// Stages a merge operand without acquiring a lock.
    pub fn merge_untracked(&mut self, key: &[u8], operand: &[u8]) -> Result<(), DbError> {
        self.batch.merge(key, operand);
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Reads `key`, seeing this transaction's own staged writes first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_cf(DEFAULT_COLUMN_FAMILY_ID, key)
    }

    /// Reads `key` from `cf`, seeing staged writes first.
    pub fn get_cf(&self, cf: u32, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let (base, operands) = self.batch.get_from_batch(cf, key)?;
        let read_options = ReadOptions {
            snapshot: self.snapshot_sequence(),
        };

        let base_value = match base {
            Some(BatchBase::Value(value)) => Some(value),
            Some(BatchBase::Deleted) => None,
            None => self.txn_db.db.get_cf_opt(cf, &read_options, key)?,
        };
        if operands.is_empty() {
            return Ok(base_value);
        }

        let Some(operator) = self.txn_db.db.merge_operator(cf) else {
            return Err(DbError::MergeInProgress(
                "staged merge operands but no merge operator configured".into(),
            ));
        };
        match operator.full_merge(key, base_value.as_deref(), &operands) {
            Some(folded) => Ok(Some(folded)),
            None => Err(DbError::Corruption(format!(
                "merge operator {} failed to fold staged operands",
                operator.name()
            ))),
        }
    }

    /// Locks `key` and reads it.  With a pinned snapshot, verifies no
    /// committed write to `key` is newer than the snapshot; a conflict
    /// returns `Busy` and the caller should retry the transaction.
    pub fn get_for_update(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_for_update_cf(DEFAULT_COLUMN_FAMILY_ID, key)
    }

    /// [`Self::get_for_update`] against column family `cf`.
    pub fn get_for_update_cf(&mut self, cf: u32, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.acquire(cf, key)?;

        if let Some(snapshot_seq) = self.snapshot_sequence() {
            let state = self.txn_db.db.inner().lock_state()?;
            let (newest, covers) = state.memtable_latest_sequence(cf, key, snapshot_seq)?;
            drop(state);
            if let Some(newest) = newest
                && newest > snapshot_seq
            {
                trace!(txn = self.id, newest, snapshot_seq, "snapshot conflict");
                return Err(DbError::Busy(format!(
                    "key was written at sequence {newest}, after snapshot {snapshot_seq}"
                )));
            }
            if !covers {
                return Err(DbError::TryAgain(
                    "memtable history needed for snapshot validation was flushed".into(),
                ));
            }
        }
        self.get_cf(cf, key)
    }

    // --------------------------------------------------------------------
    // Savepoints
    // --------------------------------------------------------------------

    /// Pushes a savepoint over the staged batch and the lock set.
    pub fn set_save_point(&mut self) {
        self.batch.set_save_point();
        self.save_points.push(self.locked.len());
    }

    /// Rolls back to the latest savepoint, releasing locks acquired
    /// since (each key is recorded at its first acquisition, so keys
    /// already held before the savepoint stay held).
    pub fn rollback_to_save_point(&mut self) -> Result<(), DbError> {
        let Some(locked_len) = self.save_points.pop() else {
            return Err(DbError::InvalidArgument("no save point to roll back to".into()));
        };
        self.batch.rollback_to_save_point()?;
        for (cf, key) in self.locked.split_off(locked_len) {
            self.locked_set.remove(&(cf, key.clone()));
            self.txn_db.lock_manager.unlock(cf, &key, self.id);
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Commit / rollback
    // --------------------------------------------------------------------

    /// Commits the staged batch atomically.
    ///
    /// Fails with `Expired` when the transaction outlived its
    /// expiration (its locks may have been stolen); nothing is written
    /// in that case.
    pub fn commit(mut self) -> Result<SequenceNumber, DbError> {
        let callback = CommitGuard {
            expires_at: self.expires_at,
            id: self.id,
            locked: &self.locked,
            lock_manager: &self.txn_db.lock_manager,
        };
        let batch = std::mem::take(&mut self.batch);
        let result =
            self.txn_db
                .db
                .write_with_callback(&WriteOptions::default(), batch, &callback);
        self.release_locks();
        debug!(txn = self.id, ok = result.is_ok(), "transaction commit");
        result
    }

    /// Discards the staged batch and releases every lock.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.batch.clear();
        self.release_locks();
        debug!(txn = self.id, "transaction rolled back");
        Ok(())
    }

    fn release_locks(&mut self) {
        for (cf, key) in self.locked.drain(..) {
            self.txn_db.lock_manager.unlock(cf, &key, self.id);
        }
        self.locked_set.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("staged", &self.batch.count())
            .field("locked", &self.locked.len())
            .finish_non_exhaustive()
    }
}

/// Commit-time verification: the transaction has not expired and still
/// owns every lock it acquired.
struct CommitGuard<'a> {
    expires_at: Option<Instant>,
    id: u64,
    locked: &'a [TrackedKey],
    lock_manager: &'a LockManager,
}

impl WriteCallback for CommitGuard<'_> {
    fn check(&self, _state: &DbState) -> Result<(), DbError> {
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            return Err(DbError::Expired(format!("transaction {} expired", self.id)));
        }
        for (cf, key) in self.locked {
            if !self.lock_manager.is_held_by(*cf, key, self.id) {
                return Err(DbError::Expired(format!(
                    "transaction {} lost a lock to a later acquirer",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Optimistic transactions
// ------------------------------------------------------------------------------------------------

/// Optimistic transaction layer: no locks, commit-time validation.
pub struct OptimisticTransactionDb {
    db: Db,
}

impl OptimisticTransactionDb {
    /// Opens (or creates) a database for optimistic transactions.
    pub fn open(path: impl AsRef<Path>, db_options: DbOptions) -> Result<Self, DbError> {
        Ok(Self::wrap(Db::open(path, db_options)?))
    }

    /// Layers optimistic transactions over an opened engine.
    pub fn wrap(db: Db) -> Self {
        Self { db }
    }

    /// The underlying engine.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Begins an optimistic transaction at the current sequence.
    pub fn begin(&self) -> OptimisticTransaction<'_> {
        OptimisticTransaction {
            txn_db: self,
            batch: WriteBatch::new(),
            tracked: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for OptimisticTransactionDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticTransactionDb").finish_non_exhaustive()
    }
}

/// An optimistic transaction.
pub struct OptimisticTransaction<'a> {
    txn_db: &'a OptimisticTransactionDb,
    batch: WriteBatch,
    /// Sequence observed when each key was first touched.
    tracked: HashMap<TrackedKey, SequenceNumber>,
}

impl OptimisticTransaction<'_> {
    fn track(&mut self, cf: u32, key: &[u8]) {
        let seq = self.txn_db.db.latest_sequence();
        self.tracked.entry((cf, key.to_vec())).or_insert(seq);
    }

    /// Stages a put, tracking the key for commit-time validation.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.track(DEFAULT_COLUMN_FAMILY_ID, key);
        self.batch.put(key, value);
        Ok(())
    }

    /// Stages a deletion.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.track(DEFAULT_COLUMN_FAMILY_ID, key);
        self.batch.delete(key);
        Ok(())
    }

    /// Stages a merge operand.
    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> Result<(), DbError> {
        self.track(DEFAULT_COLUMN_FAMILY_ID, key);
        self.batch.merge(key, operand);
        Ok(())
    }

    /// Reads `key`, tracking it so a conflicting later write fails the
    /// commit.
    pub fn get_for_update(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.track(DEFAULT_COLUMN_FAMILY_ID, key);
        self.get(key)
    }

    /// Reads `key`, seeing staged writes first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let (base, operands) = self.batch.get_from_batch(DEFAULT_COLUMN_FAMILY_ID, key)?;
        if !operands.is_empty() {
            return Err(DbError::NotSupported(
                "reading staged merge operands from an optimistic transaction".into(),
            ));
        }
        match base {
            Some(BatchBase::Value(value)) => Ok(Some(value)),
            Some(BatchBase::Deleted) => Ok(None),
            None => self.txn_db.db.get(key),
        }
    }

    /// Commits if no tracked key was written since it was first
    /// touched; otherwise fails with `Busy` (or `TryAgain` when the
    /// memtable history needed for validation was flushed).
    pub fn commit(self) -> Result<SequenceNumber, DbError> {
        let callback = OptimisticGuard {
            tracked: &self.tracked,
        };
        self.txn_db
            .db
            .write_with_callback(&WriteOptions::default(), self.batch.clone(), &callback)
    }

    /// Discards the staged writes.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.batch.clear();
        Ok(())
    }
}

impl std::fmt::Debug for OptimisticTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticTransaction")
            .field("staged", &self.batch.count())
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

struct OptimisticGuard<'a> {
    tracked: &'a HashMap<TrackedKey, SequenceNumber>,
}

impl WriteCallback for OptimisticGuard<'_> {
    fn check(&self, state: &DbState) -> Result<(), DbError> {
        for ((cf, key), first_touched) in self.tracked {
            let (newest, covers) = state.memtable_latest_sequence(*cf, key, *first_touched)?;
            if let Some(newest) = newest
                && newest > *first_touched
            {
                return Err(DbError::Busy(format!(
                    "key written at sequence {newest}, after it was read at {first_touched}"
                )));
            }
            if !covers {
                return Err(DbError::TryAgain(
                    "memtable history needed for conflict validation was flushed".into(),
                ));
            }
        }
        Ok(())
    }
}
