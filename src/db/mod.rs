//! The database engine — orchestration of the write pipeline, read
//! path, background work, recovery, and the public API surface.
//!
//! ## Concurrency Model
//!
//! Three locks cover the engine:
//!
//! 1. The **state lock** (`DbInner::state`) guards the version set,
//!    per-family memtable stacks, pending outputs, and the sticky
//!    background error.
//! 2. The **log lock** serializes WAL appends so each record is framed
//!    atomically.
//! 3. The **write queue lock** orders writers into commit groups.
//!
//! Background threads form two pools: flush (high priority) and
//! compaction (low priority), woken through bounded signal channels.
//!
//! ## Guarantees
//!
//! - **Durability**: acknowledged `sync` writes are in the fsynced WAL.
//! - **Linearizable writes**: sequence order equals WAL order equals
//!   memtable order.
//! - **Snapshot reads**: a snapshot pins a sequence; reads and
//!   iterators at that snapshot see a frozen view.
//! - **Crash recovery**: MANIFEST replay plus WAL replay reconstruct
//!   the last durable state, honoring the configured
//!   [`RecoveryMode`](crate::options::RecoveryMode).

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub(crate) mod flush;
pub mod iterator;
pub mod log_iter;
pub mod snapshot;
pub(crate) mod write;

#[cfg(test)]
mod tests;

pub use iterator::DbIterator;
pub use log_iter::TransactionLogIterator;
pub use snapshot::Snapshot;
pub(crate) use snapshot::SnapshotList;
pub(crate) use write::{WriteCallback, WriteQueue};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, bounded};
use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::compaction::pick_range_compaction;
use crate::error::DbError;
use crate::filename::{
    self, FileType, current_file_name, identity_file_name, lock_file_name, parse_file_name,
};
use crate::keys::SequenceNumber;
use crate::lookup::GetContext;
use crate::memtable::Memtable;
use crate::options::{ColumnFamilyOptions, DbOptions, ReadOptions, RecoveryMode, WriteOptions};
use crate::table_cache::TableCache;
use crate::version::set::DEFAULT_COLUMN_FAMILY_NAME;
use crate::version::{VersionSet, edit::VersionEdit};
use crate::wal::{LogReader, LogWriter};
use crate::wal_manager::WalManager;

// ------------------------------------------------------------------------------------------------
// Shared engine state
// ------------------------------------------------------------------------------------------------

/// Memtable stack of one column family: the active memtable plus the
/// sealed ones awaiting flush (oldest first).
pub(crate) struct CfMem {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) imm: Vec<Arc<Memtable>>,
}

pub(crate) struct LogState {
    pub(crate) writer: LogWriter,
    pub(crate) number: u64,
}

/// Everything guarded by the engine state lock.
pub(crate) struct DbState {
    pub(crate) versions: VersionSet,
    pub(crate) mems: HashMap<u32, CfMem>,
    /// Sticky failure from background work under paranoid checks.
    pub(crate) bg_error: Option<DbError>,
    /// Reserved output file numbers; the sweep never deletes at or
    /// above the smallest entry.
    pub(crate) pending_outputs: HashSet<u64>,
    /// Column families currently being flushed.
    pub(crate) flushing: HashSet<u32>,
    /// Nesting count of `disable_file_deletions`.
    pub(crate) file_deletions_disabled: u32,
}

impl DbState {
    /// The sticky background error, if paranoid checks latched one.
    pub(crate) fn background_error(&self) -> Option<DbError> {
        self.bg_error.as_ref().map(DbError::duplicate)
    }

    /// Newest sequence of any entry for `key` in the memtable stack of
    /// `cf_id`, plus whether memtable history reaches back to
    /// `horizon` (needed for conflict validation).
    pub(crate) fn memtable_latest_sequence(
        &self,
        cf_id: u32,
        key: &[u8],
        horizon: SequenceNumber,
    ) -> Result<(Option<SequenceNumber>, bool), DbError> {
        let Some(mems) = self.mems.get(&cf_id) else {
            return Err(DbError::InvalidArgument(format!(
                "column family {cf_id} does not exist"
            )));
        };
        let mut newest: Option<SequenceNumber> = None;
        let mut oldest_creation: Option<SequenceNumber> = None;
        for mem in std::iter::once(&mems.mem).chain(mems.imm.iter()) {
            if let Some(seq) = mem.latest_sequence_for_key(key)? {
                newest = Some(newest.map_or(seq, |n| n.max(seq)));
            }
            let creation = mem.creation_sequence();
            oldest_creation = Some(oldest_creation.map_or(creation, |e| e.min(creation)));
        }
        // The in-memory history holds every write newer than the oldest
        // memtable's creation sequence; it covers the horizon when that
        // point lies at or before it.
        let covers = oldest_creation.is_none_or(|creation| creation <= horizon);
        Ok((newest, covers))
    }
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: DbOptions,

    pub(crate) state: Mutex<DbState>,
    pub(crate) state_cv: Condvar,
    pub(crate) log: Mutex<LogState>,
    pub(crate) write_queue: Mutex<WriteQueue>,
    pub(crate) write_cv: Condvar,

    pub(crate) table_cache: TableCache,
    pub(crate) wal_manager: WalManager,
    pub(crate) snapshots: SnapshotList,
    pub(crate) shutdown: AtomicBool,

    pub(crate) flush_tx: Sender<()>,
    pub(crate) compact_tx: Sender<()>,
    pub(crate) threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DbInner {
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, DbState>, DbError> {
        self.state
            .lock()
            .map_err(|_| DbError::Internal("engine state lock poisoned".into()))
    }

    pub(crate) fn lock_log(&self) -> Result<MutexGuard<'_, LogState>, DbError> {
        self.log
            .lock()
            .map_err(|_| DbError::Internal("log lock poisoned".into()))
    }

    pub(crate) fn lock_write_queue(&self) -> Result<MutexGuard<'_, WriteQueue>, DbError> {
        self.write_queue
            .lock()
            .map_err(|_| DbError::Internal("write queue lock poisoned".into()))
    }

    /// Latches a background failure when paranoid checks are on; the
    /// engine then refuses further writes with the original error while
    /// reads keep working.
    pub(crate) fn maybe_set_background_error(&self, err: &DbError) {
        if !self.options.paranoid_checks {
            return;
        }
        if let Ok(mut state) = self.state.lock()
            && state.bg_error.is_none()
        {
            warn!(error = %err, "entering read-only mode (paranoid checks)");
            state.bg_error = Some(err.duplicate());
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        let _ = self.flush_tx.try_send(());
        let _ = self.compact_tx.try_send(());
        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                if handle.thread().id() != std::thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Db — the public handle
// ------------------------------------------------------------------------------------------------

/// The engine handle.
///
/// Cloneable and thread-safe; all clones share one engine.  Dropping
/// the last clone shuts the background workers down; call
/// [`Db::close`] for a synchronous, fsynced shutdown.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    // --------------------------------------------------------------------
    // Open / close
    // --------------------------------------------------------------------

    /// Opens (or creates) a database with only the default column
    /// family.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self, DbError> {
        let descriptors = vec![(
            DEFAULT_COLUMN_FAMILY_NAME.to_string(),
            ColumnFamilyOptions::default(),
        )];
        Self::open_cf(path, options, descriptors)
    }

    /// Opens (or creates) a database.  `descriptors` must include the
    /// default column family and every column family the database
    /// already contains.
    pub fn open_cf(
        path: impl AsRef<Path>,
        options: DbOptions,
        descriptors: Vec<(String, ColumnFamilyOptions)>,
    ) -> Result<Self, DbError> {
        options.validate()?;
        for (name, cf_options) in &descriptors {
            cf_options.validate().map_err(|err| {
                DbError::InvalidArgument(format!("column family {name:?}: {err}"))
            })?;
        }
        if descriptors
            .first()
            .is_none_or(|(name, _)| name != DEFAULT_COLUMN_FAMILY_NAME)
        {
            return Err(DbError::InvalidArgument(format!(
                "the first column family descriptor must be {DEFAULT_COLUMN_FAMILY_NAME:?}"
            )));
        }

        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        if !lock_file_name(&path).exists() {
            fs::write(lock_file_name(&path), b"")?;
        }

        let mut versions = VersionSet::new(&path, options.clone());
        let exists = current_file_name(&path).exists();
        if exists {
            if options.error_if_exists {
                return Err(DbError::InvalidArgument(format!(
                    "database already exists at {}",
                    path.display()
                )));
            }
            versions.recover(&descriptors)?;
        } else {
            if !options.create_if_missing {
                return Err(DbError::InvalidArgument(format!(
                    "database missing at {} and create_if_missing is off",
                    path.display()
                )));
            }
            filename::write_identity_file(&path)?;
            versions.bootstrap(&descriptors)?;
        }
        if !identity_file_name(&path).exists() {
            filename::write_identity_file(&path)?;
        }

        // Replay WALs written since the MANIFEST state.
        let replayed = replay_wals(&path, &options, &mut versions)?;

        // Fresh live WAL; every memtable created now maps to it.
        let live_log_number = versions.new_file_number();
        let log_writer = LogWriter::create(filename::log_file_name(&path, live_log_number))?;

        // Flush replayed memtables to level 0 so replay is idempotent,
        // and advance every family's log number past the replayed WALs.
        install_recovered_memtables(&path, &mut versions, replayed, live_log_number)?;

        let mut mems = HashMap::new();
        let recovered_seq = versions.last_sequence;
        for cf_id in versions.column_family_ids() {
            mems.insert(
                cf_id,
                CfMem {
                    mem: Arc::new(Memtable::new(live_log_number, recovered_seq)),
                    imm: Vec::new(),
                },
            );
        }

        let (flush_tx, flush_rx) = bounded::<()>(1);
        let (compact_tx, compact_rx) = bounded::<()>(1);
        let table_cache = TableCache::new(&path, options.table_cache_capacity);
        let wal_manager = WalManager::new(&path, options.clone());

        let inner = Arc::new(DbInner {
            path: path.clone(),
            options: options.clone(),
            state: Mutex::new(DbState {
                versions,
                mems,
                bg_error: None,
                pending_outputs: HashSet::new(),
                flushing: HashSet::new(),
                file_deletions_disabled: 0,
            }),
            state_cv: Condvar::new(),
            log: Mutex::new(LogState {
                writer: log_writer,
                number: live_log_number,
            }),
            write_queue: Mutex::new(WriteQueue::default()),
            write_cv: Condvar::new(),
            table_cache,
            wal_manager,
            snapshots: SnapshotList::new(),
            shutdown: AtomicBool::new(false),
            flush_tx,
            compact_tx,
            threads: Mutex::new(Vec::new()),
        });

        // Spawn the two pools.
        {
            let mut threads = inner
                .threads
                .lock()
                .map_err(|_| DbError::Internal("thread registry lock poisoned".into()))?;
            for _ in 0..options.max_background_flushes {
                let weak = Arc::downgrade(&inner);
                let rx = flush_rx.clone();
                threads.push(std::thread::spawn(move || {
                    flush::flush_worker_loop(weak, rx);
                }));
            }
            for _ in 0..options.max_background_compactions {
                let weak = Arc::downgrade(&inner);
                let rx = compact_rx.clone();
                threads.push(std::thread::spawn(move || {
                    flush::compaction_worker_loop(weak, rx);
                }));
            }
        }

        // Retire WALs and stray files left over from before the crash.
        inner.sweep_obsolete_files()?;

        info!(db = %path.display(), "database opened");
        Ok(Self { inner })
    }

    /// Synchronously shuts the engine down: stops background work,
    /// drains nothing further, and fsyncs the WAL.  Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        let _ = self.inner.flush_tx.try_send(());
        let _ = self.inner.compact_tx.try_send(());
        self.inner.state_cv.notify_all();
        self.inner.write_cv.notify_all();

        if let Ok(mut threads) = self.inner.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }

        let mut log = self.inner.lock_log()?;
        log.writer.sync()?;
        info!(db = %self.inner.path.display(), "database closed");
        Ok(())
    }

    /// Requests cancellation of pending and running background work.
    /// Pending flushes/compactions complete as no-ops; running
    /// compactions exit at their next key boundary.
    pub fn cancel_all_background_work(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        let _ = self.inner.flush_tx.try_send(());
        let _ = self.inner.compact_tx.try_send(());
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Sets `key` to `value` in the default column family.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.put_opt(&WriteOptions::default(), key, value)
    }

    /// Sets `key` to `value` with explicit write options.
    pub fn put_opt(
        &self,
        options: &WriteOptions,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write_opt(options, batch).map(|_| ())
    }

    /// Sets `key` in column family `cf`.
    pub fn put_cf(&self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value);
        self.write(batch).map(|_| ())
    }

    /// Deletes `key` from the default column family.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch).map(|_| ())
    }

    /// Deletes `key` from column family `cf`.
    pub fn delete_cf(&self, cf: u32, key: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key);
        self.write(batch).map(|_| ())
    }

    /// Appends a merge operand for `key` in the default column family.
    pub fn merge(&self, key: &[u8], operand: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.merge(key, operand);
        self.write(batch).map(|_| ())
    }

    /// Applies a batch atomically with default write options.  Returns
    /// the first sequence number assigned to it.
    pub fn write(&self, batch: WriteBatch) -> Result<SequenceNumber, DbError> {
        self.write_opt(&WriteOptions::default(), batch)
    }

    /// Applies a batch atomically.
    pub fn write_opt(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
    ) -> Result<SequenceNumber, DbError> {
        self.inner.write_impl(options, batch, None)
    }

    pub(crate) fn write_with_callback(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: &dyn WriteCallback,
    ) -> Result<SequenceNumber, DbError> {
        self.inner.write_impl(options, batch, Some(callback))
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Point lookup in the default column family at the latest
    /// sequence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_cf_opt(crate::batch::DEFAULT_COLUMN_FAMILY_ID, &ReadOptions::default(), key)
    }

    /// Point lookup with read options (snapshot pinning).
    pub fn get_opt(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_cf_opt(crate::batch::DEFAULT_COLUMN_FAMILY_ID, options, key)
    }

    /// Point lookup in column family `cf`.
    pub fn get_cf(&self, cf: u32, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_cf_opt(cf, &ReadOptions::default(), key)
    }

    /// Point lookup in column family `cf` with read options.
    pub fn get_cf_opt(
        &self,
        cf: u32,
        options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DbError> {
        let (mem, imms, version, icmp, merge_operator, snapshot) = {
            let state = self.inner.lock_state()?;
            let cf_state = state.versions.column_family(cf).ok_or_else(|| {
                DbError::InvalidArgument(format!("column family {cf} does not exist"))
            })?;
            let mems = state
                .mems
                .get(&cf)
                .ok_or_else(|| DbError::Internal("memtable state out of sync".into()))?;
            (
                Arc::clone(&mems.mem),
                mems.imm.clone(),
                Arc::clone(&cf_state.current),
                cf_state.icmp.clone(),
                cf_state.options.merge_operator.clone(),
                options.snapshot.unwrap_or(state.versions.last_sequence),
            )
        };

        let mut ctx = GetContext::new(key, merge_operator.as_deref());
        if mem.get(key, snapshot, &mut ctx)? {
            return ctx.finish();
        }
        for imm in imms.iter().rev() {
            if imm.get(key, snapshot, &mut ctx)? {
                return ctx.finish();
            }
        }
        version.get(&icmp, &self.inner.table_cache, key, snapshot, &mut ctx)?;
        ctx.finish()
    }

    /// Point lookups for several keys under one consistent view.
    pub fn multi_get(
        &self,
        options: &ReadOptions,
        keys: &[&[u8]],
    ) -> Vec<Result<Option<Vec<u8>>, DbError>> {
        let pinned = ReadOptions {
            snapshot: Some(
                options
                    .snapshot
                    .unwrap_or_else(|| self.latest_sequence()),
            ),
        };
        keys.iter()
            .map(|key| {
                self.get_cf_opt(crate::batch::DEFAULT_COLUMN_FAMILY_ID, &pinned, key)
            })
            .collect()
    }

    /// The last sequence number assigned to any write.
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.inner
            .lock_state()
            .map(|state| state.versions.last_sequence)
            .unwrap_or(0)
    }

    // --------------------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------------------

    /// Pins the current sequence as a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshots.acquire(self.latest_sequence())
    }

    /// Releases a snapshot.  Equivalent to dropping the handle.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    // --------------------------------------------------------------------
    // Iterators
    // --------------------------------------------------------------------

    /// Forward iterator over the default column family.
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator, DbError> {
        self.iter_cf(crate::batch::DEFAULT_COLUMN_FAMILY_ID, options)
    }

    /// Forward iterator over column family `cf`.
    pub fn iter_cf(&self, cf: u32, options: &ReadOptions) -> Result<DbIterator, DbError> {
        self.iter_range_cf(cf, options, None, None)
    }

    /// Forward iterator over `[lower, upper)` of column family `cf`.
    pub fn iter_range_cf(
        &self,
        cf: u32,
        options: &ReadOptions,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<DbIterator, DbError> {
        let (sources, snapshot, version, memtables, icmp, merge_operator) =
            self.iterator_sources(cf, options, lower, upper)?;
        let merged = crate::compaction::MergingIterator::new(icmp.clone(), sources);
        Ok(DbIterator::new(
            merged,
            snapshot,
            Arc::clone(icmp.user_comparator()),
            merge_operator,
            version,
            memtables,
        ))
    }

    /// Reverse iterator over column family `cf`.
    ///
    /// Rejected with `NotSupported` when the family configures a merge
    /// operator: backward iteration across merge chains is not
    /// supported.
    pub fn iter_reverse_cf(
        &self,
        cf: u32,
        options: &ReadOptions,
    ) -> Result<std::vec::IntoIter<(Vec<u8>, Vec<u8>)>, DbError> {
        {
            let state = self.inner.lock_state()?;
            let cf_state = state.versions.column_family(cf).ok_or_else(|| {
                DbError::InvalidArgument(format!("column family {cf} does not exist"))
            })?;
            if cf_state.options.merge_operator.is_some() {
                return Err(DbError::NotSupported(
                    "reverse iteration over a column family with a merge operator".into(),
                ));
            }
        }
        let mut forward = self.iter_cf(cf, options)?;
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = forward.by_ref().collect();
        if let Err(err) = forward.status() {
            return Err(err.duplicate());
        }
        pairs.reverse();
        Ok(pairs.into_iter())
    }

    #[allow(clippy::type_complexity)]
    fn iterator_sources(
        &self,
        cf: u32,
        options: &ReadOptions,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<
        (
            Vec<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'static>>,
            SequenceNumber,
            Arc<crate::version::Version>,
            Vec<Arc<Memtable>>,
            crate::keys::InternalKeyComparator,
            Option<Arc<dyn crate::merge::MergeOperator>>,
        ),
        DbError,
    > {
        let (mem, imms, version, icmp, merge_operator, snapshot) = {
            let state = self.inner.lock_state()?;
            let cf_state = state.versions.column_family(cf).ok_or_else(|| {
                DbError::InvalidArgument(format!("column family {cf} does not exist"))
            })?;
            let mems = state
                .mems
                .get(&cf)
                .ok_or_else(|| DbError::Internal("memtable state out of sync".into()))?;
            (
                Arc::clone(&mems.mem),
                mems.imm.clone(),
                Arc::clone(&cf_state.current),
                cf_state.icmp.clone(),
                cf_state.options.merge_operator.clone(),
                options.snapshot.unwrap_or(state.versions.last_sequence),
            )
        };

        let user_cmp = Arc::clone(icmp.user_comparator());
        let lower_owned = lower.map(|b| b.to_vec());
        let upper_owned = upper.map(|b| b.to_vec());
        let in_bounds = move |ikey: &[u8]| {
            let user_key = crate::keys::extract_user_key(ikey);
            if let Some(lo) = &lower_owned
                && user_cmp.compare(user_key, lo) == std::cmp::Ordering::Less
            {
                return false;
            }
            if let Some(hi) = &upper_owned
                && user_cmp.compare(user_key, hi) != std::cmp::Ordering::Less
            {
                return false;
            }
            true
        };

        let mut sources: Vec<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'static>> = Vec::new();
        sources.push(Box::new(mem.iter_range(lower, upper)?.into_iter()));
        for imm in imms.iter().rev() {
            sources.push(Box::new(imm.iter_range(lower, upper)?.into_iter()));
        }
        for level in 0..version.storage.num_levels() {
            for file in version.storage.files(level) {
                let reader = self.inner.table_cache.get(file.number, &icmp)?;
                let bounds = in_bounds.clone();
                sources.push(Box::new(
                    reader.iter().filter(move |(ikey, _)| bounds(ikey)),
                ));
            }
        }

        let mut memtables = vec![mem];
        memtables.extend(imms);
        Ok((sources, snapshot, version, memtables, icmp, merge_operator))
    }

    // --------------------------------------------------------------------
    // Column families
    // --------------------------------------------------------------------

    /// Creates a column family.  Returns its id.
    pub fn create_column_family(
        &self,
        name: &str,
        options: ColumnFamilyOptions,
    ) -> Result<u32, DbError> {
        options.validate()?;
        let log_number = self.inner.lock_log()?.number;
        let mut state = self.inner.lock_state()?;
        let id = state
            .versions
            .create_column_family(name, options, log_number)?;
        let creation_seq = state.versions.last_sequence;
        state.mems.insert(
            id,
            CfMem {
                mem: Arc::new(Memtable::new(log_number, creation_seq)),
                imm: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Drops a column family.  Its data becomes unreachable and its
    /// files are reclaimed by the sweep.
    pub fn drop_column_family(&self, cf: u32) -> Result<(), DbError> {
        {
            let mut state = self.inner.lock_state()?;
            state.versions.drop_column_family(cf)?;
            state.mems.remove(&cf);
        }
        self.inner.sweep_obsolete_files()
    }

    /// Id of the column family named `name`.
    pub fn column_family_id(&self, name: &str) -> Option<u32> {
        self.inner
            .lock_state()
            .ok()
            .and_then(|state| state.versions.column_family_by_name(name).map(|cf| cf.id))
    }

    /// Merge operator configured for column family `cf`, if any.
    pub fn merge_operator(&self, cf: u32) -> Option<Arc<dyn crate::merge::MergeOperator>> {
        self.inner
            .lock_state()
            .ok()
            .and_then(|state| {
                state
                    .versions
                    .column_family(cf)
                    .and_then(|cf| cf.options.merge_operator.clone())
            })
    }

    // --------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------

    /// Force-flushes one column family's memtables to level 0.
    pub fn flush_cf(&self, cf: u32) -> Result<(), DbError> {
        self.inner.flush_column_family(cf)
    }

    /// Force-flushes every column family.
    pub fn flush(&self) -> Result<(), DbError> {
        let ids = {
            let state = self.inner.lock_state()?;
            state.versions.column_family_ids()
        };
        for cf in ids {
            self.inner.flush_column_family(cf)?;
        }
        Ok(())
    }

    /// Manually compacts the key range `[begin, end]` of `cf` down the
    /// hierarchy, level by level.
    pub fn compact_range(
        &self,
        cf: u32,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), DbError> {
        self.inner.flush_column_family(cf)?;

        let num_levels = {
            let state = self.inner.lock_state()?;
            state
                .versions
                .column_family(cf)
                .ok_or_else(|| {
                    DbError::InvalidArgument(format!("column family {cf} does not exist"))
                })?
                .options
                .num_levels
        };

        for level in 0..num_levels - 1 {
            loop {
                if self.inner.is_shutting_down() {
                    return Err(DbError::ShutdownInProgress);
                }
                let picked = {
                    let state = self.inner.lock_state()?;
                    let Some(cf_state) = state.versions.column_family(cf) else {
                        return Err(DbError::InvalidArgument(format!(
                            "column family {cf} does not exist"
                        )));
                    };
                    pick_range_compaction(cf_state, level, begin, end)
                };
                let Some(compaction) = picked else { break };
                let result = self.inner.run_compaction(&compaction);
                compaction.release_inputs();
                // Release the pinned input version before sweeping, or
                // the inputs still count as live.
                drop(compaction);
                result?;
                self.inner.sweep_obsolete_files()?;
            }
        }
        Ok(())
    }

    /// Administratively removes one table file.  Valid only for a file
    /// whose key range has no successors at deeper levels of its
    /// column family and which is not being compacted.
    pub fn delete_file(&self, name: &str) -> Result<(), DbError> {
        let Some(FileType::TableFile(number)) = parse_file_name(name) else {
            return Err(DbError::InvalidArgument(format!(
                "{name:?} is not a table file name"
            )));
        };

        let mut state = self.inner.lock_state()?;
        let mut located: Option<(u32, usize)> = None;
        'outer: for cf_state in state.versions.iter_column_families() {
            for level in 0..cf_state.current.storage.num_levels() {
                for file in cf_state.current.storage.files(level) {
                    if file.number == number {
                        if file.being_compacted.load(AtomicOrdering::SeqCst) {
                            return Err(DbError::Aborted(format!(
                                "file {number} is being compacted"
                            )));
                        }
                        let smallest_user =
                            crate::keys::extract_user_key(file.smallest.encoded()).to_vec();
                        let largest_user =
                            crate::keys::extract_user_key(file.largest.encoded()).to_vec();
                        for deeper in level + 1..cf_state.current.storage.num_levels() {
                            if !cf_state
                                .current
                                .storage
                                .overlapping_inputs(
                                    &cf_state.icmp,
                                    deeper,
                                    Some(&smallest_user),
                                    Some(&largest_user),
                                )
                                .is_empty()
                            {
                                return Err(DbError::InvalidArgument(format!(
                                    "file {number} has overlapping data below level {level}"
                                )));
                            }
                        }
                        located = Some((cf_state.id, level));
                        break 'outer;
                    }
                }
            }
        }

        let Some((cf_id, level)) = located else {
            return Err(DbError::InvalidArgument(format!(
                "file {number} is not part of any live version"
            )));
        };
        let mut edit = VersionEdit::for_column_family(cf_id);
        edit.delete_file(level, number);
        state.versions.log_and_apply(&mut edit)?;
        drop(state);
        self.inner.sweep_obsolete_files()
    }

    /// Pauses the obsolete-file sweep so the filesystem can be copied.
    pub fn disable_file_deletions(&self) -> Result<(), DbError> {
        let mut state = self.inner.lock_state()?;
        state.file_deletions_disabled += 1;
        Ok(())
    }

    /// Resumes the obsolete-file sweep.
    pub fn enable_file_deletions(&self) -> Result<(), DbError> {
        {
            let mut state = self.inner.lock_state()?;
            if state.file_deletions_disabled == 0 {
                return Err(DbError::InvalidArgument(
                    "file deletions are not disabled".into(),
                ));
            }
            state.file_deletions_disabled -= 1;
        }
        self.inner.sweep_obsolete_files()
    }

    /// Names of every file needed to reconstruct the current state.
    /// Flushes first so the memtables are captured.
    pub fn live_files(&self) -> Result<Vec<String>, DbError> {
        self.flush()?;
        let mut state = self.inner.lock_state()?;
        let mut names = vec![
            "CURRENT".to_string(),
            "IDENTITY".to_string(),
            format!("MANIFEST-{:06}", state.versions.manifest_file_number()),
        ];
        for number in state.versions.live_file_numbers() {
            names.push(format!("{number:06}.sst"));
        }
        names.sort();
        Ok(names)
    }

    /// Ordered stream of committed write batches starting at `seq`.
    pub fn updates_since(
        &self,
        seq: SequenceNumber,
    ) -> Result<TransactionLogIterator<'_>, DbError> {
        let last = self.latest_sequence();
        if seq > last + 1 {
            return Err(DbError::InvalidArgument(format!(
                "requested sequence {seq} is past the last written sequence {last}"
            )));
        }
        TransactionLogIterator::new(&self.inner.wal_manager, seq)
    }

    // --------------------------------------------------------------------
    // Properties
    // --------------------------------------------------------------------

    /// String-valued inspection of internal counters.  Unknown names
    /// return `None`.
    pub fn property(&self, cf: u32, name: &str) -> Option<String> {
        let mut state = self.inner.lock_state().ok()?;
        if name == "basaltdb.num-live-versions" {
            return Some(state.versions.num_live_versions().to_string());
        }
        let state = &*state;
        let cf_state = state.versions.column_family(cf)?;
        let storage = &cf_state.current.storage;

        if let Some(level) = name.strip_prefix("basaltdb.num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= storage.num_levels() {
                return None;
            }
            return Some(storage.num_level_files(level).to_string());
        }

        match name {
            "basaltdb.levelstats" => {
                let mut out = String::from("level files bytes\n");
                for level in 0..storage.num_levels() {
                    out.push_str(&format!(
                        "{level:>5} {:>5} {:>5}\n",
                        storage.num_level_files(level),
                        storage.total_file_size(level)
                    ));
                }
                Some(out)
            }
            "basaltdb.cur-size-active-mem-table" => state
                .mems
                .get(&cf)
                .map(|m| m.mem.approximate_memory_usage().to_string()),
            "basaltdb.num-immutable-mem-table" => {
                state.mems.get(&cf).map(|m| m.imm.len().to_string())
            }
            "basaltdb.estimate-pending-compaction-bytes" => {
                let mut pending: u64 = 0;
                for level in 1..storage.num_levels().saturating_sub(1) {
                    let budget = cf_state.options.max_bytes_for_level(level);
                    pending += storage.total_file_size(level).saturating_sub(budget);
                }
                Some(pending.to_string())
            }
            "basaltdb.num-snapshots" => {
                Some(self.inner.snapshots.live().len().to_string())
            }
            "basaltdb.last-sequence" => Some(state.versions.last_sequence.to_string()),
            _ => None,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery helpers
// ------------------------------------------------------------------------------------------------

struct ReplayedState {
    /// Per-CF memtables rebuilt from the WALs.
    mems: HashMap<u32, Memtable>,
    max_sequence: SequenceNumber,
}

/// Replays every WAL at or past the recovered minimum log number into
/// fresh memtables, honoring the configured recovery mode.
fn replay_wals(
    path: &Path,
    options: &DbOptions,
    versions: &mut VersionSet,
) -> Result<ReplayedState, DbError> {
    let min_log = versions.min_log_number();
    let mut wal_numbers: Vec<u64> = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(FileType::WalFile { number, .. }) = parse_file_name(name)
            && number >= min_log
        {
            wal_numbers.push(number);
        }
    }
    wal_numbers.sort_unstable();

    let mut replayed = ReplayedState {
        mems: HashMap::new(),
        max_sequence: versions.last_sequence,
    };

    struct ReplayInserter<'a> {
        next_seq: SequenceNumber,
        wal_number: u64,
        versions: &'a VersionSet,
        mems: &'a mut HashMap<u32, Memtable>,
        max_sequence: &'a mut SequenceNumber,
    }

    impl crate::batch::BatchHandler for ReplayInserter<'_> {
        fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
            self.apply(cf, crate::keys::ValueType::Value, key, value)
        }
        fn delete(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError> {
            self.apply(cf, crate::keys::ValueType::Deletion, key, b"")
        }
        fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
            self.apply(cf, crate::keys::ValueType::Merge, key, value)
        }
    }

    impl ReplayInserter<'_> {
        fn apply(
            &mut self,
            cf: u32,
            ty: crate::keys::ValueType,
            key: &[u8],
            value: &[u8],
        ) -> Result<(), DbError> {
            let seq = self.next_seq;
            self.next_seq += 1;
            *self.max_sequence = (*self.max_sequence).max(seq);

            let Some(cf_state) = self.versions.column_family(cf) else {
                // Entries of a dropped column family.
                debug!(cf, "skipping replayed entry for missing column family");
                return Ok(());
            };
            // Entries already captured by a flushed memtable are
            // filtered by the column family's log number.
            if self.wal_number < cf_state.log_number {
                return Ok(());
            }
            self.mems
                .entry(cf)
                .or_insert_with(|| Memtable::new(self.wal_number, 0))
                .add(seq, ty, key, value)
        }
    }

    'wals: for number in wal_numbers {
        let wal_path = filename::log_file_name(path, number);
        let mut reader = LogReader::open(&wal_path)?;
        info!(number, "replaying WAL");
        loop {
            match reader.read_record() {
                Ok(Some(record)) => {
                    let batch = WriteBatch::from_data(record)?;
                    let mut inserter = ReplayInserter {
                        next_seq: batch.sequence(),
                        wal_number: number,
                        versions,
                        mems: &mut replayed.mems,
                        max_sequence: &mut replayed.max_sequence,
                    };
                    batch.iterate(&mut inserter)?;
                }
                Ok(None) => break,
                Err(err) => match options.recovery_mode {
                    RecoveryMode::AbsoluteConsistency => return Err(err.into()),
                    RecoveryMode::TolerateCorruptedTailRecords => {
                        warn!(number, error = %err, "ignoring rest of corrupt WAL");
                        continue 'wals;
                    }
                    RecoveryMode::PointInTimeRecovery => {
                        warn!(number, error = %err, "stopping replay at first corruption");
                        break 'wals;
                    }
                    RecoveryMode::SkipAnyCorruptedRecords => {
                        warn!(number, error = %err, "skipping corrupt record");
                        continue;
                    }
                },
            }
        }
    }

    versions.last_sequence = replayed.max_sequence;
    Ok(replayed)
}

/// Flushes replayed memtables to level 0 and advances every column
/// family's log number past the replayed WALs, making replay
/// idempotent across repeated opens.
fn install_recovered_memtables(
    path: &Path,
    versions: &mut VersionSet,
    replayed: ReplayedState,
    new_log_number: u64,
) -> Result<(), DbError> {
    let mut mems = replayed.mems;
    for cf_id in versions.column_family_ids() {
        let mut edit = VersionEdit::for_column_family(cf_id);
        edit.log_number = Some(new_log_number);

        if let Some(memtable) = mems.remove(&cf_id)
            && !memtable.is_empty()
        {
            let number = versions.new_file_number();
            let table_path = filename::table_file_name(path, number);
            let icmp = versions
                .column_family(cf_id)
                .map(|cf| cf.icmp.clone())
                .ok_or_else(|| DbError::Internal("column family vanished in recovery".into()))?;

            let mut writer = crate::table::TableWriter::new(&table_path, icmp)?;
            for (ikey, value) in memtable.iter_all()? {
                writer.add(&ikey, &value)?;
            }
            let properties = writer.finish()?;
            let file_size = fs::metadata(&table_path)
                .map(|m| m.len())
                .unwrap_or(properties.data_size);
            edit.add_file(
                0,
                number,
                0,
                file_size,
                crate::keys::InternalKey::from_encoded(properties.smallest_key.clone()),
                crate::keys::InternalKey::from_encoded(properties.largest_key.clone()),
                properties.smallest_seq,
                properties.largest_seq,
            );
            info!(
                cf = cf_id,
                number,
                entries = properties.num_entries,
                "recovered memtable flushed to level 0"
            );
        }

        versions.log_and_apply(&mut edit)?;
    }
    Ok(())
}
