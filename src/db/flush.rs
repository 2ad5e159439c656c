//! Background work — memtable flushes, compactions, and the
//! obsolete-file sweep.
//!
//! Two pools serve the engine: a high-priority pool draining sealed
//! memtables into level-0 tables, and a low-priority pool running
//! compactions.  Workers sleep on crossbeam channels and are woken by
//! the write pipeline (memtable sealed, backpressure) and by installs
//! that may have raised a compaction score.

use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

/// Idle heartbeat of the background workers; bounds how long a
/// shutdown request can go unnoticed.
const WORKER_IDLE_TICK: std::time::Duration = std::time::Duration::from_millis(200);

use crate::compaction::job::CompactionJob;
use crate::compaction::{Compaction, pick_compaction};
use crate::error::DbError;
use crate::filename::table_file_name;
use crate::keys::InternalKey;
use crate::memtable::Memtable;
use crate::table::TableWriter;
use crate::version::edit::VersionEdit;

use super::DbInner;

// ------------------------------------------------------------------------------------------------
// Worker loops
// ------------------------------------------------------------------------------------------------

/// High-priority worker: drains sealed memtables.
///
/// Holds only a weak engine reference while sleeping, so dropping the
/// last `Db` handle lets the engine shut down.
pub(crate) fn flush_worker_loop(weak: std::sync::Weak<DbInner>, wakeups: Receiver<()>) {
    loop {
        let Some(inner) = weak.upgrade() else { break };
        let outcome = inner.flush_one();
        let shutting_down = inner.is_shutting_down();
        match outcome {
            Ok(true) => continue,
            Ok(false) => {}
            Err(DbError::ShutdownInProgress) => {}
            Err(err) => {
                error!(error = %err, "background flush failed");
                inner.maybe_set_background_error(&err);
            }
        }
        drop(inner);
        if shutting_down {
            break;
        }
        match wakeups.recv_timeout(WORKER_IDLE_TICK) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("flush worker exiting");
}

/// Low-priority worker: runs compactions while any level's score is
/// due.
pub(crate) fn compaction_worker_loop(weak: std::sync::Weak<DbInner>, wakeups: Receiver<()>) {
    loop {
        let Some(inner) = weak.upgrade() else { break };
        let outcome = inner.compact_one();
        let shutting_down = inner.is_shutting_down();
        match outcome {
            Ok(true) => continue,
            Ok(false) => {}
            Err(DbError::ShutdownInProgress) => {}
            Err(err) => {
                error!(error = %err, "background compaction failed");
                inner.maybe_set_background_error(&err);
            }
        }
        drop(inner);
        if shutting_down {
            break;
        }
        match wakeups.recv_timeout(WORKER_IDLE_TICK) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("compaction worker exiting");
}

impl DbInner {
    // --------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------

    /// Flushes the oldest sealed memtable of some column family.
    /// Returns `false` when nothing is pending.
    pub(crate) fn flush_one(&self) -> Result<bool, DbError> {
        if self.is_shutting_down() {
            return Err(DbError::ShutdownInProgress);
        }

        // Pick a column family with a sealed memtable, reserving it so
        // a second flush worker cannot pick the same one.
        let picked = {
            let mut state = self.lock_state()?;
            let mut picked = None;
            for (cf_id, mems) in &state.mems {
                if state.flushing.contains(cf_id) {
                    continue;
                }
                if let Some(oldest) = mems.imm.first() {
                    let cf = state.versions.column_family(*cf_id).ok_or_else(|| {
                        DbError::Internal("memtable state out of sync".into())
                    })?;
                    picked = Some((*cf_id, Arc::clone(oldest), cf.icmp.clone()));
                    break;
                }
            }
            if let Some((cf_id, _, _)) = &picked {
                state.flushing.insert(*cf_id);
            }
            picked
        };
        let Some((cf_id, memtable, icmp)) = picked else {
            return Ok(false);
        };

        let result = self.flush_memtable_to_level0(cf_id, &memtable, &icmp);
        if let Ok(mut state) = self.lock_state() {
            state.flushing.remove(&cf_id);
        }
        match result {
            Ok(()) => {
                // Memtable retired; old WALs may now be prunable.
                self.sweep_obsolete_files()?;
                self.state_cv.notify_all();
                self.wake_compaction();
                Ok(true)
            }
            Err(err) => {
                self.state_cv.notify_all();
                Err(err)
            }
        }
    }

    /// Converts one sealed memtable into a level-0 table and installs
    /// the edit.
    fn flush_memtable_to_level0(
        &self,
        cf_id: u32,
        memtable: &Arc<Memtable>,
        icmp: &crate::keys::InternalKeyComparator,
    ) -> Result<(), DbError> {
        let mut edit = VersionEdit::for_column_family(cf_id);
        let mut reserved: Option<u64> = None;

        if !memtable.is_empty() {
            let number = {
                let mut state = self.lock_state()?;
                let number = state.versions.new_file_number();
                state.pending_outputs.insert(number);
                number
            };
            reserved = Some(number);
            let path = table_file_name(&self.path, number);

            let build = (|| -> Result<(), DbError> {
                let mut writer = TableWriter::new(&path, icmp.clone())?;
                for (ikey, value) in memtable.iter_all()? {
                    writer.add(&ikey, &value)?;
                }
                let properties = writer.finish()?;
                let file_size = std::fs::metadata(&path)
                    .map(|m| m.len())
                    .unwrap_or(properties.data_size);
                edit.add_file(
                    0,
                    number,
                    0,
                    file_size,
                    InternalKey::from_encoded(properties.smallest_key.clone()),
                    InternalKey::from_encoded(properties.largest_key.clone()),
                    properties.smallest_seq,
                    properties.largest_seq,
                );
                info!(
                    cf = cf_id,
                    number,
                    entries = properties.num_entries,
                    bytes = file_size,
                    "memtable flushed to level 0"
                );
                Ok(())
            })();
            if let Err(err) = build {
                let mut state = self.lock_state()?;
                state.pending_outputs.remove(&number);
                drop(state);
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        }

        // Install: the smallest WAL still needed is the minimum across
        // the memtables that remain after this one retires.
        let install = (|| -> Result<(), DbError> {
            let mut state = self.lock_state()?;
            let mems = state
                .mems
                .get(&cf_id)
                .ok_or_else(|| DbError::Internal("column family vanished during flush".into()))?;
            let min_log = mems
                .imm
                .iter()
                .skip(1)
                .map(|m| m.log_number())
                .chain(std::iter::once(mems.mem.log_number()))
                .min()
                .unwrap_or_else(|| mems.mem.log_number());
            edit.log_number = Some(min_log);

            state.versions.log_and_apply(&mut edit)?;

            let mems = state
                .mems
                .get_mut(&cf_id)
                .ok_or_else(|| DbError::Internal("column family vanished during flush".into()))?;
            if !mems.imm.is_empty() {
                mems.imm.remove(0);
            }
            if let Some(number) = reserved {
                state.pending_outputs.remove(&number);
            }
            Ok(())
        })();
        if install.is_err()
            && let Some(number) = reserved
        {
            if let Ok(mut state) = self.lock_state() {
                state.pending_outputs.remove(&number);
            }
            let _ = std::fs::remove_file(table_file_name(&self.path, number));
        }
        install
    }

    /// Force-flushes the active memtable (and everything sealed) of
    /// one column family.  Used by `Db::flush` and the backup path.
    pub(crate) fn flush_column_family(&self, cf_id: u32) -> Result<(), DbError> {
        // Seal the active memtable if it holds anything.
        {
            let mut state = self.lock_state()?;
            let active_empty = state
                .mems
                .get(&cf_id)
                .ok_or_else(|| {
                    DbError::InvalidArgument(format!("column family {cf_id} does not exist"))
                })?
                .mem
                .is_empty();
            if !active_empty {
                self.switch_memtable(&mut state, cf_id)?;
            }
        }
        // Drain until this family has no sealed memtables left.
        loop {
            let pending = {
                let state = self.lock_state()?;
                state
                    .mems
                    .get(&cf_id)
                    .map(|m| !m.imm.is_empty())
                    .unwrap_or(false)
            };
            if !pending {
                return Ok(());
            }
            if !self.flush_one()? {
                // A background worker owns the flush; wait it out.
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
    }

    // --------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------

    /// Picks and runs one automatic compaction.  Returns `false` when
    /// no level is due.
    pub(crate) fn compact_one(&self) -> Result<bool, DbError> {
        if self.is_shutting_down() {
            return Err(DbError::ShutdownInProgress);
        }

        let picked = {
            let state = self.lock_state()?;
            let mut best: Option<Compaction> = None;
            for cf_id in state.versions.column_family_ids() {
                if let Some(cf) = state.versions.column_family(cf_id)
                    && let Some(compaction) = pick_compaction(cf)
                {
                    best = Some(compaction);
                    break;
                }
            }
            best
        };
        let Some(compaction) = picked else {
            return Ok(false);
        };

        let result = self.run_compaction(&compaction);
        compaction.release_inputs();
        // Release the pinned input version before sweeping, or the
        // inputs still count as live.
        drop(compaction);
        match result {
            Ok(()) => {
                self.sweep_obsolete_files()?;
                self.state_cv.notify_all();
                // Installing outputs may push the next level over its
                // budget.
                self.wake_compaction();
                Ok(true)
            }
            Err(err) => {
                self.state_cv.notify_all();
                Err(err)
            }
        }
    }

    /// Executes one compaction (trivial move or full merge) and
    /// installs the result.
    pub(crate) fn run_compaction(&self, compaction: &Compaction) -> Result<(), DbError> {
        if compaction.is_trivial_move() {
            let file = &compaction.inputs[0][0];
            let mut edit = VersionEdit::for_column_family(compaction.cf_id);
            edit.delete_file(compaction.level, file.number);
            edit.add_file(
                compaction.output_level,
                file.number,
                file.path_id,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
                file.smallest_seq,
                file.largest_seq,
            );
            Self::record_compact_pointer(&mut edit, compaction);
            let mut state = self.lock_state()?;
            state.versions.log_and_apply(&mut edit)?;
            info!(
                cf = compaction.cf_id,
                number = file.number,
                from = compaction.level,
                to = compaction.output_level,
                "trivial move installed"
            );
            return Ok(());
        }

        let (icmp, merge_operator, compaction_filter) = {
            let state = self.lock_state()?;
            let cf = state
                .versions
                .column_family(compaction.cf_id)
                .ok_or_else(|| DbError::Aborted("column family dropped mid-compaction".into()))?;
            (
                cf.icmp.clone(),
                cf.options.merge_operator.clone(),
                cf.options.compaction_filter.clone(),
            )
        };
        let snapshots = self.snapshots.live();

        let job = CompactionJob {
            compaction,
            icmp,
            snapshots,
            merge_operator,
            compaction_filter,
            shutdown: &self.shutdown,
        };
        let allocated: std::sync::Mutex<Vec<u64>> = std::sync::Mutex::new(Vec::new());
        let mut allocate = || {
            let mut state = self.lock_state().expect("state lock poisoned");
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            if let Ok(mut numbers) = allocated.lock() {
                numbers.push(number);
            }
            number
        };
        let outputs = job.run(&self.path, &self.table_cache, &mut allocate);

        match outputs {
            Ok(outputs) => {
                let mut edit = VersionEdit::for_column_family(compaction.cf_id);
                for file in compaction.inputs[0].iter() {
                    edit.delete_file(compaction.level, file.number);
                }
                for file in compaction.inputs[1].iter() {
                    edit.delete_file(compaction.output_level, file.number);
                }
                for output in &outputs {
                    edit.add_file(
                        compaction.output_level,
                        output.number,
                        0,
                        output.file_size,
                        output.smallest.clone(),
                        output.largest.clone(),
                        output.smallest_seq,
                        output.largest_seq,
                    );
                }
                Self::record_compact_pointer(&mut edit, compaction);

                let mut state = self.lock_state()?;
                state.versions.log_and_apply(&mut edit)?;
                for output in &outputs {
                    state.pending_outputs.remove(&output.number);
                }
                Ok(())
            }
            Err(err) => {
                // The job already removed its partial output files;
                // release the numbers this job reserved.
                if let Ok(mut state) = self.lock_state()
                    && let Ok(numbers) = allocated.lock()
                {
                    for number in numbers.iter() {
                        state.pending_outputs.remove(number);
                    }
                }
                if !matches!(err, DbError::ShutdownInProgress) {
                    warn!(error = %err, "compaction failed");
                }
                Err(err)
            }
        }
    }

    /// Advances the round-robin cursor past the compacted range.
    fn record_compact_pointer(edit: &mut VersionEdit, compaction: &Compaction) {
        if compaction.level > 0
            && let Some(last) = compaction.inputs[0].last()
        {
            edit.compact_pointers
                .push((compaction.level, last.largest.clone()));
        }
    }

    // --------------------------------------------------------------------
    // Obsolete file sweep
    // --------------------------------------------------------------------

    /// Deletes table files no longer referenced by any version, prunes
    /// stale MANIFESTs, and archives WALs no longer needed by any
    /// column family.  Honors `pending_outputs` and the
    /// file-deletions-disabled latch.
    pub(crate) fn sweep_obsolete_files(&self) -> Result<(), DbError> {
        let (live, min_pending, min_log, manifest_number, deletions_disabled) = {
            let mut state = self.lock_state()?;
            // Drop bookkeeping for metadata nothing references anymore.
            let _ = state.versions.take_unreferenced_obsolete_files();
            (
                state.versions.live_file_numbers(),
                state.pending_outputs.iter().min().copied(),
                state.versions.min_log_number(),
                state.versions.manifest_file_number(),
                state.file_deletions_disabled > 0,
            )
        };
        if deletions_disabled {
            return Ok(());
        }

        let min_pending = min_pending.unwrap_or(u64::MAX);
        let entries = std::fs::read_dir(&self.path)?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match crate::filename::parse_file_name(name) {
                Some(crate::filename::FileType::TableFile(number)) => {
                    if !live.contains(&number) && number < min_pending {
                        debug!(number, "deleting obsolete table file");
                        let _ = std::fs::remove_file(entry.path());
                        self.table_cache.evict(number);
                    }
                }
                Some(crate::filename::FileType::WalFile { number, .. }) => {
                    let current_log = self.lock_log().map(|l| l.number).unwrap_or(0);
                    if number < min_log && number != current_log {
                        self.wal_manager.archive_wal(number)?;
                    }
                }
                Some(crate::filename::FileType::Manifest(number)) => {
                    if number < manifest_number {
                        debug!(number, "deleting old MANIFEST");
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
                Some(crate::filename::FileType::TempFile(_)) => {
                    let _ = std::fs::remove_file(entry.path());
                }
                _ => {}
            }
        }
        self.wal_manager.prune_archive(false)?;
        Ok(())
    }

    pub(crate) fn wake_background(&self) {
        let _ = self.flush_tx.try_send(());
        let _ = self.compact_tx.try_send(());
    }

    pub(crate) fn wake_compaction(&self) {
        let _ = self.compact_tx.try_send(());
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(AtomicOrdering::SeqCst)
    }
}
