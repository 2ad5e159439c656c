//! Group-commit write pipeline.
//!
//! Writers enqueue and sleep; the queue's front writer becomes the
//! **leader** of a write group.  The leader applies backpressure,
//! drains compatible followers from the queue, assigns contiguous
//! sequence numbers across the group, appends the concatenated payload
//! to the WAL (fsyncing when any member asked for it), inserts every
//! batch into the target memtables, publishes the new last sequence,
//! and wakes the group.
//!
//! Sequence-number order equals WAL-append order equals
//! memtable-insert order: only one leader runs at a time, and the next
//! leader starts only after the previous group fully finishes.
//!
//! Followers sleep on the queue condition variable; results are posted
//! under the queue lock, so the check-then-wait pattern cannot lose a
//! wakeup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::batch::{BatchHandler, WriteBatch};
use crate::error::DbError;
use crate::keys::{SequenceNumber, ValueType};
use crate::memtable::Memtable;
use crate::options::WriteOptions;

use super::{DbInner, DbState};

/// Upper bound on the combined payload of one write group.
const MAX_GROUP_BYTES: usize = 1 << 20;

// ------------------------------------------------------------------------------------------------
// WriteCallback
// ------------------------------------------------------------------------------------------------

/// Hook invoked under the commit lock before WAL append.
///
/// A failing callback aborts the write without consuming sequence
/// numbers.  The transaction layer uses this for commit-time
/// expiration and conflict checks; callback writes never share a
/// group.
pub(crate) trait WriteCallback: Send + Sync {
    fn check(&self, state: &DbState) -> Result<(), DbError>;
}

// ------------------------------------------------------------------------------------------------
// Writer handles and the queue
// ------------------------------------------------------------------------------------------------

pub(crate) struct WriterHandle {
    batch: Mutex<Option<WriteBatch>>,
    options: WriteOptions,
    has_callback: bool,
    /// Set under the queue lock once a leader claims this writer into a
    /// group; a claimed writer can no longer abandon its wait.
    in_group: std::sync::atomic::AtomicBool,
    /// Posted under the queue lock by the finishing leader.
    done: Mutex<Option<Result<SequenceNumber, Arc<DbError>>>>,
}

impl WriterHandle {
    fn new(batch: WriteBatch, options: WriteOptions, has_callback: bool) -> Self {
        Self {
            batch: Mutex::new(Some(batch)),
            options,
            has_callback,
            in_group: std::sync::atomic::AtomicBool::new(false),
            done: Mutex::new(None),
        }
    }

    fn post(&self, result: Result<SequenceNumber, Arc<DbError>>) {
        if let Ok(mut done) = self.done.lock() {
            *done = Some(result);
        }
    }

    fn take_result(&self) -> Option<Result<SequenceNumber, DbError>> {
        let done = self.done.lock().ok()?;
        done.as_ref().map(|result| match result {
            Ok(seq) => Ok(*seq),
            Err(shared) => Err(shared.duplicate()),
        })
    }
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    writers: VecDeque<Arc<WriterHandle>>,
}

// ------------------------------------------------------------------------------------------------
// Memtable insertion
// ------------------------------------------------------------------------------------------------

struct MemtableInserter<'a> {
    next_seq: SequenceNumber,
    mems: &'a HashMap<u32, Arc<Memtable>>,
    ignore_missing: bool,
}

impl MemtableInserter<'_> {
    fn apply(&mut self, ty: ValueType, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.mems.get(&cf) {
            Some(mem) => mem.add(seq, ty, key, value),
            None if self.ignore_missing => Ok(()),
            None => Err(DbError::InvalidArgument(format!(
                "write batch addresses unknown column family {cf}"
            ))),
        }
    }
}

impl BatchHandler for MemtableInserter<'_> {
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.apply(ValueType::Value, cf, key, value)
    }

    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<(), DbError> {
        self.apply(ValueType::Deletion, cf, key, b"")
    }

    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.apply(ValueType::Merge, cf, key, value)
    }
}

// ------------------------------------------------------------------------------------------------
// The pipeline
// ------------------------------------------------------------------------------------------------

impl DbInner {
    /// Full write entry point.  Returns the first sequence assigned to
    /// the batch.
    pub(crate) fn write_impl(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<&dyn WriteCallback>,
    ) -> Result<SequenceNumber, DbError> {
        if self.is_shutting_down() {
            return Err(DbError::ShutdownInProgress);
        }
        if batch.is_empty() && callback.is_none() {
            let state = self.lock_state()?;
            return Ok(state.versions.last_sequence);
        }

        let me = Arc::new(WriterHandle::new(batch, options.clone(), callback.is_some()));
        let deadline = options.timeout.map(|t| Instant::now() + t);

        // Wait until a leader absorbed this writer, or it reached the
        // queue front and leads its own group.  The condition variable
        // pairs with the queue mutex, and results are posted under that
        // mutex, so no wakeup can be lost between check and wait.
        {
            let mut queue = self.lock_write_queue()?;
            queue.writers.push_back(Arc::clone(&me));
            loop {
                if let Some(result) = me.take_result() {
                    return result;
                }
                if queue
                    .writers
                    .front()
                    .is_some_and(|front| Arc::ptr_eq(front, &me))
                {
                    break;
                }
                let claimed = me.in_group.load(std::sync::atomic::Ordering::SeqCst);
                match deadline {
                    // A writer already claimed into a group must wait
                    // for its result; the commit may be in flight.
                    Some(deadline) if !claimed => {
                        let now = Instant::now();
                        if now >= deadline {
                            queue.writers.retain(|w| !Arc::ptr_eq(w, &me));
                            return Err(DbError::TimedOut("write queue wait".into()));
                        }
                        let (guard, _timeout) = self
                            .write_cv
                            .wait_timeout(queue, deadline - now)
                            .map_err(|_| DbError::Internal("write queue lock poisoned".into()))?;
                        queue = guard;
                    }
                    _ => {
                        queue = self
                            .write_cv
                            .wait(queue)
                            .map_err(|_| DbError::Internal("write queue lock poisoned".into()))?;
                    }
                }
            }
        }

        self.lead_group(&me, callback);
        me.take_result()
            .unwrap_or_else(|| Err(DbError::Internal("write group left no result".into())))
    }

    /// Runs one write group with `leader` at the front of the queue.
    fn lead_group(
        &self,
        leader: &Arc<WriterHandle>,
        callback: Option<&dyn WriteCallback>,
    ) {
        // 1. Backpressure, using the leader's options.
        if let Err(err) = self.make_room_for_write(&leader.options) {
            self.finish_group(&[Arc::clone(leader)], Err(Arc::new(err)), &[]);
            return;
        }

        // 2. Build the group.
        let group: Vec<Arc<WriterHandle>> = {
            let queue = match self.lock_write_queue() {
                Ok(queue) => queue,
                Err(err) => {
                    self.finish_group(&[Arc::clone(leader)], Err(Arc::new(err)), &[]);
                    return;
                }
            };
            let mut group = vec![Arc::clone(leader)];
            if !leader.has_callback {
                let mut bytes = leader
                    .batch
                    .lock()
                    .ok()
                    .and_then(|b| b.as_ref().map(WriteBatch::size_in_bytes))
                    .unwrap_or(0);
                for writer in queue.writers.iter().skip(1) {
                    if writer.has_callback
                        || writer.options.disable_wal != leader.options.disable_wal
                        || (writer.options.sync && !leader.options.sync)
                    {
                        break;
                    }
                    let size = writer
                        .batch
                        .lock()
                        .ok()
                        .and_then(|b| b.as_ref().map(WriteBatch::size_in_bytes))
                        .unwrap_or(0);
                    if bytes + size > MAX_GROUP_BYTES {
                        break;
                    }
                    bytes += size;
                    group.push(Arc::clone(writer));
                }
            }
            // Claim every member while still under the queue lock, so
            // none of them can abandon a commit already in flight.
            for member in &group {
                member
                    .in_group
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
            group
        };

        // 3. Callback + sequence assignment under the engine lock.
        let staged = (|| -> Result<(Vec<SequenceNumber>, SequenceNumber, HashMap<u32, Arc<Memtable>>), DbError> {
            let state = self.lock_state()?;
            if let Some(err) = state.background_error() {
                return Err(err);
            }
            if let Some(cb) = callback {
                cb.check(&state)?;
            }

            let mut seq = state.versions.last_sequence;
            let mut first_seqs = Vec::with_capacity(group.len());
            for writer in &group {
                let mut batch = writer
                    .batch
                    .lock()
                    .map_err(|_| DbError::Internal("writer batch lock poisoned".into()))?;
                let batch_ref = batch.as_mut().ok_or_else(|| {
                    DbError::Internal("write batch consumed before commit".into())
                })?;
                batch_ref.set_sequence(seq + 1);
                first_seqs.push(seq + 1);
                seq += u64::from(batch_ref.count());
            }

            let mems: HashMap<u32, Arc<Memtable>> = state
                .mems
                .iter()
                .map(|(id, cf)| (*id, Arc::clone(&cf.mem)))
                .collect();
            Ok((first_seqs, seq, mems))
        })();
        let (first_seqs, last_sequence, mems) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                self.finish_group(&group, Err(Arc::new(err)), &[]);
                return;
            }
        };

        trace!(
            group = group.len(),
            first = first_seqs.first().copied().unwrap_or(0),
            last = last_sequence,
            "write group formed"
        );

        // 4. WAL append (skipped for disable_wal groups).
        if !leader.options.disable_wal {
            let payload: Option<Vec<u8>> = {
                if group.len() == 1 {
                    leader
                        .batch
                        .lock()
                        .ok()
                        .and_then(|b| b.as_ref().map(|batch| batch.data().to_vec()))
                } else {
                    let mut merged: Option<WriteBatch> = None;
                    for writer in &group {
                        if let Ok(guard) = writer.batch.lock()
                            && let Some(batch) = guard.as_ref()
                        {
                            match merged.as_mut() {
                                None => merged = Some(batch.clone()),
                                Some(m) => m.append_batch(batch),
                            }
                        }
                    }
                    merged.map(|m| m.data().to_vec())
                }
            };
            let Some(payload) = payload else {
                self.finish_group(
                    &group,
                    Err(Arc::new(DbError::Internal("write group lost its payload".into()))),
                    &[],
                );
                return;
            };

            let wal_result = (|| -> Result<(), DbError> {
                let mut log = self.lock_log()?;
                log.writer.add_record(&payload)?;
                if group.iter().any(|w| w.options.sync) {
                    log.writer.sync()?;
                }
                Ok(())
            })();
            if let Err(err) = wal_result {
                self.maybe_set_background_error(&err);
                self.finish_group(&group, Err(Arc::new(err)), &[]);
                return;
            }
        }

        // 5. Memtable insertion, in group (= sequence) order.
        for writer in &group {
            let batch = writer.batch.lock().ok().and_then(|mut b| b.take());
            let Some(batch) = batch else {
                self.finish_group(
                    &group,
                    Err(Arc::new(DbError::Internal("write group lost a batch".into()))),
                    &[],
                );
                return;
            };
            let mut inserter = MemtableInserter {
                next_seq: batch.sequence(),
                mems: &mems,
                ignore_missing: writer.options.ignore_missing_column_families,
            };
            if let Err(err) = batch.iterate(&mut inserter) {
                self.maybe_set_background_error(&err);
                self.finish_group(&group, Err(Arc::new(err)), &[]);
                return;
            }
        }

        // 6. Publish: readers may now observe the new sequences.
        match self.lock_state() {
            Ok(mut state) => {
                state.versions.last_sequence = last_sequence;
            }
            Err(err) => {
                self.finish_group(&group, Err(Arc::new(err)), &[]);
                return;
            }
        }

        // 7. Wake everyone.
        self.finish_group(&group, Ok(()), &first_seqs);
        debug!(last_sequence, "write group committed");
    }

    /// Pops the group off the queue, posts each member's result, and
    /// wakes all sleepers (followers see their result, the next front
    /// becomes leader).
    fn finish_group(
        &self,
        group: &[Arc<WriterHandle>],
        outcome: Result<(), Arc<DbError>>,
        first_seqs: &[SequenceNumber],
    ) {
        if let Ok(mut queue) = self.lock_write_queue() {
            for (idx, member) in group.iter().enumerate() {
                if queue
                    .writers
                    .front()
                    .is_some_and(|front| Arc::ptr_eq(front, member))
                {
                    queue.writers.pop_front();
                }
                let result = match &outcome {
                    Ok(()) => Ok(first_seqs.get(idx).copied().unwrap_or(0)),
                    Err(shared) => Err(Arc::clone(shared)),
                };
                member.post(result);
            }
            self.write_cv.notify_all();
        }
    }

    /// Applies write backpressure and memtable switching until there is
    /// room for one more write.
    fn make_room_for_write(&self, options: &WriteOptions) -> Result<(), DbError> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut delayed_once = false;

        loop {
            if self.is_shutting_down() {
                return Err(DbError::ShutdownInProgress);
            }
            let mut state = self.lock_state()?;
            if let Some(err) = state.background_error() {
                return Err(err);
            }

            #[derive(PartialEq)]
            enum Pressure {
                None,
                Delay,
                Stall,
            }
            let mut pressure = Pressure::None;
            let mut switch_cf: Option<u32> = None;

            let cf_ids: Vec<u32> = state.mems.keys().copied().collect();
            for cf_id in cf_ids {
                let Some(cf) = state.versions.column_family(cf_id) else {
                    continue;
                };
                let cf_options = cf.options.clone();
                let l0_files = cf.current.storage.num_level_files(0);
                let mems = state.mems.get(&cf_id).expect("memtable state out of sync");
                let mem_full =
                    mems.mem.approximate_memory_usage() >= cf_options.write_buffer_size;

                if l0_files >= cf_options.level0_stop_writes_trigger {
                    pressure = Pressure::Stall;
                } else if mem_full && mems.imm.len() >= cf_options.max_write_buffer_number - 1 {
                    pressure = Pressure::Stall;
                } else if mem_full {
                    switch_cf = Some(cf_id);
                } else if l0_files >= cf_options.level0_slowdown_writes_trigger
                    && pressure == Pressure::None
                {
                    pressure = Pressure::Delay;
                }
            }

            match pressure {
                Pressure::Stall => {
                    if options.no_slowdown {
                        return Err(DbError::Incomplete("write stall".into()));
                    }
                    debug!("write stalled waiting for background work");
                    self.wake_background();
                    match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(DbError::TimedOut("write stall".into()));
                            }
                            let (guard, _timeout) = self
                                .state_cv
                                .wait_timeout(state, deadline - now)
                                .map_err(|_| DbError::Internal("state lock poisoned".into()))?;
                            drop(guard);
                        }
                        None => {
                            let guard = self
                                .state_cv
                                .wait(state)
                                .map_err(|_| DbError::Internal("state lock poisoned".into()))?;
                            drop(guard);
                        }
                    }
                    continue;
                }
                Pressure::Delay if !delayed_once => {
                    if options.no_slowdown {
                        return Err(DbError::Incomplete("write slowdown".into()));
                    }
                    drop(state);
                    let rate = self.options.delayed_write_rate.max(1);
                    let delay = Duration::from_secs_f64((1u64 << 20) as f64 / rate as f64)
                        .min(Duration::from_millis(100));
                    trace!(?delay, "write delayed");
                    self.wake_background();
                    std::thread::sleep(delay);
                    delayed_once = true;
                    continue;
                }
                _ => {}
            }

            if let Some(cf_id) = switch_cf {
                self.switch_memtable(&mut state, cf_id)?;
                continue;
            }
            return Ok(());
        }
    }

    /// Seals the active memtable of `cf_id`, opens a fresh WAL, and
    /// queues the sealed memtable for flush.
    pub(crate) fn switch_memtable(
        &self,
        state: &mut DbState,
        cf_id: u32,
    ) -> Result<(), DbError> {
        let new_log_number = state.versions.new_file_number();
        let path = crate::filename::log_file_name(&self.path, new_log_number);
        let new_writer = crate::wal::LogWriter::create(&path)?;

        {
            let mut log = self.lock_log()?;
            log.writer.sync()?;
            log.writer = new_writer;
            log.number = new_log_number;
        }

        let creation_seq = state.versions.last_sequence;
        let mems = state
            .mems
            .get_mut(&cf_id)
            .ok_or_else(|| DbError::Internal("memtable state out of sync".into()))?;
        let sealed = std::mem::replace(
            &mut mems.mem,
            Arc::new(Memtable::new(new_log_number, creation_seq)),
        );
        debug!(
            cf = cf_id,
            sealed_log = sealed.log_number(),
            new_log = new_log_number,
            bytes = sealed.approximate_memory_usage(),
            "memtable sealed"
        );
        mems.imm.push(sealed);
        self.wake_background();
        Ok(())
    }
}
