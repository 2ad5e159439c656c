//! Transaction log iterator — ordered `(sequence, WriteBatch)` stream
//! from a requested starting sequence.
//!
//! The iterator opens WALs (archived and live) in order, verifies that
//! each yielded batch continues exactly at `last yielded + 1`, and on a
//! gap re-seeks through the file list once before giving up.  At the
//! tail of the newest WAL it clears the reader's EOF latch and retries
//! once, picking up records a concurrent writer appended.

use tracing::{debug, warn};

use crate::batch::WriteBatch;
use crate::error::DbError;
use crate::keys::SequenceNumber;
use crate::wal::LogReader;
use crate::wal_manager::{WalFileInfo, WalManager};

/// Streaming view of committed write batches, oldest first.
pub struct TransactionLogIterator<'a> {
    manager: &'a WalManager,
    files: Vec<WalFileInfo>,
    file_index: usize,
    reader: Option<LogReader>,

    /// Sequence the caller asked to start at.
    requested: SequenceNumber,
    /// Next sequence the stream must produce, once started.
    next_expected: Option<SequenceNumber>,
    /// One re-seek is allowed per gap before failing.
    resought: bool,
}

impl<'a> TransactionLogIterator<'a> {
    pub(crate) fn new(
        manager: &'a WalManager,
        requested: SequenceNumber,
    ) -> Result<Self, DbError> {
        let files = manager.files_from_sequence(requested)?;
        debug!(requested, files = files.len(), "transaction log iterator opened");
        Ok(Self {
            manager,
            files,
            file_index: 0,
            reader: None,
            requested,
            next_expected: None,
            resought: false,
        })
    }

    /// Next batch, or `Ok(None)` at the live tail.
    pub fn next_batch(&mut self) -> Result<Option<(SequenceNumber, WriteBatch)>, DbError> {
        loop {
            if self.reader.is_none() {
                let Some(file) = self.files.get(self.file_index) else {
                    return Ok(None);
                };
                self.reader = Some(LogReader::open(&file.path)?);
            }
            let reader = self.reader.as_mut().expect("reader just ensured");

            match reader.read_record() {
                Ok(Some(record)) => {
                    let batch = WriteBatch::from_data(record)?;
                    let first = batch.sequence();
                    let count = u64::from(batch.count());
                    let last = first + count.saturating_sub(1);

                    match self.next_expected {
                        None => {
                            // Skip batches wholly before the requested
                            // sequence.
                            if last < self.requested {
                                continue;
                            }
                            // The caller's exact sequence must fall
                            // inside the first yielded batch.
                            if first > self.requested {
                                return Err(DbError::Corruption(format!(
                                    "transaction log gap: requested sequence {} but the log resumes at {first}",
                                    self.requested
                                )));
                            }
                        }
                        Some(expected) => {
                            if first != expected {
                                return self.handle_gap(expected, first);
                            }
                        }
                    }

                    self.next_expected = Some(last + 1);
                    self.resought = false;
                    return Ok(Some((first, batch)));
                }
                Ok(None) => {
                    if self.file_index + 1 < self.files.len() {
                        self.file_index += 1;
                        self.reader = None;
                        continue;
                    }
                    // Tail of the newest WAL: retry once for records
                    // appended since the EOF latch.
                    if reader.is_at_eof() {
                        reader.unmark_eof();
                        match reader.read_record()? {
                            Some(record) => {
                                // Push the record through the normal
                                // path by replaying the loop; simplest
                                // is to decode inline.
                                let batch = WriteBatch::from_data(record)?;
                                let first = batch.sequence();
                                let count = u64::from(batch.count());
                                if let Some(expected) = self.next_expected
                                    && first != expected
                                {
                                    return self.handle_gap(expected, first);
                                }
                                self.next_expected = Some(first + count);
                                self.resought = false;
                                return Ok(Some((first, batch)));
                            }
                            None => return Ok(None),
                        }
                    }
                    return Ok(None);
                }
                Err(err) => {
                    warn!(error = %err, "corrupt record in transaction log stream");
                    return Err(err.into());
                }
            }
        }
    }

    /// Re-seeks the file list once when a sequence gap shows up; the
    /// expected batch may live in a file that was archived (or created)
    /// after this iterator listed the directory.
    fn handle_gap(
        &mut self,
        expected: SequenceNumber,
        found: SequenceNumber,
    ) -> Result<Option<(SequenceNumber, WriteBatch)>, DbError> {
        if self.resought {
            return Err(DbError::Corruption(format!(
                "transaction log gap: expected sequence {expected}, found {found}"
            )));
        }
        debug!(expected, found, "transaction log gap; re-seeking");
        self.resought = true;
        self.files = self.manager.files_from_sequence(expected)?;
        self.file_index = 0;
        self.reader = None;
        self.requested = expected;
        self.next_expected = None;
        self.next_batch()
    }
}

impl std::fmt::Debug for TransactionLogIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLogIterator")
            .field("requested", &self.requested)
            .field("next_expected", &self.next_expected)
            .field("file_index", &self.file_index)
            .finish_non_exhaustive()
    }
}
