//! Write-ahead log — block-framed, CRC-protected record files.
//!
//! Both the database WAL and the MANIFEST use this format.  A log file
//! is a sequence of 32 KiB blocks; each physical record is framed as
//!
//! ```text
//! [crc32: 4 bytes LE][length: 2 bytes LE][type: 1 byte][payload]
//! ```
//!
//! with `type ∈ {FULL, FIRST, MIDDLE, LAST}` so a logical record larger
//! than a block can be split.  When fewer than 7 bytes remain in a
//! block, the writer zero-pads to the block boundary; a record fragment
//! never spans a block boundary.
//!
//! The checksum covers the type byte and the payload.
//!
//! ## Reader behavior
//!
//! - Bad checksum, impossible length, or a `MIDDLE`/`LAST` fragment
//!   without a preceding `FIRST` is reported as
//!   [`WalError::Corruption`].  The reader skips to the next block
//!   before returning the error, so callers replaying under a lenient
//!   recovery policy can keep reading.
//! - A record truncated by a crash (or by a concurrent appender that
//!   has not finished) reads as a clean end-of-file.
//!   [`LogReader::unmark_eof`] rewinds to the start of the incomplete
//!   record and retries, which is how the transaction-log iterator
//!   tails a live WAL.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{trace, warn};

use crate::error::DbError;

/// Size of one log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Size of the physical record header: crc(4) + length(2) + type(1).
pub const RECORD_HEADER_SIZE: usize = 7;

const MAX_FRAGMENT_SIZE: usize = BLOCK_SIZE - RECORD_HEADER_SIZE;

// Physical record types.  Zero marks padding and is skipped by the
// reader.
const TYPE_ZERO: u8 = 0;
const TYPE_FULL: u8 = 1;
const TYPE_FIRST: u8 = 2;
const TYPE_MIDDLE: u8 = 3;
const TYPE_LAST: u8 = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log reading and writing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log contained a structurally invalid or checksum-failing
    /// record.
    #[error("log corruption at offset {offset}: {reason}")]
    Corruption {
        /// Byte offset of the damaged frame within the file.
        offset: u64,
        /// What failed.
        reason: String,
    },
}

impl From<WalError> for DbError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Io(e) => DbError::Io(e),
            WalError::Corruption { offset, reason } => {
                DbError::Corruption(format!("log offset {offset}: {reason}"))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LogWriter
// ------------------------------------------------------------------------------------------------

/// Appends logical records to a block-framed log file.
///
/// Not internally synchronized — the write pipeline serializes access
/// through its log mutex, which is exactly the guarantee the block
/// framing needs.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
    path: PathBuf,
    block_offset: usize,
    written: u64,
}

impl LogWriter {
    /// Creates a fresh log file, truncating any previous content.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        trace!(path = %path.display(), "log file created");
        Ok(Self {
            file,
            path,
            block_offset: 0,
            written: 0,
        })
    }

    /// Reopens an existing log file for appending, resuming block
    /// accounting from its current size.
    pub fn open_for_append(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path,
            block_offset: (len % BLOCK_SIZE as u64) as usize,
            written: len,
        })
    }

    /// Appends one logical record, splitting it into block-sized
    /// fragments as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<(), WalError> {
        let mut left = payload;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < RECORD_HEADER_SIZE {
                // Not enough room for a header: zero-pad to the block
                // boundary.
                if leftover > 0 {
                    const ZEROES: [u8; RECORD_HEADER_SIZE] = [0; RECORD_HEADER_SIZE];
                    self.file.write_all(&ZEROES[..leftover])?;
                    self.written += leftover as u64;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - RECORD_HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let is_end = fragment_len == left.len();

            let record_type = match (begin, is_end) {
                (true, true) => TYPE_FULL,
                (true, false) => TYPE_FIRST,
                (false, true) => TYPE_LAST,
                (false, false) => TYPE_MIDDLE,
            };

            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;

            if is_end {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: u8, data: &[u8]) -> Result<(), WalError> {
        debug_assert!(data.len() <= MAX_FRAGMENT_SIZE);

        let mut hasher = Crc32::new();
        hasher.update(&[record_type]);
        hasher.update(data);
        let crc = hasher.finalize();

        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type;

        self.file.write_all(&header)?;
        self.file.write_all(data)?;

        self.block_offset += RECORD_HEADER_SIZE + data.len();
        self.written += (RECORD_HEADER_SIZE + data.len()) as u64;
        Ok(())
    }

    /// fsyncs the log file.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Bytes written so far (framing included).
    pub fn file_size(&self) -> u64 {
        self.written
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ------------------------------------------------------------------------------------------------
// LogReader
// ------------------------------------------------------------------------------------------------

/// Streams logical records out of a block-framed log file.
///
/// The reader always loads whole blocks at true 32 KiB boundaries and
/// tracks its position as `(block start, in-block offset)`, so resuming
/// after [`Self::unmark_eof`] re-reads the tail block and stays aligned
/// with the writer's framing.
#[derive(Debug)]
pub struct LogReader {
    file: File,
    path: PathBuf,

    /// Contents of the block at `block_start` (possibly partial).
    buffer: Vec<u8>,
    /// Aligned file offset of `buffer`.
    block_start: u64,
    /// Consumed bytes within the block.
    buffer_pos: usize,

    /// Set when the file ended mid-record; cleared by
    /// [`Self::unmark_eof`].
    eof: bool,
}

enum Physical {
    Fragment(u8, Vec<u8>),
    Eof,
}

impl LogReader {
    /// Opens a log file for sequential reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            file,
            path,
            buffer: Vec::new(),
            block_start: 0,
            buffer_pos: 0,
            eof: false,
        })
    }

    /// Reads the next logical record.
    ///
    /// Returns `Ok(None)` at end of file — including when the file ends
    /// in an incomplete record, which a crash or a concurrent appender
    /// produces.  Structural damage is reported as
    /// [`WalError::Corruption`]; the reader has already skipped past
    /// the damaged block when the error returns.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        if self.eof {
            return Ok(None);
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Where the current logical record began, for tail rewind.
        let mut record_start = self.current_offset();

        loop {
            match self.read_physical_record(in_fragmented_record, record_start)? {
                Physical::Eof => {
                    // A partial logical record at EOF is not corruption:
                    // the tail may still be growing.  read_physical_record
                    // has already rewound to `record_start`.
                    return Ok(None);
                }
                Physical::Fragment(TYPE_FULL, data) => {
                    if in_fragmented_record {
                        return Err(self.drop_block(
                            record_start,
                            "FULL record inside fragmented record".into(),
                        ));
                    }
                    return Ok(Some(data));
                }
                Physical::Fragment(TYPE_FIRST, data) => {
                    if in_fragmented_record {
                        return Err(self.drop_block(
                            record_start,
                            "FIRST record inside fragmented record".into(),
                        ));
                    }
                    in_fragmented_record = true;
                    scratch = data;
                }
                Physical::Fragment(TYPE_MIDDLE, data) => {
                    if !in_fragmented_record {
                        return Err(
                            self.drop_block(record_start, "MIDDLE record without FIRST".into())
                        );
                    }
                    scratch.extend_from_slice(&data);
                }
                Physical::Fragment(TYPE_LAST, data) => {
                    if !in_fragmented_record {
                        return Err(
                            self.drop_block(record_start, "LAST record without FIRST".into())
                        );
                    }
                    scratch.extend_from_slice(&data);
                    return Ok(Some(scratch));
                }
                Physical::Fragment(other, _) => {
                    return Err(
                        self.drop_block(record_start, format!("unknown record type {other}"))
                    );
                }
            }
            if !in_fragmented_record {
                record_start = self.current_offset();
            }
        }
    }

    /// Clears the end-of-file latch so reading can resume if the file
    /// has grown since the last [`Self::read_record`] returned `None`.
    pub fn unmark_eof(&mut self) {
        self.eof = false;
    }

    /// True once the reader has latched end-of-file.
    pub fn is_at_eof(&self) -> bool {
        self.eof
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current_offset(&self) -> u64 {
        self.block_start + self.buffer_pos as u64
    }

    /// Skips the rest of the current block and returns a corruption
    /// error anchored at `offset`.
    fn drop_block(&mut self, offset: u64, reason: String) -> WalError {
        warn!(path = %self.path.display(), offset, %reason, "log corruption; skipping block");
        self.buffer_pos = self.buffer.len();
        WalError::Corruption { offset, reason }
    }

    /// Latches EOF positioned at the absolute offset `offset`, clearing
    /// the buffer so the block is re-read from disk after
    /// `unmark_eof`.
    fn rewind_to(&mut self, offset: u64) {
        self.block_start = offset - (offset % BLOCK_SIZE as u64);
        self.buffer_pos = (offset % BLOCK_SIZE as u64) as usize;
        self.buffer.clear();
        self.eof = true;
    }

    fn read_physical_record(
        &mut self,
        in_fragmented_record: bool,
        record_start: u64,
    ) -> Result<Physical, WalError> {
        loop {
            let remaining = self.buffer.len().saturating_sub(self.buffer_pos);
            if remaining < RECORD_HEADER_SIZE {
                if self.buffer.len() == BLOCK_SIZE {
                    // Block exhausted; any sub-header tail is writer
                    // padding.  Move to the next block.
                    self.block_start += BLOCK_SIZE as u64;
                    self.buffer.clear();
                    self.buffer_pos = 0;
                }
                if !self.load_block()? {
                    let rewind = if in_fragmented_record {
                        record_start
                    } else {
                        self.current_offset()
                    };
                    self.rewind_to(rewind);
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_pos..self.buffer_pos + RECORD_HEADER_SIZE];
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type = header[6];

            if record_type == TYPE_ZERO && length == 0 {
                // Zero-filled region (preallocation); skip the block.
                self.buffer_pos = self.buffer.len();
                continue;
            }

            let frame_end = self.buffer_pos + RECORD_HEADER_SIZE + length;
            if frame_end > self.buffer.len() {
                if self.buffer.len() < BLOCK_SIZE {
                    // Payload truncated at the file tail.
                    let rewind = if in_fragmented_record {
                        record_start
                    } else {
                        self.current_offset()
                    };
                    self.rewind_to(rewind);
                    return Ok(Physical::Eof);
                }
                let offset = self.current_offset();
                return Err(self.drop_block(offset, "record length exceeds block".into()));
            }

            let payload = &self.buffer[self.buffer_pos + RECORD_HEADER_SIZE..frame_end];

            let mut hasher = Crc32::new();
            hasher.update(&[record_type]);
            hasher.update(payload);
            if hasher.finalize() != stored_crc {
                let offset = self.current_offset();
                return Err(self.drop_block(offset, "checksum mismatch".into()));
            }

            let data = payload.to_vec();
            self.buffer_pos = frame_end;
            return Ok(Physical::Fragment(record_type, data));
        }
    }

    /// (Re)loads the block at `block_start`.  Returns `true` when the
    /// load produced bytes beyond the already-consumed position.
    fn load_block(&mut self) -> Result<bool, WalError> {
        self.file.seek(SeekFrom::Start(self.block_start))?;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        block.truncate(filled);
        self.buffer = block;
        Ok(self.buffer.len() > self.buffer_pos)
    }
}
