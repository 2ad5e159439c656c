//! Streaming iteration over one table file.

use std::sync::Arc;

use super::{TableError, TableReader, decode_block_entry};

/// Iterates `(internal key, value)` pairs in internal-key order.
///
/// Holds an `Arc` on its reader, so it can outlive the table cache
/// entry that produced it.  One decoded block is resident at a time;
/// block checksums are verified on load.
pub struct TableIterator {
    reader: Arc<TableReader>,
    next_block: usize,
    /// Decoded entries of the current block, drained front to back.
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    /// Sticky error: set once a block fails to load, then iteration
    /// ends.
    error: Option<TableError>,
}

impl TableIterator {
    pub(crate) fn new(reader: Arc<TableReader>) -> Self {
        Self {
            reader,
            next_block: 0,
            entries: Vec::new().into_iter(),
            error: None,
        }
    }

    /// The error that terminated iteration early, if any.
    pub fn take_error(&mut self) -> Option<TableError> {
        self.error.take()
    }

    fn load_next_block(&mut self) -> bool {
        while self.next_block < self.reader.num_blocks() {
            let block_index = self.next_block;
            self.next_block += 1;

            let decoded = (|| -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
                let mut data = self.reader.block_data(block_index)?;
                let input = &mut data;
                let mut out = Vec::new();
                while !input.is_empty() {
                    let (key, value) = decode_block_entry(input, self.reader.path())?;
                    out.push((key.to_vec(), value.to_vec()));
                }
                Ok(out)
            })();

            match decoded {
                Ok(entries) if entries.is_empty() => continue,
                Ok(entries) => {
                    self.entries = entries.into_iter();
                    return true;
                }
                Err(err) => {
                    self.error = Some(err);
                    return false;
                }
            }
        }
        false
    }
}

impl Iterator for TableIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some(entry);
            }
            if self.error.is_some() || !self.load_next_block() {
                return None;
            }
        }
    }
}

impl std::fmt::Debug for TableIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIterator")
            .field("path", &self.reader.path())
            .field("next_block", &self.next_block)
            .finish_non_exhaustive()
    }
}
