//! Table cache — LRU of open table readers keyed by file number.
//!
//! Readers are shared as `Arc<TableReader>`; an entry that is pinned
//! (still referenced by an iterator or a running compaction) is never
//! evicted, only unlinked from the LRU once its other holders drop it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::DbError;
use crate::filename::table_file_name;
use crate::keys::InternalKeyComparator;
use crate::table::TableReader;

struct CacheInner {
    map: HashMap<u64, Arc<TableReader>>,
    /// Most-recent first.
    lru: VecDeque<u64>,
}

/// Shared cache of open `(file number → TableReader)` entries.
pub struct TableCache {
    db_path: PathBuf,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl TableCache {
    /// Creates a cache for tables under `db_path`.
    pub fn new(db_path: &Path, capacity: usize) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    /// Returns the reader for `file_number`, opening it on a miss.
    ///
    /// `icmp` is the comparator of the owning column family; it only
    /// matters on a miss, since a cached reader was opened with its
    /// own family's comparator.
    pub fn get(
        &self,
        file_number: u64,
        icmp: &InternalKeyComparator,
    ) -> Result<Arc<TableReader>, DbError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| DbError::Internal("table cache lock poisoned".into()))?;

        if let Some(reader) = inner.map.get(&file_number).cloned() {
            inner.lru.retain(|n| *n != file_number);
            inner.lru.push_front(file_number);
            return Ok(reader);
        }

        let path = table_file_name(&self.db_path, file_number);
        let reader = Arc::new(TableReader::open(&path, icmp.clone())?);
        inner.map.insert(file_number, Arc::clone(&reader));
        inner.lru.push_front(file_number);
        trace!(file_number, "table cache fill");

        // Evict cold, unpinned entries beyond capacity.  Pinned entries
        // (strong count > 1 beyond the map) are skipped.
        if inner.lru.len() > self.capacity {
            let mut kept = VecDeque::new();
            while let Some(number) = inner.lru.pop_back() {
                let over_capacity = inner.lru.len() + kept.len() + 1 > self.capacity;
                let pinned = inner
                    .map
                    .get(&number)
                    .map(|r| Arc::strong_count(r) > 1)
                    .unwrap_or(false);
                if over_capacity && !pinned && number != file_number {
                    inner.map.remove(&number);
                    trace!(file_number = number, "table cache evict");
                } else {
                    kept.push_front(number);
                }
            }
            inner.lru = kept;
        }

        Ok(reader)
    }

    /// Drops the cached reader for a deleted file.
    pub fn evict(&self, file_number: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.remove(&file_number);
            inner.lru.retain(|n| *n != file_number);
        }
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
