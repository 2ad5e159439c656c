//! WAL manager — listing, archival, and pruning of write-ahead logs.
//!
//! Obsolete WALs (no longer needed by any column family) are renamed
//! into `archive/` when an archival policy is active, otherwise they
//! are deleted outright.  Two pruning policies apply together to the
//! archive: a TTL on file modification time and an aggregate size cap
//! that removes oldest files first.  The pruner runs at most once per
//! `max(wal_ttl_seconds / 2, default interval)`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::error::DbError;
use crate::filename::{
    FileType, archive_dir, archived_log_file_name, log_file_name, parse_file_name,
};
use crate::keys::SequenceNumber;
use crate::options::DbOptions;
use crate::wal::LogReader;

const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// One write-ahead log known to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileInfo {
    /// WAL file number.
    pub number: u64,
    /// True when the file lives under `archive/`.
    pub archived: bool,
    /// Current path of the file.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Sequence number of the first batch in the file, 0 when empty.
    pub start_sequence: SequenceNumber,
}

/// Lists, archives, and prunes the WAL directory.
pub struct WalManager {
    wal_dir: PathBuf,
    options: DbOptions,
    /// Cached starting sequence per WAL number.
    start_sequences: Mutex<BTreeMap<u64, SequenceNumber>>,
    /// Last archive-pruning run.
    last_prune: Mutex<Option<Instant>>,
}

impl WalManager {
    /// Creates a manager over `wal_dir`.
    pub fn new(wal_dir: &Path, options: DbOptions) -> Self {
        Self {
            wal_dir: wal_dir.to_path_buf(),
            options,
            start_sequences: Mutex::new(BTreeMap::new()),
            last_prune: Mutex::new(None),
        }
    }

    /// True when obsolete WALs should be archived rather than deleted.
    pub fn archiving_enabled(&self) -> bool {
        self.options.wal_ttl_seconds > 0 || self.options.wal_size_limit_mb > 0
    }

    // --------------------------------------------------------------------
    // Listing
    // --------------------------------------------------------------------

    /// Enumerates live and archived WALs, de-duplicated (a file caught
    /// mid-rename appears once, as archived) and sorted by file number.
    pub fn sorted_wal_files(&self) -> Result<Vec<WalFileInfo>, DbError> {
        let mut by_number: BTreeMap<u64, WalFileInfo> = BTreeMap::new();

        for (dir, archived) in [
            (self.wal_dir.clone(), false),
            (archive_dir(&self.wal_dir), true),
        ] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) if archived => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(FileType::WalFile { number, .. }) = parse_file_name(name) else {
                    continue;
                };
                let path = entry.path();
                let size = match fs::metadata(&path) {
                    Ok(meta) => meta.len(),
                    // Lost a rename race; the other directory has it.
                    Err(_) => continue,
                };
                let info = WalFileInfo {
                    number,
                    archived,
                    path,
                    size,
                    start_sequence: 0,
                };
                // Archived beats live on a duplicate: the rename wins.
                match by_number.get(&number) {
                    Some(existing) if existing.archived => {}
                    _ => {
                        by_number.insert(number, info);
                    }
                }
            }
        }

        let mut files: Vec<WalFileInfo> = by_number.into_values().collect();
        for file in &mut files {
            file.start_sequence = self.start_sequence_of(file)?;
        }
        Ok(files)
    }

    /// First batch sequence of a WAL, cached per file number.
    fn start_sequence_of(&self, file: &WalFileInfo) -> Result<SequenceNumber, DbError> {
        if let Ok(cache) = self.start_sequences.lock()
            && let Some(seq) = cache.get(&file.number)
        {
            return Ok(*seq);
        }

        let mut reader = LogReader::open(&file.path)?;
        let seq = match reader.read_record() {
            Ok(Some(record)) => WriteBatch::from_data(record)?.sequence(),
            Ok(None) => 0,
            Err(err) => {
                warn!(number = file.number, error = %err, "unreadable WAL head while probing start sequence");
                0
            }
        };
        if seq != 0
            && let Ok(mut cache) = self.start_sequences.lock()
        {
            cache.insert(file.number, seq);
        }
        Ok(seq)
    }

    /// WALs whose first sequence is ≤ `seq` ≤ last known batch — i.e.
    /// every file that may contain `seq` or later batches.
    pub fn files_from_sequence(&self, seq: SequenceNumber) -> Result<Vec<WalFileInfo>, DbError> {
        let files = self.sorted_wal_files()?;
        // Keep every file from the last one starting at or before
        // `seq` onwards.
        let first_idx = files
            .iter()
            .rposition(|f| f.start_sequence != 0 && f.start_sequence <= seq)
            .unwrap_or(0);
        Ok(files[first_idx..].to_vec())
    }

    // --------------------------------------------------------------------
    // Archival
    // --------------------------------------------------------------------

    /// Moves a no-longer-needed WAL out of the live directory:
    /// renamed into `archive/` when archiving is configured, deleted
    /// otherwise.
    pub fn archive_wal(&self, number: u64) -> Result<(), DbError> {
        let live = log_file_name(&self.wal_dir, number);
        if !live.exists() {
            return Ok(());
        }
        if self.archiving_enabled() {
            fs::create_dir_all(archive_dir(&self.wal_dir))?;
            let target = archived_log_file_name(&self.wal_dir, number);
            fs::rename(&live, &target)?;
            info!(number, "WAL archived");
        } else {
            fs::remove_file(&live)?;
            self.start_sequences.lock().ok().map(|mut c| c.remove(&number));
            debug!(number, "WAL deleted");
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Pruning
    // --------------------------------------------------------------------

    /// Applies the TTL and size-cap policies to the archive.  Runs at
    /// most once per interval unless `force` is set.
    pub fn prune_archive(&self, force: bool) -> Result<(), DbError> {
        let interval = if self.options.wal_ttl_seconds > 0 {
            DEFAULT_PRUNE_INTERVAL.max(Duration::from_secs(self.options.wal_ttl_seconds / 2))
        } else {
            DEFAULT_PRUNE_INTERVAL
        };
        {
            let mut last = self
                .last_prune
                .lock()
                .map_err(|_| DbError::Internal("wal manager lock poisoned".into()))?;
            if !force
                && let Some(at) = *last
                && at.elapsed() < interval
            {
                return Ok(());
            }
            *last = Some(Instant::now());
        }

        let archive = archive_dir(&self.wal_dir);
        let entries = match fs::read_dir(&archive) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        let mut archived: Vec<(u64, PathBuf, u64, SystemTime)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(FileType::WalFile { number, .. }) = parse_file_name(name) else {
                continue;
            };
            let meta = entry.metadata()?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            archived.push((number, entry.path(), meta.len(), modified));
        }
        archived.sort_by_key(|(number, ..)| *number);

        let mut removed = 0usize;

        // TTL: drop archived files older than wal_ttl_seconds.
        if self.options.wal_ttl_seconds > 0 {
            let ttl = Duration::from_secs(self.options.wal_ttl_seconds);
            let now = SystemTime::now();
            archived.retain(|(number, path, _, modified)| {
                let expired = now
                    .duration_since(*modified)
                    .map(|age| age > ttl)
                    .unwrap_or(false);
                if expired {
                    if let Err(err) = fs::remove_file(path) {
                        warn!(number, error = %err, "failed to prune archived WAL");
                        return true;
                    }
                    removed += 1;
                    return false;
                }
                true
            });
        }

        // Size cap: drop oldest files until under the limit.
        if self.options.wal_size_limit_mb > 0 {
            let limit = self.options.wal_size_limit_mb * 1024 * 1024;
            let mut total: u64 = archived.iter().map(|(_, _, size, _)| *size).sum();
            for (number, path, size, _) in &archived {
                if total <= limit {
                    break;
                }
                if let Err(err) = fs::remove_file(path) {
                    warn!(number, error = %err, "failed to prune archived WAL");
                    continue;
                }
                total -= size;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "archived WALs pruned");
        }
        Ok(())
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("wal_dir", &self.wal_dir)
            .field("ttl_seconds", &self.options.wal_ttl_seconds)
            .field("size_limit_mb", &self.options.wal_size_limit_mb)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
