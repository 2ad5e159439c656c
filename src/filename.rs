//! Database filename protocol.
//!
//! A database directory contains a fixed set of file kinds told apart
//! by name alone:
//!
//! | Name                  | Kind                                      |
//! |-----------------------|-------------------------------------------|
//! | `CURRENT`             | points at the live MANIFEST               |
//! | `LOCK`                | single-process guard                      |
//! | `IDENTITY`            | stable database id                        |
//! | `MANIFEST-<n>`        | version-edit log                          |
//! | `METADB-<n>`          | auxiliary metadata database               |
//! | `<n>.log`             | write-ahead log                           |
//! | `<n>.sst`             | table file                                |
//! | `<n>.dbtmp`           | transient install file                    |
//! | `LOG` / `LOG.old.<t>` | info log and its rotations                |
//!
//! WALs living under the `archive/` subdirectory parse the same but
//! are tagged as archived.
//!
//! The CURRENT install sequence (write temp, fsync, rename, fsync dir)
//! is crash-safe: the old CURRENT stays valid until the atomic rename
//! lands.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

/// Subdirectory of the WAL directory holding archived logs.
pub const ARCHIVE_DIR: &str = "archive";

// ------------------------------------------------------------------------------------------------
// File kinds
// ------------------------------------------------------------------------------------------------

/// The kind of a database file, parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileType {
    /// `CURRENT`.
    Current,
    /// `LOCK`.
    DbLock,
    /// `IDENTITY`.
    Identity,
    /// `MANIFEST-<n>`.
    Manifest(u64),
    /// `METADB-<n>`.
    MetaDb(u64),
    /// `<n>.log`; `archived` when it lives under `archive/`.
    WalFile {
        /// File number.
        number: u64,
        /// True when parsed from the archive subdirectory.
        archived: bool,
    },
    /// `<n>.sst`.
    TableFile(u64),
    /// `<n>.dbtmp`.
    TempFile(u64),
    /// `LOG`, or `LOG.old.<timestamp>` when rotated.
    InfoLog {
        /// Rotation timestamp, if any.
        old_timestamp: Option<u64>,
    },
}

/// Parses a file name (optionally prefixed with `archive/`) into its
/// kind.  Returns `None` for unknown names.
pub fn parse_file_name(name: &str) -> Option<FileType> {
    let (name, in_archive) = match name.strip_prefix("archive/") {
        Some(rest) => (rest, true),
        None => (name, false),
    };

    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::DbLock),
        "IDENTITY" => return Some(FileType::Identity),
        "LOG" => return Some(FileType::InfoLog { old_timestamp: None }),
        _ => {}
    }

    if let Some(ts) = name.strip_prefix("LOG.old.") {
        let ts: u64 = ts.parse().ok()?;
        return Some(FileType::InfoLog {
            old_timestamp: Some(ts),
        });
    }
    if let Some(num) = name.strip_prefix("MANIFEST-") {
        return parse_decimal(num).map(FileType::Manifest);
    }
    if let Some(num) = name.strip_prefix("METADB-") {
        return parse_decimal(num).map(FileType::MetaDb);
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return parse_decimal(stem).map(|number| FileType::WalFile {
            number,
            archived: in_archive,
        });
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return parse_decimal(stem).map(FileType::TableFile);
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        return parse_decimal(stem).map(FileType::TempFile);
    }
    None
}

/// Strict decimal parse: digits only, no sign, no trailing characters.
fn parse_decimal(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Name construction
// ------------------------------------------------------------------------------------------------

/// `<db>/CURRENT`
pub fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

/// `<db>/LOCK`
pub fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

/// `<db>/IDENTITY`
pub fn identity_file_name(db: &Path) -> PathBuf {
    db.join("IDENTITY")
}

/// `<db>/MANIFEST-<n>`
pub fn manifest_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("MANIFEST-{number:06}"))
}

/// `<dir>/<n>.log`
pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

/// `<dir>/archive/<n>.log`
pub fn archived_log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(ARCHIVE_DIR).join(format!("{number:06}.log"))
}

/// `<dir>/archive`
pub fn archive_dir(dir: &Path) -> PathBuf {
    dir.join(ARCHIVE_DIR)
}

/// `<db>/<n>.sst`
pub fn table_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.sst"))
}

/// `<db>/<n>.dbtmp`
pub fn temp_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.dbtmp"))
}

/// `<db>/LOG`
pub fn info_log_file_name(db: &Path) -> PathBuf {
    db.join("LOG")
}

// ------------------------------------------------------------------------------------------------
// Install protocols
// ------------------------------------------------------------------------------------------------

/// fsyncs a directory so a rename inside it is durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Points `CURRENT` at `MANIFEST-<manifest_number>`.
///
/// Sequence: write the MANIFEST basename + `\n` into
/// `<manifest_number>.dbtmp`, fsync the temp, rename it over
/// `CURRENT`, fsync the directory.  The rename is atomic on POSIX, so
/// a crash anywhere in this sequence leaves a valid CURRENT.
pub fn set_current_file(db: &Path, manifest_number: u64) -> io::Result<()> {
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let tmp = temp_file_name(db, manifest_number);

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    fs::rename(&tmp, current_file_name(db))?;
    fsync_dir(db)?;
    trace!(db = %db.display(), manifest_number, "CURRENT installed");
    Ok(())
}

/// Reads the MANIFEST basename out of `CURRENT`.
pub fn read_current_file(db: &Path) -> io::Result<String> {
    let raw = fs::read_to_string(current_file_name(db))?;
    let name = raw.trim_end_matches('\n');
    if name.is_empty() || raw == name {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "CURRENT is malformed (missing trailing newline)",
        ));
    }
    Ok(name.to_string())
}

/// Writes a fresh process-unique id into `IDENTITY` through the
/// `0.dbtmp` install path.  Returns the id.
pub fn write_identity_file(db: &Path) -> io::Result<String> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let id = format!(
        "{:016x}-{:08x}-{:04x}",
        nanos,
        process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );

    let tmp = temp_file_name(db, 0);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(id.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, identity_file_name(db))?;
    fsync_dir(db)?;
    Ok(id)
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_fixed_names() {
        assert_eq!(parse_file_name("CURRENT"), Some(FileType::Current));
        assert_eq!(parse_file_name("LOCK"), Some(FileType::DbLock));
        assert_eq!(parse_file_name("IDENTITY"), Some(FileType::Identity));
        assert_eq!(
            parse_file_name("LOG"),
            Some(FileType::InfoLog { old_timestamp: None })
        );
        assert_eq!(
            parse_file_name("LOG.old.1699999999"),
            Some(FileType::InfoLog {
                old_timestamp: Some(1_699_999_999)
            })
        );
    }

    #[test]
    fn parse_numbered_names() {
        assert_eq!(parse_file_name("MANIFEST-000007"), Some(FileType::Manifest(7)));
        assert_eq!(parse_file_name("METADB-12"), Some(FileType::MetaDb(12)));
        assert_eq!(
            parse_file_name("000042.log"),
            Some(FileType::WalFile {
                number: 42,
                archived: false
            })
        );
        assert_eq!(parse_file_name("000009.sst"), Some(FileType::TableFile(9)));
        assert_eq!(parse_file_name("000003.dbtmp"), Some(FileType::TempFile(3)));
    }

    #[test]
    fn parse_archived_wal() {
        assert_eq!(
            parse_file_name("archive/000042.log"),
            Some(FileType::WalFile {
                number: 42,
                archived: true
            })
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in [
            "MANIFEST-", "MANIFEST-abc", "MANIFEST-1x", "1.txt", "x.sst", "-1.log", "1.log.old",
            "CURRENTX", "manifest-1", "",
        ] {
            assert_eq!(parse_file_name(bad), None, "should reject {bad:?}");
        }
    }

    #[test]
    fn names_round_trip_through_parser() {
        let db = Path::new("/db");
        let cases: Vec<(PathBuf, FileType)> = vec![
            (manifest_file_name(db, 5), FileType::Manifest(5)),
            (
                log_file_name(db, 8),
                FileType::WalFile {
                    number: 8,
                    archived: false,
                },
            ),
            (table_file_name(db, 13), FileType::TableFile(13)),
            (temp_file_name(db, 2), FileType::TempFile(2)),
        ];
        for (path, expected) in cases {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_file_name(name), Some(expected), "name {name}");
        }
    }

    #[test]
    fn set_current_points_at_manifest() {
        let tmp = TempDir::new().unwrap();
        set_current_file(tmp.path(), 7).unwrap();
        assert_eq!(read_current_file(tmp.path()).unwrap(), "MANIFEST-000007");
        // The temp install file is gone.
        assert!(!temp_file_name(tmp.path(), 7).exists());

        // Re-pointing replaces atomically.
        set_current_file(tmp.path(), 9).unwrap();
        assert_eq!(read_current_file(tmp.path()).unwrap(), "MANIFEST-000009");
    }

    #[test]
    fn identity_is_unique_per_call() {
        let tmp = TempDir::new().unwrap();
        let first = write_identity_file(tmp.path()).unwrap();
        let second = write_identity_file(tmp.path()).unwrap();
        assert_ne!(first, second);
        let on_disk = std::fs::read_to_string(identity_file_name(tmp.path())).unwrap();
        assert_eq!(on_disk, second);
    }
}
