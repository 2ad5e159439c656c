//! Crash recovery: WAL replay, recovery modes, tail truncation.

#[cfg(test)]
mod tests {
    use crate::db::Db;
    use crate::db::tests::helpers::*;
    use crate::filename::{FileType, parse_file_name};
    use crate::options::{DbOptions, RecoveryMode, WriteOptions};
    use tempfile::TempDir;

    /// Largest-numbered WAL in the directory.
    fn newest_wal(dir: &std::path::Path) -> std::path::PathBuf {
        let mut best: Option<(u64, std::path::PathBuf)> = None;
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            if let Some(FileType::WalFile { number, .. }) =
                parse_file_name(name.to_str().unwrap())
                && best.as_ref().is_none_or(|(n, _)| number > *n)
            {
                best = Some((number, entry.path()));
            }
        }
        best.expect("no WAL found").1
    }

    #[test]
    fn synced_writes_survive_unclean_shutdown() {
        let tmp = TempDir::new().unwrap();
        let sync = WriteOptions {
            sync: true,
            ..Default::default()
        };

        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            for i in 0..20u32 {
                db.put_opt(&sync, format!("k{i:02}").as_bytes(), b"durable")
                    .unwrap();
            }
            // No close, no flush: only the WAL has the data.
        }

        let db = Db::open(tmp.path(), db_options()).unwrap();
        for i in 0..20u32 {
            assert_eq!(
                db.get(format!("k{i:02}").as_bytes()).unwrap(),
                Some(b"durable".to_vec())
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn replay_is_idempotent_across_repeated_opens() {
        let tmp = TempDir::new().unwrap();
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            db.put(b"k", b"v").unwrap();
        }
        for _ in 0..3 {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
            db.close().unwrap();
        }
    }

    #[test]
    fn point_in_time_recovery_keeps_prefix_of_truncated_wal() {
        let tmp = TempDir::new().unwrap();
        let last_seq;
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            // 100-byte values so a 64-byte truncation destroys exactly
            // the final record.
            for i in 0..10u32 {
                db.put(format!("k{i}").as_bytes(), &vec![b'v'; 100]).unwrap();
            }
            last_seq = db.latest_sequence();
        }

        let wal = newest_wal(tmp.path());
        let len = std::fs::metadata(&wal).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&wal).unwrap();
        file.set_len(len - 64).unwrap();
        drop(file);

        let options = DbOptions {
            recovery_mode: RecoveryMode::PointInTimeRecovery,
            ..db_options()
        };
        let db = Db::open(tmp.path(), options).unwrap();

        // The recovered last sequence is that of the last complete
        // record.
        assert_eq!(db.latest_sequence(), last_seq - 1);
        for i in 0..9u32 {
            assert_eq!(
                db.get(format!("k{i}").as_bytes()).unwrap(),
                Some(vec![b'v'; 100]),
                "k{i}"
            );
        }
        assert_eq!(db.get(b"k9").unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn absolute_consistency_rejects_corrupt_wal() {
        let tmp = TempDir::new().unwrap();
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            for i in 0..10u32 {
                db.put(format!("k{i}").as_bytes(), &vec![b'v'; 100]).unwrap();
            }
        }

        // Flip a payload byte mid-WAL: a checksum failure, not a clean
        // truncation.
        let wal = newest_wal(tmp.path());
        let mut contents = std::fs::read(&wal).unwrap();
        let mid = contents.len() / 2;
        contents[mid] ^= 0xFF;
        std::fs::write(&wal, &contents).unwrap();

        let strict = DbOptions {
            recovery_mode: RecoveryMode::AbsoluteConsistency,
            ..db_options()
        };
        assert!(Db::open(tmp.path(), strict).is_err());

        // The tolerant mode opens with the prefix.
        let tolerant = DbOptions {
            recovery_mode: RecoveryMode::TolerateCorruptedTailRecords,
            ..db_options()
        };
        let db = Db::open(tmp.path(), tolerant).unwrap();
        assert_eq!(db.get(b"k0").unwrap(), Some(vec![b'v'; 100]));
        db.close().unwrap();
    }

    #[test]
    fn batch_atomicity_across_recovery() {
        let tmp = TempDir::new().unwrap();
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            let mut batch = crate::batch::WriteBatch::new();
            batch.put(b"x", b"1");
            batch.put(b"y", b"2");
            batch.put(b"z", b"3");
            db.write_opt(
                &WriteOptions {
                    sync: true,
                    ..Default::default()
                },
                batch,
            )
            .unwrap();
        }

        let db = Db::open(tmp.path(), db_options()).unwrap();
        assert_eq!(db.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"y").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(b"z").unwrap(), Some(b"3".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn deletions_survive_recovery() {
        let tmp = TempDir::new().unwrap();
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            db.put(b"k", b"v").unwrap();
            db.flush().unwrap();
            db.delete(b"k").unwrap();
        }
        let db = Db::open(tmp.path(), db_options()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn sequence_counter_resumes_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let before;
        {
            let db = Db::open(tmp.path(), db_options()).unwrap();
            for i in 0..25u32 {
                db.put(format!("k{i}").as_bytes(), b"v").unwrap();
            }
            before = db.latest_sequence();
        }

        let db = Db::open(tmp.path(), db_options()).unwrap();
        assert_eq!(db.latest_sequence(), before);
        db.put(b"new", b"v").unwrap();
        assert!(db.latest_sequence() > before);
        db.close().unwrap();
    }
}
