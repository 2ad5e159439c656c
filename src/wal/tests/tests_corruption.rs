//! Corruption detection — flipped bytes, damaged headers, orphan
//! fragments.

#[cfg(test)]
mod tests {
    use crate::wal::{BLOCK_SIZE, LogReader, LogWriter, WalError};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn flip_byte(path: &std::path::Path, offset: u64) {
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut byte = [0u8; 1];
        use std::io::Read;
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
    }

    #[test]
    fn payload_flip_reports_checksum_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"record-one").unwrap();
        writer.sync().unwrap();

        // Flip a payload byte (header is 7 bytes).
        flip_byte(&path, 9);

        let mut reader = LogReader::open(&path).unwrap();
        match reader.read_record() {
            Err(WalError::Corruption { reason, .. }) => {
                assert!(reason.contains("checksum"), "unexpected reason: {reason}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn corruption_skips_to_next_block() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        // One record filling block 0 to within the 7-byte pad margin,
        // so the good record starts in block 1.
        let mut writer = LogWriter::create(&path).unwrap();
        let filler = vec![0x11_u8; BLOCK_SIZE - 10];
        writer.add_record(&filler).unwrap();
        writer.add_record(b"good-in-next-block").unwrap();
        writer.sync().unwrap();

        flip_byte(&path, 20);

        let mut reader = LogReader::open(&path).unwrap();
        // First read fails on the damaged record.
        assert!(reader.read_record().is_err());
        // Continuing after the error resumes at the next block.
        let mut survivors = Vec::new();
        while let Ok(Some(record)) = reader.read_record() {
            survivors.push(record);
        }
        assert!(survivors.iter().any(|r| r == b"good-in-next-block"));
    }

    #[test]
    fn orphan_middle_fragment_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        // Hand-craft a MIDDLE fragment with a valid checksum but no
        // preceding FIRST.
        let payload = b"orphan";
        let record_type = 3u8; // MIDDLE
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[record_type]);
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut frame = Vec::new();
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.push(record_type);
        frame.extend_from_slice(payload);
        std::fs::write(&path, &frame).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        match reader.read_record() {
            Err(WalError::Corruption { reason, .. }) => {
                assert!(reason.contains("MIDDLE"), "unexpected reason: {reason}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn impossible_length_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        // A full block whose first frame claims a payload longer than
        // the block itself.
        let mut block = vec![0u8; BLOCK_SIZE];
        block[4] = 0xFF;
        block[5] = 0x7F; // length ≈ 32k7, larger than the block remainder
        block[6] = 1; // FULL
        std::fs::write(&path, &block).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        match reader.read_record() {
            // Either framing error is acceptable: the length overruns
            // the block, or the zero checksum fails first.
            Err(WalError::Corruption { .. }) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
