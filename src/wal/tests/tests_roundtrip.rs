//! Writer/reader round-trip tests, including block-spanning records.

#[cfg(test)]
mod tests {
    use crate::wal::{BLOCK_SIZE, LogReader, LogWriter};
    use tempfile::TempDir;

    fn read_all(path: &std::path::Path) -> Vec<Vec<u8>> {
        let mut reader = LogReader::open(path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn single_small_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"hello wal").unwrap();
        writer.sync().unwrap();

        assert_eq!(read_all(&path), vec![b"hello wal".to_vec()]);
    }

    #[test]
    fn many_records_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        let mut writer = LogWriter::create(&path).unwrap();
        let payloads: Vec<Vec<u8>> = (0..500)
            .map(|i| format!("record-{i:05}").into_bytes())
            .collect();
        for payload in &payloads {
            writer.add_record(payload).unwrap();
        }
        writer.sync().unwrap();

        assert_eq!(read_all(&path), payloads);
    }

    #[test]
    fn empty_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"").unwrap();
        writer.add_record(b"after-empty").unwrap();

        assert_eq!(read_all(&path), vec![Vec::new(), b"after-empty".to_vec()]);
    }

    #[test]
    fn record_spanning_multiple_blocks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        // Two and a half blocks of patterned payload.
        let big: Vec<u8> = (0..BLOCK_SIZE * 5 / 2).map(|i| (i % 251) as u8).collect();

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"before").unwrap();
        writer.add_record(&big).unwrap();
        writer.add_record(b"after").unwrap();

        let records = read_all(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], b"before");
        assert_eq!(records[1], big);
        assert_eq!(records[2], b"after");
    }

    #[test]
    fn records_crossing_block_boundary_padding() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        // Payload sized so consecutive records land close to the block
        // boundary, exercising the <7-byte zero-pad trailer path.
        let payload = vec![0x5A_u8; 1000];
        let mut writer = LogWriter::create(&path).unwrap();
        let n = (BLOCK_SIZE * 3) / (payload.len() + 7) + 2;
        for _ in 0..n {
            writer.add_record(&payload).unwrap();
        }

        let records = read_all(&path);
        assert_eq!(records.len(), n);
        assert!(records.iter().all(|r| r == &payload));
    }

    #[test]
    fn reopen_for_append_continues() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");

        {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.add_record(b"first").unwrap();
            writer.sync().unwrap();
        }
        {
            let mut writer = LogWriter::open_for_append(&path).unwrap();
            writer.add_record(b"second").unwrap();
            writer.sync().unwrap();
        }

        assert_eq!(read_all(&path), vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
