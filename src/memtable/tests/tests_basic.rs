//! Basic insert/lookup behavior.

#[cfg(test)]
mod tests {
    use crate::keys::{MAX_SEQUENCE_NUMBER, ValueType, parse_internal_key};
    use crate::lookup::GetContext;
    use crate::memtable::Memtable;

    fn get(mem: &Memtable, key: &[u8], snapshot: u64) -> Option<Vec<u8>> {
        let mut ctx = GetContext::new(key, None);
        mem.get(key, snapshot, &mut ctx).unwrap();
        ctx.finish().unwrap()
    }

    #[test]
    fn put_then_get() {
        let mem = Memtable::new(1, 0);
        mem.add(1, ValueType::Value, b"k", b"v").unwrap();
        assert_eq!(get(&mem, b"k", MAX_SEQUENCE_NUMBER), Some(b"v".to_vec()));
        assert_eq!(get(&mem, b"missing", MAX_SEQUENCE_NUMBER), None);
    }

    #[test]
    fn deletion_hides_value() {
        let mem = Memtable::new(1, 0);
        mem.add(1, ValueType::Value, b"k", b"v").unwrap();
        mem.add(2, ValueType::Deletion, b"k", b"").unwrap();
        assert_eq!(get(&mem, b"k", MAX_SEQUENCE_NUMBER), None);
    }

    #[test]
    fn size_and_counters_track_inserts() {
        let mem = Memtable::new(7, 0);
        assert!(mem.is_empty());
        assert_eq!(mem.log_number(), 7);

        mem.add(10, ValueType::Value, b"a", b"1").unwrap();
        mem.add(11, ValueType::Value, b"b", b"2").unwrap();
        mem.add(12, ValueType::Deletion, b"a", b"").unwrap();

        assert_eq!(mem.num_entries(), 3);
        assert!(mem.approximate_memory_usage() > 0);
        assert_eq!(mem.first_sequence(), 10);
        assert_eq!(mem.largest_sequence(), 12);
    }

    #[test]
    fn iter_all_is_internal_key_ordered() {
        let mem = Memtable::new(1, 0);
        mem.add(3, ValueType::Value, b"b", b"b3").unwrap();
        mem.add(1, ValueType::Value, b"a", b"a1").unwrap();
        mem.add(2, ValueType::Value, b"b", b"b2").unwrap();

        let entries = mem.iter_all().unwrap();
        let parsed: Vec<(Vec<u8>, u64)> = entries
            .iter()
            .map(|(ikey, _)| {
                let p = parse_internal_key(ikey).unwrap();
                (p.user_key.to_vec(), p.sequence)
            })
            .collect();

        // User key ascending, sequence descending within a key.
        assert_eq!(
            parsed,
            vec![
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 3),
                (b"b".to_vec(), 2),
            ]
        );
    }

    #[test]
    fn iter_range_respects_bounds() {
        let mem = Memtable::new(1, 0);
        for (i, key) in [&b"apple"[..], &b"berry"[..], &b"cherry"[..]]
            .iter()
            .enumerate()
        {
            mem.add(i as u64 + 1, ValueType::Value, *key, b"x").unwrap();
        }

        let entries = mem.iter_range(Some(b"b"), Some(b"c")).unwrap();
        assert_eq!(entries.len(), 1);
        let parsed = parse_internal_key(&entries[0].0).unwrap();
        assert_eq!(parsed.user_key, b"berry");
    }

    #[test]
    fn latest_sequence_for_key() {
        let mem = Memtable::new(1, 0);
        mem.add(5, ValueType::Value, b"k", b"v5").unwrap();
        mem.add(9, ValueType::Value, b"k", b"v9").unwrap();
        assert_eq!(mem.latest_sequence_for_key(b"k").unwrap(), Some(9));
        assert_eq!(mem.latest_sequence_for_key(b"other").unwrap(), None);
    }
}
