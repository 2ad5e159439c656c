//! Shared test scaffolding for engine-level tests.

use crate::options::{ColumnFamilyOptions, DbOptions};
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`.  Safe to call from
/// every test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Database options for tests.
pub fn db_options() -> DbOptions {
    init_tracing();
    DbOptions::default()
}

/// Column family options with a large write buffer — no implicit
/// flushes.
pub fn memtable_only_cf() -> ColumnFamilyOptions {
    ColumnFamilyOptions {
        write_buffer_size: 64 * 1024 * 1024,
        ..Default::default()
    }
}

/// Column family options with a tiny write buffer, forcing frequent
/// memtable seals and level-0 files.
pub fn small_buffer_cf() -> ColumnFamilyOptions {
    ColumnFamilyOptions {
        write_buffer_size: 4 * 1024,
        level0_file_num_compaction_trigger: 4,
        level0_slowdown_writes_trigger: 20,
        level0_stop_writes_trigger: 30,
        max_bytes_for_level_base: 64 * 1024,
        max_output_file_size: 16 * 1024,
        ..Default::default()
    }
}

/// Default descriptors with the given default-CF options.
pub fn descriptors(cf: ColumnFamilyOptions) -> Vec<(String, ColumnFamilyOptions)> {
    vec![("default".to_string(), cf)]
}
