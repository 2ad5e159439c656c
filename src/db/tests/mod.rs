pub mod helpers;
mod tests_merge;
mod tests_recovery;
mod tests_wal_stream;
