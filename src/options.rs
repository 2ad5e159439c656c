//! Configuration surface — database, column-family, and per-call
//! option structs.
//!
//! All tunables live on these structs; the engine reads no environment
//! variables.  [`DbOptions::validate`] and
//! [`ColumnFamilyOptions::validate`] are applied on open and on column
//! family creation.

use std::sync::Arc;
use std::time::Duration;

use crate::compaction::CompactionFilter;
use crate::error::DbError;
use crate::keys::{BytewiseComparator, Comparator};
use crate::merge::MergeOperator;

// ------------------------------------------------------------------------------------------------
// Enums
// ------------------------------------------------------------------------------------------------

/// Compression algorithm id recorded in table files.
///
/// Codecs themselves are external collaborators; `None` is the only
/// codec this crate ships.  The id still participates in trivial-move
/// eligibility checks, because moving a file between levels must not
/// silently change its compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None,
    /// Snappy block compression.
    Snappy,
    /// zlib block compression.
    Zlib,
    /// LZ4 block compression.
    Lz4,
    /// bzip2 block compression.
    Bz2,
}

/// Tolerance policy for a corrupt WAL tail during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Stop replaying the damaged file at the first corrupt record and
    /// ignore the rest of it; open succeeds.
    TolerateCorruptedTailRecords,
    /// Any corruption aborts the open.
    AbsoluteConsistency,
    /// Replay up to the first corrupt record across all logs; open
    /// succeeds with the prefix.
    PointInTimeRecovery,
    /// Skip corrupt records and keep replaying, accepting gaps.
    SkipAnyCorruptedRecords,
}

// ------------------------------------------------------------------------------------------------
// DbOptions
// ------------------------------------------------------------------------------------------------

/// Database-wide configuration, shared by all column families.
#[derive(Clone)]
pub struct DbOptions {
    /// Create the database if the directory holds none.
    pub create_if_missing: bool,

    /// Fail the open if a database already exists.
    pub error_if_exists: bool,

    /// Escalate background flush/compaction failures into a read-only
    /// engine state that fails all subsequent writes.
    pub paranoid_checks: bool,

    /// Roll the MANIFEST to a fresh file once it exceeds this size.
    pub max_manifest_file_size: u64,

    /// Worker threads dedicated to memtable flushes (the high-priority
    /// pool).
    pub max_background_flushes: usize,

    /// Worker threads dedicated to compactions (the low-priority pool).
    pub max_background_compactions: usize,

    /// Archived WALs older than this many seconds are pruned.  Zero
    /// disables the TTL policy.
    pub wal_ttl_seconds: u64,

    /// Aggregate archived-WAL size cap in megabytes.  Zero disables the
    /// size policy.  When both policies are disabled, obsolete WALs are
    /// deleted instead of archived.
    pub wal_size_limit_mb: u64,

    /// WAL-tail corruption policy applied during recovery.
    pub recovery_mode: RecoveryMode,

    /// Bytes-per-second pacing applied to writes once the slowdown
    /// trigger is reached.
    pub delayed_write_rate: u64,

    /// Number of open table readers kept in the table cache.
    pub table_cache_capacity: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            max_manifest_file_size: 64 * 1024 * 1024,
            max_background_flushes: 1,
            max_background_compactions: 1,
            wal_ttl_seconds: 0,
            wal_size_limit_mb: 0,
            recovery_mode: RecoveryMode::PointInTimeRecovery,
            delayed_write_rate: 16 * 1024 * 1024,
            table_cache_capacity: 256,
        }
    }
}

impl DbOptions {
    /// Rejects nonsensical combinations before any file is touched.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.max_manifest_file_size == 0 {
            return Err(DbError::InvalidArgument(
                "max_manifest_file_size must be positive".into(),
            ));
        }
        if self.max_background_flushes == 0 || self.max_background_compactions == 0 {
            return Err(DbError::InvalidArgument(
                "background pools need at least one thread each".into(),
            ));
        }
        if self.table_cache_capacity == 0 {
            return Err(DbError::InvalidArgument(
                "table_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// ColumnFamilyOptions
// ------------------------------------------------------------------------------------------------

/// Per-column-family configuration.
#[derive(Clone)]
pub struct ColumnFamilyOptions {
    /// Max memtable size (bytes) before it is sealed and queued for
    /// flush.
    pub write_buffer_size: usize,

    /// Max memtables (active + immutable) held in memory; writers stall
    /// once the immutable list would exceed it.
    pub max_write_buffer_number: usize,

    /// Number of level-0 files that triggers a compaction into level 1.
    pub level0_file_num_compaction_trigger: usize,

    /// Number of level-0 files at which writes are delayed.
    pub level0_slowdown_writes_trigger: usize,

    /// Number of level-0 files at which writes stop entirely.
    pub level0_stop_writes_trigger: usize,

    /// Number of levels in the LSM hierarchy.
    pub num_levels: usize,

    /// Byte budget of level 1; deeper levels grow by
    /// `max_bytes_for_level_multiplier`.
    pub max_bytes_for_level_base: u64,

    /// Growth factor between consecutive level byte budgets.
    pub max_bytes_for_level_multiplier: f64,

    /// Target size of one compaction output file.
    pub max_output_file_size: u64,

    /// Cut a compaction output once it overlaps this many bytes of
    /// grandparent files.
    pub max_grandparent_overlap_bytes: u64,

    /// Compression id recorded in this family's table files.
    pub compression: CompressionType,

    /// Total order over user keys.
    pub comparator: Arc<dyn Comparator>,

    /// Associative operator applied to `Merge` entries.  Absent by
    /// default; merges fail with `NotSupported` without one.
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Optional entry filter consulted during compaction.
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            level0_file_num_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 8,
            level0_stop_writes_trigger: 12,
            num_levels: 7,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            max_bytes_for_level_multiplier: 10.0,
            max_output_file_size: 2 * 1024 * 1024,
            max_grandparent_overlap_bytes: 20 * 1024 * 1024,
            compression: CompressionType::None,
            comparator: Arc::new(BytewiseComparator),
            merge_operator: None,
            compaction_filter: None,
        }
    }
}

impl ColumnFamilyOptions {
    /// Rejects nonsensical combinations.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size == 0 {
            return Err(DbError::InvalidArgument(
                "write_buffer_size must be positive".into(),
            ));
        }
        if self.max_write_buffer_number < 2 {
            return Err(DbError::InvalidArgument(
                "max_write_buffer_number must be at least 2".into(),
            ));
        }
        if self.num_levels < 2 {
            return Err(DbError::InvalidArgument(
                "num_levels must be at least 2".into(),
            ));
        }
        if self.level0_file_num_compaction_trigger == 0 {
            return Err(DbError::InvalidArgument(
                "level0_file_num_compaction_trigger must be positive".into(),
            ));
        }
        if self.level0_slowdown_writes_trigger < self.level0_file_num_compaction_trigger
            || self.level0_stop_writes_trigger < self.level0_slowdown_writes_trigger
        {
            return Err(DbError::InvalidArgument(
                "level0 triggers must satisfy compaction <= slowdown <= stop".into(),
            ));
        }
        if self.max_bytes_for_level_multiplier < 1.0 {
            return Err(DbError::InvalidArgument(
                "max_bytes_for_level_multiplier must be >= 1.0".into(),
            ));
        }
        if self.max_output_file_size == 0 {
            return Err(DbError::InvalidArgument(
                "max_output_file_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Byte budget for `level` (level ≥ 1).
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut budget = self.max_bytes_for_level_base as f64;
        for _ in 1..level {
            budget *= self.max_bytes_for_level_multiplier;
        }
        budget as u64
    }
}

// ------------------------------------------------------------------------------------------------
// Per-call options
// ------------------------------------------------------------------------------------------------

/// Options applied to a single write (or write batch).
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging.
    pub sync: bool,

    /// Skip the WAL entirely; the write survives only until the
    /// memtable is lost.
    pub disable_wal: bool,

    /// Silently drop batch entries addressed to dropped column
    /// families instead of failing the write.
    pub ignore_missing_column_families: bool,

    /// Fail with `Incomplete` instead of stalling when the engine is
    /// applying write backpressure.
    pub no_slowdown: bool,

    /// Give up with `TimedOut` if the write cannot be scheduled within
    /// this window.
    pub timeout: Option<Duration>,
}

/// Options applied to a single read or iterator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Pin the read to this sequence number instead of the latest.
    pub snapshot: Option<crate::keys::SequenceNumber>,
}

// ------------------------------------------------------------------------------------------------
// Transaction options
// ------------------------------------------------------------------------------------------------

/// Per-transaction configuration.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Lock-acquisition deadline for each tracked operation.  `None`
    /// falls back to the transaction DB default.
    pub lock_timeout: Option<Duration>,

    /// Wall-clock lifetime of the transaction.  Once elapsed, its
    /// locks may be stolen and its commit fails with `Expired`.
    pub expiration: Option<Duration>,

    /// Pin a snapshot at `begin` for snapshot-isolation conflict
    /// checks in `get_for_update`.
    pub set_snapshot: bool,
}

/// Configuration of the pessimistic transaction layer.
#[derive(Debug, Clone)]
pub struct TransactionDbOptions {
    /// Number of lock-table stripes.
    pub num_stripes: usize,

    /// Default lock-acquisition deadline when a transaction sets none.
    pub default_lock_timeout: Duration,
}

impl Default for TransactionDbOptions {
    fn default() -> Self {
        Self {
            num_stripes: 16,
            default_lock_timeout: Duration::from_secs(1),
        }
    }
}
