//! # BasaltDB
//!
//! An embeddable, ordered, crash-safe key-value storage engine built on
//! a **leveled log-structured merge tree**, with column families,
//! snapshots, merge operators, and ACID transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Db                                │
//! │  writes ─► group committer ─► WAL ─► memtable per CF       │
//! │                                  │ seal                    │
//! │                                  ▼                         │
//! │                        immutable memtables ─► flush ─► L0  │
//! │                                                        │   │
//! │  levels L0..Ln of immutable sorted tables ◄─ compaction┘   │
//! │                                                            │
//! │  VersionSet + MANIFEST: crash-safe file placement          │
//! │  TransactionDb / OptimisticTransactionDb: ACID layers      │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Engine handle — open, read, write, iterate, flush, compact |
//! | [`batch`] | Atomic multi-key write batches with savepoints |
//! | [`memtable`] | Multi-version in-memory write buffer |
//! | [`wal`] | Block-framed, CRC-protected record log |
//! | [`table`] | Immutable sorted table files (bloom filters, mmap reads) |
//! | [`version`] | Versioned file placement + MANIFEST state machine |
//! | [`compaction`] | Leveled compaction picker and job |
//! | [`wal_manager`] | WAL listing, archival, TTL/size pruning |
//! | [`txn`] | Pessimistic and optimistic transactions |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use basaltdb::{Db, DbOptions};
//!
//! let db = Db::open("/tmp/my_db", DbOptions::default())?;
//!
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! // Snapshot-pinned reads.
//! let snapshot = db.snapshot();
//! db.put(b"hello", b"moon")?;
//! let read = basaltdb::ReadOptions { snapshot: Some(snapshot.sequence()) };
//! assert_eq!(db.get_opt(&read, b"hello")?, Some(b"world".to_vec()));
//!
//! db.close()?;
//! # Ok::<(), basaltdb::DbError>(())
//! ```

pub mod batch;
pub mod compaction;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filename;
pub mod keys;
pub mod lookup;
pub mod memtable;
pub mod merge;
pub mod options;
pub mod table;
pub mod table_cache;
pub mod txn;
pub mod version;
pub mod wal;
pub mod wal_manager;

pub use batch::WriteBatch;
pub use db::{Db, DbIterator, Snapshot, TransactionLogIterator};
pub use error::DbError;
pub use keys::{Comparator, SequenceNumber};
pub use merge::MergeOperator;
pub use options::{
    ColumnFamilyOptions, CompressionType, DbOptions, ReadOptions, RecoveryMode,
    TransactionDbOptions, TransactionOptions, WriteOptions,
};
pub use txn::{OptimisticTransaction, OptimisticTransactionDb, Transaction, TransactionDb};
