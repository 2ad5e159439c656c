//! Error taxonomy surfaced at the public API.
//!
//! Every operation returns `Result<_, DbError>`.  Subsystem errors
//! (`WalError`, `TableError`, `VersionError`, …) fold upward via
//! `From` conversions so call sites propagate with `?`.
//!
//! `NotFound` is not an error: point reads return `Ok(None)`.

use std::io;

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::keys::KeyError;

/// The status taxonomy of the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch or structurally invalid persistent data.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The operation is not supported in this configuration.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The caller passed an invalid argument or configuration.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A merge chain could not be resolved by the configured operator.
    #[error("Merge in progress: {0}")]
    MergeInProgress(String),

    /// The operation could not complete without blocking and the
    /// caller asked not to block.
    #[error("Incomplete: {0}")]
    Incomplete(String),

    /// The engine is shutting down.
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// A lock or write slot could not be acquired within the deadline.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// The operation was aborted.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// A conflicting newer write was detected (snapshot-isolation
    /// validation failure).
    #[error("Busy: {0}")]
    Busy(String),

    /// The transaction expired and its locks were stolen.
    #[error("Expired: {0}")]
    Expired(String),

    /// Validation state was flushed out of memory; the caller should
    /// retry the whole operation.
    #[error("Try again: {0}")]
    TryAgain(String),

    /// Wire-format decode failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal-key pack/parse failure.
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Internal invariant violation (poisoned lock, impossible state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// True when the error came from data corruption rather than the
    /// environment or the caller.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Rebuilds an equivalent error from a shared one.
    ///
    /// The group committer posts one failure to every writer in a
    /// group; each caller receives its own value with the same kind and
    /// message.
    pub(crate) fn duplicate(&self) -> DbError {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Corruption(msg) => Self::Corruption(msg.clone()),
            Self::NotSupported(msg) => Self::NotSupported(msg.clone()),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::MergeInProgress(msg) => Self::MergeInProgress(msg.clone()),
            Self::Incomplete(msg) => Self::Incomplete(msg.clone()),
            Self::ShutdownInProgress => Self::ShutdownInProgress,
            Self::TimedOut(msg) => Self::TimedOut(msg.clone()),
            Self::Aborted(msg) => Self::Aborted(msg.clone()),
            Self::Busy(msg) => Self::Busy(msg.clone()),
            Self::Expired(msg) => Self::Expired(msg.clone()),
            Self::TryAgain(msg) => Self::TryAgain(msg.clone()),
            other => Self::Internal(other.to_string()),
        }
    }
}
