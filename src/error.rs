use std::io;
use thiserror::Error;

/// Result type for directory store operations.
pub type Result<T> = std::result::Result<T, DirError>;

/// Errors that can occur during directory store operations.
///
/// Every public API in the engine returns `Result<T, DirError>`. Callers at
/// the protocol boundary translate these kinds into result codes.
#[derive(Debug, Error)]
pub enum DirError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Requested resource was not found.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Resource already exists (duplicate DN, duplicate unique key, existing index).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An empty key was handed to an index operation.
    #[error("empty key")]
    KeyEmpty,

    /// Index key exceeds the maximum supported length.
    #[error("key of {0} bytes exceeds maximum key size")]
    KeyTooLarge(usize),

    /// Data corruption detected (bad page layout, torn record, broken chain).
    #[error("corruption detected: {0}")]
    Corrupted(String),

    /// A stored checksum did not match the recomputed one.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// File carries an unknown magic or an unsupported format version.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Operation on a transaction that has already committed or rolled back.
    #[error("transaction is closed")]
    TxClosed,

    /// Mutation attempted against a store opened read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// Operation on an engine that has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration value or operation argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The latest visible version for the DN is a tombstone.
    #[error("version is deleted")]
    VersionDeleted,

    /// A version chain exists but no version is visible to the snapshot.
    #[error("no visible version for snapshot")]
    NoVisibleVersion,

    /// Iterator or operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
}
