use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
///
/// Every public entry point returns exactly one of these kinds; the
/// variants are stable identities suitable for equality testing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The database has been closed.
    DbClosed,
    /// The transaction has already been committed or rolled back.
    TxClosed,
    /// A write operation was attempted on a read-only transaction.
    TxNotWritable,
    /// An empty key was passed to an update operation.
    KeyEmpty,
    /// An empty bucket name was passed to an update operation.
    BucketEmpty,
    /// A single entry is larger than the segment size.
    DataSizeExceed,
    /// Too many writes were batched into a single transaction.
    TxnTooBig,
    /// Commit was called on a closed transaction.
    CannotCommitAClosedTx,
    /// Rollback was called on a closed transaction.
    CannotRollbackAClosedTx,
    /// Rollback was called while the transaction was committing.
    CannotRollbackACommittingTx,
    /// The bucket does not exist.
    NotFoundBucket,
    /// The key does not exist in the bucket.
    NotFoundKey,
    /// A range scan found no results.
    RangeScan,
    /// A prefix scan found no results.
    PrefixScan,
    /// A prefix and search scan found no results.
    PrefixSearchScan,
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DbClosed => write!(f, "db is closed"),
            Error::TxClosed => write!(f, "tx is closed"),
            Error::TxNotWritable => write!(f, "tx not writable"),
            Error::KeyEmpty => write!(f, "key cannot be empty"),
            Error::BucketEmpty => write!(f, "bucket is empty"),
            Error::DataSizeExceed => write!(f, "data size too big"),
            Error::TxnTooBig => write!(f, "txn is too big to fit into one request"),
            Error::CannotCommitAClosedTx => write!(f, "can not commit a closed tx"),
            Error::CannotRollbackAClosedTx => write!(f, "can not rollback a closed tx"),
            Error::CannotRollbackACommittingTx => write!(f, "can not rollback a committing tx"),
            Error::NotFoundBucket => write!(f, "bucket not found"),
            Error::NotFoundKey => write!(f, "key not found in the bucket"),
            Error::RangeScan => write!(f, "range scans not found"),
            Error::PrefixScan => write!(f, "prefix scans not found"),
            Error::PrefixSearchScan => write!(f, "prefix and search scans not found"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}
