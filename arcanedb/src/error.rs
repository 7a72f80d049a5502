use std::fmt::{Display, Formatter};
use serde_derive::{Deserialize, Serialize};

/// Crate-wide result type.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors and non-success statuses of the engine.
///
/// Reads and commits report their outcome through these variants: a read that
/// finds nothing is `NotFound`, a read that lands on a tombstone is `Deleted`
/// (usually surfaced to callers as `NotFound`), and a failed commit is
/// `TxnAbort`. Successful operations are plain `Ok(())`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The key does not exist at the read timestamp.
    NotFound,

    /// The key is tombstoned at the read timestamp.
    Deleted,

    /// A visible intent owned by another transaction. The caller may retry
    /// or abort.
    TxnConflict,

    /// A lock wait exceeded the timeout.
    Timeout,

    /// OCC validation failed, or an intent write failed. Locks have been
    /// released and intents marked aborted by the time this surfaces.
    TxnAbort,

    /// Ran off the end of a buffer while decoding.
    EndOfBuf,

    /// Persisted data failed to decode.
    Corrupted(String),

    /// Invariant violation or unsupported operation.
    Internal(String),

    /// I/O error from the underlying storage medium.
    IO(String),
}

impl Error {
    /// Whether the error is `NotFound` or `Deleted`, i.e. the key has no
    /// visible live value.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound | Error::Deleted)
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Deleted => write!(f, "deleted"),
            Error::TxnConflict => write!(f, "transaction conflict"),
            Error::Timeout => write!(f, "lock wait timed out"),
            Error::TxnAbort => write!(f, "transaction aborted"),
            Error::EndOfBuf => write!(f, "end of buffer"),
            Error::Corrupted(msg) => write!(f, "corrupted data: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::IO(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Corrupted(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::Corrupted(err.to_string())
    }
}
