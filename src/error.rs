use std::{io, path::PathBuf};

use snafu::Snafu;
use uuid::Uuid;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error raised by any database operation.
///
/// Every failure carries one of a flat set of kinds so that callers can
/// discriminate programmatically (via [`Error::kind`] or by matching the
/// variant directly) without resorting to string comparisons.  The display
/// string is the human-facing side and includes the offending key, index, or
/// byte range where one exists.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A caller-supplied argument failed validation before any persistence
    /// was attempted.
    #[snafu(display("invalid input: {}", message))]
    InvalidInput { message: String },

    /// The operation is not legal in the current transaction state.
    #[snafu(display("invalid action: {}", message))]
    InvalidAction { message: String },

    /// The database path does not exist, has the wrong extension, or cannot
    /// be used for the requested mode.
    #[snafu(display("path error for '{}': {}", path.display(), message))]
    Path { path: PathBuf, message: String },

    /// An append to the underlying file failed.
    ///
    /// Different methods will capture specific I/O errors depending on the
    /// situation; all write-side I/O failures, including a lost or contended
    /// file lock, are reported as this variant.
    #[snafu(display("write I/O error: {}", source))]
    Write { source: io::Error },

    /// A positioned read from the underlying file failed.
    #[snafu(display("read I/O error: {}", source))]
    Read { source: io::Error },

    /// Header or row validation failed: a missing sentinel, a parity or
    /// CRC32 mismatch, or an unrecognized control byte.
    #[snafu(display("corrupt database: {}", message))]
    Corrupt { message: String },

    /// The key's UUIDv7 timestamp is too far behind the database.
    #[snafu(display(
        "key {} out of order: timestamp {}ms plus skew {}ms must exceed max timestamp {}ms",
        key,
        timestamp_ms,
        skew_ms,
        max_timestamp_ms
    ))]
    KeyOrdering {
        key: Uuid,
        timestamp_ms: u64,
        max_timestamp_ms: u64,
        skew_ms: u64,
    },

    /// The transaction was latched into a failed state by an earlier write
    /// error and can no longer be used.
    #[snafu(display("transaction is tombstoned by an earlier write failure"))]
    Tombstoned,

    /// No committed row carries the requested key, or the row that does was
    /// invalidated by a rollback.
    #[snafu(display("key {} not found", key))]
    KeyNotFound { key: Uuid },

    /// The row belongs to a transaction that has not yet been finalized.
    #[snafu(display("transaction containing the requested row is still active"))]
    TransactionActive,

    /// The stored bytes could not be decoded into the caller's destination.
    #[snafu(display("invalid data: {}", message))]
    InvalidData { message: String },
}

impl Error {
    /// Gets the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput { .. } => ErrorKind::InvalidInput,
            Error::InvalidAction { .. } => ErrorKind::InvalidAction,
            Error::Path { .. } => ErrorKind::Path,
            Error::Write { .. } => ErrorKind::Write,
            Error::Read { .. } => ErrorKind::Read,
            Error::Corrupt { .. } => ErrorKind::Corrupt,
            Error::KeyOrdering { .. } => ErrorKind::KeyOrdering,
            Error::Tombstoned => ErrorKind::Tombstoned,
            Error::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Error::TransactionActive => ErrorKind::TransactionActive,
            Error::InvalidData { .. } => ErrorKind::InvalidData,
        }
    }
}

/// Discriminant-only view of [`Error`], for matching and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidAction,
    Path,
    Write,
    Read,
    Corrupt,
    KeyOrdering,
    Tombstoned,
    KeyNotFound,
    TransactionActive,
    InvalidData,
}

pub(crate) fn invalid_input<S: Into<String>>(message: S) -> Error {
    Error::InvalidInput {
        message: message.into(),
    }
}

pub(crate) fn invalid_action<S: Into<String>>(message: S) -> Error {
    Error::InvalidAction {
        message: message.into(),
    }
}

pub(crate) fn corrupt<S: Into<String>>(message: S) -> Error {
    Error::Corrupt {
        message: message.into(),
    }
}

pub(crate) fn invalid_data<S: Into<String>>(message: S) -> Error {
    Error::InvalidData {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_discriminable_without_strings() {
        let errors = [
            invalid_input("x"),
            invalid_action("x"),
            corrupt("x"),
            invalid_data("x"),
            Error::Tombstoned,
            Error::TransactionActive,
        ];
        let kinds: Vec<ErrorKind> = errors.iter().map(Error::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::InvalidInput,
                ErrorKind::InvalidAction,
                ErrorKind::Corrupt,
                ErrorKind::InvalidData,
                ErrorKind::Tombstoned,
                ErrorKind::TransactionActive,
            ]
        );
    }

    #[test]
    fn display_includes_offending_key() {
        let key = Uuid::now_v7();
        let error = Error::KeyNotFound { key };
        assert!(error.to_string().contains(&key.to_string()));
    }
}
