//! # frozenDB: an embedded, append-only, single-file key-value store.
//!
//! Keys are time-ordered 128-bit identifiers (UUIDv7); values are opaque
//! JSON byte strings.  Committed data is byte-level immutable, corruption
//! is detected by per-row parity plus per-block CRC32, and multi-row
//! transactions support savepoints and partial rollback.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the design simple and
//! understandable:
//! - the database is exactly one file; rows are fixed-width
//! - the file is strictly append-only: a byte, once acknowledged, never
//!   changes
//! - every row carries two longitudinal parity bytes; every block of
//!   10,000 rows is closed by a CRC32 checksum row
//! - at most one partial row exists, and only at the tail of the file
//! - at most one transaction is active per writable handle, and its full
//!   state is recoverable from the file tail alone
//! - writers append through a single task owning the file handle, while
//!   readers perform positioned reads below a length snapshot
//!
//! ## On-disk layout
//!
//! The file opens with a 64-byte JSON header and the checksum row covering
//! it, followed by fixed-width rows:
//!
//!   row:
//!     `row_start`:   0x1F
//!     `start_ctl`:   'T' | 'R' | 'C'
//!     `key`:         24-byte Base64 of the 16-byte key (8-byte Base64
//!                    CRC32 for checksum rows)
//!     `value`:       JSON bytes, null-padded (data rows only)
//!     `end_ctl`:     2 bytes classifying commit/continue/rollback state
//!     `parity`:      2 bytes, longitudinal XOR of the rest of the row
//!     `row_end`:     0x0A
//!
//! ## Writing rows
//!
//! A transaction's current row grows on disk in append-only increments:
//! `begin` writes the two opening bytes, the first `add` writes key, value
//! and padding, `savepoint` writes the single marker byte, and the next
//! `add`/`commit`/`rollback` writes the five (or four) trailer bytes that
//! finalize it.  Each public call issues exactly one append, so a crash at
//! any point leaves one of the decodable partial sub-states at the tail,
//! from which the next writable open rebuilds the transaction.
//!
//! ## Reading rows
//!
//! `get` resolves a key through a [`FinderStrategy`]: a linear scan, an
//! in-memory map, or a timestamp bisection that exploits the UUIDv7
//! ordering invariant.  The committed value is only returned after the
//! rollback visibility rules of the owning transaction are applied.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)] // UUIDv7, CRC32, and friends read better bare
#![allow(clippy::cast_possible_truncation)] // index/width arithmetic is range-checked at the callers
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]

#[macro_use]
extern crate tracing;

mod checksum;
mod db;
mod error;
mod finder;
mod header;
mod io;
mod row;
mod transaction;

#[cfg(test)]
mod tests;

pub use checksum::CHECKSUM_INTERVAL;
pub use db::{Database, OpenMode};
pub use error::{Error, ErrorKind, Result};
pub use finder::FinderStrategy;
pub use header::{Header, FORMAT_VERSION, HEADER_LEN, MAX_ROW_SIZE, MAX_SKEW_MS, MIN_ROW_SIZE, SIGNATURE};
pub use row::{ChecksumRow, DataRow, EndControl, NullRow, PartialRow, Row, StartControl};
pub use transaction::{Transaction, TransactionStatus};
