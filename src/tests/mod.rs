use std::{
    future::Future,
    path::{Path, PathBuf},
};

use temp_dir::TempDir;
use uuid::Uuid;

use crate::{row::key_from_parts, Database, FinderStrategy, OpenMode};

mod recovery;

pub(crate) const TEST_ROW_SIZE: u32 = 128;
pub(crate) const TEST_SKEW_MS: u64 = 5_000;

/// A fixed base timestamp well in the past of any `Uuid::now_v7` call, so
/// generated keys never violate ordering against deterministic ones.
pub(crate) const BASE_TS: u64 = 1_700_000_000_000;

/// Runs a future against a freshly created database file in a temporary
/// directory.
///
/// # Panics
///
/// Will panic if the temp directory or the database file cannot be created.
pub(crate) async fn with_temp_db<F, Fut, V>(f: F) -> V
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = V>,
{
    let dir = TempDir::with_prefix("frozendb").expect("cannot recover from failure to create temp dir");
    let path = dir.child("test.fdb");
    Database::create(&path, TEST_ROW_SIZE, TEST_SKEW_MS)
        .await
        .expect("create should not fail");
    f(path).await
}

/// Builds a deterministic UUIDv7 with the given timestamp and a non-zero
/// entropy pattern derived from `seq`.
pub(crate) fn key_at(ts: u64, seq: u8) -> Uuid {
    key_from_parts(ts, [seq.max(1); 10])
}

/// Builds a deterministic UUIDv7 at `BASE_TS + offset_ms`.
pub(crate) fn key(offset_ms: u64, seq: u8) -> Uuid {
    key_at(BASE_TS + offset_ms, seq)
}

pub(crate) async fn open_write(path: &Path) -> Database {
    Database::open(path, OpenMode::Write, FinderStrategy::Linear)
        .await
        .expect("write-mode open should not fail")
}

pub(crate) async fn open_read(path: &Path) -> Database {
    Database::open(path, OpenMode::Read, FinderStrategy::Linear)
        .await
        .expect("read-mode open should not fail")
}
