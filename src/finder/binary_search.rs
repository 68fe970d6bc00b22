use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use uuid::Uuid;

use crate::{
    checksum::{logical_len, logical_to_physical},
    error::{invalid_data, Error, Result},
    row::{
        encoded_key, key_timestamp_ms, validate_data_key, RowMeta, ENCODED_KEY_LEN, KEY_OFFSET,
    },
};

use super::{walk_transaction_end, walk_transaction_start, Finder, RowAccess};

/// Timestamp-bisection finder.
///
/// Works over the logical index space of data/null rows (checksum rows
/// excluded) and exploits the ordering invariant: every appended key's
/// timestamp plus the skew window exceeds the maximum timestamp before it.
/// Timestamps are therefore sorted up to `skew_ms` of local disorder, which
/// bounds how far a bisection probe can be misled:
///
/// - a probe more than `skew_ms` below the target proves no match at or
///   before it, and
/// - a probe more than `skew_ms` above the target proves no match at or
///   after it,
///
/// so the bisection either lands inside the candidate window or proves the
/// key absent.  The window is then scanned linearly with full 128-bit
/// equality.
pub(crate) struct BinarySearchFinder {
    access: RowAccess,
    skew_ms: u64,
    max_timestamp_ms: AtomicU64,
}

impl BinarySearchFinder {
    pub fn new(access: RowAccess, skew_ms: u64) -> Self {
        Self {
            access,
            skew_ms,
            max_timestamp_ms: AtomicU64::new(0),
        }
    }

    /// Reads the timestamp and encoded key field of the row at the given
    /// logical index.
    async fn key_at(&self, logical: u64) -> Result<(u64, [u8; ENCODED_KEY_LEN])> {
        let physical = logical_to_physical(logical);
        let bytes = self.access.slot_bytes(physical).await?;
        let mut field = [0u8; ENCODED_KEY_LEN];
        field.copy_from_slice(&bytes[KEY_OFFSET..KEY_OFFSET + ENCODED_KEY_LEN]);

        let raw = BASE64.decode(field).map_err(|e| {
            invalid_data(format!("row {physical}: key field is not valid Base64: {e}"))
        })?;
        let key = Uuid::from_slice(&raw).map_err(|e| {
            invalid_data(format!("row {physical}: key field is not a UUID: {e}"))
        })?;
        Ok((key_timestamp_ms(&key), field))
    }
}

#[async_trait]
impl Finder for BinarySearchFinder {
    async fn get_index(&self, key: Uuid) -> Result<u64> {
        validate_data_key(&key)?;
        let target_ts = key_timestamp_ms(&key);
        let target_field = encoded_key(&key);
        let skew = self.skew_ms;

        let snapshot = self.access.snapshot().await?;
        let rows = logical_len(snapshot.complete_rows);
        if rows == 0 {
            return Err(Error::KeyNotFound { key });
        }

        // Bisect into the candidate window.
        let mut lo = 0u64;
        let mut hi = rows;
        let mut landing = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (ts, _) = self.key_at(mid).await?;
            if ts.saturating_add(skew) < target_ts {
                lo = mid + 1;
            } else if ts > target_ts.saturating_add(skew) {
                hi = mid;
            } else {
                landing = Some(mid);
                break;
            }
        }
        let Some(landing) = landing else {
            return Err(Error::KeyNotFound { key });
        };

        // Expand to the left edge of the window.  A row more than the skew
        // below the target proves nothing earlier can match.
        let mut first = landing;
        while first > 0 {
            let (ts, _) = self.key_at(first - 1).await?;
            if ts.saturating_add(skew) < target_ts {
                break;
            }
            first -= 1;
        }

        // Scan the window with full-key equality, keeping the last match so
        // that the greatest index wins.  A row more than the skew above the
        // target proves nothing later can match.
        let mut found = None;
        let mut logical = first;
        while logical < rows {
            let (ts, field) = self.key_at(logical).await?;
            if ts > target_ts.saturating_add(skew) {
                break;
            }
            if field == target_field {
                found = Some(logical_to_physical(logical));
            }
            logical += 1;
        }

        found.ok_or(Error::KeyNotFound { key })
    }

    async fn transaction_start(&self, index: u64) -> Result<u64> {
        walk_transaction_start(&self.access, index).await
    }

    async fn transaction_end(&self, index: u64) -> Result<u64> {
        walk_transaction_end(&self.access, index).await
    }

    fn max_timestamp(&self) -> u64 {
        self.max_timestamp_ms.load(Ordering::Acquire)
    }

    fn on_row_added(&self, _index: u64, meta: &RowMeta) {
        let key = match meta {
            RowMeta::Data { key, .. } => key,
            RowMeta::Null { key } => key,
            RowMeta::Checksum => return,
        };
        self.max_timestamp_ms
            .fetch_max(key_timestamp_ms(key), Ordering::AcqRel);
    }
}
