use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    checksum::physical_to_logical,
    error::{Error, Result},
    row::{
        encoded_key, key_timestamp_ms, validate_data_key, RowMeta, ENCODED_KEY_LEN, KEY_OFFSET,
    },
};

use super::{walk_transaction_end, walk_transaction_start, Finder, RowAccess};

/// The reference finder: a straight scan over the file with one row-sized
/// buffer.  O(n) lookups, O(1) memory.  The other finders are checked
/// against this one.
pub(crate) struct LinearFinder {
    access: RowAccess,
    max_timestamp_ms: AtomicU64,
}

impl LinearFinder {
    pub fn new(access: RowAccess) -> Self {
        Self {
            access,
            max_timestamp_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Finder for LinearFinder {
    async fn get_index(&self, key: Uuid) -> Result<u64> {
        validate_data_key(&key)?;
        let target = encoded_key(&key);
        let snapshot = self.access.snapshot().await?;

        let mut found = None;
        for index in 0..snapshot.complete_rows {
            if physical_to_logical(index).is_none() {
                continue;
            }
            let bytes = self.access.slot_bytes(index).await?;
            if bytes[KEY_OFFSET..KEY_OFFSET + ENCODED_KEY_LEN] == target {
                found = Some(index);
            }
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
