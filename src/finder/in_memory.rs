use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    error::{invalid_input, Error, Result},
    row::{key_timestamp_ms, validate_data_key, RowMeta, StartControl},
};

use super::{Finder, RowAccess};

#[derive(Default)]
struct Indices {
    /// Latest physical index per key.
    by_key: HashMap<Uuid, u64>,
    /// Physical index of each row's transaction-opening row.
    tx_start: HashMap<u64, u64>,
    /// Physical index of each row's transaction-terminal row; absent while
    /// the transaction is still active.
    tx_end: HashMap<u64, u64>,
    /// Rows of the transaction currently awaiting a terminal row.
    open_rows: Vec<u64>,
    /// Opening row of that transaction.
    open_start: Option<u64>,
}

/// Map-backed finder: all three primary operations are O(1) at the cost of
/// roughly 40 bytes per row, with the maps built during the open walk and
/// maintained incrementally afterward.
pub(crate) struct InMemoryFinder {
    // Kept so the constructor signature matches the other finders; every
    // answer comes from the maps.
    #[allow(dead_code)]
    access: RowAccess,
    indices: RwLock<Indices>,
    max_timestamp_ms: AtomicU64,
}

impl InMemoryFinder {
    pub fn new(access: RowAccess) -> Self {
        Self {
            access,
            indices: RwLock::new(Indices::default()),
            max_timestamp_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Finder for InMemoryFinder {
    async fn get_index(&self, key: Uuid) -> Result<u64> {
        validate_data_key(&key)?;
        self.indices
            .read()
            .by_key
            .get(&key)
            .copied()
            .ok_or(Error::KeyNotFound { key })
    }

    async fn transaction_start(&self, index: u64) -> Result<u64> {
        self.indices
            .read()
            .tx_start
            .get(&index)
            .copied()
            .ok_or_else(|| {
                invalid_input(format!("row index {index} is not a finalized transaction row"))
            })
    }

    async fn transaction_end(&self, index: u64) -> Result<u64> {
        let indices = self.indices.read();
        if let Some(end) = indices.tx_end.get(&index) {
            return Ok(*end);
        }
        if indices.tx_start.contains_key(&index) {
            return Err(Error::TransactionActive);
        }
        Err(invalid_input(format!(
            "row index {index} is not a finalized transaction row"
        )))
    }

    fn max_timestamp(&self) -> u64 {
        self.max_timestamp_ms.load(Ordering::Acquire)
    }

    fn on_row_added(&self, index: u64, meta: &RowMeta) {
        let mut indices = self.indices.write();
        match meta {
            RowMeta::Checksum => {}
            RowMeta::Null { key } => {
                // A null row is a whole committed transaction by itself.
                debug_assert!(indices.open_rows.is_empty());
                indices.tx_start.insert(index, index);
                indices.tx_end.insert(index, index);
                self.max_timestamp_ms
                    .fetch_max(key_timestamp_ms(key), Ordering::AcqRel);
            }
            RowMeta::Data { key, start, end } => {
                let start_index = match start {
                    StartControl::Transaction => {
                        indices.open_start = Some(index);
                        index
                    }
                    StartControl::Continuation => indices.open_start.unwrap_or(index),
                    StartControl::Checksum => unreachable!("data rows never carry this control"),
                };
                indices.by_key.insert(*key, index);
                indices.tx_start.insert(index, start_index);
                indices.open_rows.push(index);

                if end.is_terminal() {
                    let rows = std::mem::take(&mut indices.open_rows);
                    for row in rows {
                        indices.tx_end.insert(row, index);
                    }
                    indices.open_start = None;
                }

                self.max_timestamp_ms
                    .fetch_max(key_timestamp_ms(key), Ordering::AcqRel);
            }
        }
    }
}
