use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    checksum::is_checksum_index,
    error::{corrupt, invalid_input, Error, Result},
    header::HEADER_LEN,
    io::FileReader,
    row::{slot_meta, EndControl, RowMeta, StartControl},
    transaction::MAX_TRANSACTION_ROWS,
};

mod binary_search;
mod in_memory;
mod linear;

pub(crate) use binary_search::BinarySearchFinder;
pub(crate) use in_memory::InMemoryFinder;
pub(crate) use linear::LinearFinder;

/// Which finder implementation a database handle uses to locate rows and
/// transaction boundaries.  Chosen at open time; there is no runtime
/// switching.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FinderStrategy {
    /// O(n) scan over the file.  The reference implementation.
    #[default]
    Linear,
    /// O(1) lookups from maps built during open.  Memory proportional to
    /// the number of rows.
    InMemory,
    /// O(log n) bisection over UUIDv7 timestamps within the skew window.
    BinarySearch,
}

/// Capability set for locating rows and transaction boundaries.
///
/// All implementations agree byte-for-byte on results; they differ only in
/// time/memory trade-offs.  `on_row_added` is invoked by the write path for
/// every finalized row, in append order, under the write lock.
#[async_trait]
pub(crate) trait Finder: Send + Sync {
    /// Physical index of the data row carrying `key`.  When several rows
    /// carry the key, the greatest index wins.
    ///
    /// # Errors
    ///
    /// A key that cannot name a data row is refused as invalid input; a key
    /// no row carries returns a not-found error.
    async fn get_index(&self, key: Uuid) -> Result<u64>;

    /// Earliest row index of the transaction containing `index`.
    async fn transaction_start(&self, index: u64) -> Result<u64>;

    /// Latest row index of the transaction containing `index`, or a
    /// transaction-active error if the chain ends in the partial row.
    async fn transaction_end(&self, index: u64) -> Result<u64>;

    /// Greatest UUIDv7 timestamp among all finalized data/null rows, in
    /// milliseconds.  Zero if none exist.  O(1).
    fn max_timestamp(&self) -> u64;

    /// Records a freshly finalized row.
    fn on_row_added(&self, index: u64, meta: &RowMeta);
}

/// Constructs the finder selected by `strategy`.
///
/// The returned finder is empty; the open-time walk feeds it every existing
/// row through `on_row_added`.
pub(crate) fn build_finder(
    strategy: FinderStrategy,
    access: RowAccess,
    skew_ms: u64,
) -> Arc<dyn Finder> {
    match strategy {
        FinderStrategy::Linear => Arc::new(LinearFinder::new(access)),
        FinderStrategy::InMemory => Arc::new(InMemoryFinder::new(access)),
        FinderStrategy::BinarySearch => Arc::new(BinarySearchFinder::new(access, skew_ms)),
    }
}

/// Shared row-slot access over the database file.
///
/// Every operation snapshots the file length up front and treats only whole
/// `row_size` slots below the snapshot as complete, which is what makes
/// readers safe against a concurrently appending writer.
#[derive(Clone, Debug)]
pub(crate) struct RowAccess {
    reader: Arc<FileReader>,
    row_size: usize,
}

impl RowAccess {
    pub fn new(reader: Arc<FileReader>, row_size: usize) -> Self {
        Self { reader, row_size }
    }

    fn slot_offset(&self, index: u64) -> u64 {
        HEADER_LEN as u64 + index * self.row_size as u64
    }

    /// Number of complete row slots under a freshly refreshed length
    /// snapshot, plus any partial tail bytes past them.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let len = self.reader.refresh_len().await?;
        let body = len.saturating_sub(HEADER_LEN as u64);
        Ok(Snapshot {
            complete_rows: body / self.row_size as u64,
            partial_bytes: (body % self.row_size as u64) as usize,
        })
    }

    /// Reads the raw bytes of a complete row slot.
    pub async fn slot_bytes(&self, index: u64) -> Result<Vec<u8>> {
        self.reader
            .read_exact_at(self.slot_offset(index), self.row_size)
            .await
    }

    /// Reads a complete row slot and classifies it without verifying
    /// parity.
    pub async fn slot_meta_at(&self, index: u64) -> Result<RowMeta> {
        let bytes = self.slot_bytes(index).await?;
        slot_meta(&bytes).map_err(|e| at_index(e, index))
    }

    /// Reads a complete row slot with full validation.
    pub async fn decode_row_at(&self, index: u64) -> Result<crate::row::Row> {
        let bytes = self.slot_bytes(index).await?;
        crate::row::decode_row(&bytes).map_err(|e| at_index(e, index))
    }
}

/// A consistent view of how many complete rows exist.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Snapshot {
    pub complete_rows: u64,
    pub partial_bytes: usize,
}

fn at_index(error: Error, index: u64) -> Error {
    match error {
        Error::Corrupt { message } => corrupt(format!("row {index}: {message}")),
        Error::InvalidData { message } => Error::InvalidData {
            message: format!("row {index}: {message}"),
        },
        other => other,
    }
}

fn reject_checksum_slot(index: u64) -> Result<()> {
    if is_checksum_index(index) {
        return Err(invalid_input(format!(
            "row index {index} is a checksum slot, not a transaction row"
        )));
    }
    Ok(())
}

/// Walks backward from `index` to the transaction-opening row.
///
/// Shared by the linear and binary-search finders; the in-memory finder
/// answers from its maps instead.
pub(crate) async fn walk_transaction_start(access: &RowAccess, index: u64) -> Result<u64> {
    reject_checksum_slot(index)?;
    let snapshot = access.snapshot().await?;
    if index >= snapshot.complete_rows {
        return Err(invalid_input(format!(
            "row index {} is beyond the {} finalized rows",
            index, snapshot.complete_rows
        )));
    }

    let mut current = index;
    let mut steps = 0u32;
    loop {
        if is_checksum_index(current) {
            if current == 0 {
                return Err(corrupt(
                    "transaction chain reaches the initial checksum row without opening",
                ));
            }
            current -= 1;
            continue;
        }
        match access.slot_meta_at(current).await? {
            RowMeta::Null { .. } if current == index => return Ok(current),
            RowMeta::Null { .. } => {
                return Err(corrupt(format!(
                    "row {current}: transaction chain runs into a null row"
                )))
            }
            RowMeta::Checksum => {
                return Err(corrupt(format!(
                    "row {current}: checksum row found outside a checksum slot"
                )))
            }
            RowMeta::Data { start, .. } => match start {
                StartControl::Transaction => return Ok(current),
                StartControl::Continuation => {
                    if current == 0 {
                        return Err(corrupt(
                            "transaction chain reaches the start of the file without opening",
                        ));
                    }
                    current -= 1;
                }
                StartControl::Checksum => unreachable!("slot_meta never yields this pairing"),
            },
        }

        steps += 1;
        if steps > MAX_TRANSACTION_ROWS {
            return Err(corrupt(format!(
                "transaction containing row {index} exceeds {MAX_TRANSACTION_ROWS} rows"
            )));
        }
    }
}

/// Walks forward from `index` to the transaction's terminal row.
///
/// A chain that runs into the partial tail (or off the end of the length
/// snapshot) belongs to the active transaction.
pub(crate) async fn walk_transaction_end(access: &RowAccess, index: u64) -> Result<u64> {
    reject_checksum_slot(index)?;
    let snapshot = access.snapshot().await?;
    if index >= snapshot.complete_rows {
        return Err(invalid_input(format!(
            "row index {} is beyond the {} finalized rows",
            index, snapshot.complete_rows
        )));
    }

    let mut current = index;
    let mut steps = 0u32;
    loop {
        if current >= snapshot.complete_rows {
            return Err(Error::TransactionActive);
        }
        if is_checksum_index(current) {
            current += 1;
            continue;
        }
        match access.slot_meta_at(current).await? {
            RowMeta::Null { .. } if current == index => return Ok(current),
            RowMeta::Null { .. } => {
                return Err(corrupt(format!(
                    "row {current}: transaction chain runs into a null row"
                )))
            }
            RowMeta::Checksum => {
                return Err(corrupt(format!(
                    "row {current}: checksum row found outside a checksum slot"
                )))
            }
            RowMeta::Data { end, .. } => {
                if end.is_terminal() {
                    return Ok(current);
                }
                debug_assert!(matches!(
                    end,
                    EndControl::RowEnd | EndControl::SavepointRowEnd
                ));
                current += 1;
            }
        }

        steps += 1;
        if steps > MAX_TRANSACTION_ROWS {
            return Err(corrupt(format!(
                "transaction containing row {index} exceeds {MAX_TRANSACTION_ROWS} rows"
            )));
        }
    }
}
