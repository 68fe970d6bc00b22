use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    checksum::BlockTally,
    error::{invalid_action, invalid_input, Error, Result},
    finder::Finder,
    io::WriterHandle,
    row::{
        encoded_key, key_timestamp_ms, null_row_key, payload_capacity, payload_prefix_len,
        savepoint_prefix_len, validate_data_key, DataRow, EndControl, NullRow, PartialRow, RowMeta,
        StartControl, KEY_OFFSET, NULL_BYTE, PAYLOAD_OFFSET, ROW_START, START_PREFIX_LEN,
    },
};

/// Maximum number of data rows a single transaction may hold.
pub(crate) const MAX_TRANSACTION_ROWS: u32 = 100;

/// Maximum number of savepoints a single transaction may declare.
pub(crate) const MAX_SAVEPOINTS: u8 = 9;

/// Everything a transaction needs from the database that owns it: a way to
/// enqueue appends, the finder for timestamp queries and index maintenance,
/// and the shared tail accounting.  Deliberately not a database handle, so
/// ownership stays one-way.
#[derive(Clone)]
pub(crate) struct TxContext {
    pub writer: WriterHandle,
    pub finder: Arc<dyn Finder>,
    pub tail: Arc<SyncMutex<TailState>>,
    pub row_size: usize,
    pub skew_ms: u64,
}

/// Accounting for the tail of the file: the running CRC of the open block
/// and the physical index of the slot the next (or current partial) row
/// occupies.
#[derive(Debug)]
pub(crate) struct TailState {
    pub tally: BlockTally,
    pub next_index: u64,
}

/// Point-in-time view of a transaction, for callers that want to display
/// or assert on its progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransactionStatus {
    /// Data rows the transaction holds, the evolving one included.
    pub rows: u32,
    /// Savepoints declared so far.
    pub savepoints: u8,
    pub tombstoned: bool,
    pub finished: bool,
}

struct TxState {
    /// Finalized data rows appended by this transaction.
    data_rows: u32,
    /// Savepoints declared, the current row's marker included.
    savepoints: u8,
    /// Key and value of the evolving partial row, once written.
    current: Option<(Uuid, Vec<u8>)>,
    /// Whether the current partial row carries the savepoint marker byte.
    marked: bool,
    /// Bytes of the evolving row already on disk.
    written: usize,
    /// Greatest timestamp among keys appended by this transaction.
    local_max_ts: u64,
    tombstoned: bool,
    finished: bool,
}

impl TxState {
    fn ensure_usable(&self) -> Result<()> {
        if self.tombstoned {
            return Err(Error::Tombstoned);
        }
        if self.finished {
            return Err(invalid_action("transaction has already been finalized"));
        }
        Ok(())
    }

    fn rows(&self) -> u32 {
        self.data_rows + u32::from(self.current.is_some())
    }
}

#[derive(Clone, Copy)]
enum FinalizeOp {
    Commit,
    Rollback(u8),
}

/// A handle to the single active transaction of a write-mode database.
///
/// All methods serialize on an internal mutex; the handle is cheap to clone
/// and safe to share across threads.  After `commit` or `rollback` the
/// handle is consumed logically: every further call reports an invalid
/// action.  After any persistence failure the handle is tombstoned and
/// every further call reports exactly that.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

struct TxInner {
    ctx: TxContext,
    state: Mutex<TxState>,
}

impl Transaction {
    /// Builds the in-memory side of a transaction whose two-byte opening
    /// prefix has just been appended.
    pub(crate) fn begun(ctx: TxContext) -> Self {
        Self::with_state(
            ctx,
            TxState {
                data_rows: 0,
                savepoints: 0,
                current: None,
                marked: false,
                written: START_PREFIX_LEN,
                local_max_ts: 0,
                tombstoned: false,
                finished: false,
            },
        )
    }

    /// Rebuilds a transaction from the partial row found at the tail of the
    /// file, together with the shape of the finalized rows walked during
    /// open: how many data rows the transaction already holds and how many
    /// of them are savepoints.
    pub(crate) fn recovered(
        ctx: TxContext,
        partial: PartialRow,
        data_rows: u32,
        savepoints_before: u8,
    ) -> Self {
        let row_size = ctx.row_size;
        let (current, marked, written, local_max_ts) = match partial {
            PartialRow::StartOnly => (None, false, START_PREFIX_LEN, 0),
            PartialRow::WithPayload { key, value, .. } => {
                let ts = key_timestamp_ms(&key);
                (Some((key, value)), false, payload_prefix_len(row_size), ts)
            }
            PartialRow::WithSavepoint { key, value, .. } => {
                let ts = key_timestamp_ms(&key);
                (Some((key, value)), true, savepoint_prefix_len(row_size), ts)
            }
        };
        let savepoints = savepoints_before + u8::from(marked);

        Self::with_state(
            ctx,
            TxState {
                data_rows,
                savepoints,
                current,
                marked,
                written,
                local_max_ts,
                tombstoned: false,
                finished: false,
            },
        )
    }

    fn with_state(ctx: TxContext, state: TxState) -> Self {
        Self {
            inner: Arc::new(TxInner {
                ctx,
                state: Mutex::new(state),
            }),
        }
    }

    /// Gets a point-in-time view of the transaction.
    pub async fn status(&self) -> TransactionStatus {
        let state = self.inner.state.lock().await;
        TransactionStatus {
            rows: state.rows(),
            savepoints: state.savepoints,
            tombstoned: state.tombstoned,
            finished: state.finished,
        }
    }

    pub(crate) async fn is_open(&self) -> bool {
        !self.inner.state.lock().await.finished
    }

    /// Appends a key/value pair to the transaction.
    ///
    /// The previous evolving row, if any, is finalized as a continuation in
    /// the same append, so the on-disk state always matches one of the
    /// recoverable partial sub-states.
    ///
    /// # Errors
    ///
    /// Validation failures (empty or oversized value, unusable key, key
    /// ordering, row limit) are reported before anything is persisted; an
    /// append failure tombstones the transaction and surfaces the original
    /// error.
    pub async fn add(&self, key: Uuid, value: &[u8]) -> Result<()> {
        let ctx = &self.inner.ctx;
        let row_size = ctx.row_size;
        let mut state = self.inner.state.lock().await;
        state.ensure_usable()?;

        if value.is_empty() {
            return Err(invalid_input("value must not be empty"));
        }
        if value.len() > payload_capacity(row_size) {
            return Err(invalid_input(format!(
                "value is {} bytes, row width {} allows at most {}",
                value.len(),
                row_size,
                payload_capacity(row_size)
            )));
        }
        validate_data_key(&key)?;

        let timestamp_ms = key_timestamp_ms(&key);
        let max_timestamp_ms = state.local_max_ts.max(ctx.finder.max_timestamp());
        if timestamp_ms.saturating_add(ctx.skew_ms) <= max_timestamp_ms {
            return Err(Error::KeyOrdering {
                key,
                timestamp_ms,
                max_timestamp_ms,
                skew_ms: ctx.skew_ms,
            });
        }
        if state.rows() + 1 > MAX_TRANSACTION_ROWS {
            return Err(invalid_input(format!(
                "transaction already holds {} rows, the limit is {}",
                state.rows(),
                MAX_TRANSACTION_ROWS
            )));
        }

        let mut batch = Vec::with_capacity(row_size * 2);
        let mut staged = Vec::new();
        let (mut tally, mut next_index) = {
            let tail = ctx.tail.lock();
            (tail.tally.clone(), tail.next_index)
        };

        let finalized_previous = if let Some((cur_key, cur_value)) = state.current.clone() {
            let end = if state.marked {
                EndControl::SavepointRowEnd
            } else {
                EndControl::RowEnd
            };
            let start = if state.data_rows == 0 {
                StartControl::Transaction
            } else {
                StartControl::Continuation
            };
            let row = DataRow {
                key: cur_key,
                value: cur_value,
                start,
                end,
            };
            let full = row.encode(row_size)?;
            batch.extend_from_slice(&full[state.written..]);
            stage_row(&mut tally, &mut staged, &mut next_index, &full, row.meta());
            stage_checksum(row_size, &mut batch, &mut tally, &mut staged, &mut next_index);

            batch.extend_from_slice(&partial_prefix(
                row_size,
                StartControl::Continuation,
                &key,
                value,
            ));
            true
        } else {
            // The opening prefix is already on disk; the new payload
            // continues that same row.
            let prefix = partial_prefix(row_size, StartControl::Transaction, &key, value);
            batch.extend_from_slice(&prefix[state.written..]);
            false
        };

        if let Err(e) = ctx.writer.append(Bytes::from(batch)).await {
            state.tombstoned = true;
            return Err(e);
        }

        {
            let mut tail = ctx.tail.lock();
            tail.tally = tally;
            tail.next_index = next_index;
        }
        for (index, meta) in &staged {
            ctx.finder.on_row_added(*index, meta);
        }
        if finalized_previous {
            state.data_rows += 1;
        }
        state.current = Some((key, value.to_vec()));
        state.marked = false;
        state.written = payload_prefix_len(row_size);
        state.local_max_ts = state.local_max_ts.max(timestamp_ms);
        Ok(())
    }

    /// Declares a savepoint on the current row.
    ///
    /// The leading byte of the eventual savepoint-flavoured end-control is
    /// appended immediately, so the declaration survives a crash.
    ///
    /// # Errors
    ///
    /// Declaring a savepoint before any row, on a row that already is one,
    /// or past the limit of nine is an invalid action; an append failure
    /// tombstones the transaction.
    pub async fn savepoint(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        let mut state = self.inner.state.lock().await;
        state.ensure_usable()?;

        if state.current.is_none() {
            return Err(invalid_action(
                "savepoint requires at least one row in the transaction",
            ));
        }
        if state.marked {
            return Err(invalid_action("the current row is already a savepoint"));
        }
        if state.savepoints >= MAX_SAVEPOINTS {
            return Err(invalid_action(format!(
                "a transaction may declare at most {MAX_SAVEPOINTS} savepoints"
            )));
        }

        if let Err(e) = ctx.writer.append(Bytes::from_static(b"S")).await {
            state.tombstoned = true;
            return Err(e);
        }

        state.marked = true;
        state.savepoints += 1;
        state.written += 1;
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// An empty transaction commits as a single null row; otherwise the
    /// evolving row is finalized with a commit terminator.
    ///
    /// # Errors
    ///
    /// An append failure tombstones the transaction and surfaces the
    /// original error.
    pub async fn commit(&self) -> Result<()> {
        self.finalize(FinalizeOp::Commit).await
    }

    /// Rolls the transaction back to the given savepoint (0 for a full
    /// rollback).
    ///
    /// # Errors
    ///
    /// A target above nine or above the number of declared savepoints is
    /// invalid input; an append failure tombstones the transaction.
    pub async fn rollback(&self, savepoint: u8) -> Result<()> {
        self.finalize(FinalizeOp::Rollback(savepoint)).await
    }

    async fn finalize(&self, op: FinalizeOp) -> Result<()> {
        let ctx = &self.inner.ctx;
        let row_size = ctx.row_size;
        let mut state = self.inner.state.lock().await;
        state.ensure_usable()?;

        if let FinalizeOp::Rollback(target) = op {
            if target > MAX_SAVEPOINTS {
                return Err(invalid_input(format!(
                    "rollback target {target} is out of range 0..={MAX_SAVEPOINTS}"
                )));
            }
            if target > state.savepoints {
                return Err(invalid_input(format!(
                    "rollback target {} exceeds the {} declared savepoints",
                    target, state.savepoints
                )));
            }
        }

        let mut batch = Vec::with_capacity(row_size * 2);
        let mut staged = Vec::new();
        let (mut tally, mut next_index) = {
            let tail = ctx.tail.lock();
            (tail.tally.clone(), tail.next_index)
        };

        let finalized_previous = match state.current.clone() {
            None => {
                // An empty transaction terminates as a null row either way:
                // there is nothing to roll back.
                debug_assert_eq!(state.data_rows, 0);
                let key = null_row_key(state.local_max_ts.max(ctx.finder.max_timestamp()));
                let row = NullRow { key };
                let full = row.encode(row_size)?;
                batch.extend_from_slice(&full[state.written..]);
                stage_row(&mut tally, &mut staged, &mut next_index, &full, row.meta());
                stage_checksum(row_size, &mut batch, &mut tally, &mut staged, &mut next_index);
                false
            }
            Some((cur_key, cur_value)) => {
                let end = match (op, state.marked) {
                    (FinalizeOp::Commit, false) => EndControl::Commit,
                    (FinalizeOp::Commit, true) => EndControl::SavepointCommit,
                    (FinalizeOp::Rollback(n), false) => EndControl::Rollback(n),
                    (FinalizeOp::Rollback(n), true) => EndControl::SavepointRollback(n),
                };
                let start = if state.data_rows == 0 {
                    StartControl::Transaction
                } else {
                    StartControl::Continuation
                };
                let row = DataRow {
                    key: cur_key,
                    value: cur_value,
                    start,
                    end,
                };
                let full = row.encode(row_size)?;
                batch.extend_from_slice(&full[state.written..]);
                stage_row(&mut tally, &mut staged, &mut next_index, &full, row.meta());
                stage_checksum(row_size, &mut batch, &mut tally, &mut staged, &mut next_index);
                true
            }
        };

        if let Err(e) = ctx.writer.append(Bytes::from(batch)).await {
            state.tombstoned = true;
            return Err(e);
        }

        {
            let mut tail = ctx.tail.lock();
            tail.tally = tally;
            tail.next_index = next_index;
        }
        for (index, meta) in &staged {
            ctx.finder.on_row_added(*index, meta);
        }
        if finalized_previous {
            state.data_rows += 1;
        }
        state.current = None;
        state.marked = false;
        state.written = 0;
        state.finished = true;
        Ok(())
    }
}

fn stage_row(
    tally: &mut BlockTally,
    staged: &mut Vec<(u64, RowMeta)>,
    next_index: &mut u64,
    full_row: &[u8],
    meta: RowMeta,
) {
    tally.absorb_row(full_row);
    staged.push((*next_index, meta));
    *next_index += 1;
}

/// If the block just filled up, appends the checksum row that closes it in
/// the same batch, before any further bytes.
fn stage_checksum(
    row_size: usize,
    batch: &mut Vec<u8>,
    tally: &mut BlockTally,
    staged: &mut Vec<(u64, RowMeta)>,
    next_index: &mut u64,
) {
    if !tally.block_full() {
        return;
    }
    let row = tally.emit();
    batch.extend_from_slice(&row.encode(row_size));
    staged.push((*next_index, RowMeta::Checksum));
    *next_index += 1;
}

/// Builds the on-disk prefix of a fresh partial row: sentinel, start
/// control, encoded key, value, and padding through the end-control
/// boundary.
fn partial_prefix(row_size: usize, start: StartControl, key: &Uuid, value: &[u8]) -> Vec<u8> {
    let mut buf = vec![NULL_BYTE; payload_prefix_len(row_size)];
    buf[0] = ROW_START;
    buf[1] = start.as_byte();
    buf[KEY_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&encoded_key(key));
    buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + value.len()].copy_from_slice(value);
    buf
}
