use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicU64, Arc},
};

use bytes::Bytes;
use fslock::LockFile;
use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    checksum::{is_checksum_index, BlockTally},
    error::{corrupt, invalid_action, invalid_data, Error, ReadSnafu, Result, WriteSnafu},
    finder::{build_finder, Finder, FinderStrategy, RowAccess},
    header::{Header, HEADER_LEN},
    io::{acquire_write_lock, append_file_options, create_file_options, spawn_writer, FileReader, WriterHandle},
    row::{decode_any, decode_row, slot_meta, PartialRow, Row, RowMeta, StartControl, ROW_START},
    transaction::{TailState, Transaction, TxContext},
};

const BEGIN_PREFIX: [u8; 2] = [ROW_START, b'T'];

/// Access mode for an open database handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Shared read-only access; any number of concurrent readers.
    Read,
    /// Exclusive writable access, guarded by an OS-level advisory lock.
    Write,
}

/// An open database file.
///
/// A handle may be shared across reader threads; write methods serialize
/// internally through the single active transaction and the writer task.
pub struct Database {
    core: Arc<DbCore>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

struct DbCore {
    path: PathBuf,
    mode: OpenMode,
    header: Header,
    access: RowAccess,
    finder: Arc<dyn Finder>,
    writer: SyncMutex<Option<WriterHandle>>,
    writer_task: SyncMutex<Option<JoinHandle<()>>>,
    lock: SyncMutex<Option<LockFile>>,
    tail: Arc<SyncMutex<TailState>>,
    active: Mutex<Option<Transaction>>,
}

impl Database {
    /// Creates a new database file at `path`.
    ///
    /// Writes the 64-byte header followed by the initial checksum row
    /// covering it, then synchronizes the file.  Refuses to overwrite an
    /// existing file.
    ///
    /// # Errors
    ///
    /// An unusable path (wrong extension, already exists, unwritable
    /// parent) is reported as a path error; out-of-range parameters as
    /// invalid input; I/O failures during the initial write as write
    /// errors.
    pub async fn create<P: AsRef<Path>>(path: P, row_size: u32, skew_ms: u64) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        validate_extension(&path)?;
        let header = Header::new(row_size, skew_ms)?;
        let header_bytes = header.encode()?;

        let mut tally = BlockTally::new();
        tally.absorb_header(&header_bytes);
        let checksum_row = tally.emit().encode(header.row_size());

        let mut file = create_file_options().open(&path).await.map_err(|e| Error::Path {
            path: path.clone(),
            message: format!("cannot create database file: {e}"),
        })?;
        file.write_all(&header_bytes).await.context(WriteSnafu)?;
        file.write_all(&checksum_row).await.context(WriteSnafu)?;
        file.flush().await.context(WriteSnafu)?;
        file.sync_all().await.context(WriteSnafu)?;

        debug!(path = %path.display(), row_size, skew_ms, "Created database file.");
        Ok(())
    }

    /// Opens the database file at `path`.
    ///
    /// Open validates the header, walks the whole file structurally
    /// (sentinels, control bytes, per-block CRC32 for every complete
    /// block), builds the requested finder from that walk, and, in write
    /// mode, acquires the advisory lock and recovers the active
    /// transaction from the tail partial row if one exists.
    ///
    /// # Errors
    ///
    /// A missing file or wrong extension is a path error; a contended lock
    /// is a write error; any structural deviation found by the walk is a
    /// corruption error.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        strategy: FinderStrategy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        validate_extension(&path)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| Error::Path {
            path: path.clone(),
            message: format!("cannot open database file: {e}"),
        })?;
        if !metadata.is_file() {
            return Err(Error::Path {
                path,
                message: "not a regular file".to_string(),
            });
        }

        // Lock before reading anything, so the state we validate cannot be
        // appended to underneath us by another writer.
        let lock = match mode {
            OpenMode::Write => Some(acquire_write_lock(&path)?),
            OpenMode::Read => None,
        };

        let reader = Arc::new(FileReader::open(&path).await?);
        if reader.len() < HEADER_LEN as u64 {
            return Err(corrupt(format!(
                "file is {} bytes, too short to hold a header",
                reader.len()
            )));
        }
        let header_bytes = reader.read_exact_at(0, HEADER_LEN).await?;
        let header = Header::decode(&header_bytes)?;
        let row_size = header.row_size();

        let access = RowAccess::new(Arc::clone(&reader), row_size);
        let finder = build_finder(strategy, access.clone(), header.skew_ms());

        let outcome = scan_file(
            &path,
            &header,
            &header_bytes,
            finder.as_ref(),
            mode == OpenMode::Write,
        )
        .await?;
        debug!(
            path = %path.display(),
            rows = outcome.row_count,
            partial = outcome.partial.is_some(),
            "Validated database file."
        );

        let tail = Arc::new(SyncMutex::new(TailState {
            tally: outcome.tally,
            next_index: outcome.row_count,
        }));

        let (writer, writer_task, active) = match mode {
            OpenMode::Read => (None, None, None),
            OpenMode::Write => {
                let file = append_file_options().open(&path).await.context(WriteSnafu)?;
                let size = Arc::new(AtomicU64::new(reader.len()));
                let (handle, task) = spawn_writer(file, size);

                let active = outcome.partial.map(|partial| {
                    let (data_rows, savepoints) = outcome.recovered_shape;
                    debug!(
                        data_rows,
                        savepoints,
                        "Recovered an active transaction from the tail partial row."
                    );
                    let ctx = TxContext {
                        writer: handle.clone(),
                        finder: Arc::clone(&finder),
                        tail: Arc::clone(&tail),
                        row_size,
                        skew_ms: header.skew_ms(),
                    };
                    Transaction::recovered(ctx, partial, data_rows, savepoints)
                });

                (Some(handle), Some(task), active)
            }
        };

        Ok(Self {
            core: Arc::new(DbCore {
                path,
                mode,
                header,
                access,
                finder,
                writer: SyncMutex::new(writer),
                writer_task: SyncMutex::new(writer_task),
                lock: SyncMutex::new(lock),
                tail,
                active: Mutex::new(active),
            }),
        })
    }

    /// Gets the header this file was created with.
    pub fn header(&self) -> &Header {
        &self.core.header
    }

    /// Gets the path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.core.path
    }

    /// Gets the greatest UUIDv7 timestamp among all finalized rows, in
    /// milliseconds since the epoch.  Zero for an empty database.
    pub fn max_timestamp(&self) -> u64 {
        self.core.finder.max_timestamp()
    }

    /// Gets the number of finalized row slots in the file, checksum rows
    /// included.
    pub async fn row_count(&self) -> Result<u64> {
        let snapshot = self.core.access.snapshot().await?;
        Ok(snapshot.complete_rows)
    }

    /// Whether the file currently ends in a partial row, i.e. a
    /// transaction is active on disk.
    pub async fn has_partial_tail(&self) -> Result<bool> {
        let snapshot = self.core.access.snapshot().await?;
        Ok(snapshot.partial_bytes > 0)
    }

    /// Reads and fully validates the row at the given physical index.
    ///
    /// Exposed for inspection tooling; regular reads resolve keys through
    /// [`Database::get`] instead.
    pub async fn row_at(&self, index: u64) -> Result<Row> {
        let snapshot = self.core.access.snapshot().await?;
        if index >= snapshot.complete_rows {
            return Err(crate::error::invalid_input(format!(
                "row index {} is beyond the {} finalized rows",
                index, snapshot.complete_rows
            )));
        }
        self.core.access.decode_row_at(index).await
    }

    /// Begins a new transaction.
    ///
    /// The two-byte opening prefix is appended before this returns, so the
    /// transaction is crash-recoverable from its very first moment.
    ///
    /// # Errors
    ///
    /// Beginning on a read-mode handle, or while another transaction is
    /// active, is an invalid action; an append failure is a write error.
    pub async fn begin(&self) -> Result<Transaction> {
        let core = &self.core;
        let writer = core.writer_handle()?;
        let mut active = core.active.lock().await;
        if let Some(tx) = active.as_ref() {
            if tx.is_open().await {
                return Err(invalid_action("a transaction is already active"));
            }
        }

        writer.append(Bytes::from_static(&BEGIN_PREFIX)).await?;

        let tx = Transaction::begun(TxContext {
            writer,
            finder: Arc::clone(&core.finder),
            tail: Arc::clone(&core.tail),
            row_size: core.header.row_size(),
            skew_ms: core.header.skew_ms(),
        });
        *active = Some(tx.clone());
        Ok(tx)
    }

    /// Gets a handle to the active transaction, whether begun on this
    /// handle or recovered at open, or `None` when the database is idle.
    pub async fn active_transaction(&self) -> Option<Transaction> {
        let active = self.core.active.lock().await;
        match active.as_ref() {
            Some(tx) if tx.is_open().await => Some(tx.clone()),
            _ => None,
        }
    }

    /// Reads the committed value stored under `key`, with the row padding
    /// trimmed but without interpreting the bytes.
    ///
    /// # Errors
    ///
    /// A key that cannot name a data row is invalid input.  A key with no
    /// visible committed row reports not-found; a row inside a still-active
    /// transaction reports exactly that; rows failing parity validation
    /// report corruption.
    pub async fn get_raw(&self, key: Uuid) -> Result<Vec<u8>> {
        let core = &self.core;
        let index = core.finder.get_index(key).await?;
        let start = core.finder.transaction_start(index).await?;
        let end = core.finder.transaction_end(index).await?;

        let end_control = match core.access.decode_row_at(end).await? {
            Row::Data(row) => row.end,
            Row::Null(_) => {
                return Err(corrupt(format!(
                    "row {end}: data row chain terminates in a null row"
                )))
            }
            Row::Checksum(_) | Row::Partial(_) => {
                return Err(corrupt(format!(
                    "row {end}: transaction terminal slot holds no transaction row"
                )))
            }
        };

        match end_control.rollback_target() {
            None => {
                if !end_control.is_terminal() {
                    return Err(corrupt(format!(
                        "row {end}: transaction chain ends without a terminal control"
                    )));
                }
            }
            Some(0) => return Err(Error::KeyNotFound { key }),
            Some(target) => {
                let savepoint_index = nth_savepoint_index(&core.access, start, end, target).await?;
                if index > savepoint_index {
                    return Err(Error::KeyNotFound { key });
                }
            }
        }

        match core.access.decode_row_at(index).await? {
            Row::Data(row) => Ok(row.value),
            _ => Err(corrupt(format!("row {index}: expected a data row"))),
        }
    }

    /// Reads the committed value stored under `key` and unmarshals its
    /// JSON into `T`.
    ///
    /// # Errors
    ///
    /// On top of the [`Database::get_raw`] failure modes, stored bytes
    /// that do not decode into `T` report invalid data.
    pub async fn get<T: DeserializeOwned>(&self, key: Uuid) -> Result<T> {
        let bytes = self.get_raw(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| invalid_data(format!("cannot decode value for key {key}: {e}")))
    }

    /// Closes the database: drops the active transaction handle, shuts the
    /// writer down, and releases the advisory lock.
    ///
    /// Every append was already flushed and synchronized when its issuing
    /// call returned, so there is never buffered data to lose here.
    pub async fn close(self) {
        {
            let mut active = self.core.active.lock().await;
            active.take();
        }
        // Dropping the handle lets the writer task drain and exit on its
        // own; the advisory lock is released last.
        self.core.writer.lock().take();
        self.core.writer_task.lock().take();
        self.core.lock.lock().take();
    }

    #[cfg(test)]
    pub(crate) fn finder_for_tests(&self) -> Arc<dyn Finder> {
        Arc::clone(&self.core.finder)
    }

    /// Kills the writer task to simulate an append failure underneath a
    /// live transaction.
    #[cfg(test)]
    pub(crate) async fn abort_writer_for_tests(&self) {
        let task = self.core.writer_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl DbCore {
    fn writer_handle(&self) -> Result<WriterHandle> {
        if self.mode == OpenMode::Read {
            return Err(invalid_action("database is open in read-only mode"));
        }
        self.writer
            .lock()
            .clone()
            .ok_or_else(|| invalid_action("database has been closed"))
    }
}

fn validate_extension(path: &Path) -> Result<()> {
    if path.extension().and_then(std::ffi::OsStr::to_str) != Some("fdb") {
        return Err(Error::Path {
            path: path.to_path_buf(),
            message: "database files use the .fdb extension".to_string(),
        });
    }
    Ok(())
}

/// Finds the physical index of the `target`-th savepoint-marked row within
/// the transaction spanning `start..=end`.
async fn nth_savepoint_index(access: &RowAccess, start: u64, end: u64, target: u8) -> Result<u64> {
    let mut count = 0u8;
    let mut index = start;
    while index <= end {
        if is_checksum_index(index) {
            index += 1;
            continue;
        }
        if let RowMeta::Data { end: control, .. } = access.slot_meta_at(index).await? {
            if control.is_savepoint() {
                count += 1;
                if count == target {
                    return Ok(index);
                }
            }
        }
        index += 1;
    }
    Err(corrupt(format!(
        "rollback targets savepoint {target} but rows {start}..={end} declare only {count}"
    )))
}

#[derive(Debug)]
struct ScanOutcome {
    row_count: u64,
    partial: Option<PartialRow>,
    recovered_shape: (u32, u8),
    tally: BlockTally,
}

#[derive(Debug, Default)]
struct RunShape {
    rows: u32,
    savepoints: u8,
}

/// Walks the file once, structurally validating every row slot, verifying
/// the CRC32 of every complete block, feeding each finalized row to the
/// finder, and classifying the tail partial row if one exists.
///
/// Row parity is deliberately not verified here; it is checked by the
/// first full decode that touches a row.
async fn scan_file(
    path: &Path,
    header: &Header,
    header_bytes: &[u8],
    finder: &dyn Finder,
    write_mode: bool,
) -> Result<ScanOutcome> {
    let file = tokio::fs::File::open(path).await.context(ReadSnafu)?;
    let mut reader = BufReader::new(file);
    let mut skip_header = vec![0u8; HEADER_LEN];
    reader.read_exact(&mut skip_header).await.context(ReadSnafu)?;

    let row_size = header.row_size();
    let mut tally = BlockTally::new();
    tally.absorb_header(header_bytes);

    let mut buf = vec![0u8; row_size];
    let mut index = 0u64;
    let mut open_run: Option<RunShape> = None;
    let mut partial = None;
    let mut recovered_shape = (0u32, 0u8);

    loop {
        let filled = fill_slot(&mut reader, &mut buf).await?;
        if filled == 0 {
            break;
        }

        if filled < row_size {
            if is_checksum_index(index) {
                return Err(corrupt(format!(
                    "row {index}: partial bytes in a checksum slot"
                )));
            }
            let row = decode_any(&buf[..filled], row_size)
                .map_err(|e| corrupt(format!("row {index}: {e}")))?;
            let Row::Partial(tail_partial) = row else {
                return Err(corrupt(format!(
                    "row {index}: short slot decoded as a complete row"
                )));
            };

            let continues_run = matches!(
                &tail_partial,
                PartialRow::WithPayload {
                    start: StartControl::Continuation,
                    ..
                } | PartialRow::WithSavepoint {
                    start: StartControl::Continuation,
                    ..
                }
            );
            match (continues_run, open_run.take()) {
                (true, Some(run)) => recovered_shape = (run.rows, run.savepoints),
                (true, None) => {
                    return Err(corrupt(format!(
                        "row {index}: partial continuation row without an open transaction"
                    )))
                }
                (false, None) => recovered_shape = (0, 0),
                (false, Some(_)) => {
                    return Err(corrupt(format!(
                        "row {index}: partial row opens a transaction while another is active"
                    )))
                }
            }
            partial = Some(tail_partial);
            break;
        }

        if is_checksum_index(index) {
            let row =
                decode_row(&buf).map_err(|e| corrupt(format!("row {index}: {e}")))?;
            let Row::Checksum(checksum_row) = row else {
                return Err(corrupt(format!(
                    "row {index}: expected a checksum row in this slot"
                )));
            };
            tally.verify(index, &checksum_row)?;
            finder.on_row_added(index, &RowMeta::Checksum);
        } else {
            let meta = slot_meta(&buf).map_err(|e| corrupt(format!("row {index}: {e}")))?;
            match meta {
                RowMeta::Checksum => {
                    return Err(corrupt(format!(
                        "row {index}: checksum row outside a checksum slot"
                    )))
                }
                RowMeta::Null { .. } => {
                    if open_run.is_some() {
                        return Err(corrupt(format!(
                            "row {index}: null row inside an open transaction"
                        )));
                    }
                    tally.absorb_row(&buf);
                    finder.on_row_added(index, &meta);
                }
                RowMeta::Data { start, end, .. } => {
                    match start {
                        StartControl::Transaction => {
                            if open_run.is_some() {
                                return Err(corrupt(format!(
                                    "row {index}: transaction opens while another is active"
                                )));
                            }
                            open_run = Some(RunShape::default());
                        }
                        StartControl::Continuation => {
                            if open_run.is_none() {
                                return Err(corrupt(format!(
                                    "row {index}: continuation row without an open transaction"
                                )));
                            }
                        }
                        StartControl::Checksum => {
                            unreachable!("slot_meta never yields this pairing")
                        }
                    }
                    let run = open_run
                        .as_mut()
                        .expect("open run exists for every data row");
                    run.rows += 1;
                    if end.is_savepoint() {
                        run.savepoints += 1;
                    }
                    if end.is_terminal() {
                        open_run = None;
                    }

                    tally.absorb_row(&buf);
                    finder.on_row_added(index, &meta);
                }
            }
        }

        index += 1;
    }

    if index == 0 && partial.is_none() {
        return Err(corrupt("file is missing the initial checksum row"));
    }

    // These two states can appear transiently to a reader racing a writer
    // mid-batch, but under the exclusive write lock they can only mean the
    // file was damaged.
    if write_mode {
        if open_run.is_some() && partial.is_none() {
            return Err(corrupt(
                "transaction chain reaches the end of the file without a partial row",
            ));
        }
        if tally.block_full() {
            return Err(corrupt("block is full but its checksum row is missing"));
        }
    }

    Ok(ScanOutcome {
        row_count: index,
        partial,
        recovered_shape,
        tally,
    })
}

async fn fill_slot(reader: &mut BufReader<tokio::fs::File>, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await.context(ReadSnafu)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
