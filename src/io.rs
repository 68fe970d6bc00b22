use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use fslock::LockFile;
use snafu::ResultExt;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::error::{Error, ReadSnafu, Result, WriteSnafu};

#[cfg(unix)]
const FILE_MODE_OWNER_RW_GROUP_RO: u32 = 0o640;

/// Depth of the writer queue.  Appends are strictly serialized anyway, so
/// the queue only ever buffers callers briefly.
const WRITE_QUEUE_DEPTH: usize = 8;

struct WriteRequest {
    bytes: Bytes,
    reply: oneshot::Sender<io::Result<u64>>,
}

/// Handle for enqueuing appends to the database file.
///
/// All writes funnel through a single background task that owns the file
/// handle, so there is at most one in-flight write at any time and the
/// order of delivered requests defines the on-disk order.  Once any append
/// fails, the task latches into a failed state and every subsequent request
/// is refused immediately.
#[derive(Clone, Debug)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Appends the given bytes to the file, waiting until the write has
    /// been flushed and synchronized.
    ///
    /// Returns the file size after the append.
    ///
    /// # Errors
    ///
    /// If the underlying append fails, or an earlier append already failed
    /// and halted the writer, an error variant will be returned describing
    /// the error.
    pub async fn append(&self, bytes: Bytes) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { bytes, reply })
            .await
            .map_err(|_| writer_gone())?;
        let result = rx.await.map_err(|_| writer_gone())?;
        result.context(WriteSnafu)
    }
}

fn writer_gone() -> Error {
    Error::Write {
        source: io::Error::new(io::ErrorKind::BrokenPipe, "writer task is gone"),
    }
}

/// Spawns the writer task over an already-opened append-mode file.
///
/// `size` starts at the current file length and grows with every
/// acknowledged append; readers may snapshot it at any time.
pub(crate) fn spawn_writer(file: File, size: Arc<AtomicU64>) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let task = tokio::spawn(run_writer(file, size, rx));
    (WriterHandle { tx }, task)
}

async fn run_writer(mut file: File, size: Arc<AtomicU64>, mut rx: mpsc::Receiver<WriteRequest>) {
    let mut halted = false;
    while let Some(WriteRequest { bytes, reply }) = rx.recv().await {
        if halted {
            let _ = reply.send(Err(io::Error::new(
                io::ErrorKind::Other,
                "writer halted by an earlier append failure",
            )));
            continue;
        }

        let result = append_all(&mut file, &bytes).await;
        let response = match result {
            Ok(()) => {
                let len = bytes.len() as u64;
                let new_size = size.fetch_add(len, Ordering::AcqRel) + len;
                trace!(appended = len, file_size = new_size, "Appended bytes.");
                Ok(new_size)
            }
            Err(e) => {
                error!(error = %e, "Append failed, halting writer.");
                halted = true;
                Err(e)
            }
        };

        // The caller may have given up waiting; nothing to do about it.
        let _ = reply.send(response);
    }

    if let Err(e) = file.sync_all().await {
        error!(error = %e, "Final sync on writer shutdown failed.");
    }
}

async fn append_all(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Positioned reader over the database file.
///
/// Multiple readers may exist concurrently; each operation snapshots the
/// file length first and then only ever reads below that snapshot, so a
/// reader racing the writer still observes a consistent committed prefix.
#[derive(Debug)]
pub(crate) struct FileReader {
    file: Mutex<File>,
    len: AtomicU64,
}

impl FileReader {
    /// Opens the file at `path` for positioned reads.
    ///
    /// # Errors
    ///
    /// If the file cannot be opened or its metadata queried, an error
    /// variant will be returned describing the underlying error.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .context(ReadSnafu)?;
        let len = file.metadata().await.context(ReadSnafu)?.len();
        Ok(Self {
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    /// Gets the last observed file length.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Re-reads the file length from the filesystem.  The observed length
    /// never shrinks: the file is append-only, so a smaller value could
    /// only mean an outside actor truncated it, and the stale larger value
    /// will surface as a read error instead.
    pub async fn refresh_len(&self) -> Result<u64> {
        let file = self.file.lock().await;
        let len = file.metadata().await.context(ReadSnafu)?.len();
        self.len.fetch_max(len, Ordering::AcqRel);
        Ok(self.len())
    }

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// If the positioned read fails or ends early, an error variant will be
    /// returned describing the underlying error.
    pub async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await.context(ReadSnafu)?;
        file.read_exact(&mut buf).await.context(ReadSnafu)?;
        Ok(buf)
    }
}

/// Acquires the exclusive advisory lock for write-mode access.
///
/// The lock is taken on the database file itself, so a second writer is
/// refused even before it reads the header.  Bear in mind this does not
/// prevent other processes from modifying the file in ways that corrupt it;
/// the advisory lock only arbitrates between cooperating writers.
///
/// # Errors
///
/// If the lock is already held elsewhere, or the lock operation itself
/// fails, an error variant will be returned describing the situation.
pub(crate) fn acquire_write_lock(path: &Path) -> Result<LockFile> {
    let mut lock = LockFile::open(path).context(WriteSnafu)?;
    let acquired = lock.try_lock().context(WriteSnafu)?;
    if !acquired {
        return Err(Error::Write {
            source: io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "failed to lock {}; is another process writing to this database?",
                    path.display()
                ),
            ),
        });
    }
    Ok(lock)
}

/// Builds the options used to open the database file for appending.
pub(crate) fn append_file_options() -> OpenOptions {
    let mut open_options = OpenOptions::new();
    open_options.append(true);

    #[cfg(unix)]
    {
        open_options.mode(FILE_MODE_OWNER_RW_GROUP_RO);
    }

    open_options
}

/// Builds the options used to create a database file, failing if it
/// already exists.
pub(crate) fn create_file_options() -> OpenOptions {
    let mut open_options = append_file_options();
    open_options.create_new(true);
    open_options
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;
    use crate::error::ErrorKind;

    async fn spawn_over_temp_file(dir: &TempDir) -> (WriterHandle, JoinHandle<()>, PathBuf) {
        let path = dir.child("writer.fdb");
        let file = create_file_options()
            .open(&path)
            .await
            .expect("create should not fail");
        let (handle, task) = spawn_writer(file, Arc::new(AtomicU64::new(0)));
        (handle, task, path)
    }

    #[tokio::test]
    async fn appends_are_ordered_and_sized() {
        let dir = TempDir::new().expect("temp dir should be created");
        let (handle, task, path) = spawn_over_temp_file(&dir).await;

        let size = handle
            .append(Bytes::from_static(b"first"))
            .await
            .expect("append should not fail");
        assert_eq!(size, 5);
        let size = handle
            .append(Bytes::from_static(b"second"))
            .await
            .expect("append should not fail");
        assert_eq!(size, 11);

        drop(handle);
        task.await.expect("writer task should not panic");

        let contents = tokio::fs::read(&path).await.expect("read should not fail");
        assert_eq!(contents, b"firstsecond");
    }

    #[tokio::test]
    async fn writes_fail_fast_once_task_is_gone() {
        let dir = TempDir::new().expect("temp dir should be created");
        let (handle, task, _path) = spawn_over_temp_file(&dir).await;

        task.abort();
        let _ = task.await;

        let error = handle
            .append(Bytes::from_static(b"too late"))
            .await
            .expect_err("append should fail");
        assert_eq!(error.kind(), ErrorKind::Write);
    }

    #[tokio::test]
    async fn reader_snapshots_length() {
        let dir = TempDir::new().expect("temp dir should be created");
        let (handle, task, path) = spawn_over_temp_file(&dir).await;
        handle
            .append(Bytes::from_static(b"0123456789"))
            .await
            .expect("append should not fail");

        let reader = FileReader::open(&path).await.expect("open should not fail");
        assert_eq!(reader.len(), 10);
        assert_eq!(
            reader
                .read_exact_at(3, 4)
                .await
                .expect("read should not fail"),
            b"3456"
        );

        handle
            .append(Bytes::from_static(b"ab"))
            .await
            .expect("append should not fail");
        assert_eq!(
            reader.refresh_len().await.expect("refresh should not fail"),
            12
        );

        drop(handle);
        task.await.expect("writer task should not panic");
    }

    #[tokio::test]
    async fn second_write_lock_is_refused() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = dir.child("locked.fdb");
        tokio::fs::write(&path, b"").await.expect("write should not fail");

        let _held = acquire_write_lock(&path).expect("first lock should be acquired");
        let error = acquire_write_lock(&path).expect_err("second lock should be refused");
        assert_eq!(error.kind(), ErrorKind::Write);
    }
}
