use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const COPY_CHUNK_BYTES: usize = 32 * 1024;
pub const WRITER_LIVENESS: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("short write: {written} of {requested} bytes accepted")]
    ShortWrite { requested: usize, written: usize },
}

impl CopyError {
    fn duplicate(&self) -> Self {
        match self {
            Self::Read(e) => Self::Read(std::io::Error::new(e.kind(), e.to_string())),
            Self::Write(e) => Self::Write(std::io::Error::new(e.kind(), e.to_string())),
            Self::ShortWrite { requested, written } => Self::ShortWrite {
                requested: *requested,
                written: *written,
            },
        }
    }
}

#[derive(Debug)]
pub struct CopyOutcome {
    pub bytes: u64,
    pub error: Option<CopyError>,
}

impl CopyOutcome {
    pub fn into_result(self) -> std::result::Result<u64, CopyError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.bytes),
        }
    }
}

/// Two-task copier: a reader task fills a bounded queue with fixed-size chunks
/// and a writer task drains it into the destination in FIFO order.
#[derive(Debug, Clone)]
pub struct StreamCopier {
    chunk_bytes: usize,
    liveness: Duration,
}

impl Default for StreamCopier {
    fn default() -> Self {
        Self {
            chunk_bytes: COPY_CHUNK_BYTES,
            liveness: WRITER_LIVENESS,
        }
    }
}

impl StreamCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_liveness(mut self, liveness: Duration) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    pub fn queue_capacity(&self, buffer_budget: usize) -> usize {
        buffer_budget / self.chunk_bytes + 1
    }

    /// Copies until both tasks finish. End-of-stream is reported as success.
    pub async fn copy<W, R>(&self, dst: W, src: R, buffer_budget: usize) -> CopyOutcome
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (reader, writer) = self.spawn(dst, src, buffer_budget);
        let state = writer.state.clone();
        if let Err(e) = reader.await {
            state.record(CopyError::Read(std::io::Error::other(format!(
                "reader task failed: {e}"
            ))));
        }
        writer.finish().await
    }

    /// Returns as soon as the reader task finishes. The writer keeps draining
    /// the queue in the background; its outcome comes from the returned handle.
    pub async fn copy_pipelined<W, R>(
        &self,
        dst: W,
        src: R,
        buffer_budget: usize,
    ) -> (CopyOutcome, WriterHandle)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (reader, writer) = self.spawn(dst, src, buffer_budget);
        let bytes_read = match reader.await {
            Ok(n) => n,
            Err(e) => {
                writer.state.record(CopyError::Read(std::io::Error::other(format!(
                    "reader task failed: {e}"
                ))));
                0
            }
        };
        let read = CopyOutcome {
            bytes: bytes_read,
            error: writer.state.peek_error(),
        };
        (read, writer)
    }

    fn spawn<W, R>(&self, dst: W, src: R, buffer_budget: usize) -> (JoinHandle<u64>, WriterHandle)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capacity = self.queue_capacity(buffer_budget);
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(CopyState::default());
        debug!(
            event = "copy.start",
            chunk_bytes = self.chunk_bytes,
            queue_capacity = capacity,
            "copy.start"
        );

        let reader = tokio::spawn(read_loop(src, tx, state.clone(), self.chunk_bytes));
        let task = tokio::spawn(write_loop(dst, rx, state.clone(), self.liveness));
        (reader, WriterHandle { task, state })
    }
}

pub struct WriterHandle {
    task: JoinHandle<u64>,
    state: Arc<CopyState>,
}

impl WriterHandle {
    pub async fn finish(self) -> CopyOutcome {
        let bytes = match self.task.await {
            Ok(n) => n,
            Err(e) => {
                self.state
                    .record(CopyError::Write(std::io::Error::other(format!(
                        "writer task failed: {e}"
                    ))));
                0
            }
        };
        CopyOutcome {
            bytes,
            error: self.state.take_error(),
        }
    }
}

#[derive(Debug, Default)]
struct CopyState {
    error: Mutex<Option<CopyError>>,
    failed: AtomicBool,
    reader_done: AtomicBool,
}

impl CopyState {
    fn record(&self, err: CopyError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Copy of the first error, left in place for the writer's report.
    fn peek_error(&self) -> Option<CopyError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(CopyError::duplicate)
    }

    fn take_error(&self) -> Option<CopyError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn reader_done(&self) -> bool {
        self.reader_done.load(Ordering::SeqCst)
    }
}

async fn read_loop<R>(
    mut src: R,
    tx: mpsc::Sender<Vec<u8>>,
    state: Arc<CopyState>,
    chunk_bytes: usize,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut read = 0u64;
    while !state.failed() {
        let mut buf = vec![0u8; chunk_bytes];
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                read += n as u64;
                // the writer dropped its end after a failure
                if tx.send(buf).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                state.record(CopyError::Read(e));
                break;
            }
        }
    }
    state.reader_done.store(true, Ordering::SeqCst);
    trace!(event = "copy.reader_done", bytes_read = read, "copy.reader_done");
    read
}

async fn write_loop<W>(
    mut dst: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    state: Arc<CopyState>,
    liveness: Duration,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let chunk = match tokio::time::timeout(liveness, rx.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) if state.reader_done() => break,
            Err(_) => {
                trace!(event = "copy.writer_idle", "copy.writer_idle");
                continue;
            }
        };

        match dst.write(&chunk).await {
            Ok(n) if n < chunk.len() => {
                written += n as u64;
                state.record(CopyError::ShortWrite {
                    requested: chunk.len(),
                    written: n,
                });
                return written;
            }
            Ok(n) => written += n as u64,
            Err(e) => {
                state.record(CopyError::Write(e));
                return written;
            }
        }
    }

    if let Err(e) = dst.flush().await {
        state.record(CopyError::Write(e));
    }
    trace!(event = "copy.writer_done", bytes_written = written, "copy.writer_done");
    written
}
