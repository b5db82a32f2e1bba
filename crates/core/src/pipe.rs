use std::ffi::CString;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

const PIPE_NAME_PREFIX: &str = "rcatsize";
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// An ephemeral FIFO on the local filesystem. Creation fails if the path
/// already exists, so a pipe is never shared between sessions.
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
}

impl NamedPipe {
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        let path = dir.join(format!("{PIPE_NAME_PREFIX}-{}", uuid::Uuid::new_v4()));
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "pipe path contains NUL"))?;

        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666 as libc::mode_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per-transfer state shared by every exit path of one pipe transfer.
///
/// `finalize` may run any number of times from any task: it closes the
/// session's read end and pipe write handle (through the cancellation token),
/// releases a reader still blocked opening the pipe, and removes the pipe file.
#[derive(Debug)]
pub struct CopySession {
    pipe_path: PathBuf,
    closed: CancellationToken,
    write_opened: AtomicBool,
}

impl CopySession {
    pub fn new(pipe: NamedPipe) -> Arc<Self> {
        Arc::new(Self {
            pipe_path: pipe.path,
            closed: CancellationToken::new(),
            write_opened: AtomicBool::new(false),
        })
    }

    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    pub fn is_finalized(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Opens the pipe for writing. Resolves once the remote side has opened
    /// it for reading; fails if the session is finalized first.
    pub async fn open_write_end(&self) -> io::Result<tokio::fs::File> {
        loop {
            if self.is_finalized() {
                return Err(session_closed());
            }
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.pipe_path)
            {
                Ok(file) => {
                    set_blocking(&file)?;
                    self.write_opened.store(true, Ordering::SeqCst);
                    return Ok(tokio::fs::File::from_std(file));
                }
                // no reader yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = self.closed.cancelled() => {}
                _ = tokio::time::sleep(CONNECT_POLL_INTERVAL) => {}
            }
        }
    }

    pub fn guard<T>(&self, inner: T) -> Guarded<T> {
        Guarded {
            inner,
            closed: Box::pin(self.closed.clone().cancelled_owned()),
            seen_closed: false,
        }
    }

    pub fn finalize(&self) {
        self.closed.cancel();

        if !self.write_opened.load(Ordering::SeqCst) {
            release_pending_reader(&self.pipe_path);
        }

        match std::fs::remove_file(&self.pipe_path) {
            Ok(()) => debug!(
                event = "pipe.removed",
                path = %self.pipe_path.display(),
                "pipe.removed"
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                event = "pipe.remove_failed",
                path = %self.pipe_path.display(),
                error = %e,
                "pipe.remove_failed"
            ),
        }
    }
}

// A reader blocked in open() on the pipe waits for a writer. Opening the
// write end non-blocking and dropping it lets that reader through to EOF.
fn release_pending_reader(path: &Path) {
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}

fn set_blocking(file: &std::fs::File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is owned by `file` and stays open for both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn session_closed() -> io::Error {
    io::Error::new(ErrorKind::BrokenPipe, "transfer session closed")
}

/// Stream wrapper that fails every read or write once its session is finalized.
pub struct Guarded<T> {
    inner: T,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    seen_closed: bool,
}

impl<T> Guarded<T> {
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.seen_closed && self.closed.as_mut().poll(cx).is_ready() {
            self.seen_closed = true;
        }
        self.seen_closed
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Guarded<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(session_closed()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Guarded<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(session_closed()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_do_not_collide() {
        let temp = tempfile::tempdir().unwrap();
        let a = NamedPipe::create_in(temp.path()).unwrap();
        let b = NamedPipe::create_in(temp.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().exists());
        assert!(b.path().exists());
    }

    #[test]
    fn finalize_is_repeatable_and_removes_the_pipe() {
        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());
        let path = session.pipe_path().to_path_buf();

        session.finalize();
        session.finalize();
        assert!(session.is_finalized());
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finalize_from_many_tasks() {
        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());
        let path = session.pipe_path().to_path_buf();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move { session.finalize() }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finalize_stops_waiting_for_a_reader() {
        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());

        let opener = {
            let session = session.clone();
            tokio::spawn(async move { session.open_write_end().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.finalize();

        let err = tokio::time::timeout(Duration::from_secs(5), opener)
            .await
            .expect("open should give up after finalize")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(!session.pipe_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_end_connects_when_reader_opens() {
        use std::io::Read;
        use tokio::io::AsyncWriteExt;

        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());
        let path = session.pipe_path().to_path_buf();

        let reader = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            std::fs::File::open(path).unwrap().read_to_end(&mut buf).unwrap();
            buf
        });

        let mut file = session.open_write_end().await.unwrap();
        file.write_all(b"through the pipe").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(reader.await.unwrap(), b"through the pipe");
        session.finalize();
        assert!(!session.pipe_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guarded_read_fails_after_finalize() {
        use tokio::io::AsyncReadExt;

        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());
        let (_producer, consumer) = tokio::io::duplex(64);
        let mut guarded = session.guard(consumer);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            guarded.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.finalize();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
