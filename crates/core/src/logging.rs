use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "ARCHIVEPIPE_LOG";

static RUN_LOG: RunLogSink = RunLogSink {
    file: Mutex::new(None),
};

/// Where the JSON layer sends events. Empty until [`start_run_log`] opens a
/// file; events emitted meanwhile are dropped.
struct RunLogSink {
    file: Mutex<Option<RunLogFile>>,
}

struct RunLogFile {
    path: PathBuf,
    file: File,
}

impl RunLogSink {
    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = slot.as_ref() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("run log already active: {}", active.path.display()),
            ));
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *slot = Some(RunLogFile {
            path: path.to_path_buf(),
            file,
        });
        Ok(())
    }

    /// Closes the file only if it is still the one opened at `path`.
    fn close(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(active) if active.path == path => active.file.sync_all(),
            other => {
                *slot = other;
                Ok(())
            }
        }
    }

    fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(active) => active.file.write_all(line),
            None => Ok(()),
        }
    }
}

/// Collects one formatted event and appends it in a single write when
/// dropped, so lines from concurrent tasks never interleave.
struct EventLine<'a> {
    sink: &'a RunLogSink,
    buf: Vec<u8>,
}

impl Write for EventLine<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for EventLine<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.sink.append(&self.buf);
        }
    }
}

impl<'a> MakeWriter<'a> for &'static RunLogSink {
    type Writer = EventLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        EventLine {
            sink: *self,
            buf: Vec::with_capacity(256),
        }
    }
}

fn build_env_filter_from(
    archivepipe_log: Option<&str>,
    rust_log: Option<&str>,
    default: &str,
) -> EnvFilter {
    let fallback = || EnvFilter::new(default);

    if let Some(v) = archivepipe_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| fallback());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| fallback());
    }
    fallback()
}

fn build_env_filter(debug: bool) -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        if debug { "debug" } else { "info" },
    )
}

/// Installs the global subscriber: human-readable lines on stderr plus the
/// NDJSON run log. Once a subscriber is installed, later calls do nothing.
pub fn init_logging(debug: bool) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(&RUN_LOG);

    let _ = tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(stderr_layer)
        .with(json_layer)
        .try_init();
}

pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        let _ = RUN_LOG.close(&self.path);
    }
}

/// Starts appending NDJSON events to `path` until the guard is dropped.
pub fn start_run_log(path: &Path, debug: bool) -> std::io::Result<RunLogGuard> {
    init_logging(debug);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    RUN_LOG.open(path)?;

    Ok(RunLogGuard {
        path: path.to_path_buf(),
    })
}
