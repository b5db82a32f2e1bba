use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, warn};

use crate::copy::{COPY_CHUNK_BYTES, StreamCopier};
use crate::jobs::JobClient;
use crate::pipe::{CopySession, NamedPipe};
use crate::remote::{RCATSIZE_OP, RemotePath};
use crate::{Error, Result};

pub const DEFAULT_BUFFER_BYTES: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TransferItem {
    pub index: u64,
    pub destination: RemotePath,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Success,
    Failed(Error),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Resolves once the transfer's remote job reaches a terminal state, or
/// immediately if the pipe or the job submission could not be set up.
#[derive(Debug)]
pub struct TransferHandle {
    index: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl TransferHandle {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub async fn outcome(self) -> TransferOutcome {
        match self.rx.await {
            Ok(Ok(_)) => TransferOutcome::Success,
            Ok(Err(e)) => TransferOutcome::Failed(e),
            Err(_) => TransferOutcome::Failed(Error::TransferAborted {
                message: format!("item {} completed without a result", self.index),
            }),
        }
    }
}

/// Write-once result slot shared by every path that may finish a transfer.
struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

impl CompletionSlot {
    fn new() -> (Arc<Self>, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    fn complete(&self, result: Result<Value>) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// Turns "upload from a local readable resource" into a writable stream: bytes
/// written to the returned stream travel through a fresh named pipe that the
/// remote job reads from.
#[derive(Clone)]
pub struct PipeTransfer {
    jobs: JobClient,
    copier: StreamCopier,
    pipe_dir: PathBuf,
    buffer_budget: u64,
    runtime: Handle,
}

impl PipeTransfer {
    /// Must be called from within a tokio runtime; sessions are spawned on it.
    pub fn new(jobs: JobClient, pipe_dir: PathBuf, buffer_budget: u64) -> Self {
        Self {
            jobs,
            copier: StreamCopier::new(),
            pipe_dir,
            buffer_budget,
            runtime: Handle::current(),
        }
    }

    pub fn with_copier(mut self, copier: StreamCopier) -> Self {
        self.copier = copier;
        self
    }

    pub fn jobs(&self) -> &JobClient {
        &self.jobs
    }

    /// Returns the write end immediately. The first write stalls until the
    /// remote side has opened the pipe.
    pub fn open(&self, item: &TransferItem) -> (DuplexStream, TransferHandle) {
        let (producer, session_end) = tokio::io::duplex(COPY_CHUNK_BYTES);
        let (slot, rx) = CompletionSlot::new();
        self.runtime
            .spawn(self.clone().run_session(item.clone(), session_end, slot));
        (
            producer,
            TransferHandle {
                index: item.index,
                rx,
            },
        )
    }

    /// Blocking-I/O flavour of [`PipeTransfer::open`] for synchronous producers.
    /// The writer must be used off the async worker threads.
    pub fn open_writer(&self, item: &TransferItem) -> (SyncIoBridge<DuplexStream>, TransferHandle) {
        let (stream, handle) = self.open(item);
        (
            SyncIoBridge::new_with_handle(stream, self.runtime.clone()),
            handle,
        )
    }

    async fn run_session(
        self,
        item: TransferItem,
        session_end: DuplexStream,
        slot: Arc<CompletionSlot>,
    ) {
        let pipe = match NamedPipe::create_in(&self.pipe_dir) {
            Ok(pipe) => pipe,
            Err(e) => {
                error!(
                    event = "transfer.pipe_create_failed",
                    index = item.index,
                    dir = %self.pipe_dir.display(),
                    error = %e,
                    "transfer.pipe_create_failed"
                );
                // dropping session_end fails the producer's writes
                slot.complete(Err(e.into()));
                return;
            }
        };
        let session = CopySession::new(pipe);
        debug!(
            event = "transfer.pipe_created",
            index = item.index,
            destination = %item.destination,
            pipe = %session.pipe_path().display(),
            "transfer.pipe_created"
        );

        // The remote side opens the pipe for reading, so the job goes out
        // before the write end is opened.
        tokio::spawn(submit_job(
            self.jobs.clone(),
            rcatsize_params(&item, &session),
            session.clone(),
            slot.clone(),
            item.destination.to_string(),
        ));

        let pipe_writer = match session.open_write_end().await {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    event = "transfer.pipe_open_failed",
                    index = item.index,
                    error = %e,
                    "transfer.pipe_open_failed"
                );
                // the job's callback reports the outcome
                session.finalize();
                return;
            }
        };
        if session.is_finalized() {
            return;
        }
        debug!(event = "transfer.pipe_connected", index = item.index, "transfer.pipe_connected");

        let budget = self.buffer_budget.min(item.size) as usize;
        let (read, writer) = self
            .copier
            .copy_pipelined(
                session.guard(pipe_writer),
                session.guard(session_end),
                budget,
            )
            .await;
        debug!(
            event = "transfer.reader_finished",
            index = item.index,
            bytes = read.bytes,
            error = ?read.error,
            "transfer.reader_finished"
        );

        tokio::spawn(async move {
            let outcome = writer.finish().await;
            if let Some(e) = &outcome.error {
                warn!(
                    event = "transfer.writer_failed",
                    index = item.index,
                    bytes = outcome.bytes,
                    error = %e,
                    "transfer.writer_failed"
                );
            } else {
                debug!(
                    event = "transfer.writer_finished",
                    index = item.index,
                    bytes = outcome.bytes,
                    "transfer.writer_finished"
                );
            }
            // closing the pipe lets the remote job see end of data
            session.finalize();
        });
    }
}

async fn submit_job(
    jobs: JobClient,
    params: Value,
    session: Arc<CopySession>,
    slot: Arc<CompletionSlot>,
    destination: String,
) {
    let on_done = {
        let session = session.clone();
        let slot = slot.clone();
        move |result: Result<Value>| {
            session.finalize();
            slot.complete(result);
        }
    };

    if let Err(e) = jobs.submit_async(RCATSIZE_OP, params, on_done).await {
        warn!(
            event = "transfer.submit_failed",
            destination = %destination,
            error = %e,
            "transfer.submit_failed"
        );
        session.finalize();
        slot.complete(Err(e));
    }
}

fn rcatsize_params(item: &TransferItem, session: &CopySession) -> Value {
    let mut params = json!({
        "type": "fifo",
        "addr": session.pipe_path().to_string_lossy(),
        "size": item.size,
        "fs": item.destination.fs,
        "remote": item.destination.remote,
    });
    if let Some(modified) = item.modified {
        params["modtime"] = json!(modified.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_slot_accepts_one_result() {
        let (slot, mut rx) = CompletionSlot::new();
        assert!(slot.complete(Ok(json!({ "first": true }))));
        assert!(!slot.complete(Err(Error::remote("late"))));
        let got = rx.try_recv().unwrap().unwrap();
        assert_eq!(got, json!({ "first": true }));
    }

    #[test]
    fn rcatsize_params_carry_pipe_and_destination() {
        let temp = tempfile::tempdir().unwrap();
        let session = CopySession::new(NamedPipe::create_in(temp.path()).unwrap());
        let item = TransferItem {
            index: 3,
            destination: RemotePath::parse("remote:dir/file.bin"),
            size: 1024,
            modified: DateTime::from_timestamp(1_700_000_000, 0),
        };

        let params = rcatsize_params(&item, &session);
        assert_eq!(params["type"], "fifo");
        assert_eq!(params["size"], 1024);
        assert_eq!(params["fs"], "remote:");
        assert_eq!(params["remote"], "dir/file.bin");
        assert_eq!(params["modtime"], "2023-11-14T22:13:20Z");
        assert_eq!(
            params["addr"].as_str().unwrap(),
            session.pipe_path().to_string_lossy()
        );
        session.finalize();
    }
}
