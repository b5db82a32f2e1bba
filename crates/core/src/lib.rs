mod archive;
mod batch;
pub mod config;
mod copy;
mod error;
mod jobs;
pub mod logging;
mod pipe;
mod progress;
mod remote;
mod transfer;

pub const APP_NAME: &str = "archivepipe";

pub use archive::{
    ArchiveDecoder, ArchiveEntry, ExtractReport, ItemError, ItemSink, MemoryArchive, TarDecoder,
    ZipDecoder, normalize_item_path, open_archive,
};
pub use batch::{
    BatchConfig, BatchOptions, BatchReport, DEFAULT_MAX_ROUNDS, RoundSummary, run_batch,
    run_batch_with,
};
pub use copy::{COPY_CHUNK_BYTES, CopyError, CopyOutcome, StreamCopier, WRITER_LIVENESS, WriterHandle};
pub use error::{Error, FailedItem, Result};
pub use jobs::{DEFAULT_POLL_INTERVAL, JobClient};
pub use pipe::{CopySession, Guarded, NamedPipe};
pub use progress::{
    ExtractProgress, NoProgress, PROGRESS_REPORT_INTERVAL, ProgressSink, ThrottledProgressLog,
    format_bytes_iec,
};
pub use remote::{
    BasicAuth, JOB_STATUS_OP, LoopbackRemote, NOOP_OP, RCATSIZE_OP, RcloneRc, RcloneRcConfig,
    RemoteControl, RemotePath,
};
pub use transfer::{
    DEFAULT_BUFFER_BYTES, PipeTransfer, TransferHandle, TransferItem, TransferOutcome,
};
