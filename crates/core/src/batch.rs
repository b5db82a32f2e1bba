use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::{ArchiveDecoder, ArchiveEntry, ExtractReport, ItemSink};
use crate::error::FailedItem;
use crate::progress::{NoProgress, ProgressSink};
use crate::remote::RemotePath;
use crate::transfer::{PipeTransfer, TransferHandle, TransferItem, TransferOutcome};
use crate::{Error, Result};

pub const DEFAULT_MAX_ROUNDS: u32 = 10;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub destination: RemotePath,
    pub max_rounds: u32,
}

impl BatchConfig {
    pub fn new(destination: RemotePath) -> Self {
        Self {
            destination,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    pub progress: Option<Arc<dyn ProgressSink>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub round: u32,
    pub attempted: Vec<u64>,
    pub transferred: u64,
    pub failed: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub items_total: u64,
    pub rounds: Vec<RoundSummary>,
}

pub async fn run_batch<D>(
    decoder: D,
    transfer: &PipeTransfer,
    config: &BatchConfig,
) -> Result<BatchReport>
where
    D: ArchiveDecoder + 'static,
{
    run_batch_with(decoder, transfer, config, BatchOptions::default()).await
}

/// Extracts every item through `transfer`, retrying failed items in further
/// rounds until none fail or `config.max_rounds` rounds have run.
pub async fn run_batch_with<D>(
    decoder: D,
    transfer: &PipeTransfer,
    config: &BatchConfig,
    options: BatchOptions,
) -> Result<BatchReport>
where
    D: ArchiveDecoder + 'static,
{
    let max_rounds = config.max_rounds.max(1);
    let progress: Arc<dyn ProgressSink> = options.progress.unwrap_or_else(|| Arc::new(NoProgress));
    let items_total = decoder.item_count();
    let mut decoder = decoder;
    let mut pending: Vec<u64> = (0..items_total).collect();
    let mut report = BatchReport {
        items_total,
        rounds: Vec::new(),
    };
    let mut failed = Vec::new();

    info!(
        event = "batch.start",
        items_total,
        destination = %config.destination,
        max_rounds,
        "batch.start"
    );

    for round in 1..=max_rounds {
        info!(
            event = "batch.round_start",
            round,
            items = pending.len(),
            "Extracting all items ({} items), round {round}",
            pending.len()
        );

        let sink = TransferSink {
            transfer: transfer.clone(),
            destination: config.destination.clone(),
            started: Vec::new(),
        };
        let indices = pending.clone();
        let progress = progress.clone();
        let (returned, sink, extracted) = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let extracted = decoder.extract(&indices, &mut sink, progress.as_ref());
            (decoder, sink, extracted)
        })
        .await
        .map_err(|e| Error::archive(format!("decoder task failed: {e}")))?;
        decoder = returned;

        let outcomes = settle(transfer, sink.started).await;
        let extract_report = match extracted {
            Ok(r) => r,
            Err(e) => {
                error!(event = "batch.decoder_failed", round, error = %e, "batch.decoder_failed");
                return Err(e);
            }
        };

        failed = collect_failures(&outcomes, &extract_report);
        let summary = RoundSummary {
            round,
            attempted: pending.clone(),
            transferred: outcomes.iter().filter(|o| o.outcome.is_success()).count() as u64,
            failed: failed.iter().map(|f| f.index).collect(),
        };
        info!(
            event = "batch.round_finished",
            round,
            attempted = summary.attempted.len(),
            transferred = summary.transferred,
            failed = summary.failed.len(),
            "batch.round_finished"
        );
        report.rounds.push(summary);

        if failed.is_empty() {
            info!(event = "batch.finished", rounds = round, "batch.finished");
            return Ok(report);
        }
        let failed_paths: Vec<&str> = failed.iter().map(|f| f.path.as_str()).collect();
        warn!(
            event = "batch.items_failed",
            round,
            items = ?failed_paths,
            "Items failed: {}",
            failed.len()
        );
        pending = failed.iter().map(|f| f.index).collect();
    }

    Err(Error::BatchFailed {
        rounds: max_rounds,
        items: failed,
    })
}

struct Settled {
    index: u64,
    path: String,
    outcome: TransferOutcome,
}

/// Barrier: every transfer started this round has reported and every polling
/// task has released its ticket.
async fn settle(transfer: &PipeTransfer, started: Vec<(String, TransferHandle)>) -> Vec<Settled> {
    let mut settled = Vec::with_capacity(started.len());
    for (path, handle) in started {
        let index = handle.index();
        let outcome = handle.outcome().await;
        match &outcome {
            TransferOutcome::Success => {
                info!(event = "transfer.finished", index, path = %path, "transfer.finished");
            }
            TransferOutcome::Failed(e) => {
                error!(event = "transfer.failed", index, path = %path, error = %e, "transfer.failed");
            }
        }
        settled.push(Settled {
            index,
            path,
            outcome,
        });
    }
    transfer.jobs().wait_idle().await;
    settled
}

/// Failed transfers, plus items the decoder gave up on before any transfer
/// was started for them.
fn collect_failures(outcomes: &[Settled], extract: &ExtractReport) -> Vec<FailedItem> {
    let mut failed = BTreeMap::new();
    for s in outcomes {
        if let TransferOutcome::Failed(e) = &s.outcome {
            failed.insert(
                s.index,
                FailedItem {
                    index: s.index,
                    path: s.path.clone(),
                    error: e.to_string(),
                },
            );
        }
    }
    for item_error in &extract.errors {
        warn!(
            event = "batch.extract_error",
            index = item_error.index,
            path = %item_error.path,
            error = %item_error.message,
            "batch.extract_error"
        );
        let started = outcomes.iter().any(|s| s.index == item_error.index);
        if !started {
            failed.entry(item_error.index).or_insert_with(|| FailedItem {
                index: item_error.index,
                path: item_error.path.clone(),
                error: item_error.message.clone(),
            });
        }
    }
    failed.into_values().collect()
}

struct TransferSink {
    transfer: PipeTransfer,
    destination: RemotePath,
    started: Vec<(String, TransferHandle)>,
}

impl ItemSink for TransferSink {
    fn open_item(&mut self, entry: &ArchiveEntry) -> io::Result<Box<dyn Write + Send>> {
        let item = TransferItem {
            index: entry.index,
            destination: self.destination.join(&entry.path),
            size: entry.size,
            modified: entry.modified,
        };
        let (writer, handle) = self.transfer.open_writer(&item);
        self.started.push((entry.path.clone(), handle));
        Ok(Box::new(writer))
    }
}
