use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use archive_pipe_core::config::{Settings, load_settings, validate_settings};
use archive_pipe_core::logging::{RunLogGuard, init_logging, start_run_log};
use archive_pipe_core::{
    APP_NAME, BatchConfig, BatchOptions, BatchReport, Error, JobClient, NOOP_OP, PipeTransfer,
    RcloneRc, RemotePath, StreamCopier, ThrottledProgressLog, open_archive, run_batch_with,
};
use clap::Parser;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "archivepipe")]
#[command(about = "Stream archive items into an rclone remote without unpacking to disk", long_about = None)]
struct Cli {
    /// Archive to upload (.zip or .tar)
    archive: PathBuf,

    /// Upload destination (fs:path)
    destination: String,

    #[arg(long)]
    password: Option<String>,

    /// Max running transfers
    #[arg(long)]
    transfers: Option<usize>,

    /// Buffer in bytes between the archive reader and rclone
    #[arg(long)]
    buffer: Option<u64>,

    /// Max extraction rounds before giving up on failed items
    #[arg(long)]
    rounds: Option<u32>,

    /// URL of the rclone rc server
    #[arg(long, env = "RC_ADDR")]
    rc_addr: Option<String>,

    /// user:password for the rclone rc server
    #[arg(long, env = "RC_AUTH")]
    rc_auth: Option<String>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write NDJSON logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, env = "RC_DEBUG")]
    debug: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        match &e {
            Error::InvalidConfig { .. } => Self::new("config.invalid", e.to_string()),
            Error::Io(_) => Self::new("io.failed", e.to_string()),
            Error::Remote { .. } => Self::retryable("rc.failed", e.to_string()),
            Error::Archive { .. } => Self::new("archive.invalid", e.to_string()),
            Error::Copy(_) | Error::TransferAborted { .. } => {
                Self::retryable("transfer.failed", e.to_string())
            }
            Error::BatchFailed { rounds, items } => {
                let failed: Vec<_> = items
                    .iter()
                    .map(|i| serde_json::json!({ "index": i.index, "path": i.path, "error": i.error }))
                    .collect();
                Self::retryable("batch.failed", e.to_string())
                    .with_details(serde_json::json!({ "rounds": rounds, "items": failed }))
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(std::io::stderr(), "{}", error_line(&e, json));
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let _run_log = setup_logging(&cli)?;

    let settings = resolve_settings(&cli)?;
    tracing::info!(
        event = "cli.start",
        app = APP_NAME,
        archive = %cli.archive.display(),
        destination = %cli.destination,
        rc_addr = %settings.rc.addr,
        max_transfers = settings.transfer.max_transfers,
        buffer_bytes = settings.transfer.buffer_bytes,
        max_rounds = settings.transfer.max_rounds,
        "cli.start"
    );

    let remote = RcloneRc::new(settings.rc_config()?);
    let jobs = JobClient::new(Arc::new(remote), settings.transfer.max_transfers)
        .with_poll_interval(settings.poll_interval());
    jobs.call(NOOP_OP, serde_json::json!({}))
        .await
        .map_err(|e| CliError::retryable("rc.unavailable", e.to_string()))?;

    let transfer = PipeTransfer::new(
        jobs,
        std::env::temp_dir(),
        settings.transfer.buffer_bytes,
    )
    .with_copier(StreamCopier::new().with_liveness(settings.liveness()));

    let archive = cli.archive.clone();
    let password = cli.password.clone();
    let decoder = tokio::task::spawn_blocking(move || open_archive(&archive, password.as_deref()))
        .await
        .map_err(|e| CliError::new("archive.invalid", format!("open task failed: {e}")))??;

    let config = BatchConfig {
        destination: RemotePath::parse(&cli.destination),
        max_rounds: settings.transfer.max_rounds,
    };
    let options = BatchOptions {
        progress: Some(Arc::new(ThrottledProgressLog::default())),
    };
    let report = run_batch_with(decoder, &transfer, &config, options).await?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string(&report)
                .map_err(|e| CliError::new("json.encode_failed", e.to_string()))?
        );
    } else {
        println!("{}", summary_line(&report, &config.destination));
    }
    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<Option<RunLogGuard>, CliError> {
    match &cli.log_file {
        Some(path) => start_run_log(path, cli.debug)
            .map(Some)
            .map_err(|e| CliError::new("log.open_failed", e.to_string())),
        None => {
            init_logging(cli.debug);
            Ok(None)
        }
    }
}

/// Config file, then env/flags on top.
fn resolve_settings(cli: &Cli) -> Result<Settings, CliError> {
    let mut settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };

    if let Some(v) = &cli.rc_addr {
        settings.rc.addr = v.clone();
    }
    if let Some(v) = &cli.rc_auth {
        settings.rc.auth = v.clone();
    }
    if let Some(v) = cli.poll_interval_ms {
        settings.rc.poll_interval_ms = v;
    }
    if let Some(v) = cli.transfers {
        settings.transfer.max_transfers = v;
    }
    if let Some(v) = cli.buffer {
        settings.transfer.buffer_bytes = v;
    }
    if let Some(v) = cli.rounds {
        settings.transfer.max_rounds = v;
    }

    validate_settings(&settings)?;
    Ok(settings)
}

fn summary_line(report: &BatchReport, destination: &RemotePath) -> String {
    let transferred: u64 = report.rounds.iter().map(|r| r.transferred).sum();
    format!(
        "transferred {transferred} items to {destination} in {} round(s)",
        report.rounds.len()
    )
}

fn error_line(e: &CliError, json: bool) -> String {
    if json {
        return serde_json::to_string(e).unwrap_or_else(|_| {
            "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string()
        });
    }
    let mut line = format!("error[{}]: {}", e.code, e.message);
    if let Some(items) = e.details.get("items").and_then(|v| v.as_array()) {
        for item in items {
            let path = item.get("path").and_then(|v| v.as_str()).unwrap_or("?");
            let error = item.get("error").and_then(|v| v.as_str()).unwrap_or("");
            line.push_str(&format!("\n  {path}: {error}"));
        }
    }
    if e.retryable {
        line.push_str("\n(retryable)");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use archive_pipe_core::{FailedItem, RoundSummary};

    #[test]
    fn summary_counts_transferred_items_across_rounds() {
        let report = BatchReport {
            items_total: 4,
            rounds: vec![
                RoundSummary {
                    round: 1,
                    attempted: vec![0, 1, 2, 3],
                    transferred: 2,
                    failed: vec![3],
                },
                RoundSummary {
                    round: 2,
                    attempted: vec![3],
                    transferred: 1,
                    failed: vec![],
                },
            ],
        };
        let line = summary_line(&report, &RemotePath::parse("remote:out"));
        assert_eq!(line, "transferred 3 items to remote:out in 2 round(s)");
    }

    #[test]
    fn errors_are_json_only_when_asked() {
        let e = CliError::from(Error::BatchFailed {
            rounds: 2,
            items: vec![FailedItem {
                index: 1,
                path: "bad.bin".to_string(),
                error: "upload refused".to_string(),
            }],
        });

        let v: serde_json::Value = serde_json::from_str(&error_line(&e, true)).unwrap();
        assert_eq!(v["code"], "batch.failed");
        assert_eq!(v["details"]["items"][0]["path"], "bad.bin");

        let text = error_line(&e, false);
        assert!(text.starts_with("error[batch.failed]: "), "{text}");
        assert!(text.contains("bad.bin: upload refused"), "{text}");
        assert!(serde_json::from_str::<serde_json::Value>(&text).is_err());
    }
}
