use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Error, Result};

pub const RCATSIZE_OP: &str = "operations/rcatsize";
pub const JOB_STATUS_OP: &str = "job/status";
pub const NOOP_OP: &str = "rc/noop";

/// Request/response access to the remote storage control service.
pub trait RemoteControl: Send + Sync {
    fn endpoint(&self) -> &str;

    fn call<'a>(
        &'a self,
        op: &'a str,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;
}

/// A destination of the form `remote:path`. Without a colon the path is local
/// to the control service and `fs` is `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub fs: String,
    pub remote: String,
}

impl RemotePath {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((fs, remote)) => Self {
                fs: format!("{fs}:"),
                remote: remote.to_string(),
            },
            None => Self {
                fs: "/".to_string(),
                remote: s.to_string(),
            },
        }
    }

    pub fn join(&self, item: &str) -> Self {
        let item = item.trim_start_matches('/');
        let remote = if self.remote.is_empty() {
            item.to_string()
        } else {
            format!("{}/{item}", self.remote.trim_end_matches('/'))
        };
        Self {
            fs: self.fs.clone(),
            remote,
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.fs, self.remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// Parses `user:password`; an empty string means no auth.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        if s.is_empty() {
            return Ok(None);
        }
        let (username, password) = s.split_once(':').ok_or_else(|| Error::InvalidConfig {
            message: "rc auth must be user:password".to_string(),
        })?;
        Ok(Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RcloneRcConfig {
    pub addr: String,
    pub auth: Option<BasicAuth>,
}

pub struct RcloneRc {
    config: RcloneRcConfig,
    client: reqwest::Client,
}

impl RcloneRc {
    pub fn new(config: RcloneRcConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl RemoteControl for RcloneRc {
    fn endpoint(&self) -> &str {
        &self.config.addr
    }

    fn call<'a>(
        &'a self,
        op: &'a str,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/{}",
                self.config.addr.trim_end_matches('/'),
                op.trim_start_matches('/')
            );

            let mut req = self.client.post(url).json(&body);
            if let Some(auth) = &self.config.auth {
                req = req.basic_auth(&auth.username, Some(&auth.password));
            }

            let res = req
                .send()
                .await
                .map_err(|e| Error::remote(format!("{op} request failed: {e}")))?;

            let status = res.status();
            let text = res
                .text()
                .await
                .map_err(|e| Error::remote(format!("{op} read response failed: {e}")))?;

            if !status.is_success() {
                return Err(Error::remote(format!("{op} http {status}: {text}")));
            }

            serde_json::from_str(&text)
                .map_err(|e| Error::remote(format!("{op} invalid json: {e}; body={text}")))
        })
    }
}

/// In-process control service. `operations/rcatsize` drains the referenced
/// named pipe into memory; `rc/noop` echoes its input. Both can run as async
/// jobs queried through `job/status`.
#[derive(Debug, Default)]
pub struct LoopbackRemote {
    state: Arc<LoopbackState>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    job_delay: Duration,
    next_job: AtomicU64,
    submitted: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    jobs: Mutex<HashMap<u64, JobRecord>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[derive(Debug, Clone, Default)]
struct JobRecord {
    finished: bool,
    error: String,
    output: Value,
}

#[derive(Debug, Deserialize)]
struct RcatSizeParams {
    addr: PathBuf,
    size: u64,
    fs: String,
    remote: String,
}

impl LoopbackRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every async job waits this long before doing its work.
    pub fn with_job_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(LoopbackState {
                job_delay: delay,
                ..LoopbackState::default()
            }),
        }
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().await.get(key).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.state.objects.lock().await.len()
    }

    pub fn submitted(&self) -> usize {
        self.state.submitted.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.state.peak_running.load(Ordering::SeqCst)
    }

    async fn start_job(&self, op: String, body: Value) -> Value {
        let state = self.state.clone();
        let job_id = state.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        state.submitted.fetch_add(1, Ordering::SeqCst);
        state.jobs.lock().await.insert(job_id, JobRecord::default());

        tokio::spawn(async move {
            let current = state.running.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak_running.fetch_max(current, Ordering::SeqCst);
            if !state.job_delay.is_zero() {
                tokio::time::sleep(state.job_delay).await;
            }

            let result = state.run_op(&op, body).await;
            state.running.fetch_sub(1, Ordering::SeqCst);

            let mut jobs = state.jobs.lock().await;
            if let Some(record) = jobs.get_mut(&job_id) {
                record.finished = true;
                match result {
                    Ok(output) => record.output = output,
                    Err(e) => record.error = e.to_string(),
                }
            }
            debug!(
                event = "loopback.job_finished",
                job_id,
                op = %op,
                "loopback.job_finished"
            );
        });

        json!({ "jobid": job_id })
    }
}

impl LoopbackState {
    async fn run_op(&self, op: &str, body: Value) -> Result<Value> {
        match op {
            RCATSIZE_OP => self.rcatsize(body).await,
            NOOP_OP => Ok(body),
            other => Err(Error::remote(format!("unknown op: {other}"))),
        }
    }

    async fn rcatsize(&self, body: Value) -> Result<Value> {
        let params: RcatSizeParams = serde_json::from_value(body)
            .map_err(|e| Error::remote(format!("invalid rcatsize params: {e}")))?;

        let addr = params.addr.clone();
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            std::fs::File::open(&addr)?.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| Error::remote(format!("pipe reader failed: {e}")))??;

        if data.len() as u64 != params.size {
            return Err(Error::remote(format!(
                "size mismatch for {}{}: expected {} bytes, got {}",
                params.fs,
                params.remote,
                params.size,
                data.len()
            )));
        }

        let key = format!("{}{}", params.fs, params.remote);
        self.objects.lock().await.insert(key, data);
        Ok(json!({}))
    }

    async fn job_status(&self, body: &Value) -> Result<Value> {
        let job_id = body
            .get("jobid")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::remote("job/status requires jobid"))?;
        let jobs = self.jobs.lock().await;
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| Error::remote(format!("job not found: {job_id}")))?;
        Ok(json!({
            "id": job_id,
            "finished": record.finished,
            "success": record.finished && record.error.is_empty(),
            "error": record.error,
            "output": record.output,
        }))
    }
}

impl RemoteControl for LoopbackRemote {
    fn endpoint(&self) -> &str {
        "loopback"
    }

    fn call<'a>(
        &'a self,
        op: &'a str,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            if op == JOB_STATUS_OP {
                return self.state.job_status(&body).await;
            }

            let mut body = body;
            let is_async = body
                .as_object_mut()
                .and_then(|m| m.remove("_async"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if is_async {
                match op {
                    RCATSIZE_OP | NOOP_OP => Ok(self.start_job(op.to_string(), body).await),
                    other => Err(Error::remote(format!("unknown op: {other}"))),
                }
            } else {
                self.state.run_op(op, body).await
            }
        })
    }
}
