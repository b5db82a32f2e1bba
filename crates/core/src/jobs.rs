use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::remote::{JOB_STATUS_OP, RemoteControl};
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const ASYNC_MARKER: &str = "_async";

/// Submits async jobs to the control service under a global transfer budget.
///
/// A ticket is taken before each submission and held by the job's polling
/// task until the completion callback has run, so at most `max_transfers`
/// jobs occupy backend capacity at once.
#[derive(Clone)]
pub struct JobClient {
    remote: Arc<dyn RemoteControl>,
    tickets: Arc<Semaphore>,
    max_tickets: usize,
    active: Arc<ActiveJobs>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error: Option<String>,
}

impl JobClient {
    pub fn new(remote: Arc<dyn RemoteControl>, max_transfers: usize) -> Self {
        let max_tickets = max_transfers.max(1);
        Self {
            remote,
            tickets: Arc::new(Semaphore::new(max_tickets)),
            max_tickets,
            active: Arc::new(ActiveJobs::default()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoint(&self) -> &str {
        self.remote.endpoint()
    }

    pub fn max_tickets(&self) -> usize {
        self.max_tickets
    }

    pub fn outstanding_tickets(&self) -> usize {
        self.max_tickets - self.tickets.available_permits()
    }

    pub fn active_jobs(&self) -> usize {
        self.active.count.load(Ordering::SeqCst)
    }

    /// Synchronous call: the response body is the result.
    pub async fn call(&self, op: &str, params: Value) -> Result<Value> {
        self.remote.call(op, params).await
    }

    /// Submits `op` as an async job and returns its id. `on_done` runs exactly
    /// once, from the polling task, when the job finishes or fails. If the
    /// submission itself fails, `on_done` is dropped without being called and
    /// the ticket is returned before the error.
    pub async fn submit_async<F>(&self, op: &str, params: Value, on_done: F) -> Result<u64>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidConfig {
                    message: format!("job params must be an object, got {other}"),
                });
            }
        };
        body.insert(ASYNC_MARKER.to_string(), Value::Bool(true));

        let ticket = self
            .tickets
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::remote("transfer budget closed"))?;
        debug!(
            event = "job.ticket_acquired",
            op,
            outstanding = self.outstanding_tickets(),
            "job.ticket_acquired"
        );

        let resp = self.remote.call(op, Value::Object(body)).await?;
        let job_id = parse_job_id(&resp)?;
        debug!(event = "job.submitted", op, job_id, "job.submitted");

        let guard = self.active.enter();
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.poll_until_terminal(job_id).await;
            on_done(result);
            drop(ticket);
            drop(guard);
        });

        Ok(job_id)
    }

    async fn poll_until_terminal(&self, job_id: u64) -> Result<Value> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let resp = match self.call(JOB_STATUS_OP, json!({ "jobid": job_id })).await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(
                        event = "job.status_failed",
                        job_id,
                        error = %e,
                        "job.status_failed"
                    );
                    continue;
                }
            };

            let status: JobStatus = match serde_json::from_value(resp.clone()) {
                Ok(status) => status,
                Err(e) => {
                    warn!(event = "job.status_invalid", job_id, error = %e, "job.status_invalid");
                    return Err(Error::remote(format!(
                        "job {job_id} status unreadable: {e}; body={resp}"
                    )));
                }
            };

            if let Some(error) = status.error.filter(|e| !e.is_empty()) {
                warn!(event = "job.failed", job_id, error = %error, "job.failed");
                return Err(Error::remote(format!("job {job_id} failed: {error}")));
            }
            if status.finished {
                debug!(event = "job.finished", job_id, "job.finished");
                return Ok(resp);
            }
        }
    }

    /// Waits until every polling task has delivered its callback.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.active.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let active = self.active_jobs();
            if active == 0 {
                info!(event = "job.all_finished", "All async jobs finished");
                return;
            }
            info!(event = "job.waiting", active, "Still {active} jobs running");
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }
}

fn parse_job_id(resp: &Value) -> Result<u64> {
    resp.get("jobid")
        .and_then(Value::as_u64)
        .filter(|id| *id != 0)
        .ok_or_else(|| Error::remote(format!("failed to get returned jobid, server resp: {resp}")))
}

#[derive(Debug, Default)]
struct ActiveJobs {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveJobs {
    fn enter(self: &Arc<Self>) -> ActiveJobGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveJobGuard(self.clone())
    }
}

struct ActiveJobGuard(Arc<ActiveJobs>);

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_must_be_present_and_nonzero() {
        assert_eq!(parse_job_id(&json!({ "jobid": 7 })).unwrap(), 7);
        assert!(parse_job_id(&json!({ "jobid": 0 })).is_err());
        assert!(parse_job_id(&json!({ "id": 3 })).is_err());
        assert!(parse_job_id(&json!("nope")).is_err());
    }
}
