use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use archive_pipe_core::{Error, JobClient, LoopbackRemote, NOOP_OP, RCATSIZE_OP, RemoteControl};
use serde_json::{Value, json};

const POLL: Duration = Duration::from_millis(10);

/// Fails every call; counts how many arrived.
#[derive(Default)]
struct FailOnSubmit {
    calls: AtomicUsize,
}

impl RemoteControl for FailOnSubmit {
    fn endpoint(&self) -> &str {
        "test.fail"
    }

    fn call<'a>(
        &'a self,
        op: &'a str,
        _body: Value,
    ) -> Pin<Box<dyn Future<Output = archive_pipe_core::Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Remote {
                message: format!("{op} unavailable"),
            })
        })
    }
}

/// Accepts submissions but answers with an unusable job id.
struct ZeroJobId;

impl RemoteControl for ZeroJobId {
    fn endpoint(&self) -> &str {
        "test.zero"
    }

    fn call<'a>(
        &'a self,
        _op: &'a str,
        _body: Value,
    ) -> Pin<Box<dyn Future<Output = archive_pipe_core::Result<Value>> + Send + 'a>> {
        Box::pin(async move { Ok(json!({ "jobid": 0 })) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tickets_bound_running_jobs_and_return_to_zero() {
    const MAX: usize = 3;
    const JOBS: usize = 12;

    let remote = Arc::new(LoopbackRemote::with_job_delay(Duration::from_millis(40)));
    let client = JobClient::new(remote.clone(), MAX).with_poll_interval(POLL);
    let done = Arc::new(AtomicUsize::new(0));
    let peak_tickets = Arc::new(AtomicUsize::new(0));

    let mut submits = Vec::new();
    for i in 0..JOBS {
        let client = client.clone();
        let done = done.clone();
        let peak_tickets = peak_tickets.clone();
        submits.push(tokio::spawn(async move {
            let observer = client.clone();
            client
                .submit_async(NOOP_OP, json!({ "n": i }), move |result| {
                    assert!(result.is_ok());
                    peak_tickets.fetch_max(observer.outstanding_tickets(), Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
        }));
    }
    for s in submits {
        let job_id = s.await.unwrap().unwrap();
        assert!(job_id >= 1);
    }

    client.wait_idle().await;

    assert_eq!(done.load(Ordering::SeqCst), JOBS);
    assert_eq!(remote.submitted(), JOBS);
    assert!(remote.peak_running() <= MAX, "peak {}", remote.peak_running());
    let peak = peak_tickets.load(Ordering::SeqCst);
    assert!((1..=MAX).contains(&peak), "peak tickets {peak}");
    assert_eq!(client.outstanding_tickets(), 0);
    assert_eq!(client.active_jobs(), 0);
}

#[tokio::test]
async fn failed_submissions_return_their_ticket_and_skip_the_callback() {
    let remote = Arc::new(FailOnSubmit::default());
    let client = JobClient::new(remote.clone(), 1).with_poll_interval(POLL);
    let called = Arc::new(AtomicUsize::new(0));

    // more attempts than tickets: a leaked ticket would hang the next submit
    for _ in 0..3 {
        let called = called.clone();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            client.submit_async(RCATSIZE_OP, json!({}), move |_| {
                called.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("ticket leaked");
        assert!(matches!(res, Err(Error::Remote { .. })));
        assert_eq!(client.outstanding_tickets(), 0);
    }

    assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
    assert_eq!(called.load(Ordering::SeqCst), 0);
    client.wait_idle().await;
}

#[tokio::test]
async fn zero_job_id_is_rejected() {
    let client = JobClient::new(Arc::new(ZeroJobId), 2).with_poll_interval(POLL);
    let res = client.submit_async(NOOP_OP, json!({}), |_| {}).await;
    match res {
        Err(Error::Remote { message }) => assert!(message.contains("jobid"), "{message}"),
        other => panic!("expected jobid error, got {other:?}"),
    }
    assert_eq!(client.outstanding_tickets(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_errors_reach_the_callback() {
    let temp = tempfile::tempdir().unwrap();
    let remote = Arc::new(LoopbackRemote::new());
    let client = JobClient::new(remote, 1).with_poll_interval(POLL);
    let (tx, rx) = tokio::sync::oneshot::channel();

    let params = json!({
        "type": "fifo",
        "addr": temp.path().join("missing-pipe"),
        "size": 1,
        "fs": "mem:",
        "remote": "x",
    });
    client
        .submit_async(RCATSIZE_OP, params, move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();

    let result = rx.await.unwrap();
    assert!(matches!(result, Err(Error::Remote { .. })));
    client.wait_idle().await;
    assert_eq!(client.outstanding_tickets(), 0);
}

#[tokio::test]
async fn non_object_params_are_rejected_before_taking_a_ticket() {
    let remote = Arc::new(LoopbackRemote::new());
    let client = JobClient::new(remote.clone(), 1);
    let res = client.submit_async(NOOP_OP, json!([1, 2]), |_| {}).await;
    assert!(matches!(res, Err(Error::InvalidConfig { .. })));
    assert_eq!(remote.submitted(), 0);
    assert_eq!(client.outstanding_tickets(), 0);
}
