// Server-side lease renewal for a single job request.
//
// The renewer runs as its own task for the lifetime of one dispatch. It
// renews immediately, then every 60 s. Errors are retried with jittered
// backoff; the renewer returning on its own (without being stopped) means
// the lease is gone and the executor must treat the job as abandoned.

use agent_common::constants::dispatch;
use agent_common::errors::JobServerError;
use agent_common::job_server::{ConnectionKind, JobServer};
use agent_common::tracing::Tracing;
use agent_sdk::TraceWriter;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle on a running renewal task.
pub struct LeaseRenewal {
    /// The renewal task. The executor selects on this to observe lease loss.
    pub handle: JoinHandle<()>,
    /// Set once the task has been joined (directly or via `stop`).
    pub finished: bool,
    first_renewed_rx: watch::Receiver<bool>,
    stop_token: CancellationToken,
}

impl LeaseRenewal {
    /// Wait for the outcome of the first renewal: `true` once it succeeds,
    /// `false` if the renewer gives up first.
    pub async fn first_renewed(&mut self) -> bool {
        match self.first_renewed_rx.wait_for(|renewed| *renewed).await {
            Ok(_) => true,
            // Sender dropped: the renewal task ended without ever renewing.
            Err(_) => false,
        }
    }

    /// Non-blocking view of the first-renewal flag.
    pub fn has_first_renewed(&self) -> bool {
        *self.first_renewed_rx.borrow()
    }

    /// Stop the renewal task and wait for it to wind down.
    pub async fn stop(&mut self) {
        self.stop_token.cancel();
        if !self.finished {
            self.finished = true;
            let _ = (&mut self.handle).await;
        }
    }
}

/// Starts renewal tasks against a `JobServer`.
pub struct LeaseRenewer {
    trace: Tracing,
    job_server: Arc<dyn JobServer>,
    pool_id: u64,
}

impl LeaseRenewer {
    pub fn new(trace: Tracing, job_server: Arc<dyn JobServer>, pool_id: u64) -> Self {
        Self {
            trace,
            job_server,
            pool_id,
        }
    }

    /// Begin renewing `request_id`. `initial_locked_until` seeds the lease
    /// horizon until the first successful renewal refreshes it.
    pub fn start(
        &self,
        request_id: u64,
        lock_token: Uuid,
        initial_locked_until: Option<DateTime<Utc>>,
    ) -> LeaseRenewal {
        // The watch sender lives inside the task so that its drop doubles
        // as the "renewer has returned" signal for `first_renewed`.
        let (first_renewed_tx, first_renewed_rx) = watch::channel(false);
        let stop_token = CancellationToken::new();

        let handle = tokio::spawn(renew_loop(
            self.trace.clone(),
            self.job_server.clone(),
            self.pool_id,
            request_id,
            lock_token,
            initial_locked_until,
            first_renewed_tx,
            stop_token.clone(),
        ));

        LeaseRenewal {
            handle,
            finished: false,
            first_renewed_rx,
            stop_token,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn renew_loop(
    trace: Tracing,
    job_server: Arc<dyn JobServer>,
    pool_id: u64,
    request_id: u64,
    lock_token: Uuid,
    initial_locked_until: Option<DateTime<Utc>>,
    first_renewed_tx: watch::Sender<bool>,
    stop_token: CancellationToken,
) {
    let mut first_renewed = false;
    let mut attempts_before_first = 0u32;
    let mut error_count = 0u32;
    let mut degraded = false;
    let mut lease_deadline = deadline_after(initial_locked_until);

    loop {
        if stop_token.is_cancelled() {
            return;
        }

        match job_server
            .renew_agent_request(pool_id, request_id, lock_token)
            .await
        {
            Ok(request) => {
                if !first_renewed {
                    first_renewed = true;
                    let _ = first_renewed_tx.send(true);
                    trace.info(&format!("Request {request_id} renewed for the first time."));
                }
                lease_deadline = deadline_after(request.locked_until);
                error_count = 0;
                if degraded {
                    degraded = false;
                    job_server.set_connection_timeout(
                        ConnectionKind::JobRequest,
                        dispatch::RENEW_HEALTHY_TIMEOUT,
                    );
                }

                if sleep_cancellable(dispatch::LEASE_RENEW_INTERVAL, &stop_token).await {
                    return;
                }
            }

            Err(e) if e.is_terminal() => {
                // The server no longer knows the job; nothing left to renew.
                trace.info(&format!("Stop renewing request {request_id}: {e}"));
                return;
            }

            Err(e) => {
                trace.warning(&format!("Failed to renew request {request_id}: {e}"));

                let backoff = if !first_renewed {
                    attempts_before_first += 1;
                    if attempts_before_first >= dispatch::LEASE_INITIAL_RETRY_LIMIT {
                        trace.error(&format!(
                            "Giving up on request {request_id} after {attempts_before_first} renewal attempts; the job will not start."
                        ));
                        return;
                    }
                    jitter_secs(1, 10)
                } else {
                    if Utc::now() >= lease_deadline {
                        trace.error(&format!(
                            "Lease on request {request_id} could not be recovered before it expired."
                        ));
                        return;
                    }
                    error_count += 1;
                    if error_count <= 5 {
                        jitter_secs(5, 15)
                    } else {
                        jitter_secs(15, 30)
                    }
                };

                // A renewal failure often means the connection is wedged;
                // rebuild it with a tighter timeout until we recover.
                if let Err(refresh_err) = job_server
                    .refresh_connection(
                        ConnectionKind::JobRequest,
                        dispatch::RENEW_DEGRADED_TIMEOUT,
                    )
                    .await
                {
                    trace.warning(&format!(
                        "Failed to refresh the job request connection: {refresh_err}"
                    ));
                }
                degraded = true;

                if sleep_cancellable(backoff, &stop_token).await {
                    return;
                }
            }
        }
    }
}

/// How long past `locked_until` the renewer keeps fighting for the lease.
fn deadline_after(locked_until: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let base = locked_until.unwrap_or_else(Utc::now);
    base + chrono::Duration::from_std(dispatch::LEASE_EXPIRY_GRACE)
        .unwrap_or_else(|_| chrono::Duration::minutes(5))
}

fn jitter_secs(low: u64, high: u64) -> Duration {
    let secs = {
        let mut rng = rand::thread_rng();
        rng.gen_range(low..=high)
    };
    Duration::from_secs(secs)
}

/// Returns true when interrupted by the stop token.
async fn sleep_cancellable(duration: Duration, stop_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_token.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_common::host_context::HostContext;
    use agent_common::job_server::{TaskAgentJobRequest, TimelineIssue};
    use agent_common::task_result::TaskResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted `JobServer` that pops one renewal response per call and
    /// records connection management calls.
    #[derive(Default)]
    struct ScriptedJobServer {
        responses: Mutex<Vec<Result<Option<DateTime<Utc>>, JobServerError>>>,
        renew_calls: Mutex<u32>,
        refresh_calls: Mutex<u32>,
        timeout_calls: Mutex<Vec<Duration>>,
    }

    impl ScriptedJobServer {
        fn push_ok(&self, locked_until: Option<DateTime<Utc>>) {
            self.responses.lock().unwrap().insert(0, Ok(locked_until));
        }

        fn push_err(&self, err: JobServerError) {
            self.responses.lock().unwrap().insert(0, Err(err));
        }

        fn renew_calls(&self) -> u32 {
            *self.renew_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobServer for ScriptedJobServer {
        async fn renew_agent_request(
            &self,
            _pool_id: u64,
            request_id: u64,
            _lock_token: Uuid,
        ) -> Result<TaskAgentJobRequest, JobServerError> {
            *self.renew_calls.lock().unwrap() += 1;
            let next = self.responses.lock().unwrap().pop();
            match next {
                Some(Ok(locked_until)) => Ok(TaskAgentJobRequest {
                    request_id,
                    job_id: None,
                    locked_until,
                    result: None,
                }),
                Some(Err(e)) => Err(e),
                // Script exhausted: keep renewing successfully.
                None => Ok(TaskAgentJobRequest {
                    request_id,
                    job_id: None,
                    locked_until: Some(Utc::now() + chrono::Duration::minutes(5)),
                    result: None,
                }),
            }
        }

        async fn finish_agent_request(
            &self,
            _pool_id: u64,
            _request_id: u64,
            _lock_token: Uuid,
            _finish_time: DateTime<Utc>,
            _result: TaskResult,
        ) -> Result<(), JobServerError> {
            Ok(())
        }

        async fn get_agent_request(
            &self,
            _pool_id: u64,
            request_id: u64,
        ) -> Result<TaskAgentJobRequest, JobServerError> {
            Ok(TaskAgentJobRequest {
                request_id,
                job_id: None,
                locked_until: None,
                result: None,
            })
        }

        async fn append_timeline_issue(
            &self,
            _plan_id: Uuid,
            _timeline_id: Uuid,
            _record_id: Uuid,
            _issue: TimelineIssue,
        ) -> Result<(), JobServerError> {
            Ok(())
        }

        async fn refresh_connection(
            &self,
            _kind: ConnectionKind,
            _timeout: Duration,
        ) -> Result<(), JobServerError> {
            *self.refresh_calls.lock().unwrap() += 1;
            Ok(())
        }

        fn set_connection_timeout(&self, _kind: ConnectionKind, timeout: Duration) {
            self.timeout_calls.lock().unwrap().push(timeout);
        }
    }

    fn renewer(server: &Arc<ScriptedJobServer>) -> LeaseRenewer {
        let context = HostContext::new("Agent");
        LeaseRenewer::new(
            context.get_trace("LeaseRenewer"),
            server.clone() as Arc<dyn JobServer>,
            1,
        )
    }

    fn transient() -> JobServerError {
        JobServerError::Status {
            status: 500,
            body: "boom".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn signals_first_renewal_and_keeps_renewing() {
        let server = Arc::new(ScriptedJobServer::default());
        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);

        assert!(renewal.first_renewed().await);
        assert!(renewal.has_first_renewed());

        // Two more interval renewals.
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(server.renew_calls() >= 3);

        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn job_not_found_ends_renewal_quietly() {
        let server = Arc::new(ScriptedJobServer::default());
        server.push_err(JobServerError::JobNotFound(7));

        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);
        assert!(!renewal.first_renewed().await);
        renewal.finished = true;
        let _ = (&mut renewal.handle).await;
        assert_eq!(server.renew_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts_before_first_renewal() {
        let server = Arc::new(ScriptedJobServer::default());
        for _ in 0..8 {
            server.push_err(transient());
        }

        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);
        assert!(!renewal.first_renewed().await);
        renewal.finished = true;
        let _ = (&mut renewal.handle).await;

        assert_eq!(server.renew_calls(), 5);
        // Connection reset on every retry but the final, non-retried one.
        assert_eq!(*server.refresh_calls.lock().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_error_and_retunes_timeout() {
        let server = Arc::new(ScriptedJobServer::default());
        // First call fails, everything afterwards succeeds.
        server.push_err(transient());

        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);
        assert!(renewal.first_renewed().await);

        assert_eq!(*server.refresh_calls.lock().unwrap(), 1);
        assert_eq!(
            server.timeout_calls.lock().unwrap().as_slice(),
            &[dispatch::RENEW_HEALTHY_TIMEOUT]
        );

        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_ends_renewal_after_first_success() {
        let server = Arc::new(ScriptedJobServer::default());
        // One success with a horizon already in the past, then failures:
        // the very first error retry finds the grace exhausted.
        server.push_ok(Some(Utc::now() - chrono::Duration::minutes(10)));
        for _ in 0..4 {
            server.push_err(transient());
        }

        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);
        assert!(renewal.first_renewed().await);

        renewal.finished = true;
        let _ = (&mut renewal.handle).await;
        // One success + one failed retry that hit the expiry check.
        assert_eq!(server.renew_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_interval_sleep_promptly() {
        let server = Arc::new(ScriptedJobServer::default());
        let mut renewal = renewer(&server).start(7, Uuid::new_v4(), None);

        assert!(renewal.first_renewed().await);
        let calls_before = server.renew_calls();

        renewal.stop().await;
        assert_eq!(server.renew_calls(), calls_before);
    }
}
