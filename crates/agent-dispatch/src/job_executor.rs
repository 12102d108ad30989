// Per-job execution: drive one dispatch from lease acquisition through
// worker supervision to the completion report.

use crate::completion_reporter::CompletionReporter;
use crate::lease_renewer::LeaseRenewer;
use crate::messages::{AgentJobRequestMessage, JobMetadataMessage};
use crate::worker_process::{WorkerLauncher, WorkerProcess};

use agent_common::constants::{dispatch, feature_flags};
use agent_common::errors::ProtocolViolation;
use agent_common::host_context::{HostContext, ShutdownReason};
use agent_common::job_notification::JobNotification;
use agent_common::job_server::{ConnectionKind, JobServer, TimelineIssue};
use agent_common::process_channel::{channel_timeout, MessageType};
use agent_common::task_result::{translate_worker_exit_code, TaskResult, WorkerExit};
use agent_common::telemetry::{TelemetryEvent, TelemetryPublisher};
use agent_common::terminal::Terminal;
use agent_common::tracing::Tracing;
use agent_common::FeatureFlagProvider;
use agent_sdk::TraceWriter;

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-job context: cancellation signals, the metadata slot and completion
/// observation. Owned by the executor; the front-end holds it only to route
/// cancel/metadata/wait events.
pub struct JobDispatch {
    pub job_id: Uuid,
    pub request_id: u64,

    /// External request to stop the job, or lease loss. Leads to a graceful
    /// worker-side cancel.
    pub job_cancel: CancellationToken,
    /// Fires when graceful cancellation has waited long enough.
    pub kill_deadline: CancellationToken,
    /// Forces termination of the worker process tree.
    pub worker_cancel: CancellationToken,

    /// Single-slot metadata rendezvous, last write wins.
    metadata_tx: watch::Sender<Option<JobMetadataMessage>>,

    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    handle: Mutex<Option<JoinHandle<()>>>,
    error: Mutex<Option<anyhow::Error>>,

    kill_timer: Mutex<Option<JoinHandle<()>>>,
    kill_scheduled: AtomicBool,
}

impl JobDispatch {
    pub fn new(job_id: Uuid, request_id: u64) -> Arc<Self> {
        let (metadata_tx, _) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            job_id,
            request_id,
            job_cancel: CancellationToken::new(),
            kill_deadline: CancellationToken::new(),
            worker_cancel: CancellationToken::new(),
            metadata_tx,
            done_tx,
            done_rx,
            handle: Mutex::new(None),
            error: Mutex::new(None),
            kill_timer: Mutex::new(None),
            kill_scheduled: AtomicBool::new(false),
        })
    }

    /// Fill the metadata slot. A second write before the executor drains the
    /// slot overwrites the first; metadata is cumulative, so last wins.
    pub fn post_metadata(&self, message: JobMetadataMessage) {
        self.metadata_tx.send_replace(Some(message));
    }

    pub(crate) fn subscribe_metadata(&self) -> watch::Receiver<Option<JobMetadataMessage>> {
        let mut rx = self.metadata_tx.subscribe();
        // An update posted before the executor started selecting must still
        // be delivered on the first poll.
        rx.mark_changed();
        rx
    }

    /// Arm the kill deadline: `max(timeout, 60 s)` clamped to the timer
    /// ceiling, minus the 15 s reporting pad. The first caller wins; later
    /// calls keep the earlier deadline.
    pub fn schedule_kill_deadline(&self, timeout: Duration) {
        if self.kill_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = kill_deadline_delay(timeout);
        let deadline = self.kill_deadline.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            deadline.cancel();
        });
        *self.kill_timer.lock().unwrap() = Some(timer);
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Wait for the executor of this dispatch to finish.
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Mark the dispatch finished, recording the executor's error if any.
    pub(crate) fn complete(&self, error: Option<anyhow::Error>) {
        if let Some(timer) = self.kill_timer.lock().unwrap().take() {
            timer.abort();
        }
        *self.error.lock().unwrap() = error;
        let _ = self.done_tx.send(true);
    }

    pub(crate) fn store_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().unwrap().take()
    }

    /// Surface the executor's stored error (once).
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().unwrap().take()
    }
}

/// Delay from cancel to forced kill for a caller-supplied graceful timeout.
pub fn kill_deadline_delay(timeout: Duration) -> Duration {
    timeout
        .max(dispatch::MIN_CANCEL_TIMEOUT)
        .min(dispatch::MAX_CANCEL_TIMEOUT)
        - dispatch::KILL_DEADLINE_PADDING
}

/// Executes a single job end to end.
pub struct JobExecutor {
    context: Arc<HostContext>,
    trace: Tracing,
    pool_id: u64,
    job_server: Arc<dyn JobServer>,
    feature_flags: Arc<dyn FeatureFlagProvider>,
    telemetry: Arc<dyn TelemetryPublisher>,
    notification: Arc<JobNotification>,
    launcher: Arc<dyn WorkerLauncher>,
    terminal: Arc<Terminal>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<HostContext>,
        pool_id: u64,
        job_server: Arc<dyn JobServer>,
        feature_flags: Arc<dyn FeatureFlagProvider>,
        telemetry: Arc<dyn TelemetryPublisher>,
        notification: Arc<JobNotification>,
        launcher: Arc<dyn WorkerLauncher>,
        terminal: Arc<Terminal>,
    ) -> Self {
        let trace = context.get_trace("JobExecutor");
        Self {
            context,
            trace,
            pool_id,
            job_server,
            feature_flags,
            telemetry,
            notification,
            launcher,
            terminal,
        }
    }

    /// Run `message` to its terminal outcome.
    ///
    /// Returns `Err` only for conditions the front-end must see:
    /// a protocol violation against the previous dispatch, or exhausted
    /// completion-report retries. Everything else folds into the outcome.
    pub async fn run(
        &self,
        message: AgentJobRequestMessage,
        dispatch: Arc<JobDispatch>,
        previous: Option<Arc<JobDispatch>>,
    ) -> Result<()> {
        self.trace.info(&format!(
            "Starting dispatch of job {} (request {}): {}",
            message.job_id, message.request_id, message.job_display_name
        ));

        self.await_previous(previous).await?;

        // The token must never reach diagnostics in the clear.
        if let Some(token) = message.access_token() {
            self.context.secret_masker.add_value(token);
        }

        // A fresh handshake before the renewal loop starts; a stale pooled
        // connection would burn the first renewal attempts.
        if let Err(e) = self
            .job_server
            .refresh_connection(
                ConnectionKind::JobRequest,
                dispatch::CONNECTION_REFRESH_TIMEOUT,
            )
            .await
        {
            self.trace
                .warning(&format!("Failed to refresh the job request connection: {e}"));
        }

        let renewer = LeaseRenewer::new(
            self.context.get_trace("LeaseRenewer"),
            self.job_server.clone(),
            self.pool_id,
        );
        let mut renewal =
            renewer.start(message.request_id, message.lock_token, message.locked_until);

        // ------------------------------------------------------------------
        // AwaitingFirstRenewal
        // ------------------------------------------------------------------
        tokio::select! {
            renewed = renewal.first_renewed() => {
                if !renewed {
                    self.trace.error(&format!(
                        "Could not establish the lease on request {}; the job will not start.",
                        message.request_id
                    ));
                    return Ok(());
                }
            }
            _ = dispatch.job_cancel.cancelled() => {
                self.trace.info("Job canceled before the lease was established.");
                renewal.stop().await;
                return self.report_and_finish(&message, TaskResult::Canceled).await;
            }
        }

        // ------------------------------------------------------------------
        // SendingJobPayload
        // ------------------------------------------------------------------
        let server_url = message
            .system_connection()
            .map(|e| e.url.clone())
            .unwrap_or_default();
        self.notification.job_started(
            message.job_id,
            message.access_token().unwrap_or(""),
            &server_url,
        );

        let mut worker = match WorkerProcess::start(
            &self.context,
            self.launcher.as_ref(),
            dispatch.worker_cancel.clone(),
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                // Nothing was sent; the server will observe lease expiration.
                self.trace
                    .error(&format!("Failed to start the worker process: {e:#}"));
                renewal.stop().await;
                return Ok(());
            }
        };

        let send_timeout = channel_timeout();
        let job_body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                self.trace
                    .error(&format!("Failed to serialize the job message: {e}"));
                dispatch.worker_cancel.cancel();
                worker.wait_exit().await;
                renewal.stop().await;
                return Ok(());
            }
        };

        if let Err(e) = worker
            .send(MessageType::NewJobRequest, &job_body, send_timeout)
            .await
        {
            // The worker never started the job; report nothing and let the
            // lease lapse.
            self.trace
                .error(&format!("Failed to deliver the job to the worker: {e}"));
            dispatch.worker_cancel.cancel();
            worker.wait_exit().await;
            renewal.stop().await;
            return Ok(());
        }

        // ------------------------------------------------------------------
        // Running
        // ------------------------------------------------------------------
        let mut metadata_rx = dispatch.subscribe_metadata();
        let outcome_on_cancel;

        loop {
            tokio::select! {
                // Ordering matters: a cancellation observed in the same poll
                // as a pending metadata update must win, so no metadata is
                // sent once graceful termination has begun.
                biased;

                exit_code = worker.wait_exit() => {
                    let result = match translate_worker_exit_code(exit_code) {
                        WorkerExit::Defined(result) => result,
                        WorkerExit::Crashed(code) => {
                            self.report_worker_crash(&message, code, worker.drain_captured_output())
                                .await;
                            TaskResult::Failed
                        }
                    };
                    self.trace.info(&format!(
                        "Worker for job {} exited with code {exit_code} ({result}).",
                        message.job_id
                    ));
                    renewal.stop().await;
                    return self.report_and_finish(&message, result).await;
                }

                _ = &mut renewal.handle, if !renewal.finished => {
                    renewal.finished = true;
                    self.trace.error(&format!(
                        "Lease on request {} is lost; the job is abandoned.",
                        message.request_id
                    ));
                    outcome_on_cancel = TaskResult::Abandoned;
                    dispatch.job_cancel.cancel();
                    break;
                }

                _ = dispatch.job_cancel.cancelled() => {
                    self.trace.info(&format!("Job {} is being canceled.", message.job_id));
                    outcome_on_cancel = TaskResult::Canceled;
                    break;
                }

                changed = metadata_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let metadata = metadata_rx.borrow_and_update().clone();
                    if let Some(metadata) = metadata {
                        self.forward_metadata(&mut worker, metadata, send_timeout).await;
                    }
                }
            }
        }

        // ------------------------------------------------------------------
        // TerminatingGracefully
        // ------------------------------------------------------------------
        // Lease loss arrives without a front-end cancel, so make sure a kill
        // deadline exists before waiting on the worker.
        dispatch.schedule_kill_deadline(dispatch::MIN_CANCEL_TIMEOUT);

        let mut result = outcome_on_cancel;
        let cancel_message = if self.context.agent_shutdown_token().is_cancelled() {
            let message_type = match self.context.agent_shutdown_reason() {
                Some(ShutdownReason::OperatingSystemShutdown) => {
                    MessageType::OperatingSystemShutdown
                }
                _ => MessageType::AgentShutdown,
            };
            if self
                .feature_flags
                .get_feature_flag(feature_flags::FAIL_JOB_WHEN_AGENT_DIES)
                .await
                .is_on()
            {
                result = TaskResult::Failed;
                self.publish_shutdown_telemetry(&message).await;
            }
            message_type
        } else {
            MessageType::CancelRequest
        };

        self.trace
            .info(&format!("Sending {cancel_message} to the worker."));
        if let Err(e) = worker.send(cancel_message, "", send_timeout).await {
            self.trace.error(&format!(
                "Failed to deliver {cancel_message} to the worker: {e}; killing it."
            ));
            dispatch.worker_cancel.cancel();
        }

        // ------------------------------------------------------------------
        // WaitingForWorkerExit
        // ------------------------------------------------------------------
        tokio::select! {
            _ = worker.wait_exit() => {}
            _ = dispatch.kill_deadline.cancelled() => {
                self.trace.warning(
                    "Worker did not exit within the cancellation window; killing the process tree.",
                );
                dispatch.worker_cancel.cancel();
            }
        }
        worker.wait_exit().await;

        // ------------------------------------------------------------------
        // Reporting
        // ------------------------------------------------------------------
        renewal.stop().await;
        self.report_and_finish(&message, result).await
    }

    /// Drive the previous dispatch, if any, to completion before starting a
    /// new one. This is the backstop against silent double execution.
    async fn await_previous(&self, previous: Option<Arc<JobDispatch>>) -> Result<()> {
        let Some(previous) = previous else {
            return Ok(());
        };
        if previous.is_done() {
            return Ok(());
        }

        self.trace.info(&format!(
            "Previous dispatch (request {}) is still running; asking the server about it.",
            previous.request_id
        ));

        match self
            .job_server
            .get_agent_request(self.pool_id, previous.request_id)
            .await
        {
            Ok(request) if request.result.is_some() => {
                // Server already recorded a result while the old worker
                // still runs locally. Kill it and bound the wait.
                self.trace.info(&format!(
                    "Server reports request {} finished ({:?}); terminating its worker.",
                    previous.request_id, request.result
                ));
                previous.worker_cancel.cancel();
                if tokio::time::timeout(dispatch::PREVIOUS_WORKER_GRACE, previous.wait_done())
                    .await
                    .is_err()
                {
                    return Err(ProtocolViolation(format!(
                        "dispatch task for request {} cannot be canceled",
                        previous.request_id
                    ))
                    .into());
                }
                Ok(())
            }
            Ok(_) => {
                // The server sent a new job while it still considers the old
                // one active. Should never happen; stop the agent.
                Err(ProtocolViolation(format!(
                    "server delivered a new job while request {} is still active",
                    previous.request_id
                ))
                .into())
            }
            Err(e) => {
                // Blind on the server's state: kill the old worker and
                // re-raise rather than risk double execution.
                previous.worker_cancel.cancel();
                previous.wait_done().await;
                Err(anyhow::Error::from(e).context(format!(
                    "failed to query the server about outstanding request {}",
                    previous.request_id
                )))
            }
        }
    }

    async fn forward_metadata(
        &self,
        worker: &mut WorkerProcess,
        metadata: JobMetadataMessage,
        send_timeout: Duration,
    ) {
        let body = match serde_json::to_string(&metadata) {
            Ok(body) => body,
            Err(e) => {
                self.trace
                    .warning(&format!("Failed to serialize job metadata: {e}"));
                return;
            }
        };
        if let Err(e) = worker
            .send(MessageType::JobMetadataUpdate, &body, send_timeout)
            .await
        {
            // Metadata is best-effort; the job carries on without it.
            self.trace
                .warning(&format!("Failed to deliver job metadata to the worker: {e}"));
        }
    }

    async fn report_worker_crash(
        &self,
        message: &AgentJobRequestMessage,
        exit_code: i32,
        output: Vec<String>,
    ) {
        self.trace.error(&format!(
            "Worker for job {} crashed with exit code {exit_code}.",
            message.job_id
        ));
        for line in &output {
            self.trace.error(line);
        }

        if let Some(timeline) = &message.timeline {
            let mut detail = format!("Worker process exited with code {exit_code}.");
            if !output.is_empty() {
                detail.push('\n');
                detail.push_str(&output.join("\n"));
            }
            if let Err(e) = self
                .job_server
                .append_timeline_issue(
                    message.plan.plan_id,
                    timeline.id,
                    message.job_id,
                    TimelineIssue::error(detail),
                )
                .await
            {
                self.trace
                    .warning(&format!("Failed to append the crash issue: {e}"));
            }
        }

        let event = TelemetryEvent::new("GitHubActionsRunner", "WorkerCrash")
            .with_property("jobId", message.job_id.to_string())
            .with_property("exitCode", exit_code);
        if let Err(e) = self.telemetry.publish(event).await {
            self.trace
                .warning(&format!("Failed to publish crash telemetry: {e}"));
        }
    }

    async fn publish_shutdown_telemetry(&self, message: &AgentJobRequestMessage) {
        let reason = self
            .context
            .agent_shutdown_reason()
            .map(|r| r.to_string())
            .unwrap_or_default();
        let event = TelemetryEvent::new("GitHubActionsRunner", "AgentShutdown")
            .with_property("jobId", message.job_id.to_string())
            .with_property("shutdownReason", reason);
        if let Err(e) = self.telemetry.publish(event).await {
            self.trace
                .warning(&format!("Failed to publish shutdown telemetry: {e}"));
        }
    }

    async fn report_and_finish(
        &self,
        message: &AgentJobRequestMessage,
        result: TaskResult,
    ) -> Result<()> {
        let reporter = CompletionReporter::new(
            self.context.get_trace("CompletionReporter"),
            self.job_server.clone(),
        );
        let outcome = reporter.report(self.pool_id, message, result).await;

        self.terminal.write_line(&format!(
            "JobCompleted {} {} {result}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            message.job_display_name
        ));

        outcome
    }
}
