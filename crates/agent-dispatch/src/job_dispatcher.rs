// Dispatcher front-end: accepts control events from the message loop and
// routes them to the single in-flight job executor.
//
// Not thread-safe by contract: the message loop invokes these operations
// sequentially. The registry is shared with executor tasks (which remove
// themselves on completion), so it sits behind a mutex anyway.

use crate::job_executor::{JobDispatch, JobExecutor};
use crate::messages::{AgentJobRequestMessage, JobMetadataMessage};
use crate::worker_process::WorkerLauncher;

use agent_common::constants::{self, dispatch};
use agent_common::host_context::HostContext;
use agent_common::job_notification::JobNotification;
use agent_common::job_server::JobServer;
use agent_common::telemetry::TelemetryPublisher;
use agent_common::terminal::Terminal;
use agent_common::tracing::Tracing;
use agent_common::FeatureFlagProvider;
use agent_sdk::TraceWriter;

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Accepts new-job / cancel / metadata / wait / shutdown events and keeps
/// the "at most one running executor" invariant.
pub struct JobDispatcher {
    context: Arc<HostContext>,
    trace: Tracing,
    executor: Arc<JobExecutor>,
    notification: Arc<JobNotification>,
    /// `job_id → dispatch`; zero or one entry in steady state.
    jobs: Arc<Mutex<HashMap<Uuid, Arc<JobDispatch>>>>,
    /// Single-element queue naming the most recent dispatch, used only to
    /// hand the previous dispatch to the next executor.
    dispatched: VecDeque<Uuid>,
    /// Signalled once per job in one-shot mode.
    run_once_tx: Option<mpsc::Sender<bool>>,
}

impl JobDispatcher {
    pub fn new(
        context: Arc<HostContext>,
        pool_id: u64,
        job_server: Arc<dyn JobServer>,
        feature_flags: Arc<dyn FeatureFlagProvider>,
        telemetry: Arc<dyn TelemetryPublisher>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let trace = context.get_trace("JobDispatcher");

        let notification = context.get_or_create_service::<JobNotification>();
        if let Ok(address) = std::env::var(constants::agent::MONITOR_SOCKET_VARIABLE) {
            notification.start_client(&address);
        }

        let terminal = match context.get_service::<Terminal>() {
            Some(terminal) => terminal,
            None => {
                let terminal = Arc::new(Terminal::new(context.secret_masker.clone()));
                context.register_service(terminal.clone());
                terminal
            }
        };

        let executor = Arc::new(JobExecutor::new(
            context.clone(),
            pool_id,
            job_server,
            feature_flags,
            telemetry,
            notification.clone(),
            launcher,
            terminal,
        ));

        Self {
            context,
            trace,
            executor,
            notification,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            dispatched: VecDeque::new(),
            run_once_tx: None,
        }
    }

    /// Channel signalled when a one-shot job finishes; `true` means the
    /// executor completed without a surfaced error.
    pub fn set_run_once_channel(&mut self, tx: mpsc::Sender<bool>) {
        self.run_once_tx = Some(tx);
    }

    /// Whether a dispatch is currently outstanding.
    pub fn is_busy(&self) -> bool {
        !self.jobs.lock().unwrap().is_empty()
    }

    /// Dispatch a new job.
    pub fn run(&mut self, mut message: AgentJobRequestMessage, run_once: bool) -> Result<()> {
        let job_id = message.job_id;

        if self.jobs.lock().unwrap().contains_key(&job_id) {
            self.trace.warning(&format!(
                "Job {job_id} is already running; ignoring duplicate dispatch."
            ));
            return Ok(());
        }

        // Hand the previous dispatch (if any) to the new executor so it can
        // be driven to completion before the new job starts.
        let previous = self
            .dispatched
            .pop_front()
            .and_then(|id| self.jobs.lock().unwrap().get(&id).cloned());

        if run_once {
            message.set_variable(
                constants::variables::RUN_MODE,
                constants::variables::RUN_MODE_ONCE,
            );
        }

        let dispatch = JobDispatch::new(job_id, message.request_id);
        self.jobs.lock().unwrap().insert(job_id, dispatch.clone());
        self.dispatched.push_back(job_id);

        let executor = self.executor.clone();
        let notification = self.notification.clone();
        let jobs = self.jobs.clone();
        let run_once_tx = self.run_once_tx.clone();
        let task_dispatch = dispatch.clone();

        let handle = tokio::spawn(async move {
            let result = executor.run(message, task_dispatch.clone(), previous).await;

            // Guaranteed-execute region: the hook, the registry and the
            // one-shot signal fire no matter how the executor ended.
            notification.job_completed(job_id);
            jobs.lock().unwrap().remove(&job_id);
            let succeeded = result.is_ok();
            task_dispatch.complete(result.err());
            if let Some(tx) = run_once_tx {
                let _ = tx.send(succeeded).await;
            }
        });
        dispatch.store_handle(handle);

        Ok(())
    }

    /// Cancel a running job. Returns false when the job is not running.
    /// The worker is forcibly killed `max(timeout, 60 s) − 15 s` after this
    /// call if it has not exited by then.
    pub fn cancel(&mut self, job_id: Uuid, timeout: Duration) -> bool {
        let dispatch = self.jobs.lock().unwrap().get(&job_id).cloned();
        match dispatch {
            Some(dispatch) => {
                self.trace.info(&format!(
                    "Cancelling job {job_id} with a {:.0}s graceful window.",
                    timeout.as_secs_f64()
                ));
                dispatch.job_cancel.cancel();
                dispatch.schedule_kill_deadline(timeout);
                true
            }
            None => {
                self.trace.warning(&format!(
                    "Cannot cancel job {job_id}; it is not running."
                ));
                false
            }
        }
    }

    /// Deliver a metadata update to a running job. No-op if the job is gone.
    pub fn update_metadata(&mut self, message: JobMetadataMessage) {
        let dispatch = self.jobs.lock().unwrap().get(&message.job_id).cloned();
        match dispatch {
            Some(dispatch) => dispatch.post_metadata(message),
            None => self.trace.verbose(&format!(
                "Dropping metadata for job {}; it is not running.",
                message.job_id
            )),
        }
    }

    /// Await the currently-running executor. If `token` fires first, inject
    /// a 60-second graceful cancel and keep waiting. The dispatch is always
    /// removed from the registry on exit, and the executor's surfaced error
    /// (if any) is re-raised here.
    pub async fn wait_async(&mut self, token: CancellationToken) -> Result<()> {
        let current = self
            .dispatched
            .front()
            .and_then(|id| self.jobs.lock().unwrap().get(id).cloned());
        let Some(dispatch) = current else {
            return Ok(());
        };
        let job_id = dispatch.job_id;

        if let Some(mut handle) = dispatch.take_handle() {
            tokio::select! {
                join = &mut handle => { let _ = join; }
                _ = token.cancelled() => {
                    self.trace.info(&format!(
                        "Wait for job {job_id} interrupted; injecting a graceful cancel."
                    ));
                    dispatch.job_cancel.cancel();
                    dispatch.schedule_kill_deadline(dispatch::MIN_CANCEL_TIMEOUT);
                    let _ = handle.await;
                }
            }
        } else {
            dispatch.wait_done().await;
        }

        self.jobs.lock().unwrap().remove(&job_id);

        if let Some(error) = dispatch.take_error() {
            return Err(error);
        }
        Ok(())
    }

    /// Tear everything down: force-kill the running worker (no graceful
    /// cancel) and wait for the executor to wind down.
    pub async fn shutdown_async(&mut self) {
        self.trace.info("Shutting down the job dispatcher.");

        let entries: Vec<(Uuid, Arc<JobDispatch>)> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(id, dispatch)| (*id, dispatch.clone()))
            .collect();

        for (job_id, dispatch) in entries {
            self.trace
                .info(&format!("Force-terminating the worker of job {job_id}."));
            dispatch.worker_cancel.cancel();
            if let Some(handle) = dispatch.take_handle() {
                let _ = handle.await;
            } else {
                dispatch.wait_done().await;
            }
            self.jobs.lock().unwrap().remove(&job_id);
        }
    }

    /// Resolve once no dispatch is outstanding.
    pub async fn wait_until_idle(&self) {
        loop {
            let snapshot: Vec<Arc<JobDispatch>> =
                self.jobs.lock().unwrap().values().cloned().collect();
            if snapshot.is_empty() {
                return;
            }
            for dispatch in snapshot {
                dispatch.wait_done().await;
            }
        }
    }

    /// The host context this dispatcher was built over.
    pub fn context(&self) -> &Arc<HostContext> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        finished_request, job_message, ok_request, FakeWorkerLauncher, MockJobServer,
        WorkerBehavior,
    };
    use agent_common::constants::feature_flags;
    use agent_common::errors::JobServerError;
    use agent_common::host_context::ShutdownReason;
    use agent_common::process_channel::MessageType;
    use agent_common::task_result::{return_code_for, TaskResult};
    use agent_common::telemetry::LogTelemetryPublisher;
    use agent_common::{FeatureFlagState, StaticFeatureFlagProvider};

    struct Harness {
        server: Arc<MockJobServer>,
        launcher: Arc<FakeWorkerLauncher>,
        terminal: Arc<Terminal>,
        dispatcher: JobDispatcher,
    }

    fn harness_with_flags(flags: StaticFeatureFlagProvider) -> Harness {
        let context = HostContext::new("Agent");
        let terminal = Arc::new(Terminal::capturing());
        context.register_service(terminal.clone());

        let server = Arc::new(MockJobServer::default());
        let launcher = Arc::new(FakeWorkerLauncher::new());
        let dispatcher = JobDispatcher::new(
            context,
            1,
            server.clone() as Arc<dyn JobServer>,
            Arc::new(flags),
            Arc::new(LogTelemetryPublisher),
            launcher.clone() as Arc<dyn WorkerLauncher>,
        );

        Harness {
            server,
            launcher,
            terminal,
            dispatcher,
        }
    }

    fn harness() -> Harness {
        harness_with_flags(StaticFeatureFlagProvider::new())
    }

    /// Poll `condition` until it holds or a generous deadline passes.
    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn happy_path_reports_succeeded_once() {
        let mut h = harness();
        h.launcher
            .queue_behavior(WorkerBehavior::ExitAfterJob(return_code_for(
                TaskResult::Succeeded,
            )));

        let message = job_message(42);
        h.dispatcher.run(message, false).unwrap();
        assert!(h.dispatcher.is_busy());

        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(h.server.finished(), vec![(42, TaskResult::Succeeded)]);
        assert!(h.server.issues.lock().unwrap().is_empty());
        assert!(!h.dispatcher.is_busy());

        let lines = h.terminal.captured_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("JobCompleted "));
        assert!(lines[0].ends_with("Build Succeeded"));
    }

    #[tokio::test]
    async fn worker_crash_reports_failed_with_captured_output() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::ExitAfterJob(137));
        h.launcher
            .stdio_script
            .lock()
            .unwrap()
            .push("segfault at 0xdead".to_string());

        h.dispatcher.run(job_message(7), false).unwrap();
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(h.server.finished(), vec![(7, TaskResult::Failed)]);
        let issues = h.server.issues.lock().unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("exited with code 137"));
        assert!(issues[0].message.contains("segfault at 0xdead"));
    }

    #[tokio::test]
    async fn run_once_signals_completion_and_overlays_the_variable() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::ExitAfterJob(0));

        let (tx, mut rx) = mpsc::channel(1);
        h.dispatcher.set_run_once_channel(tx);

        h.dispatcher.run(job_message(9), true).unwrap();
        assert!(rx.recv().await.unwrap());

        let received = h.launcher.received.lock().unwrap();
        let job = received
            .iter()
            .find(|m| m.message_type == MessageType::NewJobRequest)
            .unwrap();
        assert!(job.body.contains("agent.runMode"));
        assert!(job.body.contains("once"));
    }

    #[tokio::test]
    async fn external_cancel_sends_cancel_request_and_reports_canceled() {
        let mut h = harness();
        h.launcher
            .queue_behavior(WorkerBehavior::ExitOnCancelMessage(return_code_for(
                TaskResult::Canceled,
            )));

        let message = job_message(11);
        let job_id = message.job_id;
        h.dispatcher.run(message, false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        assert!(h.dispatcher.cancel(job_id, Duration::from_secs(60)));
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(h.server.finished(), vec![(11, TaskResult::Canceled)]);
        assert_eq!(
            h.launcher.received_types(),
            vec![MessageType::NewJobRequest, MessageType::CancelRequest]
        );
    }

    #[tokio::test]
    async fn cancel_of_an_unknown_job_returns_false() {
        let mut h = harness();
        assert!(!h.dispatcher.cancel(Uuid::new_v4(), Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn ipc_send_timeout_kills_the_worker_and_reports_nothing() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::NeverConnect);

        h.dispatcher.run(job_message(13), false).unwrap();
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert!(h.server.finished().is_empty());
        assert!(!h.dispatcher.is_busy());
        assert!(h.terminal.captured_lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_loss_abandons_the_job_and_kills_a_stuck_worker() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);
        // First renewal succeeds; the next one learns the job is gone.
        h.server.queue_renew(Ok(ok_request(21)));
        h.server
            .queue_renew(Err(JobServerError::JobNotFound(21)));

        h.dispatcher.run(job_message(21), false).unwrap();
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(h.server.finished(), vec![(21, TaskResult::Abandoned)]);
        // Graceful cancel was attempted before the kill deadline fired.
        assert!(h
            .launcher
            .received_types()
            .contains(&MessageType::CancelRequest));
    }

    #[tokio::test]
    async fn metadata_is_forwarded_to_the_worker() {
        let mut h = harness();
        h.launcher
            .queue_behavior(WorkerBehavior::ExitOnCancelMessage(return_code_for(
                TaskResult::Canceled,
            )));

        let message = job_message(15);
        let job_id = message.job_id;
        h.dispatcher.run(message, false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        h.dispatcher.update_metadata(JobMetadataMessage {
            job_id,
            post_lines_frequency_millis: Some(500),
            properties: Default::default(),
        });

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::JobMetadataUpdate)
        })
        .await;

        h.dispatcher.cancel(job_id, Duration::from_secs(60));
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(
            h.launcher.received_types(),
            vec![
                MessageType::NewJobRequest,
                MessageType::JobMetadataUpdate,
                MessageType::CancelRequest
            ]
        );
    }

    #[tokio::test]
    async fn metadata_behind_a_cancel_is_never_sent() {
        let mut h = harness();
        h.launcher
            .queue_behavior(WorkerBehavior::ExitOnCancelMessage(return_code_for(
                TaskResult::Canceled,
            )));

        let message = job_message(16);
        let job_id = message.job_id;
        h.dispatcher.run(message, false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        // Cancel first, then a metadata update racing in behind it. The
        // executor must observe the cancel first and never touch the slot.
        h.dispatcher.cancel(job_id, Duration::from_secs(60));
        h.dispatcher.update_metadata(JobMetadataMessage {
            job_id,
            post_lines_frequency_millis: Some(500),
            properties: Default::default(),
        });

        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        let received = h.launcher.received_types();
        assert!(!received.contains(&MessageType::JobMetadataUpdate));
        assert_eq!(h.server.finished(), vec![(16, TaskResult::Canceled)]);
    }

    #[tokio::test]
    async fn second_job_proceeds_after_server_declares_the_first_finished() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);
        h.launcher.queue_behavior(WorkerBehavior::ExitAfterJob(0));

        let first = job_message(31);
        h.dispatcher.run(first, false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        // The server says request 31 already finished.
        h.server
            .queue_get(Ok(finished_request(31, TaskResult::Succeeded)));

        h.dispatcher.run(job_message(32), false).unwrap();
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        let finished = h.server.finished();
        assert!(finished.contains(&(32, TaskResult::Succeeded)));
        // The superseded worker was force-killed, which the first executor
        // reports as a failure of its own dispatch.
        assert!(finished.iter().any(|(id, _)| *id == 31));
        assert!(!h.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn second_job_with_first_still_active_server_side_is_fatal() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);

        h.dispatcher.run(job_message(33), false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        // No result: the server still owns request 33.
        h.server.queue_get(Ok(ok_request(33)));

        h.dispatcher.run(job_message(34), false).unwrap();
        let err = h
            .dispatcher
            .wait_async(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("protocol violation"));

        h.dispatcher.shutdown_async().await;
        assert!(!h.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn failed_server_query_kills_the_old_worker_and_reraises() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);

        h.dispatcher.run(job_message(35), false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        h.server.queue_get(Err(JobServerError::Status {
            status: 503,
            body: "unavailable".into(),
        }));

        h.dispatcher.run(job_message(36), false).unwrap();
        let err = h
            .dispatcher
            .wait_async(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outstanding request 35"));

        // The old dispatch was driven to completion before the re-raise.
        assert!(h.server.finished().iter().any(|(id, _)| *id == 35));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_with_a_fired_token_injects_a_graceful_cancel() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);

        h.dispatcher.run(job_message(51), false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        let token = CancellationToken::new();
        token.cancel();
        h.dispatcher.wait_async(token).await.unwrap();

        // Canceled via the injected 60s window, then force-killed at the
        // 45s deadline because the worker ignored the cancel message.
        assert_eq!(h.server.finished(), vec![(51, TaskResult::Canceled)]);
        assert!(!h.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn shutdown_force_kills_the_running_worker() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::IgnoreCancel);

        h.dispatcher.run(job_message(61), false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        h.dispatcher.shutdown_async().await;
        assert!(!h.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn agent_shutdown_with_the_fail_flag_overrides_the_outcome() {
        let mut h = harness_with_flags(
            StaticFeatureFlagProvider::new()
                .with_flag(feature_flags::FAIL_JOB_WHEN_AGENT_DIES, FeatureFlagState::On),
        );
        h.launcher
            .queue_behavior(WorkerBehavior::ExitOnCancelMessage(return_code_for(
                TaskResult::Canceled,
            )));

        let message = job_message(91);
        let job_id = message.job_id;
        h.dispatcher.run(message, false).unwrap();

        let launcher = h.launcher.clone();
        wait_for(|| {
            launcher
                .received_types()
                .contains(&MessageType::NewJobRequest)
        })
        .await;

        h.dispatcher
            .context()
            .shutdown_agent(ShutdownReason::OperatingSystemShutdown);
        h.dispatcher.cancel(job_id, Duration::from_secs(60));
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();

        assert_eq!(h.server.finished(), vec![(91, TaskResult::Failed)]);
        assert!(h
            .launcher
            .received_types()
            .contains(&MessageType::OperatingSystemShutdown));
    }

    #[tokio::test]
    async fn wait_until_idle_resolves_after_the_job_finishes() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::ExitAfterJob(0));

        h.dispatcher.run(job_message(71), false).unwrap();
        h.dispatcher.wait_until_idle().await;
        assert!(!h.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn duplicate_dispatch_of_the_same_job_is_ignored() {
        let mut h = harness();
        h.launcher.queue_behavior(WorkerBehavior::ExitOnCancelMessage(
            return_code_for(TaskResult::Canceled),
        ));

        let message = job_message(81);
        let job_id = message.job_id;
        h.dispatcher.run(message.clone(), false).unwrap();
        h.dispatcher.run(message, false).unwrap();

        assert_eq!(h.jobs_len(), 1);

        h.dispatcher.cancel(job_id, Duration::from_secs(60));
        h.dispatcher.wait_async(CancellationToken::new()).await.unwrap();
        assert_eq!(h.server.finished().len(), 1);
    }

    impl Harness {
        fn jobs_len(&self) -> usize {
            self.dispatcher.jobs.lock().unwrap().len()
        }
    }
}
