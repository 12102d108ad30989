// Shared fakes for the dispatch test harnesses: a scriptable job server
// and an in-process worker impostor.

use crate::messages::AgentJobRequestMessage;
use crate::worker_process::{StdioBuffer, WorkerLauncher};

use agent_common::errors::JobServerError;
use agent_common::job_server::{ConnectionKind, JobServer, TaskAgentJobRequest, TimelineIssue};
use agent_common::process_channel::{MessageType, ProcessChannel, WorkerMessage};
use agent_common::task_result::TaskResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn ok_request(request_id: u64) -> TaskAgentJobRequest {
    TaskAgentJobRequest {
        request_id,
        job_id: None,
        locked_until: Some(Utc::now() + chrono::Duration::minutes(5)),
        result: None,
    }
}

pub(crate) fn finished_request(request_id: u64, result: TaskResult) -> TaskAgentJobRequest {
    TaskAgentJobRequest {
        request_id,
        job_id: None,
        locked_until: None,
        result: Some(result),
    }
}

/// Scriptable `JobServer`: queued responses are popped per call; an empty
/// queue means success.
#[derive(Default)]
pub(crate) struct MockJobServer {
    pub renew_responses: Mutex<VecDeque<Result<TaskAgentJobRequest, JobServerError>>>,
    pub renew_calls: AtomicU32,
    pub finish_failures: Mutex<VecDeque<JobServerError>>,
    pub finish_calls: Mutex<Vec<(u64, TaskResult)>>,
    pub get_responses: Mutex<VecDeque<Result<TaskAgentJobRequest, JobServerError>>>,
    pub get_calls: AtomicU32,
    pub issues: Mutex<Vec<TimelineIssue>>,
    pub refresh_calls: AtomicU32,
}

impl MockJobServer {
    pub fn queue_renew(&self, response: Result<TaskAgentJobRequest, JobServerError>) {
        self.renew_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_get(&self, response: Result<TaskAgentJobRequest, JobServerError>) {
        self.get_responses.lock().unwrap().push_back(response);
    }

    pub fn finished(&self) -> Vec<(u64, TaskResult)> {
        self.finish_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobServer for MockJobServer {
    async fn renew_agent_request(
        &self,
        _pool_id: u64,
        request_id: u64,
        _lock_token: Uuid,
    ) -> Result<TaskAgentJobRequest, JobServerError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        match self.renew_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(ok_request(request_id)),
        }
    }

    async fn finish_agent_request(
        &self,
        _pool_id: u64,
        request_id: u64,
        _lock_token: Uuid,
        _finish_time: DateTime<Utc>,
        result: TaskResult,
    ) -> Result<(), JobServerError> {
        if let Some(err) = self.finish_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.finish_calls.lock().unwrap().push((request_id, result));
        Ok(())
    }

    async fn get_agent_request(
        &self,
        _pool_id: u64,
        request_id: u64,
    ) -> Result<TaskAgentJobRequest, JobServerError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        match self.get_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(ok_request(request_id)),
        }
    }

    async fn append_timeline_issue(
        &self,
        _plan_id: Uuid,
        _timeline_id: Uuid,
        _record_id: Uuid,
        issue: TimelineIssue,
    ) -> Result<(), JobServerError> {
        self.issues.lock().unwrap().push(issue);
        Ok(())
    }

    async fn refresh_connection(
        &self,
        _kind: ConnectionKind,
        _timeout: Duration,
    ) -> Result<(), JobServerError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_connection_timeout(&self, _kind: ConnectionKind, _timeout: Duration) {}
}

/// How the next fake worker behaves once launched.
#[derive(Debug, Clone)]
pub(crate) enum WorkerBehavior {
    /// Connect, read the job message, exit with the given code.
    ExitAfterJob(i32),
    /// Connect, read the job message, then exit with the given code once a
    /// cancel-family message arrives.
    ExitOnCancelMessage(i32),
    /// Connect, read the job message, then only die when force-killed.
    IgnoreCancel,
    /// Never connect to the channel at all.
    NeverConnect,
}

/// In-process worker impostor. Behaviors are consumed per launch; every
/// message the "worker" receives is recorded.
pub(crate) struct FakeWorkerLauncher {
    behaviors: Mutex<VecDeque<WorkerBehavior>>,
    pub received: Arc<Mutex<Vec<WorkerMessage>>>,
    /// Lines pushed into the stdio capture before the worker acts.
    pub stdio_script: Mutex<Vec<String>>,
}

impl FakeWorkerLauncher {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(VecDeque::new()),
            received: Arc::new(Mutex::new(Vec::new())),
            stdio_script: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_behavior(&self, behavior: WorkerBehavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn received_types(&self) -> Vec<MessageType> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.message_type)
            .collect()
    }
}

impl WorkerLauncher for FakeWorkerLauncher {
    fn launch(
        &self,
        pipe_handle_out: String,
        _pipe_handle_in: String,
        stdio: Arc<StdioBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<anyhow::Result<i32>> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(WorkerBehavior::ExitAfterJob(0));
        let received = self.received.clone();
        let stdio_script: Vec<String> = self.stdio_script.lock().unwrap().drain(..).collect();

        tokio::spawn(async move {
            if matches!(behavior, WorkerBehavior::NeverConnect) {
                cancel.cancelled().await;
                return Ok(-1);
            }

            let mut channel = ProcessChannel::new();
            channel.start_client(&pipe_handle_out).await?;

            for line in stdio_script {
                stdio.push(line);
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(128 + 9),
                    msg = channel.receive() => {
                        let msg = match msg {
                            Ok(msg) => msg,
                            // Agent side went away; pretend a clean death.
                            Err(_) => return Ok(0),
                        };
                        let message_type = msg.message_type;
                        received.lock().unwrap().push(msg);
                        match (&behavior, message_type) {
                            (WorkerBehavior::ExitAfterJob(code), MessageType::NewJobRequest) => {
                                return Ok(*code);
                            }
                            (
                                WorkerBehavior::ExitOnCancelMessage(code),
                                MessageType::CancelRequest
                                | MessageType::AgentShutdown
                                | MessageType::OperatingSystemShutdown,
                            ) => {
                                return Ok(*code);
                            }
                            _ => {}
                        }
                    }
                }
            }
        })
    }
}

/// A job request message with the given request id and a system connection.
pub(crate) fn job_message(request_id: u64) -> AgentJobRequestMessage {
    serde_json::from_str(&format!(
        r#"{{
            "jobId": "{}",
            "jobDisplayName": "Build",
            "requestId": {request_id},
            "lockToken": "{}",
            "plan": {{ "planId": "{}", "planType": "Build", "version": 12 }},
            "timeline": {{ "id": "{}" }},
            "resources": {{
                "endpoints": [{{
                    "name": "SystemVssConnection",
                    "url": "https://dev.example.com/org",
                    "authorization": {{
                        "scheme": "OAuth",
                        "parameters": {{ "AccessToken": "test-token" }}
                    }}
                }}]
            }}
        }}"#,
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    ))
    .unwrap()
}
