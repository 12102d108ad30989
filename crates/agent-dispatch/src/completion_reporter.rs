// Terminal-result reporting for a finished dispatch.

use crate::messages::AgentJobRequestMessage;
use agent_common::constants::{dispatch, plan_features};
use agent_common::job_server::JobServer;
use agent_common::task_result::TaskResult;
use agent_common::tracing::Tracing;
use agent_sdk::TraceWriter;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

/// Reports a job's terminal result to the orchestration service, retrying
/// transient failures. Exactly one report is sent per job, and none at all
/// when the plan says the worker already emitted the terminal event.
pub struct CompletionReporter {
    trace: Tracing,
    job_server: Arc<dyn JobServer>,
}

impl CompletionReporter {
    pub fn new(trace: Tracing, job_server: Arc<dyn JobServer>) -> Self {
        Self { trace, job_server }
    }

    pub async fn report(
        &self,
        pool_id: u64,
        message: &AgentJobRequestMessage,
        result: TaskResult,
    ) -> Result<()> {
        if message
            .plan
            .has_feature(plan_features::JOB_COMPLETED_PLAN_EVENT)
        {
            // The worker raised the terminal plan event itself; a second
            // report would be a protocol error.
            self.trace.info(&format!(
                "Plan for request {} handles job completion; skipping the completion report.",
                message.request_id
            ));
            return Ok(());
        }

        let mut attempt_errors: Vec<String> = Vec::new();

        for attempt in 1..=dispatch::REPORT_RETRY_LIMIT {
            match self
                .job_server
                .finish_agent_request(
                    pool_id,
                    message.request_id,
                    message.lock_token,
                    Utc::now(),
                    result,
                )
                .await
            {
                Ok(()) => {
                    self.trace.info(&format!(
                        "Reported request {} finished with result {result}.",
                        message.request_id
                    ));
                    return Ok(());
                }
                Err(e) if e.is_terminal() => {
                    // The server already considers the request finished.
                    self.trace
                        .info(&format!("Completion report absorbed: {e}"));
                    return Ok(());
                }
                Err(e) => {
                    self.trace.warning(&format!(
                        "Completion report attempt {attempt}/{} for request {} failed: {e}",
                        dispatch::REPORT_RETRY_LIMIT,
                        message.request_id
                    ));
                    attempt_errors.push(format!("attempt {attempt}: {e}"));

                    if attempt < dispatch::REPORT_RETRY_LIMIT {
                        tokio::time::sleep(dispatch::REPORT_RETRY_DELAY).await;
                    }
                }
            }
        }

        anyhow::bail!(
            "Failed to report completion of request {} after {} attempts: {}",
            message.request_id,
            dispatch::REPORT_RETRY_LIMIT,
            attempt_errors.join("; ")
        )
    }
}
