// Client surface of the orchestration service, as consumed by the dispatch
// core. `JobServer` is the injected interface; `HttpJobServer` is the
// production implementation over the distributed-task REST endpoints.

use crate::errors::JobServerError;
use crate::http_client_factory::HttpClientFactory;
use crate::task_result::TaskResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const API_VERSION_HEADER: &str = "application/json;api-version=6.0-preview";

/// Default request timeout for a freshly-built connection.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Which logical connection to the service an operation rides on. The
/// renewer resets and retunes the `JobRequest` connection without touching
/// the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Generic,
    MessageQueue,
    JobRequest,
}

/// Server-side state of one job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAgentJobRequest {
    pub request_id: u64,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    /// Lease horizon granted by the last renewal.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// Present once the server considers the request finished.
    #[serde(default)]
    pub result: Option<TaskResult>,
}

/// An issue appended to a timeline record (crash diagnostics).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineIssue {
    /// "error" or "warning".
    pub issue_type: String,
    pub message: String,
}

impl TimelineIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            issue_type: "error".into(),
            message: message.into(),
        }
    }
}

/// Orchestration-service operations the dispatch core depends on.
#[async_trait]
pub trait JobServer: Send + Sync {
    /// Extend the agent's lease on a request. Returns the refreshed request
    /// including its new `locked_until`.
    async fn renew_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
    ) -> Result<TaskAgentJobRequest, JobServerError>;

    /// Report the terminal result of a request.
    async fn finish_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
        finish_time: DateTime<Utc>,
        result: TaskResult,
    ) -> Result<(), JobServerError>;

    /// Read the server-side state of a request.
    async fn get_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
    ) -> Result<TaskAgentJobRequest, JobServerError>;

    /// Append an issue to a timeline record and bump its error count.
    async fn append_timeline_issue(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        record_id: Uuid,
        issue: TimelineIssue,
    ) -> Result<(), JobServerError>;

    /// Tear down and rebuild a connection with the given request timeout.
    async fn refresh_connection(
        &self,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<(), JobServerError>;

    /// Retune the request timeout of an existing connection.
    fn set_connection_timeout(&self, kind: ConnectionKind, timeout: Duration);
}

/// REST implementation over
/// `{server}/_apis/distributedtask/pools/{pool}/jobrequests/{request}`.
pub struct HttpJobServer {
    server_url: Url,
    access_token: String,
    clients: RwLock<HashMap<ConnectionKind, reqwest::Client>>,
}

impl HttpJobServer {
    pub fn new(server_url: Url, access_token: String) -> Result<Self, JobServerError> {
        let server = Self {
            server_url,
            access_token,
            clients: RwLock::new(HashMap::new()),
        };
        server.rebuild_client(ConnectionKind::Generic, DEFAULT_CONNECTION_TIMEOUT)?;
        server.rebuild_client(ConnectionKind::JobRequest, DEFAULT_CONNECTION_TIMEOUT)?;
        Ok(server)
    }

    fn rebuild_client(
        &self,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<(), JobServerError> {
        let client = HttpClientFactory::create_client(timeout).map_err(|e| {
            JobServerError::Status {
                status: 0,
                body: format!("failed to build http client: {e}"),
            }
        })?;
        self.clients.write().insert(kind, client);
        Ok(())
    }

    fn client(&self, kind: ConnectionKind) -> reqwest::Client {
        self.clients
            .read()
            .get(&kind)
            .cloned()
            // Kinds are pre-built in `new`; an unknown kind falls back to a
            // fresh default client rather than failing the operation.
            .unwrap_or_default()
    }

    fn job_request_url(&self, pool_id: u64, request_id: u64) -> String {
        build_job_request_url(&self.server_url, pool_id, request_id)
    }

    async fn check_status(
        request_id: u64,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, JobServerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_status(request_id, status.as_u16(), body))
    }
}

fn build_job_request_url(base: &Url, pool_id: u64, request_id: u64) -> String {
    format!(
        "{}/_apis/distributedtask/pools/{}/jobrequests/{}",
        base.as_str().trim_end_matches('/'),
        pool_id,
        request_id
    )
}

fn map_status(request_id: u64, status: u16, body: String) -> JobServerError {
    match status {
        404 => JobServerError::JobNotFound(request_id),
        401 | 403 => JobServerError::JobTokenExpired(request_id),
        _ => JobServerError::Status { status, body },
    }
}

#[async_trait]
impl JobServer for HttpJobServer {
    async fn renew_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
    ) -> Result<TaskAgentJobRequest, JobServerError> {
        let url = self.job_request_url(pool_id, request_id);
        let response = self
            .client(ConnectionKind::JobRequest)
            .patch(&url)
            .query(&[("lockToken", lock_token.to_string())])
            .bearer_auth(&self.access_token)
            .header("Accept", API_VERSION_HEADER)
            .json(&serde_json::json!({ "requestId": request_id }))
            .send()
            .await?;

        let response = Self::check_status(request_id, response).await?;
        Ok(response.json::<TaskAgentJobRequest>().await?)
    }

    async fn finish_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
        lock_token: Uuid,
        finish_time: DateTime<Utc>,
        result: TaskResult,
    ) -> Result<(), JobServerError> {
        let url = self.job_request_url(pool_id, request_id);
        let response = self
            .client(ConnectionKind::Generic)
            .patch(&url)
            .query(&[("lockToken", lock_token.to_string())])
            .bearer_auth(&self.access_token)
            .header("Accept", API_VERSION_HEADER)
            .json(&serde_json::json!({
                "requestId": request_id,
                "result": result,
                "finishTime": finish_time,
            }))
            .send()
            .await?;

        Self::check_status(request_id, response).await?;
        Ok(())
    }

    async fn get_agent_request(
        &self,
        pool_id: u64,
        request_id: u64,
    ) -> Result<TaskAgentJobRequest, JobServerError> {
        let url = self.job_request_url(pool_id, request_id);
        let response = self
            .client(ConnectionKind::Generic)
            .get(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", API_VERSION_HEADER)
            .send()
            .await?;

        let response = Self::check_status(request_id, response).await?;
        Ok(response.json::<TaskAgentJobRequest>().await?)
    }

    async fn append_timeline_issue(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        record_id: Uuid,
        issue: TimelineIssue,
    ) -> Result<(), JobServerError> {
        let url = format!(
            "{}/_apis/distributedtask/plans/{}/timelines/{}/records",
            self.server_url.as_str().trim_end_matches('/'),
            plan_id,
            timeline_id
        );
        let response = self
            .client(ConnectionKind::Generic)
            .patch(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", API_VERSION_HEADER)
            .json(&serde_json::json!({
                "value": [{
                    "id": record_id,
                    "issues": [issue],
                    "errorCount": 1,
                }],
                "count": 1,
            }))
            .send()
            .await?;

        Self::check_status(0, response).await?;
        Ok(())
    }

    async fn refresh_connection(
        &self,
        kind: ConnectionKind,
        timeout: Duration,
    ) -> Result<(), JobServerError> {
        // Dropping the reqwest client tears down its pooled connections;
        // rebuilding forces a clean handshake on the next request.
        self.rebuild_client(kind, timeout)
    }

    fn set_connection_timeout(&self, kind: ConnectionKind, timeout: Duration) {
        let _ = self.rebuild_client(kind, timeout);
    }
}
