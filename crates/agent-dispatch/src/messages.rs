// Server → agent message model for the dispatch core.

use agent_common::constants;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A job request received from the orchestration service. Immutable after
/// delivery, except for the single run-once variable overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJobRequestMessage {
    pub job_id: Uuid,
    #[serde(default)]
    pub job_display_name: String,
    #[serde(default)]
    pub request_id: u64,
    /// Lease token presented on every renewal and on the completion report.
    #[serde(default)]
    pub lock_token: Uuid,
    /// Lease horizon at delivery time.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan: PlanReference,
    #[serde(default)]
    pub timeline: Option<TimelineReference>,
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
    #[serde(default)]
    pub resources: JobResources,
}

impl AgentJobRequestMessage {
    /// The endpoint the agent uses to talk back to the service.
    pub fn system_connection(&self) -> Option<&ServiceEndpoint> {
        self.resources
            .endpoints
            .iter()
            .find(|e| e.name == constants::agent::SYSTEM_CONNECTION_ENDPOINT)
    }

    /// Access token from the system connection, if present.
    pub fn access_token(&self) -> Option<&str> {
        self.system_connection()
            .and_then(|e| e.authorization.as_ref())
            .and_then(|a| a.parameters.get("AccessToken"))
            .map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(
            name.into(),
            VariableValue {
                value: value.into(),
                is_secret: false,
            },
        );
    }
}

/// Orchestration plan descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    #[serde(default)]
    pub plan_id: Uuid,
    #[serde(default)]
    pub plan_type: String,
    #[serde(default)]
    pub version: i32,
    /// Capabilities the plan advertises (e.g. `JobCompletedPlanEvent`).
    #[serde(default)]
    pub features: HashSet<String>,
}

impl PlanReference {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineReference {
    #[serde(default)]
    pub id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResources {
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub authorization: Option<EndpointAuthorization>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthorization {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// A cancellation request for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCancelMessage {
    pub job_id: Uuid,
    /// Graceful window in seconds before the worker is killed.
    #[serde(default)]
    pub timeout_in_seconds: Option<u64>,
}

/// Cumulative metadata pushed to a running job's worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadataMessage {
    pub job_id: Uuid,
    #[serde(default)]
    pub post_lines_frequency_millis: Option<u64>,
    #[serde(flatten)]
    pub properties: HashMap<String, serde_json::Value>,
}
