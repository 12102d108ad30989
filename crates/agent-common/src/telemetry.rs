// Telemetry publication. Callers treat publication as best-effort: a
// failure is logged and swallowed, never folded into a job outcome.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

/// One customer-intelligence event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub area: String,
    pub feature: String,
    pub properties: HashMap<String, serde_json::Value>,
}

impl TelemetryEvent {
    pub fn new(area: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            feature: feature.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(&self, event: TelemetryEvent) -> anyhow::Result<()>;
}

/// Publishes events to the diagnostic log only. Used when no telemetry
/// endpoint is configured, and by tests.
#[derive(Debug, Default)]
pub struct LogTelemetryPublisher;

#[async_trait]
impl TelemetryPublisher for LogTelemetryPublisher {
    async fn publish(&self, event: TelemetryEvent) -> anyhow::Result<()> {
        tracing::info!(
            "telemetry {}/{}: {}",
            event.area,
            event.feature,
            serde_json::to_string(&event.properties).unwrap_or_default()
        );
        Ok(())
    }
}
