// Per-component trace sources with secret masking, dispatched to the
// `tracing` crate.

use crate::secret_masker::SecretMasker;
use agent_sdk::TraceWriter;
use chrono::Utc;
use std::sync::Arc;

/// Trace severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose = 0,
    Information = 1,
    Warning = 2,
    Error = 3,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// Output configuration shared by all sources created from one manager.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity to emit.
    pub level: TraceEventType,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
        }
    }
}

/// A named trace source. All sources share one `SecretMasker`, so secrets
/// registered anywhere are scrubbed everywhere.
#[derive(Clone)]
pub struct Tracing {
    name: Arc<str>,
    secret_masker: SecretMasker,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            name: name.into().into(),
            secret_masker,
            setting,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let masked = self.secret_masker.mask_secrets(message);
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = format!("[{timestamp}][{}] {event_type}: {masked}", self.name);

        match event_type {
            TraceEventType::Error => tracing::error!("{line}"),
            TraceEventType::Warning => tracing::warn!("{line}"),
            TraceEventType::Information => tracing::info!("{line}"),
            TraceEventType::Verbose => tracing::debug!("{line}"),
        }
    }

    pub fn entering(&self, name: &str) {
        self.verbose(&format!("Entering {name}"));
    }

    pub fn leaving(&self, name: &str) {
        self.verbose(&format!("Leaving {name}"));
    }

    /// Log an error along with its whole source chain.
    pub fn error_chain(&self, err: &dyn std::error::Error) {
        self.error(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.error(&format!("  caused by: {cause}"));
            source = cause.source();
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.emit(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.emit(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.emit(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.emit(TraceEventType::Error, message);
    }
}

/// Creates named `Tracing` sources over a shared masker and setting.
pub struct TraceManager {
    secret_masker: SecretMasker,
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self {
            secret_masker,
            default_setting: TraceSetting::default(),
        }
    }

    pub fn with_setting(secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            default_setting: setting,
        }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(
            name,
            self.secret_masker.clone(),
            self.default_setting.clone(),
        )
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }
}

/// Install the process-level `tracing` subscriber. Host binaries and test
/// harnesses call this once; repeated calls are ignored.
pub fn init_diagnostics() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(TraceEventType::Verbose < TraceEventType::Information);
        assert!(TraceEventType::Information < TraceEventType::Warning);
        assert!(TraceEventType::Warning < TraceEventType::Error);
    }

    #[test]
    fn sources_share_the_masker() {
        let masker = SecretMasker::new();
        let manager = TraceManager::new(masker.clone());
        let _a = manager.get("JobDispatcher");
        let _b = manager.get("LeaseRenewer");
        masker.add_value("tok123");
        assert_eq!(manager.secret_masker().secret_count(), 1);
    }
}
