// agent-common: shared services and infrastructure for the agent processes.
// Depends on `agent-sdk`; everything stateful hangs off the `HostContext`.

pub mod constants;
pub mod errors;
pub mod feature_flags;
pub mod host_context;
pub mod http_client_factory;
pub mod job_notification;
pub mod job_server;
pub mod process_channel;
pub mod secret_masker;
pub mod task_result;
pub mod telemetry;
pub mod terminal;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use constants::WellKnownDirectory;
pub use errors::{ChannelError, JobServerError, ProtocolViolation};
pub use feature_flags::{FeatureFlagProvider, FeatureFlagState, StaticFeatureFlagProvider};
pub use host_context::{HostContext, ShutdownReason};
pub use http_client_factory::HttpClientFactory;
pub use job_notification::JobNotification;
pub use job_server::{
    ConnectionKind, HttpJobServer, JobServer, TaskAgentJobRequest, TimelineIssue,
};
pub use process_channel::{channel_timeout, MessageType, ProcessChannel, WorkerMessage};
pub use secret_masker::SecretMasker;
pub use task_result::{translate_worker_exit_code, TaskResult, WorkerExit};
pub use telemetry::{LogTelemetryPublisher, TelemetryEvent, TelemetryPublisher};
pub use terminal::Terminal;
pub use self::tracing::{init_diagnostics, TraceEventType, TraceManager, TraceSetting, Tracing};
