// agent-dispatch: the job dispatch core of the agent.
//
// One job at a time: the dispatcher front-end serializes control events,
// the executor drives a job through lease renewal, worker supervision,
// cancellation and completion reporting.

pub mod completion_reporter;
pub mod job_dispatcher;
pub mod job_executor;
pub mod lease_renewer;
pub mod messages;
pub mod worker_process;

#[cfg(test)]
pub(crate) mod test_support;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use completion_reporter::CompletionReporter;
pub use job_dispatcher::JobDispatcher;
pub use job_executor::{JobDispatch, JobExecutor};
pub use lease_renewer::{LeaseRenewal, LeaseRenewer};
pub use messages::{
    AgentJobRequestMessage, JobCancelMessage, JobMetadataMessage, PlanReference,
    ServiceEndpoint, VariableValue,
};
pub use worker_process::{
    ProcessWorkerLauncher, StdioBuffer, WorkerLauncher, WorkerProcess,
};
