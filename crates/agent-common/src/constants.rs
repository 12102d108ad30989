// Well-known names, return codes and dispatch timing constants.

/// Well-known directories resolved by the `HostContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownDirectory {
    /// Directory containing the agent binaries.
    Bin,
    /// Agent installation root (parent of Bin).
    Root,
    /// Diagnostic log directory.
    Diag,
    /// Work directory for job payloads.
    Work,
    /// Scratch directory under Work.
    Temp,
}

pub mod path {
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const WORK_DIRECTORY: &str = "_work";
    pub const TEMP_DIRECTORY: &str = "_temp";
}

pub mod agent {
    /// Base name of the worker executable; a platform suffix is appended on Windows.
    pub const WORKER_PROGRAM: &str = "Agent.Worker";

    /// First argv entry handed to the worker, ahead of the two pipe handles.
    pub const WORKER_SPAWN_ARG: &str = "spawnclient";

    /// Environment override for the worker IPC send timeout, in seconds.
    pub const CHANNEL_TIMEOUT_VARIABLE: &str = "VSTS_AGENT_CHANNEL_TIMEOUT";

    /// Environment variable carrying the monitor socket address, "host:port".
    pub const MONITOR_SOCKET_VARIABLE: &str = "ACTIONS_RUNNER_INPUT_MONITORSOCKETADDRESS";

    /// Name of the service endpoint that carries the system connection.
    pub const SYSTEM_CONNECTION_ENDPOINT: &str = "SystemVssConnection";
}

pub mod variables {
    /// Overlaid on the job variables when the agent runs in one-shot mode.
    pub const RUN_MODE: &str = "agent.runMode";
    pub const RUN_MODE_ONCE: &str = "once";
}

pub mod plan_features {
    /// When the plan advertises this, the worker emits the terminal event
    /// itself and the dispatcher must not send a second completion report.
    pub const JOB_COMPLETED_PLAN_EVENT: &str = "JobCompletedPlanEvent";
}

pub mod feature_flags {
    /// When On, a job interrupted by agent shutdown is reported Failed
    /// instead of Canceled.
    pub const FAIL_JOB_WHEN_AGENT_DIES: &str = "agent.failJobWhenAgentDies";
}

pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const RETRYABLE_ERROR: i32 = 2;
}

/// Timing constants for the dispatch core.
pub mod dispatch {
    use std::time::Duration;

    /// Interval between successful lease renewals.
    pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(60);

    /// Renewal attempts allowed before the first success.
    pub const LEASE_INITIAL_RETRY_LIMIT: u32 = 5;

    /// Grace beyond `locked_until` during which renewal keeps retrying.
    pub const LEASE_EXPIRY_GRACE: Duration = Duration::from_secs(5 * 60);

    /// Completion report attempts.
    pub const REPORT_RETRY_LIMIT: u32 = 5;

    /// Fixed delay between completion report attempts.
    pub const REPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Floor applied to a caller-supplied cancellation timeout.
    pub const MIN_CANCEL_TIMEOUT: Duration = Duration::from_secs(60);

    /// Ceiling applied to a caller-supplied cancellation timeout. Matches
    /// the largest interval the timer primitive can represent in minutes
    /// without overflowing.
    pub const MAX_CANCEL_TIMEOUT: Duration = Duration::from_secs(35_790 * 60);

    /// The kill deadline fires this long before the cancellation timeout,
    /// leaving room for the completion report.
    pub const KILL_DEADLINE_PADDING: Duration = Duration::from_secs(15);

    /// How long a superseded worker is given to exit after `worker_cancel`.
    pub const PREVIOUS_WORKER_GRACE: Duration = Duration::from_secs(45);

    /// Timeout used when refreshing the job-request connection.
    pub const CONNECTION_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Server timeout while the renewer is healthy.
    pub const RENEW_HEALTHY_TIMEOUT: Duration = Duration::from_secs(60);

    /// Server timeout while the renewer is in its error path.
    pub const RENEW_DEGRADED_TIMEOUT: Duration = Duration::from_secs(30);
}
