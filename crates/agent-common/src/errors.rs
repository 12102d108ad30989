// Typed errors at the service boundaries of the dispatch core.

/// Errors returned by the orchestration-service client.
#[derive(Debug, thiserror::Error)]
pub enum JobServerError {
    /// The server no longer knows the request. Terminal: the job is gone.
    #[error("job request {0} not found")]
    JobNotFound(u64),

    /// The job token has expired server-side. Terminal: the job is gone.
    #[error("job token expired for request {0}")]
    JobTokenExpired(u64),

    /// Any non-success HTTP status other than the terminal ones above.
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl JobServerError {
    /// True when the server considers the job finished and retrying is
    /// pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobServerError::JobNotFound(_) | JobServerError::JobTokenExpired(_)
        )
    }
}

/// Errors surfaced by the worker IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The send did not complete within the channel timeout.
    #[error("timed out sending '{0}' to the worker")]
    Timeout(String),

    /// The worker is gone; nothing can be delivered.
    #[error("worker channel closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The server's view of the dispatch diverged from the agent's in a way
/// that must stop the agent rather than be papered over.
#[derive(Debug, thiserror::Error)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);
