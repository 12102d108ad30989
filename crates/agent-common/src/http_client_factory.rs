// HTTP client construction for the orchestration-service connections.

use anyhow::Result;
use reqwest::Client;
use std::time::Duration;

/// Builds `reqwest` clients configured the way every agent connection
/// expects: an agent user-agent, a per-connection request timeout, and an
/// environment opt-out for TLS verification on broken-proxy setups. Proxy
/// settings come from the standard `HTTP(S)_PROXY` environment variables,
/// which reqwest honors on its own.
pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Environment variable disabling TLS certificate verification.
    const TLS_NO_VERIFY_VARIABLE: &'static str = "GITHUB_ACTIONS_RUNNER_TLS_NO_VERIFY";

    pub fn create_client(timeout: Duration) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(format!(
                "GitHubActionsRunner-{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(timeout);

        if let Ok(value) = std::env::var(Self::TLS_NO_VERIFY_VARIABLE) {
            if matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "y" | "yes") {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(builder.build()?)
    }
}
