// Feature-flag lookup consumed by the dispatch core.

use async_trait::async_trait;
use std::collections::HashMap;

/// State of a server-side feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlagState {
    On,
    Off,
}

impl FeatureFlagState {
    pub fn is_on(self) -> bool {
        self == FeatureFlagState::On
    }
}

/// Resolves feature flags by name. Implementations must answer `Off` rather
/// than fail: a flag lookup must never take a job down with it.
#[async_trait]
pub trait FeatureFlagProvider: Send + Sync {
    async fn get_feature_flag(&self, name: &str) -> FeatureFlagState;
}

/// Fixed flag set, for tests and for agents configured without a flag
/// service. Unknown flags are Off.
#[derive(Debug, Default)]
pub struct StaticFeatureFlagProvider {
    flags: HashMap<String, FeatureFlagState>,
}

impl StaticFeatureFlagProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: impl Into<String>, state: FeatureFlagState) -> Self {
        self.flags.insert(name.into(), state);
        self
    }
}

#[async_trait]
impl FeatureFlagProvider for StaticFeatureFlagProvider {
    async fn get_feature_flag(&self, name: &str) -> FeatureFlagState {
        self.flags
            .get(name)
            .copied()
            .unwrap_or(FeatureFlagState::Off)
    }
}
