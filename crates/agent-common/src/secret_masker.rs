// Thread-safe store of secret values, scrubbed out of diagnostic output.

use parking_lot::RwLock;
use std::sync::Arc;

const MASK: &str = "***";

/// Replaces registered secret values with `***` in arbitrary strings.
///
/// Shared process-wide; every `Tracing` source runs its output through the
/// same masker, so a token registered once is masked everywhere.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    /// Secrets ordered longest-first so a secret that contains another
    /// secret is replaced whole rather than in fragments.
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to be masked. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if secrets.iter().any(|s| s == trimmed) {
            return;
        }
        let at = secrets
            .iter()
            .position(|s| s.len() < trimmed.len())
            .unwrap_or(secrets.len());
        secrets.insert(at, trimmed.to_string());
    }

    /// Replace every registered secret occurring in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        if secrets.is_empty() {
            return input.to_string();
        }

        let mut masked = input.to_string();
        for secret in secrets.iter() {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), MASK);
            }
        }
        masked
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}
