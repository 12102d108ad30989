// Console output for the operator watching the agent.

use crate::secret_masker::SecretMasker;
use std::sync::Mutex;

/// Writes operator-facing lines to stdout/stderr, masking secrets first.
/// Tests flip `capture` to collect lines instead of printing them.
pub struct Terminal {
    secret_masker: SecretMasker,
    /// When set, lines are collected here instead of being printed.
    captured: Option<Mutex<Vec<String>>>,
    pub silent: bool,
}

impl Terminal {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self {
            secret_masker,
            captured: None,
            silent: false,
        }
    }

    /// A capturing terminal for tests.
    pub fn capturing() -> Self {
        Self {
            secret_masker: SecretMasker::new(),
            captured: Some(Mutex::new(Vec::new())),
            silent: false,
        }
    }

    pub fn write_line(&self, line: &str) {
        if self.silent {
            return;
        }
        let masked = self.secret_masker.mask_secrets(line);
        match &self.captured {
            Some(captured) => captured.lock().unwrap().push(masked),
            None => println!("{masked}"),
        }
    }

    pub fn write_error(&self, line: &str) {
        if self.silent {
            return;
        }
        let masked = self.secret_masker.mask_secrets(line);
        match &self.captured {
            Some(captured) => captured.lock().unwrap().push(format!("! {masked}")),
            None => eprintln!("{masked}"),
        }
    }

    /// Lines collected by a capturing terminal.
    pub fn captured_lines(&self) -> Vec<String> {
        self.captured
            .as_ref()
            .map(|c| c.lock().unwrap().clone())
            .unwrap_or_default()
    }
}
