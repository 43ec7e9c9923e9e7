//! User-facing build output

use indicatif::ProgressBar;
use std::sync::Mutex;

/// Where steps report progress to the person running the build
///
/// Diagnostics go to `tracing`; this is only for messages a user is meant
/// to read.
pub trait Ui: Send + Sync {
    /// A headline for something the build is about to do
    fn say(&self, message: &str);

    /// Supporting detail for the last headline
    fn message(&self, message: &str);

    /// A failure the user should see
    fn error(&self, message: &str);

    /// A progress bar for a transfer of `total` bytes (0 when unknown)
    fn progress(&self, _total: u64) -> ProgressBar {
        ProgressBar::hidden()
    }
}

/// Ui that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUi;

impl Ui for NullUi {
    fn say(&self, _message: &str) {}
    fn message(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Ui that keeps every line in memory
#[derive(Debug, Default)]
pub struct MemoryUi {
    lines: Mutex<Vec<String>>,
}

impl MemoryUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines so far, prefixed with `say:`, `message:` or `error:`
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push(&self, kind: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("{}: {}", kind, message));
        }
    }
}

impl Ui for MemoryUi {
    fn say(&self, message: &str) {
        self.push("say", message);
    }

    fn message(&self, message: &str) {
        self.push("message", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}
