//! CLI output formatting

use crate::core::{ExecutionStatus, Ui};
use crate::execution::RunnerEvent;
use crate::persistence::BuildRecord;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Ui that writes to the terminal, prefixed with the build name
pub struct ConsoleUi {
    build_name: String,
}

impl ConsoleUi {
    pub fn new(build_name: impl Into<String>) -> Self {
        Self {
            build_name: build_name.into(),
        }
    }
}

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("{} {}", style(format!("==> {}:", self.build_name)).green().bold(), message);
    }

    fn message(&self, message: &str) {
        println!("    {}", style(format!("{}: {}", self.build_name, message)).green());
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", style(format!("==> {}:", self.build_name)).red().bold(), style(message).red());
    }

    fn progress(&self, total: u64) -> ProgressBar {
        create_progress_bar(total)
    }
}

/// Create a byte progress bar; a spinner when the size is unknown
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let (progress, template) = if total > 0 {
        (
            ProgressBar::new(total),
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
    } else {
        (ProgressBar::new_spinner(), "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})")
    };

    if let Ok(bar_style) = ProgressStyle::default_bar().template(template) {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
        ExecutionStatus::Halted => style("HALTED").blue().to_string(),
    }
}

/// Format a build record as one history line
pub fn format_build_record(record: &BuildRecord) -> String {
    let status_icon = match record.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    let duration = record
        .completed_at
        .and_then(|done| done.signed_duration_since(record.started_at).to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} - {} - {}",
        status_icon,
        style(&record.build_id.to_string()[..8]).dim(),
        style(&record.build_name).bold(),
        format_status(record.status),
        style(record.started_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        style(duration).cyan()
    )
}

/// Format a runner event for verbose display
///
/// `index` is the 1-based position of the step and `total` the step count.
pub fn format_runner_event(event: &RunnerEvent, index: usize, total: usize) -> Option<String> {
    match event {
        RunnerEvent::StepStarted { step } => Some(format!(
            "{} {} {}",
            SPINNER,
            style(format!("[{}/{}]", index, total)).dim(),
            style(step).cyan()
        )),
        RunnerEvent::CleanupStarted { step } => {
            Some(format!("{} cleanup {}", INFO, style(step).dim()))
        }
        RunnerEvent::RunFinished { status } => {
            Some(format!("{} Build finished: {}", ROCKET, format_status(*status)))
        }
        RunnerEvent::StepFinished { .. } => None,
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
