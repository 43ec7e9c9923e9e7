//! CLI command definitions

use clap::Args;

/// Run a build
#[derive(Debug, Args, Clone)]
pub struct BuildCommand {
    /// Path to build YAML file
    #[arg(short, long)]
    pub file: String,

    /// Replace an existing output directory
    #[arg(long)]
    pub force: bool,

    /// Don't save the build to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a build configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to build YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show build history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Build name to filter by
    #[arg(short, long)]
    pub build: Option<String>,

    /// Number of recent builds to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single build by ID
    #[arg(long)]
    pub build_id: Option<String>,
}
