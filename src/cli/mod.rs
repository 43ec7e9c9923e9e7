//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{BuildCommand, HistoryCommand, ValidateCommand};
use std::ffi::OsString;

/// Builds VirtualBox images from OVF/OVA appliances
#[derive(Debug, Parser, Clone)]
#[command(name = "ovfbuild")]
#[command(version)]
#[command(about = "Builds VirtualBox images from OVF/OVA appliances", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a build
    Build(BuildCommand),

    /// Validate a build configuration
    Validate(ValidateCommand),

    /// Show build history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
