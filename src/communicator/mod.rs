//! Guest communication
//!
//! Once the guest has booted, commands and files reach it through a
//! `Communicator`. The only implementation shells out to OpenSSH.

pub mod ssh;

pub use ssh::{SshCommunicator, SshSettings};

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Error types for guest communication
#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with code {code}: {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A channel for running commands in the guest and copying files to it
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Run a shell command in the guest and return its exit status
    async fn run(&self, command: &str) -> Result<i32, CommunicatorError>;

    /// Copy a local file to `remote` in the guest
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), CommunicatorError>;

    /// Write `data` to `remote` in the guest
    async fn upload_bytes(&self, data: &[u8], remote: &str) -> Result<(), CommunicatorError>;
}
