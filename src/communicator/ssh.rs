//! OpenSSH subprocess communicator

use crate::communicator::{Communicator, CommunicatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Connection settings for the guest's SSH server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    /// Host to connect to, normally the forwarded localhost address
    pub host: String,

    /// Port to connect to
    pub port: u16,

    /// Guest user
    pub username: String,

    /// Private key for authentication; the SSH agent is used otherwise
    pub private_key_file: Option<PathBuf>,

    /// Timeout for a single command in seconds
    pub command_timeout_secs: u64,
}

impl SshSettings {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            private_key_file: None,
            command_timeout_secs: 3600,
        }
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Communicator that runs `ssh` and `scp`
#[derive(Debug, Clone)]
pub struct SshCommunicator {
    settings: SshSettings,
}

impl SshCommunicator {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Options shared by ssh and scp; only the port flag differs
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            port_flag.to_string(),
            self.settings.port.to_string(),
        ];

        if let Some(key) = &self.settings.private_key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args
    }

    async fn exec(
        &self,
        program: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output, CommunicatorError> {
        debug!("Executing {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| CommunicatorError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }

        let timeout_secs = self.settings.command_timeout_secs;
        timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| CommunicatorError::Timeout(timeout_secs))?
            .map_err(CommunicatorError::from)
    }

    fn check(program: &str, output: std::process::Output) -> Result<(), CommunicatorError> {
        if output.status.success() {
            return Ok(());
        }
        Err(CommunicatorError::Command {
            program: program.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl Communicator for SshCommunicator {
    async fn run(&self, command: &str) -> Result<i32, CommunicatorError> {
        let mut args = self.common_args("-p");
        args.push(self.settings.destination());
        args.push(command.to_string());

        let output = self.exec("ssh", args, None).await?;
        let code = output.status.code().unwrap_or(-1);
        debug!("Remote command exited with {}", code);
        Ok(code)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), CommunicatorError> {
        let mut args = self.common_args("-P");
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.settings.destination(), remote));

        let output = self.exec("scp", args, None).await?;
        Self::check("scp", output)
    }

    async fn upload_bytes(&self, data: &[u8], remote: &str) -> Result<(), CommunicatorError> {
        let mut args = self.common_args("-p");
        args.push(self.settings.destination());
        args.push(format!("cat > {}", shell_quote(remote)));

        let output = self.exec("ssh", args, Some(data)).await?;
        Self::check("ssh", output)
    }
}
