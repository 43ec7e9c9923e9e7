//! Steps that talk to the guest over the communicator

use crate::communicator::{Communicator, SshCommunicator, SshSettings};
use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::steps::{cancel_signal, require, sleep_unless_cancelled, ui};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const CONNECT_RETRY: Duration = Duration::from_secs(5);

/// Waits for SSH to come up in the guest
#[derive(Debug, Clone)]
pub struct Connect {
    /// `None` when the build has no communicator
    pub settings: Option<SshSettings>,
    pub timeout: Duration,

    /// Use the configured port instead of the forwarded one
    pub skip_nat: bool,
}

impl Connect {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let Some(settings) = self.settings.clone() else {
            debug!("No communicator configured, not connecting");
            return Ok(StepAction::Continue);
        };

        let settings = if self.skip_nat {
            settings
        } else {
            settings.with_port(require::<keys::SshHostPort>(state)?)
        };
        let signal = cancel_signal(state);
        let ui = ui(state);

        ui.say(&format!(
            "Waiting for SSH to become available on {}:{}...",
            settings.host, settings.port
        ));
        let comm = SshCommunicator::new(settings);
        let deadline = Instant::now() + self.timeout;

        loop {
            match comm.run("true").await {
                Ok(0) => break,
                Ok(code) => debug!("SSH probe exited with {}", code),
                Err(e) => debug!("SSH not available yet: {}", e),
            }

            if Instant::now() >= deadline {
                bail!("Timeout waiting for SSH.");
            }
            if !sleep_unless_cancelled(&signal, CONNECT_RETRY).await {
                info!("Interrupted while waiting for SSH");
                return Ok(StepAction::Halt);
            }
        }

        ui.say("Connected to SSH!");
        state.put::<keys::Communicator>(Arc::new(comm) as Arc<dyn Communicator>);
        Ok(StepAction::Continue)
    }
}

/// Writes the VirtualBox version into a file in the guest
#[derive(Debug, Clone)]
pub struct UploadVersion {
    /// Guest path; empty to skip
    pub path: String,
}

impl UploadVersion {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.path.is_empty() {
            debug!("Not uploading VirtualBox version info, path is empty");
            return Ok(StepAction::Continue);
        }
        let Some(comm) = state.get::<keys::Communicator>().cloned() else {
            debug!("No communicator, not uploading VirtualBox version info");
            return Ok(StepAction::Continue);
        };

        let driver = require::<keys::Driver>(state)?;
        let version = driver.version().await.context("Error reading VirtualBox version")?;

        ui(state).say(&format!("Uploading VirtualBox version info ({})", version));
        comm.upload_bytes(version.as_bytes(), &self.path)
            .await
            .context("Error uploading VirtualBox version")?;
        Ok(StepAction::Continue)
    }
}

/// Runs inline shell commands in the guest
#[derive(Debug, Clone)]
pub struct Provision {
    pub commands: Vec<String>,
}

impl Provision {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.commands.is_empty() {
            return Ok(StepAction::Continue);
        }

        let comm = require::<keys::Communicator>(state)?;
        let ui = ui(state);

        for command in &self.commands {
            ui.say(&format!("Provisioning with shell command: {}", command));
            let code = comm
                .run(command)
                .await
                .with_context(|| format!("Error running provisioning command: {}", command))?;
            if code != 0 {
                bail!("Provisioning command exited with non-zero status {}: {}", code, command);
            }
        }

        info!("Ran {} provisioning commands", self.commands.len());
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{state_with, FakeCommunicator, FakeDriver};

    #[tokio::test]
    async fn test_connect_without_communicator_is_noop() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver);

        let step = Connect {
            settings: None,
            timeout: Duration::from_secs(1),
            skip_nat: false,
        };
        assert_eq!(step.run(&mut state).await.unwrap(), StepAction::Continue);
        assert!(!state.contains::<keys::Communicator>());
    }

    #[tokio::test]
    async fn test_connect_needs_forwarded_port() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver);

        let step = Connect {
            settings: Some(SshSettings::new("127.0.0.1", 22, "vagrant")),
            timeout: Duration::from_secs(1),
            skip_nat: false,
        };
        assert!(step.run(&mut state).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_version() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver);
        let comm = Arc::new(FakeCommunicator::default());
        state.put::<keys::Communicator>(comm.clone() as Arc<dyn Communicator>);

        UploadVersion {
            path: ".vbox_version".to_string(),
        }
        .run(&mut state)
        .await
        .unwrap();

        let uploads = comm.uploads.lock().unwrap();
        assert_eq!(uploads[0], (".vbox_version".to_string(), b"7.0.10".to_vec()));
    }

    #[tokio::test]
    async fn test_provision_runs_commands_in_order() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver);
        let comm = Arc::new(FakeCommunicator::default());
        state.put::<keys::Communicator>(comm.clone() as Arc<dyn Communicator>);

        let step = Provision {
            commands: vec!["apt-get update".to_string(), "apt-get -y upgrade".to_string()],
        };
        step.run(&mut state).await.unwrap();
        assert_eq!(*comm.commands.lock().unwrap(), vec!["apt-get update", "apt-get -y upgrade"]);
    }

    #[tokio::test]
    async fn test_provision_non_zero_exit_fails() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver);
        let comm = Arc::new(FakeCommunicator {
            exit_code: 2,
            ..Default::default()
        });
        state.put::<keys::Communicator>(comm as Arc<dyn Communicator>);

        let step = Provision {
            commands: vec!["false".to_string()],
        };
        let err = step.run(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("non-zero status 2"));
    }
}
