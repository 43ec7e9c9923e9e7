//! VM lifecycle steps

use crate::core::artifact::ExportFormat;
use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::core::template;
use crate::steps::{cancel_signal, require, sleep_unless_cancelled, ui};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Turns off VirtualBox GUI notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressMessages;

impl SuppressMessages {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let driver = require::<keys::Driver>(state)?;
        debug!("Suppressing annoying messages in VirtualBox");
        driver
            .suppress_messages()
            .await
            .context("Error configuring VirtualBox to suppress messages")?;
        Ok(StepAction::Continue)
    }
}

/// Imports the source appliance as a new VM
#[derive(Debug, Clone)]
pub struct Import {
    pub name: String,
    pub flags: Vec<String>,
}

impl Import {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let driver = require::<keys::Driver>(state)?;
        let path = require::<keys::VmPath>(state)?;

        ui(state).say(&format!("Importing VM: {}", path.display()));
        driver
            .import(&self.name, &path, &self.flags)
            .await
            .context("Error importing VM")?;

        info!("Imported {} as {}", path.display(), self.name);
        state.put::<keys::VmName>(self.name.clone());
        Ok(StepAction::Continue)
    }

    pub async fn cleanup(&self, state: &mut StateBag) -> Result<()> {
        let Some(name) = state.get::<keys::VmName>().cloned() else {
            return Ok(());
        };
        let driver = require::<keys::Driver>(state)?;

        ui(state).say("Unregistering and deleting imported VM...");
        driver
            .delete(&name)
            .await
            .with_context(|| format!("Error deleting VM {}", name))?;
        Ok(())
    }
}

/// Runs user supplied VBoxManage commands against the VM
#[derive(Debug, Clone)]
pub struct VBoxManage {
    pub commands: Vec<Vec<String>>,
}

impl VBoxManage {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.commands.is_empty() {
            return Ok(StepAction::Continue);
        }

        let driver = require::<keys::Driver>(state)?;
        let name = require::<keys::VmName>(state)?;
        let ui = ui(state);
        ui.say("Executing custom VBoxManage commands...");

        for command in &self.commands {
            let args: Vec<String> = command
                .iter()
                .map(|arg| template::render_one(arg, "name", &name))
                .collect();

            ui.message(&format!("Executing: {}", args.join(" ")));
            driver
                .vboxmanage(&args)
                .await
                .context("Error executing command")?;
        }

        Ok(StepAction::Continue)
    }
}

/// Starts the VM and waits for it to boot
#[derive(Debug, Clone)]
pub struct Run {
    pub boot_wait: Duration,
    pub headless: bool,
}

impl Run {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        let ui = ui(state);

        ui.say("Starting the virtual machine...");
        let gui = if self.headless { "headless" } else { "gui" };
        let args = vec![
            "startvm".to_string(),
            name.clone(),
            "--type".to_string(),
            gui.to_string(),
        ];
        driver.vboxmanage(&args).await.context("Error starting VM")?;

        if !self.boot_wait.is_zero() {
            ui.say(&format!("Waiting {}s for boot...", self.boot_wait.as_secs()));
            if !sleep_unless_cancelled(&cancel_signal(state), self.boot_wait).await {
                info!("Interrupted during boot wait");
                return Ok(StepAction::Halt);
            }
        }

        Ok(StepAction::Continue)
    }

    pub async fn cleanup(&self, state: &mut StateBag) -> Result<()> {
        let Some(name) = state.get::<keys::VmName>().cloned() else {
            return Ok(());
        };
        let driver = require::<keys::Driver>(state)?;

        if driver.is_running(&name).await.unwrap_or(false) {
            driver.stop(&name).await.context("Error shutting down VM")?;
        }
        Ok(())
    }
}

/// Shuts the guest down, gracefully when a command is configured
#[derive(Debug, Clone)]
pub struct Shutdown {
    pub command: Option<String>,
    pub timeout: Duration,
    pub delay: Duration,
}

impl Shutdown {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        let signal = cancel_signal(state);
        let ui = ui(state);

        match &self.command {
            Some(command) => {
                let comm = require::<keys::Communicator>(state)?;
                ui.say("Gracefully halting virtual machine...");
                debug!("Shutdown command: {}", command);
                comm.run(command)
                    .await
                    .context("Failed to send shutdown command")?;

                let deadline = Instant::now() + self.timeout;
                while driver.is_running(&name).await? {
                    if signal.is_cancelled() {
                        return Ok(StepAction::Halt);
                    }
                    if Instant::now() >= deadline {
                        bail!("Timeout while waiting for machine to shut down.");
                    }
                    tokio::time::sleep(SHUTDOWN_POLL).await;
                }
            }
            None => {
                ui.say("Halting the virtual machine...");
                if driver.is_running(&name).await? {
                    driver.stop(&name).await.context("Error stopping VM")?;
                }
            }
        }

        if !self.delay.is_zero() {
            ui.say(&format!("Waiting {}s after shutdown...", self.delay.as_secs()));
            if !sleep_unless_cancelled(&signal, self.delay).await {
                return Ok(StepAction::Halt);
            }
        }

        info!("VM {} shut down", name);
        Ok(StepAction::Continue)
    }
}

/// Exports the VM into the output directory
#[derive(Debug, Clone)]
pub struct Export {
    pub format: ExportFormat,
    pub output_dir: PathBuf,
    pub opts: Vec<String>,
}

impl Export {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        let output = self
            .output_dir
            .join(format!("{}.{}", name, self.format.extension()));

        ui(state).say("Exporting virtual machine...");
        driver
            .export(&name, &output, &self.opts)
            .await
            .context("Error exporting virtual machine")?;

        info!("Exported {} to {}", name, output.display());
        Ok(StepAction::Continue)
    }
}
