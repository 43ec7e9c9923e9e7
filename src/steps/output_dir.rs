//! Output directory lifecycle

use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::steps::ui;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const REMOVE_ATTEMPTS: u32 = 5;

/// Creates the output directory, and removes it again if the build fails
#[derive(Debug, Clone)]
pub struct OutputDir {
    pub force: bool,
    pub path: PathBuf,
}

impl OutputDir {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let ui = ui(state);
        ui.say("Creating output directory...");

        if self.path.exists() {
            if !self.force {
                bail!(
                    "Output directory '{}' already exists. It must not exist.",
                    self.path.display()
                );
            }
            ui.message("Deleting previous output directory...");
            tokio::fs::remove_dir_all(&self.path)
                .await
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }

        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("Failed to create output directory {}", self.path.display()))?;

        info!("Created output directory {}", self.path.display());
        state.put::<keys::OutputDir>(self.path.clone());
        Ok(StepAction::Continue)
    }

    pub async fn cleanup(&self, state: &mut StateBag) -> Result<()> {
        let Some(path) = state.get::<keys::OutputDir>().cloned() else {
            return Ok(());
        };

        let failed = state.contains::<keys::Cancelled>()
            || state.contains::<keys::Halted>()
            || state.contains::<keys::Error>();
        if !failed {
            return Ok(());
        }

        ui(state).say("Deleting output directory...");

        // VirtualBox can hold on to exported files for a moment after it exits
        for attempt in 1..=REMOVE_ATTEMPTS {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt == REMOVE_ATTEMPTS => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
                Err(e) => {
                    debug!("Removing {} failed (attempt {}): {}", path.display(), attempt, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        state.remove::<keys::OutputDir>();
        Ok(())
    }
}
