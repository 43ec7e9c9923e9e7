//! VirtualBox guest additions

use crate::checksum::{resolve_from_url, HashType};
use crate::core::config::GuestAdditionsMode;
use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::core::template;
use crate::download::{cache_path, downloadable_url, fetch, ExpectedChecksum};
use crate::steps::{cancel_signal, cancelled, require, ui};
use anyhow::{Context, Result};
use tracing::{debug, info};

const DOWNLOAD_BASE: &str = "https://download.virtualbox.org/virtualbox";

/// Arguments to put `medium` into the DVD drive used for the additions
pub(crate) fn dvd_attach_args(name: &str, medium: &str) -> Vec<String> {
    [
        "storageattach",
        name,
        "--storagectl",
        "IDE Controller",
        "--port",
        "1",
        "--device",
        "0",
        "--type",
        "dvddrive",
        "--medium",
        medium,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Downloads the guest additions ISO matching the installed VirtualBox
#[derive(Debug, Clone)]
pub struct DownloadGuestAdditions {
    pub mode: GuestAdditionsMode,

    /// Overrides the VirtualBox download site
    pub url: Option<String>,

    /// Expected SHA256 for an overridden URL; unchecked when empty
    pub sha256: String,
}

impl DownloadGuestAdditions {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.mode == GuestAdditionsMode::Disable {
            debug!("Guest additions disabled, skipping download");
            return Ok(StepAction::Continue);
        }

        let driver = require::<keys::Driver>(state)?;
        let ui = ui(state);

        let (source, sha256) = match &self.url {
            Some(url) => (url.clone(), self.sha256.clone()),
            None => {
                let version = driver
                    .version()
                    .await
                    .context("Error reading version for guest additions download")?;
                let iso = format!("VBoxGuestAdditions_{}.iso", version);
                let url = format!("{}/{}/{}", DOWNLOAD_BASE, version, iso);

                let sha256 = if self.sha256.is_empty() {
                    ui.message("Downloading guest additions checksums...");
                    let sums = format!("{}/{}/SHA256SUMS", DOWNLOAD_BASE, version);
                    resolve_from_url(&sums, &iso, HashType::Sha256.name())
                        .await
                        .context("Error resolving guest additions checksum")?
                        .unwrap_or_default()
                } else {
                    self.sha256.clone()
                };
                (url, sha256)
            }
        };

        let url = downloadable_url(&source)
            .with_context(|| format!("Invalid guest additions url {}", source))?;
        let checksum = (!sha256.is_empty()).then(|| ExpectedChecksum::new(HashType::Sha256, sha256));

        ui.say("Downloading VirtualBox guest additions...");
        let progress = ui.progress(0);
        let signal = cancel_signal(state);
        let target = cache_path(&url, "iso");
        let path = tokio::select! {
            result = fetch(&url, &target, checksum.as_ref(), &progress) => {
                result.context("Error downloading guest additions")?
            }
            _ = cancelled(&signal) => {
                progress.abandon();
                return Ok(StepAction::Halt);
            }
        };

        info!("Guest additions ISO at {}", path.display());
        state.put::<keys::GuestAdditionsIso>(path);
        Ok(StepAction::Continue)
    }
}

/// Attaches the guest additions ISO as a DVD
#[derive(Debug, Clone)]
pub struct AttachGuestAdditions {
    pub mode: GuestAdditionsMode,
}

impl AttachGuestAdditions {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.mode != GuestAdditionsMode::Attach {
            return Ok(StepAction::Continue);
        }

        let name = require::<keys::VmName>(state)?;
        let iso = require::<keys::GuestAdditionsIso>(state)?;
        let driver = require::<keys::Driver>(state)?;

        ui(state).say("Attaching guest additions ISO onto IDE controller...");
        driver
            .vboxmanage(&dvd_attach_args(&name, &iso.display().to_string()))
            .await
            .context("Error attaching guest additions")?;

        state.put::<keys::GuestAdditionsAttached>(true);
        Ok(StepAction::Continue)
    }

    pub async fn cleanup(&self, state: &mut StateBag) -> Result<()> {
        if state.remove::<keys::GuestAdditionsAttached>() != Some(true) {
            return Ok(());
        }

        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        driver
            .vboxmanage(&dvd_attach_args(&name, "none"))
            .await
            .context("Error detaching guest additions")?;
        Ok(())
    }
}

/// Uploads the guest additions ISO into the guest
#[derive(Debug, Clone)]
pub struct UploadGuestAdditions {
    pub mode: GuestAdditionsMode,

    /// Guest path; `{{ version }}` is the VirtualBox version
    pub path: String,
}

impl UploadGuestAdditions {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if self.mode != GuestAdditionsMode::Upload {
            return Ok(StepAction::Continue);
        }
        let Some(comm) = state.get::<keys::Communicator>().cloned() else {
            debug!("No communicator, not uploading guest additions");
            return Ok(StepAction::Continue);
        };

        let driver = require::<keys::Driver>(state)?;
        let iso = require::<keys::GuestAdditionsIso>(state)?;
        let version = driver.version().await.context("Error reading version for guest additions")?;
        let remote = template::render_one(&self.path, "version", &version);

        ui(state).say("Uploading VirtualBox guest additions ISO...");
        comm.upload_file(&iso, &remote)
            .await
            .context("Error uploading guest additions")?;
        Ok(StepAction::Continue)
    }
}
