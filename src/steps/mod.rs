//! Build steps
//!
//! Every step a build can run is a variant of `BuildStep`. Each variant
//! wraps a struct holding the step's parameters; the structs report
//! failures as `anyhow` errors and `BuildStep` turns those into the
//! `Error` state entry the runner looks for.

pub mod boot_command;
pub mod download;
pub mod guest;
pub mod guest_additions;
pub mod network;
pub mod output_dir;
pub mod vm;

pub use boot_command::TypeBootCommand;
pub use download::Download;
pub use guest::{Connect, Provision, UploadVersion};
pub use guest_additions::{AttachGuestAdditions, DownloadGuestAdditions, UploadGuestAdditions};
pub use network::{ConfigureVrdp, ForwardSsh, RemoveDevices};
pub use output_dir::OutputDir;
pub use vm::{Export, Import, Run, Shutdown, SuppressMessages, VBoxManage};

use crate::core::state::{keys, CancelSignal, Entry, StateBag};
use crate::core::step::{Step, StepAction, StepError};
use crate::core::ui::{NullUi, Ui};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// How often long waits look at the cancel signal
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A step of the VirtualBox OVF build
#[derive(Debug, Clone)]
pub enum BuildStep {
    OutputDir(OutputDir),
    SuppressMessages(SuppressMessages),
    DownloadGuestAdditions(DownloadGuestAdditions),
    Download(Download),
    Import(Import),
    AttachGuestAdditions(AttachGuestAdditions),
    ConfigureVrdp(ConfigureVrdp),
    ForwardSsh(ForwardSsh),
    VBoxManage(VBoxManage),
    Run(Run),
    TypeBootCommand(TypeBootCommand),
    Connect(Connect),
    UploadVersion(UploadVersion),
    UploadGuestAdditions(UploadGuestAdditions),
    Provision(Provision),
    Shutdown(Shutdown),
    RemoveDevices(RemoveDevices),
    Export(Export),
}

impl BuildStep {
    async fn try_run(&self, state: &mut StateBag) -> anyhow::Result<StepAction> {
        match self {
            BuildStep::OutputDir(step) => step.run(state).await,
            BuildStep::SuppressMessages(step) => step.run(state).await,
            BuildStep::DownloadGuestAdditions(step) => step.run(state).await,
            BuildStep::Download(step) => step.run(state).await,
            BuildStep::Import(step) => step.run(state).await,
            BuildStep::AttachGuestAdditions(step) => step.run(state).await,
            BuildStep::ConfigureVrdp(step) => step.run(state).await,
            BuildStep::ForwardSsh(step) => step.run(state).await,
            BuildStep::VBoxManage(step) => step.run(state).await,
            BuildStep::Run(step) => step.run(state).await,
            BuildStep::TypeBootCommand(step) => step.run(state).await,
            BuildStep::Connect(step) => step.run(state).await,
            BuildStep::UploadVersion(step) => step.run(state).await,
            BuildStep::UploadGuestAdditions(step) => step.run(state).await,
            BuildStep::Provision(step) => step.run(state).await,
            BuildStep::Shutdown(step) => step.run(state).await,
            BuildStep::RemoveDevices(step) => step.run(state).await,
            BuildStep::Export(step) => step.run(state).await,
        }
    }

    async fn try_cleanup(&self, state: &mut StateBag) -> anyhow::Result<()> {
        match self {
            BuildStep::OutputDir(step) => step.cleanup(state).await,
            BuildStep::Import(step) => step.cleanup(state).await,
            BuildStep::AttachGuestAdditions(step) => step.cleanup(state).await,
            BuildStep::Run(step) => step.cleanup(state).await,
            BuildStep::SuppressMessages(_)
            | BuildStep::DownloadGuestAdditions(_)
            | BuildStep::Download(_)
            | BuildStep::ConfigureVrdp(_)
            | BuildStep::ForwardSsh(_)
            | BuildStep::VBoxManage(_)
            | BuildStep::TypeBootCommand(_)
            | BuildStep::Connect(_)
            | BuildStep::UploadVersion(_)
            | BuildStep::UploadGuestAdditions(_)
            | BuildStep::Provision(_)
            | BuildStep::Shutdown(_)
            | BuildStep::RemoveDevices(_)
            | BuildStep::Export(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Step for BuildStep {
    fn name(&self) -> &'static str {
        match self {
            BuildStep::OutputDir(_) => "output_dir",
            BuildStep::SuppressMessages(_) => "suppress_messages",
            BuildStep::DownloadGuestAdditions(_) => "download_guest_additions",
            BuildStep::Download(_) => "download",
            BuildStep::Import(_) => "import",
            BuildStep::AttachGuestAdditions(_) => "attach_guest_additions",
            BuildStep::ConfigureVrdp(_) => "configure_vrdp",
            BuildStep::ForwardSsh(_) => "forward_ssh",
            BuildStep::VBoxManage(_) => "vboxmanage",
            BuildStep::Run(_) => "run",
            BuildStep::TypeBootCommand(_) => "type_boot_command",
            BuildStep::Connect(_) => "connect",
            BuildStep::UploadVersion(_) => "upload_version",
            BuildStep::UploadGuestAdditions(_) => "upload_guest_additions",
            BuildStep::Provision(_) => "provision",
            BuildStep::Shutdown(_) => "shutdown",
            BuildStep::RemoveDevices(_) => "remove_devices",
            BuildStep::Export(_) => "export",
        }
    }

    async fn run(&self, state: &mut StateBag) -> StepAction {
        match self.try_run(state).await {
            Ok(action) => action,
            Err(e) => {
                let err = StepError::new(self.name(), format!("{:#}", e));
                error!("Step {} failed: {}", err.step, err.message);
                ui(state).error(&err.message);
                state.put::<keys::Error>(err);
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&self, state: &mut StateBag) {
        if let Err(e) = self.try_cleanup(state).await {
            warn!("Cleanup of step {} failed: {:#}", self.name(), e);
            ui(state).error(&format!("Error cleaning up {}: {:#}", self.name(), e));
        }
    }
}

/// Clone a value the step cannot do without out of the state bag
pub(crate) fn require<E: Entry>(state: &StateBag) -> anyhow::Result<E::Value>
where
    E::Value: Clone,
{
    state
        .get::<E>()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} is missing from the build state", E::KEY))
}

pub(crate) fn ui(state: &StateBag) -> Arc<dyn Ui> {
    state
        .get::<keys::Ui>()
        .cloned()
        .unwrap_or_else(|| Arc::new(NullUi))
}

pub(crate) fn cancel_signal(state: &StateBag) -> CancelSignal {
    state.get::<keys::CancelSignal>().cloned().unwrap_or_default()
}

/// Sleep for `duration`, returning `false` early if the build is cancelled
pub(crate) async fn sleep_unless_cancelled(signal: &CancelSignal, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if signal.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}

/// Resolves once the build is cancelled
pub(crate) async fn cancelled(signal: &CancelSignal) {
    while !signal.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}
