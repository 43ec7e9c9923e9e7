//! The VirtualBox OVF builder
//!
//! Turns a prepared `BuildConfig` into the ordered step list, runs it and
//! maps the outcome onto an `Artifact` or a `BuildError`.

use crate::core::artifact::Artifact;
use crate::core::config::{BuildConfig, CommunicatorType, ConfigError};
use crate::core::state::{keys, CancelSignal, StateBag};
use crate::core::step::StepError;
use crate::core::ui::Ui;
use crate::download::ExpectedChecksum;
use crate::driver::{Driver, DriverError, VBoxManageDriver};
use crate::execution::runner::{EventHandler, PipelineRunner, RunOutcome, RunnerEvent};
use crate::steps::{
    AttachGuestAdditions, BuildStep, ConfigureVrdp, Connect, Download, DownloadGuestAdditions, Export,
    ForwardSsh, Import, OutputDir, Provision, RemoveDevices, Run, Shutdown, SuppressMessages,
    TypeBootCommand, UploadGuestAdditions, UploadVersion, VBoxManage,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Error types for a build run
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed creating VirtualBox driver: {0}")]
    Driver(#[from] DriverError),

    #[error("Build failed in step {}: {}", .0.step, .0.message)]
    Step(StepError),

    #[error("Build was cancelled.")]
    Cancelled,

    #[error("Build was halted.")]
    Halted,

    #[error("Failed to collect build artifact: {0}")]
    Artifact(#[from] std::io::Error),
}

/// Builds a VM image from an OVF/OVA appliance
pub struct Builder {
    config: Arc<BuildConfig>,
    cancel: CancelSignal,
    event_handlers: Vec<EventHandler>,
}

impl Builder {
    /// Prepare `config` and create a builder for it
    ///
    /// Returns the config warnings alongside the builder.
    pub async fn prepare(mut config: BuildConfig) -> Result<(Self, Vec<String>), ConfigError> {
        let warnings = config.prepare().await?;
        Ok((Self::new(config), warnings))
    }

    /// Create a builder for an already prepared config
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancelSignal::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// A handle that cancels the build, e.g. from a signal handler
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Add a handler for runner events
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    /// The steps of this build, in execution order
    pub fn steps(&self) -> Vec<BuildStep> {
        let c = &self.config;
        let mode = c.additions_mode();
        let ssh = c.communicator == CommunicatorType::Ssh;
        let checksum = c
            .hash_type()
            .filter(|_| !c.checksum.is_empty())
            .map(|hash_type| ExpectedChecksum::new(hash_type, c.checksum.clone()));

        vec![
            BuildStep::OutputDir(OutputDir {
                force: c.force,
                path: c.output_directory.clone(),
            }),
            BuildStep::SuppressMessages(SuppressMessages),
            BuildStep::DownloadGuestAdditions(DownloadGuestAdditions {
                mode,
                url: c.guest_additions_url.clone(),
                sha256: c.guest_additions_sha256.clone(),
            }),
            BuildStep::Download(Download {
                url: c.source_path.clone(),
                checksum,
                target_path: c.target_path.clone(),
            }),
            BuildStep::Import(Import {
                name: c.vm_name.clone(),
                flags: c.import_flags.clone(),
            }),
            BuildStep::AttachGuestAdditions(AttachGuestAdditions { mode }),
            BuildStep::ConfigureVrdp(ConfigureVrdp {
                bind_address: c.vrdp_bind_address.clone(),
                port_min: c.vrdp_port_min,
                port_max: c.vrdp_port_max,
            }),
            BuildStep::ForwardSsh(ForwardSsh {
                enabled: ssh,
                guest_port: c.ssh_port,
                host_port_min: c.ssh_host_port_min,
                host_port_max: c.ssh_host_port_max,
                skip_nat: c.ssh_skip_nat_mapping,
            }),
            BuildStep::VBoxManage(VBoxManage {
                commands: c.vboxmanage.clone(),
            }),
            BuildStep::Run(Run {
                boot_wait: c.boot_wait(),
                headless: c.headless,
            }),
            BuildStep::TypeBootCommand(TypeBootCommand {
                commands: c.boot_command.clone(),
            }),
            BuildStep::Connect(Connect {
                settings: c.ssh_settings(c.ssh_port),
                timeout: c.ssh_wait_timeout(),
                skip_nat: c.ssh_skip_nat_mapping,
            }),
            BuildStep::UploadVersion(UploadVersion {
                path: c.virtualbox_version_file.clone(),
            }),
            BuildStep::UploadGuestAdditions(UploadGuestAdditions {
                mode,
                path: c.guest_additions_path.clone(),
            }),
            BuildStep::Provision(Provision {
                commands: c.provision.clone(),
            }),
            BuildStep::Shutdown(Shutdown {
                command: c.shutdown_command.clone(),
                timeout: c.shutdown_timeout(),
                delay: c.post_shutdown_delay(),
            }),
            BuildStep::RemoveDevices(RemoveDevices {
                remove_ssh_forward: ssh && !c.ssh_skip_nat_mapping,
            }),
            BuildStep::VBoxManage(VBoxManage {
                commands: c.vboxmanage_post.clone(),
            }),
            BuildStep::Export(Export {
                format: c.export_format(),
                output_dir: c.output_directory.clone(),
                opts: c.export_opts.clone(),
            }),
        ]
    }

    /// Run the build against the installed VirtualBox
    ///
    /// Fails with `BuildError::Driver` before any step runs if VBoxManage
    /// cannot be found.
    pub async fn run(&self, ui: Arc<dyn Ui>) -> Result<Artifact, BuildError> {
        let driver = VBoxManageDriver::new()?;
        self.run_with_driver(Arc::new(driver), ui).await
    }

    /// Run the build with the given driver
    pub async fn run_with_driver(
        &self,
        driver: Arc<dyn Driver>,
        ui: Arc<dyn Ui>,
    ) -> Result<Artifact, BuildError> {
        let mut state = StateBag::new();
        state.put::<keys::Config>(self.config.clone());
        state.put::<keys::Driver>(driver);
        state.put::<keys::Ui>(ui);

        let mut runner = PipelineRunner::new(self.steps()).with_cancel_signal(self.cancel.clone());
        for handler in &self.event_handlers {
            let handler = handler.clone();
            runner.add_event_handler(move |event| handler(event));
        }

        info!("Starting build {} (VM {})", self.config.build_name, self.config.vm_name);
        match runner.run(&mut state).await {
            RunOutcome::Completed => {
                let artifact =
                    Artifact::from_dir(&self.config.output_directory, self.config.export_format())?;
                info!("Build produced {} files", artifact.files.len());
                Ok(artifact)
            }
            RunOutcome::Errored(err) => Err(BuildError::Step(err)),
            RunOutcome::Cancelled => Err(BuildError::Cancelled),
            RunOutcome::Halted => Err(BuildError::Halted),
        }
    }
}
