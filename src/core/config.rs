//! Build configuration from YAML
//!
//! A build is described by one flat `BuildConfig`. Loading only checks the
//! shape of the document; `prepare` validates and normalizes the values,
//! fills in defaults and resolves the source checksum.

use crate::checksum::{resolve_from_url, HashType};
use crate::communicator::SshSettings;
use crate::core::artifact::ExportFormat;
use crate::download::{downloadable_url, source_file_name};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors produced while loading or preparing a build config
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(ValidationErrors),

    #[error("Failed to parse build config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Failed to read build config: {0}")]
    Io(#[from] std::io::Error),
}

/// Every problem found by `prepare`, reported together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub errors: Vec<String>,

    /// Advisory warnings found alongside the errors
    pub warnings: Vec<String>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) in build config:", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n* {}", error)?;
        }
        Ok(())
    }
}

/// How the guest additions ISO is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestAdditionsMode {
    /// Neither downloaded nor given to the guest
    Disable,
    /// Attached to the VM as a DVD
    Attach,
    /// Uploaded to the guest over the communicator
    Upload,
}

impl GuestAdditionsMode {
    pub const ALL: [GuestAdditionsMode; 3] = [
        GuestAdditionsMode::Disable,
        GuestAdditionsMode::Attach,
        GuestAdditionsMode::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestAdditionsMode::Disable => "disable",
            GuestAdditionsMode::Attach => "attach",
            GuestAdditionsMode::Upload => "upload",
        }
    }
}

impl FromStr for GuestAdditionsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|m| m.as_str()).collect();
                format!(
                    "guest_additions_mode is invalid. Must be one of: {}",
                    names.join(", ")
                )
            })
    }
}

/// How the build talks to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorType {
    #[default]
    Ssh,
    None,
}

/// Resolved configuration for one build
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Name of the build, used in defaults and history
    #[serde(default = "default_build_name")]
    pub build_name: String,

    /// Replace an existing output directory
    #[serde(default)]
    pub force: bool,

    /// The OVF/OVA appliance to import, as a URL or local path
    #[serde(default)]
    pub source_path: String,

    #[serde(default)]
    pub checksum: String,

    /// Manifest to look the checksum up in when none is given inline
    #[serde(default)]
    pub checksum_url: String,

    #[serde(default)]
    pub checksum_type: String,

    /// Where a remote source is downloaded to; defaults to the cache
    #[serde(default)]
    pub target_path: Option<PathBuf>,

    /// Export format, `ovf` or `ova`
    #[serde(default = "default_format")]
    pub format: String,

    /// Extra flags for `VBoxManage export`
    #[serde(default)]
    pub export_opts: Vec<String>,

    #[serde(default)]
    pub output_directory: PathBuf,

    #[serde(default)]
    pub headless: bool,

    #[serde(default = "default_boot_wait")]
    pub boot_wait_secs: u64,

    #[serde(default = "default_localhost")]
    pub vrdp_bind_address: String,

    #[serde(default = "default_vrdp_port_min")]
    pub vrdp_port_min: u16,

    #[serde(default = "default_vrdp_port_max")]
    pub vrdp_port_max: u16,

    /// Command run in the guest to shut it down gracefully
    #[serde(default)]
    pub shutdown_command: Option<String>,

    #[serde(default = "default_wait_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub post_shutdown_delay_secs: u64,

    #[serde(default)]
    pub communicator: CommunicatorType,

    #[serde(default = "default_localhost")]
    pub ssh_host: String,

    #[serde(default)]
    pub ssh_username: Option<String>,

    /// SSH port inside the guest
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default)]
    pub ssh_private_key_file: Option<PathBuf>,

    #[serde(default = "default_ssh_host_port_min")]
    pub ssh_host_port_min: u16,

    #[serde(default = "default_ssh_host_port_max")]
    pub ssh_host_port_max: u16,

    /// Connect to `ssh_host:ssh_port` directly instead of through a NAT
    /// port forward
    #[serde(default)]
    pub ssh_skip_nat_mapping: bool,

    #[serde(default = "default_wait_timeout")]
    pub ssh_wait_timeout_secs: u64,

    /// VBoxManage commands run after import; `{{ name }}` is the VM name
    #[serde(default)]
    pub vboxmanage: Vec<Vec<String>>,

    /// VBoxManage commands run after shutdown, before export
    #[serde(default)]
    pub vboxmanage_post: Vec<Vec<String>>,

    /// Guest file the VirtualBox version is written to; empty to skip
    #[serde(default = "default_version_file")]
    pub virtualbox_version_file: String,

    #[serde(default)]
    pub boot_command: Vec<String>,

    #[serde(default)]
    pub guest_additions_mode: String,

    /// Guest path for the uploaded ISO; `{{ version }}` is available
    #[serde(default)]
    pub guest_additions_path: String,

    #[serde(default)]
    pub guest_additions_url: Option<String>,

    #[serde(default)]
    pub guest_additions_sha256: String,

    /// Shorthand for `--options <opts>` in the import flags
    #[serde(default)]
    pub import_opts: Option<String>,

    #[serde(default)]
    pub import_flags: Vec<String>,

    #[serde(default)]
    pub vm_name: String,

    /// Inline shell commands run in the guest after boot
    #[serde(default)]
    pub provision: Vec<String>,
}

fn default_build_name() -> String {
    "virtualbox-ovf".to_string()
}

fn default_format() -> String {
    ExportFormat::Ovf.extension().to_string()
}

fn default_boot_wait() -> u64 {
    10
}

fn default_localhost() -> String {
    "127.0.0.1".to_string()
}

fn default_vrdp_port_min() -> u16 {
    5900
}

fn default_vrdp_port_max() -> u16 {
    6000
}

fn default_wait_timeout() -> u64 {
    300
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_host_port_min() -> u16 {
    2222
}

fn default_ssh_host_port_max() -> u16 {
    4444
}

fn default_version_file() -> String {
    ".vbox_version".to_string()
}

const DEFAULT_GUEST_ADDITIONS_PATH: &str = "VBoxGuestAdditions.iso";

impl BuildConfig {
    /// Load a build configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a build configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate and normalize the configuration in place
    ///
    /// Returns the warnings on success. On failure every error found is
    /// returned at once, together with the warnings.
    pub async fn prepare(&mut self) -> Result<Vec<String>, ConfigError> {
        let (mut warnings, mut errors) = self.prepare_source().await;

        self.prepare_export(&mut errors);
        self.prepare_output(&mut errors);
        self.prepare_run(&mut errors);
        self.prepare_communicator(&mut errors);
        self.prepare_vboxmanage(&mut errors);
        self.prepare_guest_additions(&mut errors);
        self.prepare_vm_name();
        self.prepare_import();

        if self.shutdown_command.is_none() {
            warnings.push(
                "A shutdown_command was not specified. Without a shutdown command, the VM \
                 will be forcibly halted, which may cause data loss."
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(ValidationErrors { errors, warnings }));
        }

        debug!("Prepared build config for {}", self.build_name);
        Ok(warnings)
    }

    /// Validate the source and resolve its checksum
    ///
    /// Returns `(warnings, errors)`. A failure to resolve the checksum
    /// stops the checksum checks but not the source path check.
    pub async fn prepare_source(&mut self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.source_path.is_empty() {
            errors.push("The source_path must be specified.".to_string());
        }

        if self.checksum_type.is_empty() {
            errors.push("The checksum_type must be specified.".to_string());
        } else {
            self.checksum_type = self.checksum_type.to_lowercase();
            if self.checksum_type != "none" {
                if let Err(error) = self.resolve_checksum().await {
                    errors.push(error);
                    return (warnings, errors);
                }
            }
        }

        self.checksum = self.checksum.to_lowercase();

        if !self.source_path.is_empty() {
            match downloadable_url(&self.source_path) {
                Ok(url) => self.source_path = url.to_string(),
                Err(e) => errors.push(format!("Failed to parse source_path: {}", e)),
            }
        }

        if self.checksum_type == "none" {
            warnings.push(
                "A checksum type of 'none' was specified. Since OVA files can be big, \
                 a checksum is highly recommended."
                    .to_string(),
            );
        }

        (warnings, errors)
    }

    async fn resolve_checksum(&mut self) -> Result<(), String> {
        if self.checksum.is_empty() && self.checksum_url.is_empty() {
            return Err("Due to large file sizes, a checksum is required".to_string());
        }

        if HashType::from_name(&self.checksum_type).is_none() {
            return Err(format!("Unsupported checksum type: {}", self.checksum_type));
        }

        if self.checksum.is_empty() {
            let file_name = source_file_name(&self.source_path);
            let resolved = resolve_from_url(&self.checksum_url, &file_name, &self.checksum_type)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(checksum) = resolved {
                self.checksum = checksum;
            }
        }

        Ok(())
    }

    fn prepare_export(&mut self, errors: &mut Vec<String>) {
        if self.format.is_empty() {
            self.format = default_format();
        }
        if self.parse_format().is_none() {
            errors.push("format must be one of: ovf, ova".to_string());
        }
    }

    fn prepare_output(&mut self, errors: &mut Vec<String>) {
        if self.output_directory.as_os_str().is_empty() {
            self.output_directory = PathBuf::from(format!("output-{}", self.build_name));
        }

        if !self.force && self.output_directory.exists() {
            errors.push(format!(
                "Output directory '{}' already exists. It must not exist.",
                self.output_directory.display()
            ));
        }
    }

    fn prepare_run(&mut self, errors: &mut Vec<String>) {
        if self.vrdp_port_min > self.vrdp_port_max {
            errors.push("vrdp_port_min must be less than vrdp_port_max".to_string());
        }
    }

    fn prepare_communicator(&mut self, errors: &mut Vec<String>) {
        match self.communicator {
            CommunicatorType::Ssh => {
                if self.ssh_username.as_deref().map_or(true, str::is_empty) {
                    errors.push("An ssh_username must be specified".to_string());
                }

                if self.ssh_host_port_min > self.ssh_host_port_max {
                    errors.push("ssh_host_port_min must be less than ssh_host_port_max".to_string());
                }

                if let Some(key) = &self.ssh_private_key_file {
                    if !key.is_file() {
                        errors.push(format!(
                            "ssh_private_key_file is invalid: {} does not exist",
                            key.display()
                        ));
                    }
                }
            }
            CommunicatorType::None => {
                if self.shutdown_command.is_some() {
                    errors.push("shutdown_command requires a communicator".to_string());
                }
                if !self.provision.is_empty() {
                    errors.push("provision requires a communicator".to_string());
                }
            }
        }
    }

    fn prepare_vboxmanage(&mut self, errors: &mut Vec<String>) {
        for (field, commands) in [("vboxmanage", &self.vboxmanage), ("vboxmanage_post", &self.vboxmanage_post)] {
            for (i, command) in commands.iter().enumerate() {
                if command.is_empty() {
                    errors.push(format!("{}[{}] must not be empty", field, i));
                }
            }
        }
    }

    fn prepare_guest_additions(&mut self, errors: &mut Vec<String>) {
        if self.guest_additions_mode.is_empty() {
            self.guest_additions_mode = GuestAdditionsMode::Upload.as_str().to_string();
        }
        if self.guest_additions_path.is_empty() {
            self.guest_additions_path = DEFAULT_GUEST_ADDITIONS_PATH.to_string();
        }

        if let Err(error) = self.guest_additions_mode.parse::<GuestAdditionsMode>() {
            errors.push(error);
        }

        self.guest_additions_sha256 = self.guest_additions_sha256.to_lowercase();
    }

    fn prepare_vm_name(&mut self) {
        if self.vm_name.is_empty() {
            self.vm_name = format!("packer-{}-{}", self.build_name, chrono::Utc::now().timestamp());
        }
    }

    fn prepare_import(&mut self) {
        if let Some(opts) = self.import_opts.take().filter(|o| !o.is_empty()) {
            self.import_flags.push("--options".to_string());
            self.import_flags.push(opts);
        }
    }

    fn parse_format(&self) -> Option<ExportFormat> {
        match self.format.as_str() {
            "ovf" => Some(ExportFormat::Ovf),
            "ova" => Some(ExportFormat::Ova),
            _ => None,
        }
    }

    /// The export format; `ovf` unless prepared otherwise
    pub fn export_format(&self) -> ExportFormat {
        self.parse_format().unwrap_or_default()
    }

    /// The guest additions mode; `upload` unless prepared otherwise
    pub fn additions_mode(&self) -> GuestAdditionsMode {
        self.guest_additions_mode
            .parse()
            .unwrap_or(GuestAdditionsMode::Upload)
    }

    /// The hash type to verify the source with, `None` for `none`
    pub fn hash_type(&self) -> Option<HashType> {
        HashType::from_name(&self.checksum_type)
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn post_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.post_shutdown_delay_secs)
    }

    pub fn ssh_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_wait_timeout_secs)
    }

    /// SSH settings for the guest, or `None` without a communicator
    ///
    /// `host_port` is the forwarded port; it is ignored when NAT mapping
    /// is skipped.
    pub fn ssh_settings(&self, host_port: u16) -> Option<SshSettings> {
        if self.communicator == CommunicatorType::None {
            return None;
        }

        let port = if self.ssh_skip_nat_mapping { self.ssh_port } else { host_port };
        let username = self.ssh_username.clone().unwrap_or_default();
        let mut settings = SshSettings::new(self.ssh_host.clone(), port, username);
        if let Some(key) = &self.ssh_private_key_file {
            settings = settings.with_private_key(key.clone());
        }
        Some(settings)
    }
}
