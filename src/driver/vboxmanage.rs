//! VBoxManage subprocess driver

use crate::driver::{Driver, DriverError};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 3600;

#[cfg(windows)]
const BINARY_NAME: &str = "VBoxManage.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "VBoxManage";

/// Driver that shells out to the `VBoxManage` executable
#[derive(Debug, Clone)]
pub struct VBoxManageDriver {
    /// Path to the VBoxManage executable
    path: PathBuf,

    /// Timeout for a single VBoxManage invocation in seconds
    timeout_secs: u64,
}

impl VBoxManageDriver {
    /// Locate VBoxManage and create a driver for it
    ///
    /// `VBOX_INSTALL_PATH` and `VBOX_MSI_INSTALL_PATH` are searched before
    /// `PATH`.
    pub fn new() -> Result<Self, DriverError> {
        let path = find_vboxmanage().ok_or_else(|| {
            DriverError::NotFound(format!(
                "{} is not on PATH and VBOX_INSTALL_PATH is not set",
                BINARY_NAME
            ))
        })?;

        debug!("Using VBoxManage at {}", path.display());
        Ok(Self::with_path(path))
    }

    /// Create a driver for a known VBoxManage path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn reported_error() -> &'static Regex {
    static REPORTED: OnceLock<Regex> = OnceLock::new();
    REPORTED.get_or_init(|| Regex::new(r"VBoxManage([.a-z]*?): error:").expect("valid error regex"))
}

/// Whether VBoxManage printed an error on stderr
///
/// VBoxManage sometimes reports errors while exiting 0.
fn reports_error(stderr: &str) -> bool {
    reported_error().is_match(stderr)
}

fn find_vboxmanage() -> Option<PathBuf> {
    let install_dirs = ["VBOX_INSTALL_PATH", "VBOX_MSI_INSTALL_PATH"]
        .into_iter()
        .filter_map(std::env::var_os);
    let path_dirs = std::env::var_os("PATH");

    install_dirs
        .chain(path_dirs)
        .flat_map(|dirs| std::env::split_paths(&dirs).collect::<Vec<_>>())
        .map(|dir| dir.join(BINARY_NAME))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl Driver for VBoxManageDriver {
    async fn vboxmanage(&self, args: &[String]) -> Result<String, DriverError> {
        debug!("Executing VBoxManage: {:?}", args);

        let result = timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.path)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| DriverError::Timeout(self.timeout_secs))?;

        let output = result.map_err(|e| {
            DriverError::Internal(format!("Failed to execute VBoxManage: {}", e))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!("VBoxManage exited with code {}: {}", code, stderr);
            return Err(DriverError::Command {
                args: args.join(" "),
                code,
                stderr,
            });
        }

        if reports_error(&stderr) {
            return Err(DriverError::Reported(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("VBoxManage returned {} bytes of output", stdout.len());
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_path() {
        let driver = VBoxManageDriver::with_path("/opt/vbox/VBoxManage").with_timeout(5);
        assert_eq!(driver.path(), std::path::Path::new("/opt/vbox/VBoxManage"));
        assert_eq!(driver.timeout_secs, 5);
    }

    #[test]
    fn test_reports_error() {
        assert!(reports_error(
            "VBoxManage: error: Could not find a registered machine named 'x'"
        ));
        assert!(reports_error(
            "VBoxManage.exe: error: Could not find a registered machine named 'x'"
        ));
        assert!(!reports_error("0%...10%...20%...100%"));
        assert!(!reports_error(""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_error_on_stderr_with_zero_exit() {
        // sh stands in for VBoxManage: it prints the error and exits 0
        let driver = VBoxManageDriver::with_path("/bin/sh");
        let args = vec![
            "-c".to_string(),
            "echo \"VBoxManage: error: Machine 'x' is not running\" >&2".to_string(),
        ];
        let result = driver.vboxmanage(&args).await;
        assert!(matches!(result, Err(DriverError::Reported(ref msg)) if msg.contains("not running")));
    }

    #[tokio::test]
    async fn test_invalid_path() {
        let driver = VBoxManageDriver::with_path("/nonexistent/VBoxManage");
        let result = driver.vboxmanage(&["--version".to_string()]).await;
        assert!(matches!(result, Err(DriverError::Internal(_))));
    }

    #[tokio::test]
    #[ignore] // Requires VirtualBox to be installed
    async fn test_version() {
        let driver = VBoxManageDriver::new().unwrap();
        let version = driver.version().await.unwrap();
        assert!(!version.is_empty());
    }
}
