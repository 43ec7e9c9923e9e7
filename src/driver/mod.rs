//! VirtualBox driver
//!
//! Every VirtualBox operation a build needs goes through `VBoxManage`. The
//! `Driver` trait only requires the raw `vboxmanage` call; the higher level
//! operations are expressed on top of it so alternative drivers (and test
//! doubles) only have to provide one method.

pub mod vboxmanage;

pub use vboxmanage::VBoxManageDriver;

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Error types for driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("VBoxManage not found: {0}")]
    NotFound(String),

    #[error("VBoxManage {args} exited with code {code}: {stderr}")]
    Command {
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("VBoxManage error: {0}")]
    Reported(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Operations a build performs against VirtualBox
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run `VBoxManage` with the given arguments and return its stdout
    async fn vboxmanage(&self, args: &[String]) -> Result<String, DriverError>;

    /// Import an OVF/OVA appliance as a VM called `name`
    async fn import(&self, name: &str, path: &Path, flags: &[String]) -> Result<(), DriverError> {
        let mut args = vec![
            "import".to_string(),
            path.display().to_string(),
            "--vsys".to_string(),
            "0".to_string(),
            "--vmname".to_string(),
            name.to_string(),
        ];
        args.extend(flags.iter().cloned());
        self.vboxmanage(&args).await.map(|_| ())
    }

    /// Unregister a VM and delete its files
    async fn delete(&self, name: &str) -> Result<(), DriverError> {
        self.vboxmanage(&args(&["unregistervm", name, "--delete"]))
            .await
            .map(|_| ())
    }

    /// Whether the VM is running or on its way down
    async fn is_running(&self, name: &str) -> Result<bool, DriverError> {
        let info = self
            .vboxmanage(&args(&["showvminfo", name, "--machinereadable"]))
            .await?;

        Ok(info.lines().any(|line| {
            let line = line.trim();
            line == r#"VMState="running""# || line == r#"VMState="stopping""#
        }))
    }

    /// Power the VM off immediately
    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        self.vboxmanage(&args(&["controlvm", name, "poweroff"]))
            .await
            .map(|_| ())
    }

    /// Turn off the VirtualBox GUI notification popups
    async fn suppress_messages(&self) -> Result<(), DriverError> {
        self.vboxmanage(&args(&["setextradata", "global", "GUI/SuppressMessages", "all"]))
            .await
            .map(|_| ())
    }

    /// The installed VirtualBox version, e.g. `7.0.10`
    async fn version(&self) -> Result<String, DriverError> {
        let output = self.vboxmanage(&args(&["--version"])).await?;
        parse_version(&output)
    }

    /// Export a VM to `output`; the extension picks OVF or OVA
    async fn export(&self, name: &str, output: &Path, opts: &[String]) -> Result<(), DriverError> {
        let mut args = vec![
            "export".to_string(),
            name.to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ];
        args.extend(opts.iter().cloned());
        self.vboxmanage(&args).await.map(|_| ())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Extract the release number from `VBoxManage --version` output
///
/// Build suffixes such as `r158379` and `_RC1` are dropped.
pub fn parse_version(output: &str) -> Result<String, DriverError> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let re = VERSION
        .get_or_init(|| Regex::new(r"^([.0-9]+)(?:_(?:RC|OSEr)[0-9]+)?").expect("valid version regex"));
    let trimmed = output.trim();

    re.captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DriverError::Internal(format!("No VirtualBox version found in: {}", trimmed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedDriver {
        output: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn vboxmanage(&self, args: &[String]) -> Result<String, DriverError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self.output.clone())
        }
    }

    fn scripted(output: &str) -> ScriptedDriver {
        ScriptedDriver {
            output: output.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("7.0.10r158379\n").unwrap(), "7.0.10");
        assert_eq!(parse_version("5.0.0_RC1r101000").unwrap(), "5.0.0");
        assert_eq!(parse_version("6.1.38_Ubuntur153438").unwrap(), "6.1.38");
        assert!(parse_version("garbage").is_err());
    }

    #[tokio::test]
    async fn test_is_running() {
        let driver = scripted("name=\"vm\"\nVMState=\"running\"\n");
        assert!(driver.is_running("vm").await.unwrap());

        let driver = scripted("name=\"vm\"\nVMState=\"poweroff\"\n");
        assert!(!driver.is_running("vm").await.unwrap());
    }

    #[tokio::test]
    async fn test_import_arguments() {
        let driver = scripted("");
        driver
            .import("packer-vm", Path::new("/tmp/the-OS.ova"), &["--eula".to_string(), "accept".to_string()])
            .await
            .unwrap();

        let calls = driver.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            vec!["import", "/tmp/the-OS.ova", "--vsys", "0", "--vmname", "packer-vm", "--eula", "accept"]
        );
    }
}
