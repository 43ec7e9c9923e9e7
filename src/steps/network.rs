//! Remote display and port forwarding

use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::steps::guest_additions::dvd_attach_args;
use crate::steps::{require, ui};
use anyhow::{anyhow, Context, Result};
use std::net::TcpListener;
use tracing::{debug, info};

/// Name of the NAT rule that forwards the communicator port
const FORWARD_RULE: &str = "packercomm";

/// First port in `min..=max` that can be bound on `address`
pub fn find_free_port(address: &str, min: u16, max: u16) -> Option<u16> {
    (min..=max).find(|&port| TcpListener::bind((address, port)).is_ok())
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Enables VRDP on a free port
#[derive(Debug, Clone)]
pub struct ConfigureVrdp {
    pub bind_address: String,
    pub port_min: u16,
    pub port_max: u16,
}

impl ConfigureVrdp {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;

        debug!("Looking for available port between {} and {}", self.port_min, self.port_max);
        let port = find_free_port(&self.bind_address, self.port_min, self.port_max).ok_or_else(|| {
            anyhow!(
                "Unable to find available VRDP port between {} and {}",
                self.port_min,
                self.port_max
            )
        })?;

        let port_arg = port.to_string();
        let args = strings(&[
            "modifyvm",
            &name,
            "--vrde",
            "on",
            "--vrdeaddress",
            &self.bind_address,
            "--vrdeport",
            &port_arg,
        ]);
        driver.vboxmanage(&args).await.context("Error enabling VRDP")?;

        ui(state).message(&format!("VRDP available at {}:{}", self.bind_address, port));
        state.put::<keys::VrdpPort>(port);
        Ok(StepAction::Continue)
    }
}

/// Forwards a host port to the guest's SSH port
#[derive(Debug, Clone)]
pub struct ForwardSsh {
    /// False when the build has no communicator
    pub enabled: bool,
    pub guest_port: u16,
    pub host_port_min: u16,
    pub host_port_max: u16,
    pub skip_nat: bool,
}

impl ForwardSsh {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        if !self.enabled {
            return Ok(StepAction::Continue);
        }
        if self.skip_nat {
            state.put::<keys::SshHostPort>(self.guest_port);
            return Ok(StepAction::Continue);
        }

        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;

        ui(state).say("Creating forwarded port mapping for communicator (SSH)...");
        let host_port = find_free_port("127.0.0.1", self.host_port_min, self.host_port_max)
            .ok_or_else(|| {
                anyhow!(
                    "Unable to find available SSH host port between {} and {}",
                    self.host_port_min,
                    self.host_port_max
                )
            })?;

        let rule = format!("{},tcp,127.0.0.1,{},,{}", FORWARD_RULE, host_port, self.guest_port);
        driver
            .vboxmanage(&strings(&["modifyvm", &name, "--natpf1", &rule]))
            .await
            .context("Error creating port forwarding rule")?;

        info!("Forwarding 127.0.0.1:{} to guest port {}", host_port, self.guest_port);
        state.put::<keys::SshHostPort>(host_port);
        Ok(StepAction::Continue)
    }
}

/// Removes devices and rules the build added so they are not exported
#[derive(Debug, Clone)]
pub struct RemoveDevices {
    pub remove_ssh_forward: bool,
}

impl RemoveDevices {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let name = require::<keys::VmName>(state)?;
        let driver = require::<keys::Driver>(state)?;
        let ui = ui(state);

        if self.remove_ssh_forward && state.contains::<keys::SshHostPort>() {
            ui.message("Deleting forwarded port mapping for the communicator (SSH)");
            driver
                .vboxmanage(&strings(&["modifyvm", &name, "--natpf1", "delete", FORWARD_RULE]))
                .await
                .context("Error deleting port forwarding rule")?;
        }

        if state.get::<keys::GuestAdditionsAttached>() == Some(&true) {
            ui.message("Detaching guest additions ISO");
            driver
                .vboxmanage(&dvd_attach_args(&name, "none"))
                .await
                .context("Error detaching guest additions ISO")?;
            state.remove::<keys::GuestAdditionsAttached>();
        }

        if state.contains::<keys::VrdpPort>() {
            driver
                .vboxmanage(&strings(&["modifyvm", &name, "--vrde", "off"]))
                .await
                .context("Error disabling VRDP")?;
        }

        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{state_with, FakeDriver};
    use std::sync::Arc;

    #[test]
    fn test_find_free_port_skips_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        assert_eq!(find_free_port("127.0.0.1", taken, taken), None);
    }

    #[tokio::test]
    async fn test_forward_ssh_adds_rule() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver.clone());

        let step = ForwardSsh {
            enabled: true,
            guest_port: 22,
            host_port_min: 20000,
            host_port_max: 30000,
            skip_nat: false,
        };
        step.run(&mut state).await.unwrap();

        let port = *state.get::<keys::SshHostPort>().unwrap();
        assert!((20000..=30000).contains(&port));
        assert_eq!(
            driver.calls()[0],
            vec![
                "modifyvm".to_string(),
                "packer-vm".to_string(),
                "--natpf1".to_string(),
                format!("packercomm,tcp,127.0.0.1,{},,22", port),
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_ssh_skip_nat() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver.clone());

        let step = ForwardSsh {
            enabled: true,
            guest_port: 2200,
            host_port_min: 2222,
            host_port_max: 4444,
            skip_nat: true,
        };
        step.run(&mut state).await.unwrap();
        assert_eq!(state.get::<keys::SshHostPort>(), Some(&2200));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_configure_vrdp() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver.clone());

        let step = ConfigureVrdp {
            bind_address: "127.0.0.1".to_string(),
            port_min: 35900,
            port_max: 36000,
        };
        step.run(&mut state).await.unwrap();
        assert!(state.contains::<keys::VrdpPort>());
        assert_eq!(driver.calls()[0][2], "--vrde");
    }

    #[tokio::test]
    async fn test_remove_devices() {
        let driver = Arc::new(FakeDriver::default());
        let (mut state, _ui) = state_with(driver.clone());
        state.put::<keys::SshHostPort>(2222);
        state.put::<keys::GuestAdditionsAttached>(true);

        RemoveDevices { remove_ssh_forward: true }
            .run(&mut state)
            .await
            .unwrap();

        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["modifyvm", "packer-vm", "--natpf1", "delete", "packercomm"]);
        assert_eq!(calls[1].last().unwrap(), "none");
        assert!(!state.contains::<keys::GuestAdditionsAttached>());
    }
}
