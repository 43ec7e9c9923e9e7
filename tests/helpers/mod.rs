//! Test utility functions for ovfbuild

#![allow(dead_code)]

use async_trait::async_trait;
use ovfbuild::core::{StateBag, Step, StepAction, StepError};
use ovfbuild::core::keys;
use ovfbuild::driver::{Driver, DriverError};
use ovfbuild::core::CancelSignal;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared, ordered log of what the recording steps did
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// What a recording step does when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Continue,
    /// Record an error and halt
    Fail,
    /// Halt without an error
    Halt,
    /// Request cancellation, then continue
    Cancel,
}

/// Step that logs `run:<name>` and `cleanup:<name>`
pub struct RecordingStep {
    pub name: &'static str,
    pub behavior: Behavior,
    pub log: Log,
}

impl RecordingStep {
    pub fn new(name: &'static str, log: &Log) -> Self {
        Self::with(name, Behavior::Continue, log)
    }

    pub fn with(name: &'static str, behavior: Behavior, log: &Log) -> Self {
        Self {
            name,
            behavior,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, state: &mut StateBag) -> StepAction {
        self.log.lock().unwrap().push(format!("run:{}", self.name));
        match self.behavior {
            Behavior::Continue => StepAction::Continue,
            Behavior::Fail => {
                state.put::<keys::Error>(StepError::new(self.name, "scripted failure"));
                StepAction::Halt
            }
            Behavior::Halt => StepAction::Halt,
            Behavior::Cancel => {
                if let Some(signal) = state.get::<keys::CancelSignal>() {
                    signal.cancel();
                }
                StepAction::Continue
            }
        }
    }

    async fn cleanup(&self, _state: &mut StateBag) {
        self.log.lock().unwrap().push(format!("cleanup:{}", self.name));
    }
}

/// Driver that pretends to be VirtualBox
///
/// Records every call, tracks whether the VM runs and writes a small file
/// for `export` so the build produces an artifact.
#[derive(Default)]
pub struct MockDriver {
    calls: Mutex<Vec<Vec<String>>>,
    running: Mutex<bool>,

    /// First argument of a command that should fail
    pub fail_on: Option<&'static str>,
}

impl MockDriver {
    pub fn failing_on(command: &'static str) -> Self {
        Self {
            fail_on: Some(command),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// The first argument of every call, in order
    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().filter_map(|c| c.into_iter().next()).collect()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn vboxmanage(&self, args: &[String]) -> Result<String, DriverError> {
        self.calls.lock().unwrap().push(args.to_vec());

        let command = args.first().map(String::as_str).unwrap_or_default();
        if self.fail_on == Some(command) {
            return Err(DriverError::Command {
                args: args.join(" "),
                code: 1,
                stderr: "scripted failure".to_string(),
            });
        }

        match command {
            "--version" => Ok("7.0.10r158379\n".to_string()),
            "showvminfo" => {
                let state = if *self.running.lock().unwrap() { "running" } else { "poweroff" };
                Ok(format!("name=\"vm\"\nVMState=\"{}\"\n", state))
            }
            "startvm" => {
                *self.running.lock().unwrap() = true;
                Ok(String::new())
            }
            "controlvm" if args.get(2).map(String::as_str) == Some("poweroff") => {
                *self.running.lock().unwrap() = false;
                Ok(String::new())
            }
            "export" => {
                let output = Path::new(&args[3]);
                std::fs::write(output, b"<Envelope/>")
                    .map_err(|e| DriverError::Internal(e.to_string()))?;
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

/// Cancel signal already triggered
pub fn cancelled_signal() -> CancelSignal {
    let signal = CancelSignal::new();
    signal.cancel();
    signal
}
