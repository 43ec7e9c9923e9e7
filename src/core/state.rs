//! Execution state models
//!
//! The `StateBag` is the scratchpad shared by the runner and every step of
//! one build. Keys form a closed set and each key declares the type of the
//! value stored under it, so a lookup can never come back with the wrong
//! type.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Overall build execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Build has not started
    Pending,
    /// Build is currently running
    Running,
    /// All steps completed
    Completed,
    /// A step failed
    Failed,
    /// The build was cancelled by the caller
    Cancelled,
    /// A step stopped the build without an error
    Halted,
}

impl ExecutionStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::Halted => "Halted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(ExecutionStatus::Pending),
            "Running" => Some(ExecutionStatus::Running),
            "Completed" => Some(ExecutionStatus::Completed),
            "Failed" => Some(ExecutionStatus::Failed),
            "Cancelled" => Some(ExecutionStatus::Cancelled),
            "Halted" => Some(ExecutionStatus::Halted),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag
///
/// Clones share the same flag, so one handle can be given to a signal
/// handler while the runner polls another between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The known state keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    Config,
    Driver,
    Ui,
    Error,
    Cancelled,
    Halted,
    CancelSignal,
    OutputDir,
    VmPath,
    VmName,
    GuestAdditionsIso,
    GuestAdditionsAttached,
    VrdpPort,
    SshHostPort,
    Communicator,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::Config => "config",
            StateKey::Driver => "driver",
            StateKey::Ui => "ui",
            StateKey::Error => "error",
            StateKey::Cancelled => "cancelled",
            StateKey::Halted => "halted",
            StateKey::CancelSignal => "cancel_signal",
            StateKey::OutputDir => "output_dir",
            StateKey::VmPath => "vm_path",
            StateKey::VmName => "vm_name",
            StateKey::GuestAdditionsIso => "guest_additions_iso",
            StateKey::GuestAdditionsAttached => "guest_additions_attached",
            StateKey::VrdpPort => "vrdp_port",
            StateKey::SshHostPort => "ssh_host_port",
            StateKey::Communicator => "communicator",
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed entry in the state bag
pub trait Entry: 'static {
    const KEY: StateKey;
    type Value: Send + Sync + 'static;
}

/// Typed entries, one per `StateKey`
pub mod keys {
    use super::{CancelSignal as Signal, Entry, StateKey};
    use crate::communicator::Communicator as Comm;
    use crate::core::config::BuildConfig;
    use crate::core::step::StepError;
    use crate::core::ui::Ui as UserInterface;
    use crate::driver::Driver as VmDriver;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// The prepared build configuration
    pub struct Config;
    impl Entry for Config {
        const KEY: StateKey = StateKey::Config;
        type Value = Arc<BuildConfig>;
    }

    pub struct Driver;
    impl Entry for Driver {
        const KEY: StateKey = StateKey::Driver;
        type Value = Arc<dyn VmDriver>;
    }

    pub struct Ui;
    impl Entry for Ui {
        const KEY: StateKey = StateKey::Ui;
        type Value = Arc<dyn UserInterface>;
    }

    /// Set by a step that failed; its presence makes the run an error
    pub struct Error;
    impl Entry for Error {
        const KEY: StateKey = StateKey::Error;
        type Value = StepError;
    }

    /// Set by the runner once cancellation has been observed
    pub struct Cancelled;
    impl Entry for Cancelled {
        const KEY: StateKey = StateKey::Cancelled;
        type Value = bool;
    }

    /// Set by the runner when a step halted the pipeline
    pub struct Halted;
    impl Entry for Halted {
        const KEY: StateKey = StateKey::Halted;
        type Value = bool;
    }

    /// The live cancellation flag, for steps that wait a long time
    pub struct CancelSignal;
    impl Entry for CancelSignal {
        const KEY: StateKey = StateKey::CancelSignal;
        type Value = Signal;
    }

    /// Output directory created by this build
    pub struct OutputDir;
    impl Entry for OutputDir {
        const KEY: StateKey = StateKey::OutputDir;
        type Value = PathBuf;
    }

    /// Local path of the appliance to import
    pub struct VmPath;
    impl Entry for VmPath {
        const KEY: StateKey = StateKey::VmPath;
        type Value = PathBuf;
    }

    /// Name of the imported VM
    pub struct VmName;
    impl Entry for VmName {
        const KEY: StateKey = StateKey::VmName;
        type Value = String;
    }

    pub struct GuestAdditionsIso;
    impl Entry for GuestAdditionsIso {
        const KEY: StateKey = StateKey::GuestAdditionsIso;
        type Value = PathBuf;
    }

    pub struct GuestAdditionsAttached;
    impl Entry for GuestAdditionsAttached {
        const KEY: StateKey = StateKey::GuestAdditionsAttached;
        type Value = bool;
    }

    pub struct VrdpPort;
    impl Entry for VrdpPort {
        const KEY: StateKey = StateKey::VrdpPort;
        type Value = u16;
    }

    /// Host side of the SSH port forward
    pub struct SshHostPort;
    impl Entry for SshHostPort {
        const KEY: StateKey = StateKey::SshHostPort;
        type Value = u16;
    }

    pub struct Communicator;
    impl Entry for Communicator {
        const KEY: StateKey = StateKey::Communicator;
        type Value = Arc<dyn Comm>;
    }
}

/// Shared key/value store for one build
#[derive(Default)]
pub struct StateBag {
    values: HashMap<StateKey, Box<dyn Any + Send + Sync>>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one
    pub fn put<E: Entry>(&mut self, value: E::Value) {
        self.values.insert(E::KEY, Box::new(value));
    }

    /// Get a value
    pub fn get<E: Entry>(&self) -> Option<&E::Value> {
        self.values.get(&E::KEY).and_then(|v| v.downcast_ref::<E::Value>())
    }

    /// Whether a value is present
    pub fn contains<E: Entry>(&self) -> bool {
        self.get::<E>().is_some()
    }

    /// Remove a value and return it
    pub fn remove<E: Entry>(&mut self) -> Option<E::Value> {
        self.values
            .remove(&E::KEY)
            .and_then(|v| v.downcast::<E::Value>().ok())
            .map(|v| *v)
    }

    /// Keys that currently hold a value, in no particular order
    pub fn keys(&self) -> impl Iterator<Item = StateKey> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for StateBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort();
        f.debug_struct("StateBag").field("keys", &keys).finish()
    }
}
