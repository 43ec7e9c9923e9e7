//! Core domain models for a build
//!
//! This module defines the build configuration, the step contract, the
//! shared state bag and the artifact a successful build produces.

pub mod artifact;
pub mod config;
pub mod state;
pub mod step;
pub mod template;
pub mod ui;

pub use artifact::{Artifact, ExportFormat};
pub use config::{BuildConfig, CommunicatorType, ConfigError, GuestAdditionsMode, ValidationErrors};
pub use state::{keys, CancelSignal, ExecutionStatus, StateBag, StateKey};
pub use step::{Step, StepAction, StepError};
pub use ui::{MemoryUi, NullUi, Ui};
