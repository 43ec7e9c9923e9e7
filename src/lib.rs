//! ovfbuild - builds VirtualBox images from OVF/OVA appliances

pub mod checksum;
pub mod cli;
pub mod communicator;
pub mod core;
pub mod download;
pub mod driver;
pub mod execution;
pub mod persistence;
pub mod steps;

// Re-export commonly used types
pub use core::{Artifact, BuildConfig, ConfigError, ExecutionStatus, StateBag, Step, StepAction, Ui};
pub use driver::{Driver, DriverError, VBoxManageDriver};
pub use execution::{BuildError, Builder, PipelineRunner, RunOutcome, RunnerEvent};
pub use persistence::{BuildRecord, InMemoryPersistence, PersistenceBackend};
