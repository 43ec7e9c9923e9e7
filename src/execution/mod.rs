//! Build execution

pub mod builder;
pub mod runner;

pub use builder::{BuildError, Builder};
pub use runner::{EventHandler, PipelineRunner, RunOutcome, RunnerEvent};
