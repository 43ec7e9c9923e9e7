//! Step domain model

use crate::core::state::StateBag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the runner should do after a step returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Go on with the next step
    Continue,
    /// Stop the pipeline; cleanup still runs
    Halt,
}

/// A failure recorded by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{step}: {message}")]
pub struct StepError {
    /// Name of the step that failed
    pub step: String,

    /// Human readable description, including the cause chain
    pub message: String,
}

impl StepError {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// A unit of work in the build pipeline
///
/// `run` is called at most once. If it was called, `cleanup` is called
/// exactly once after the pipeline stops, whatever the outcome, in reverse
/// order of the steps that ran. Cleanup inspects the state bag to find out
/// how the build ended and must tolerate partial work of its own step.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name used in logs and error reports
    fn name(&self) -> &'static str {
        "step"
    }

    async fn run(&self, state: &mut StateBag) -> StepAction;

    async fn cleanup(&self, state: &mut StateBag);
}
