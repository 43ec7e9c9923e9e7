//! Sequential step runner
//!
//! Runs steps in order against one state bag, stops on cancellation or a
//! halting step, cleans up every started step in reverse order and
//! classifies how the run ended.

use crate::core::state::{keys, CancelSignal, ExecutionStatus, StateBag};
use crate::core::step::{Step, StepAction, StepError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step returned `Continue`
    Completed,
    /// A step recorded an error
    Errored(StepError),
    /// Cancellation was requested
    Cancelled,
    /// A step stopped the run without an error
    Halted,
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Completed => ExecutionStatus::Completed,
            RunOutcome::Errored(_) => ExecutionStatus::Failed,
            RunOutcome::Cancelled => ExecutionStatus::Cancelled,
            RunOutcome::Halted => ExecutionStatus::Halted,
        }
    }

    /// Classify the state left behind by a run
    ///
    /// An error wins over cancellation, cancellation over a halt.
    pub fn from_state(state: &StateBag) -> Self {
        if let Some(err) = state.get::<keys::Error>() {
            RunOutcome::Errored(err.clone())
        } else if state.get::<keys::Cancelled>() == Some(&true) {
            RunOutcome::Cancelled
        } else if state.get::<keys::Halted>() == Some(&true) {
            RunOutcome::Halted
        } else {
            RunOutcome::Completed
        }
    }
}

/// Events that can occur during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    StepStarted { step: &'static str },
    StepFinished { step: &'static str, action: StepAction },
    CleanupStarted { step: &'static str },
    RunFinished { status: ExecutionStatus },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(&RunnerEvent) + Send + Sync>;

/// Executes an ordered list of steps
pub struct PipelineRunner<S> {
    steps: Vec<S>,
    cancel: CancelSignal,
    status: ExecutionStatus,
    event_handlers: Vec<EventHandler>,
}

impl<S: Step> PipelineRunner<S> {
    pub fn new(steps: Vec<S>) -> Self {
        Self {
            steps,
            cancel: CancelSignal::new(),
            status: ExecutionStatus::Pending,
            event_handlers: Vec::new(),
        }
    }

    /// Use an existing cancel signal instead of a fresh one
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = signal;
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    fn emit_event(&self, event: RunnerEvent) {
        for handler in &self.event_handlers {
            handler(&event);
        }
    }

    pub fn steps(&self) -> &[S] {
        &self.steps
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// A handle that cancels this runner from anywhere
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Request cancellation; takes effect before the next step starts
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run every step and classify the result
    pub async fn run(&mut self, state: &mut StateBag) -> RunOutcome {
        self.status = ExecutionStatus::Running;
        state.put::<keys::CancelSignal>(self.cancel.clone());

        let mut started = 0;
        for step in &self.steps {
            if self.cancel.is_cancelled() {
                info!("Cancelled before step {}", step.name());
                state.put::<keys::Cancelled>(true);
                break;
            }

            started += 1;
            info!("Running step: {}", step.name());
            self.emit_event(RunnerEvent::StepStarted { step: step.name() });

            let action = step.run(state).await;
            debug!("Step {} returned {:?}", step.name(), action);
            self.emit_event(RunnerEvent::StepFinished {
                step: step.name(),
                action,
            });

            if action == StepAction::Halt {
                state.put::<keys::Halted>(true);
                break;
            }
        }

        // A cancel that arrived during the last step to run
        if self.cancel.is_cancelled() {
            state.put::<keys::Cancelled>(true);
        }

        for step in self.steps[..started].iter().rev() {
            debug!("Cleaning up step: {}", step.name());
            self.emit_event(RunnerEvent::CleanupStarted { step: step.name() });
            step.cleanup(state).await;
        }

        let outcome = RunOutcome::from_state(state);
        match &outcome {
            RunOutcome::Errored(err) => warn!("Build errored in step {}: {}", err.step, err.message),
            other => info!("Build finished: {}", other.status().as_str()),
        }

        self.status = outcome.status();
        self.emit_event(RunnerEvent::RunFinished { status: self.status });
        outcome
    }
}
