//! Test: Runner semantics - ordering, cleanup and how a run ends

use crate::helpers::*;
use ovfbuild::core::{keys, ExecutionStatus, StateBag};
use ovfbuild::execution::{PipelineRunner, RunOutcome, RunnerEvent};
use std::sync::{Arc, Mutex};

/// Every step runs in order, then every step is cleaned up in reverse
#[tokio::test]
async fn test_all_steps_cleaned_up_in_reverse() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::new("a", &log),
        RecordingStep::new("b", &log),
        RecordingStep::new("c", &log),
    ]);

    let outcome = runner.run(&mut StateBag::new()).await;

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(
        entries(&log),
        vec!["run:a", "run:b", "run:c", "cleanup:c", "cleanup:b", "cleanup:a"]
    );
}

/// An error in step k stops the run and only steps 1..=k are cleaned up
#[tokio::test]
async fn test_error_cleans_up_started_steps_only() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::new("output_dir", &log),
        RecordingStep::with("import", Behavior::Fail, &log),
        RecordingStep::new("export", &log),
    ]);
    let mut state = StateBag::new();

    let outcome = runner.run(&mut state).await;

    match outcome {
        RunOutcome::Errored(err) => {
            assert_eq!(err.step, "import");
            assert_eq!(err.message, "scripted failure");
        }
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(
        entries(&log),
        vec!["run:output_dir", "run:import", "cleanup:import", "cleanup:output_dir"]
    );
    assert_eq!(state.get::<keys::Halted>(), Some(&true));
    assert_eq!(runner.status(), ExecutionStatus::Failed);
}

/// A step that halts without an error ends the run as halted
#[tokio::test]
async fn test_halt_without_error() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::with("a", Behavior::Halt, &log),
        RecordingStep::new("b", &log),
    ]);

    let outcome = runner.run(&mut StateBag::new()).await;

    assert_eq!(outcome, RunOutcome::Halted);
    assert_eq!(entries(&log), vec!["run:a", "cleanup:a"]);
}

/// Cancelling during step k prevents step k+1 from starting
#[tokio::test]
async fn test_cancel_stops_before_next_step() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::new("a", &log),
        RecordingStep::with("b", Behavior::Cancel, &log),
        RecordingStep::new("c", &log),
    ]);
    let mut state = StateBag::new();

    let outcome = runner.run(&mut state).await;

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(entries(&log), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
    assert_eq!(state.get::<keys::Cancelled>(), Some(&true));
}

/// A cancel during the final step still counts as cancelled
#[tokio::test]
async fn test_cancel_during_last_step() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![RecordingStep::with("last", Behavior::Cancel, &log)]);

    let outcome = runner.run(&mut StateBag::new()).await;

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(runner.status(), ExecutionStatus::Cancelled);
}

/// A signal cancelled before the run means no step runs at all
#[tokio::test]
async fn test_precancelled_signal() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![RecordingStep::new("a", &log)])
        .with_cancel_signal(cancelled_signal());

    let outcome = runner.run(&mut StateBag::new()).await;

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(entries(&log).is_empty());
}

/// An error recorded before a cancel still reports the error
#[tokio::test]
async fn test_error_wins_over_cancel() {
    let log = new_log();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::with("a", Behavior::Cancel, &log),
        RecordingStep::new("b", &log),
    ]);
    let mut state = StateBag::new();
    state.put::<keys::Error>(ovfbuild::core::StepError::new("earlier", "failed"));

    let outcome = runner.run(&mut state).await;

    assert!(matches!(outcome, RunOutcome::Errored(ref e) if e.step == "earlier"));
}

/// Handlers see every step start and the final status
#[tokio::test]
async fn test_events_are_emitted() {
    let log = new_log();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut runner = PipelineRunner::new(vec![
        RecordingStep::new("a", &log),
        RecordingStep::with("b", Behavior::Halt, &log),
    ]);
    runner.add_event_handler(move |event| sink.lock().unwrap().push(event.clone()));

    runner.run(&mut StateBag::new()).await;

    let events = events.lock().unwrap();
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::StepStarted { step } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["a", "b"]);
    assert_eq!(
        events.last(),
        Some(&RunnerEvent::RunFinished {
            status: ExecutionStatus::Halted
        })
    );
}
