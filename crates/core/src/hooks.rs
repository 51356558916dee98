//! Step lifecycle observers.
//!
//! The step loop calls a [`StepHookSink`] synchronously, in step order, at
//! three points: before each model call, after each step's tool results are
//! collected, and once when the run ends. Sinks observe; they cannot steer
//! the loop.

use crate::step::{RunOutcome, StepRecord};

/// Observer of step-loop lifecycle events (telemetry, persistence).
pub trait StepHookSink: Send + Sync {
    /// Called before the model is invoked for `step`.
    fn on_step_start(&self, _step: u32) {}

    /// Called after every tool result of the step has been collected and
    /// appended to the conversation.
    fn on_step_finish(&self, _record: &StepRecord) {}

    /// Called exactly once, right before `run` returns.
    fn on_run_finish(&self, _outcome: &RunOutcome) {}
}

/// A sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl StepHookSink for NoopHooks {}
