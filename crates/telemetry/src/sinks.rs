//! Logging and fan-out sinks.

use chatloop_core::hooks::StepHookSink;
use chatloop_core::step::{RunOutcome, StepRecord};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Emits one structured `tracing` event per lifecycle point.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl StepHookSink for TracingHooks {
    fn on_step_start(&self, step: u32) {
        debug!(step, "Step started");
    }

    fn on_step_finish(&self, record: &StepRecord) {
        let failed = record.tool_results.iter().filter(|r| !r.is_success()).count();
        let tokens = record.usage.map(|u| u.total_tokens).unwrap_or(0);
        let elapsed_ms = (record.finished_at - record.started_at).num_milliseconds();
        info!(
            step = record.step,
            model = %record.model,
            tool_calls = record.tool_calls.len(),
            failed,
            tokens,
            elapsed_ms,
            "Step completed"
        );
        for result in record.tool_results.iter().filter(|r| !r.is_success()) {
            warn!(
                step = record.step,
                tool = %result.tool_name,
                call_id = %result.call_id,
                status = ?result.status,
                error = result.error.as_deref().unwrap_or(""),
                "Tool call did not succeed"
            );
        }
    }

    fn on_run_finish(&self, outcome: &RunOutcome) {
        let usage = outcome.total_usage();
        info!(
            conversation_id = %outcome.conversation.id,
            reason = %outcome.reason,
            steps = outcome.steps.len(),
            total_tokens = usage.total_tokens,
            "Run ended"
        );
    }
}

/// Forwards every event to each inner sink, in registration order.
#[derive(Default, Clone)]
pub struct FanoutHooks {
    sinks: Vec<Arc<dyn StepHookSink>>,
}

impl FanoutHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StepHookSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StepHookSink for FanoutHooks {
    fn on_step_start(&self, step: u32) {
        for sink in &self.sinks {
            sink.on_step_start(step);
        }
    }

    fn on_step_finish(&self, record: &StepRecord) {
        for sink in &self.sinks {
            sink.on_step_finish(record);
        }
    }

    fn on_run_finish(&self, outcome: &RunOutcome) {
        for sink in &self.sinks {
            sink.on_run_finish(outcome);
        }
    }
}
