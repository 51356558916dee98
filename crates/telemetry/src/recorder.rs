//! In-memory recorder: keeps every step record and running usage totals.

use crate::model::{RunSummary, UsageSnapshot, tool_counts};
use chatloop_core::hooks::StepHookSink;
use chatloop_core::step::{RunOutcome, StepRecord};
use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_MAX_RUNS: usize = 1_000;
const DEFAULT_MAX_STEPS: usize = 10_000;

/// A [`StepHookSink`] that keeps what it observes.
///
/// Thread-safe via `RwLock`. Step records and run summaries are both capped,
/// oldest dropped first; the usage totals cover everything observed.
pub struct RecordingHooks {
    steps: RwLock<VecDeque<StepRecord>>,
    runs: RwLock<VecDeque<RunSummary>>,
    totals: RwLock<UsageSnapshot>,
    max_steps: usize,
    max_runs: usize,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::with_max_runs(DEFAULT_MAX_RUNS)
    }

    pub fn with_max_runs(max_runs: usize) -> Self {
        Self {
            steps: RwLock::new(VecDeque::new()),
            runs: RwLock::new(VecDeque::new()),
            totals: RwLock::new(UsageSnapshot::default()),
            max_steps: DEFAULT_MAX_STEPS,
            max_runs: max_runs.max(1),
        }
    }

    /// Bound the number of retained step records (minimum 1).
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Retained step records, in the order they finished.
    pub fn steps(&self) -> Vec<StepRecord> {
        read(&self.steps).iter().cloned().collect()
    }

    /// Summaries of finished runs, oldest first.
    pub fn runs(&self) -> Vec<RunSummary> {
        read(&self.runs).iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<RunSummary> {
        read(&self.runs).back().cloned()
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        read(&self.totals).clone()
    }

    pub fn clear(&self) {
        write(&self.steps).clear();
        write(&self.runs).clear();
        *write(&self.totals) = UsageSnapshot::default();
    }
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHookSink for RecordingHooks {
    fn on_step_finish(&self, record: &StepRecord) {
        {
            let mut totals = write(&self.totals);
            totals.steps += 1;
            if let Some(usage) = &record.usage {
                totals.prompt_tokens += usage.prompt_tokens as u64;
                totals.completion_tokens += usage.completion_tokens as u64;
                totals.total_tokens += usage.total_tokens as u64;
            }
            let (calls, failed) = tool_counts(record);
            totals.tool_calls += calls;
            totals.failed_tool_calls += failed;
            *totals.model_calls.entry(record.model.clone()).or_default() += 1;
        }
        let mut steps = write(&self.steps);
        if steps.len() >= self.max_steps {
            steps.pop_front();
        }
        steps.push_back(record.clone());
    }

    fn on_run_finish(&self, outcome: &RunOutcome) {
        {
            let mut totals = write(&self.totals);
            totals.runs += 1;
            *totals.outcomes.entry(outcome.reason.to_string()).or_default() += 1;
        }
        let mut runs = write(&self.runs);
        if runs.len() >= self.max_runs {
            runs.pop_front();
        }
        runs.push_back(RunSummary::from_outcome(outcome));
    }
}

// A panicking reader cannot leave these collections half-updated in a way
// that matters, so poisoned locks are recovered.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
