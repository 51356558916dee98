//! Data model for recorded runs and usage snapshots.

use chatloop_core::step::{RunOutcome, StepRecord, TerminationReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub conversation_id: String,
    pub reason: TerminationReason,
    pub steps: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_calls: u64,
    pub failed_tool_calls: u64,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let usage = outcome.total_usage();
        let (tool_calls, failed_tool_calls) = outcome.steps.iter().fold((0, 0), |(n, failed), s| {
            let (calls, fails) = tool_counts(s);
            (n + calls, failed + fails)
        });
        Self {
            conversation_id: outcome.conversation.id.to_string(),
            reason: outcome.reason.clone(),
            steps: outcome.steps.len() as u32,
            prompt_tokens: usage.prompt_tokens as u64,
            completion_tokens: usage.completion_tokens as u64,
            tool_calls,
            failed_tool_calls,
            finished_at: Utc::now(),
        }
    }
}

/// `(calls, failed calls)` for one step.
pub(crate) fn tool_counts(step: &StepRecord) -> (u64, u64) {
    let failed = step.tool_results.iter().filter(|r| !r.is_success()).count();
    (step.tool_results.len() as u64, failed as u64)
}

/// Point-in-time view of everything a recorder has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub runs: u64,
    pub steps: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub tool_calls: u64,
    pub failed_tool_calls: u64,
    /// Model calls per model name.
    pub model_calls: BTreeMap<String, u64>,
    /// Finished runs per termination reason (`completed`, `budget exhausted`, ...).
    pub outcomes: BTreeMap<String, u64>,
}

impl std::fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} step(s), {} tokens ({} prompt / {} completion), {} tool call(s), {} failed",
            self.steps,
            self.total_tokens,
            self.prompt_tokens,
            self.completion_tokens,
            self.tool_calls,
            self.failed_tool_calls
        )
    }
}
