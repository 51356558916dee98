//! Stop policy: pure predicates evaluated after each step.
//!
//! Conditions are checked in declaration order and the first match wins.
//! Two rules are always in force behind the configured conditions: a model
//! response without tool calls completes the run, and the step budget ends
//! it no matter what the model does.

use chatloop_core::step::{StepRecord, TerminationReason};
use std::sync::Arc;

/// Snapshot of the run handed to each stop condition.
pub struct StopContext<'a> {
    /// Every step taken so far, including the latest.
    pub steps: &'a [StepRecord],
    pub max_steps: u32,
}

impl<'a> StopContext<'a> {
    pub fn latest(&self) -> Option<&'a StepRecord> {
        self.steps.last()
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// A composable stop predicate.
pub trait StopCondition: Send + Sync {
    /// Stable identifier, used in logs.
    fn id(&self) -> &str;

    fn check(&self, ctx: &StopContext<'_>) -> Option<TerminationReason>;
}

/// Fires when the latest step produced a successful result from the
/// designated terminal tool.
pub struct TerminalToolFired {
    tool_name: String,
}

impl TerminalToolFired {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
        }
    }
}

impl StopCondition for TerminalToolFired {
    fn id(&self) -> &str {
        "terminal_tool"
    }

    fn check(&self, ctx: &StopContext<'_>) -> Option<TerminationReason> {
        ctx.latest()?
            .successful_result_of(&self.tool_name)
            .map(|_| TerminationReason::TerminalTool {
                tool_name: self.tool_name.clone(),
            })
    }
}

/// Fires once the step count reaches the budget.
pub struct StepBudgetExhausted;

impl StopCondition for StepBudgetExhausted {
    fn id(&self) -> &str {
        "step_budget"
    }

    fn check(&self, ctx: &StopContext<'_>) -> Option<TerminationReason> {
        (ctx.steps_taken() >= ctx.max_steps).then_some(TerminationReason::BudgetExhausted)
    }
}

/// Fires when the model answered in plain text without calling any tool.
pub struct TextResponse;

impl StopCondition for TextResponse {
    fn id(&self) -> &str {
        "text_response"
    }

    fn check(&self, ctx: &StopContext<'_>) -> Option<TerminationReason> {
        ctx.latest()
            .filter(|step| step.tool_calls.is_empty())
            .map(|_| TerminationReason::Completed)
    }
}

#[derive(Clone)]
pub struct StopPolicy {
    max_steps: u32,
    conditions: Vec<Arc<dyn StopCondition>>,
    complete_on_text: bool,
}

impl StopPolicy {
    /// A policy with only the step budget (minimum 1) and text completion.
    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps: max_steps.max(1),
            conditions: Vec::new(),
            complete_on_text: true,
        }
    }

    /// Stop when `tool_name` succeeds.
    pub fn with_terminal_tool(self, tool_name: impl Into<String>) -> Self {
        self.with_condition(Arc::new(TerminalToolFired::new(tool_name)))
    }

    pub fn with_condition(mut self, condition: Arc<dyn StopCondition>) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Keep going after a text-only response; only configured conditions
    /// and the budget end the run.
    pub fn without_text_completion(mut self) -> Self {
        self.complete_on_text = false;
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn evaluate(&self, steps: &[StepRecord]) -> Option<TerminationReason> {
        let ctx = StopContext {
            steps,
            max_steps: self.max_steps,
        };
        let text = self.complete_on_text.then_some(&TextResponse as &dyn StopCondition);
        self.conditions
            .iter()
            .map(|c| c.as_ref())
            .chain(text)
            .chain(std::iter::once(&StepBudgetExhausted as &dyn StopCondition))
            .find_map(|condition| {
                let reason = condition.check(&ctx)?;
                tracing::debug!(condition = condition.id(), %reason, "Stop condition fired");
                Some(reason)
            })
    }
}

impl std::fmt::Debug for StopPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.conditions.iter().map(|c| c.id()).collect();
        f.debug_struct("StopPolicy")
            .field("max_steps", &self.max_steps)
            .field("conditions", &ids)
            .field("complete_on_text", &self.complete_on_text)
            .finish()
    }
}
