//! Per-step records and run outcomes of the step loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Conversation;
use crate::provider::Usage;
use crate::tool::{ToolCall, ToolResult};

/// Per-step changes a step configurator may ask for.
///
/// All fields are optional; `None` means "use the loop's default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    /// Swap the model for this step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Replace the system instruction for this step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Show the model only the most recent N messages. The full history
    /// is still kept in the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<usize>,
}

impl StepOverride {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.system.is_none() && self.keep_last.is_none()
    }
}

/// Everything that happened in one step. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// 0-based step number within the run
    pub step: u32,

    /// Model that answered this step
    pub model: String,

    /// Assistant text that accompanied the tool calls (may be empty)
    pub text: String,

    pub tool_calls: Vec<ToolCall>,

    /// One result per call, in call order
    pub tool_results: Vec<ToolResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Override applied to this step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_override: Option<StepOverride>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepRecord {
    /// The first successful result of `tool_name` in call order.
    pub fn successful_result_of(&self, tool_name: &str) -> Option<&ToolResult> {
        self.tool_results
            .iter()
            .find(|r| r.tool_name == tool_name && r.is_success())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunError {
    /// The model capability failed or timed out.
    ModelFailure(String),
    /// The run was started with an empty conversation and no instruction.
    InvalidInput(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelFailure(detail) => write!(f, "model failure: {detail}"),
            Self::InvalidInput(detail) => write!(f, "invalid input: {detail}"),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model answered with text and no tool calls.
    Completed,
    /// The designated terminal tool produced a result.
    TerminalTool { tool_name: String },
    /// The step budget ran out.
    BudgetExhausted,
    /// The caller cancelled the run.
    Cancelled,
    Error { error: RunError },
}

impl TerminationReason {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TerminalTool { tool_name } => write!(f, "terminal tool ({tool_name})"),
            Self::BudgetExhausted => write!(f, "budget exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error { error } => write!(f, "error: {error}"),
        }
    }
}

/// What a run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Full history, including everything the run appended
    pub conversation: Conversation,

    pub reason: TerminationReason,

    pub steps: Vec<StepRecord>,

    /// Canonical terminal-tool output, when the run ended that way
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<serde_json::Value>,
}

impl RunOutcome {
    /// Summed usage over all steps.
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.steps.iter().filter_map(|s| s.usage.as_ref()) {
            total.add(usage);
        }
        total
    }

    /// Text of the last assistant message, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.conversation.last_assistant().map(|m| m.content.as_str())
    }
}
