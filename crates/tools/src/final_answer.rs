//! The terminal tool: the model calls it to hand back its final answer.
//!
//! The tool itself only echoes its validated input; ending the run is the
//! stop policy's job, which watches for a successful result of this tool.

use async_trait::async_trait;
use chatloop_core::error::ToolError;
use chatloop_core::tool::TypedTool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default name of the terminal tool.
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FinalAnswer {
    /// The answer to present to the user.
    pub answer: String,
    /// Optional structured payload accompanying the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub struct FinalAnswerTool {
    name: String,
}

impl FinalAnswerTool {
    pub fn new() -> Self {
        Self::named(FINAL_ANSWER_TOOL)
    }

    /// Register the terminal tool under a different name.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for FinalAnswerTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TypedTool for FinalAnswerTool {
    type Input = FinalAnswer;
    type Output = FinalAnswer;

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Submit the final answer and end the task. Call this exactly once, when no further tool use is needed."
    }

    async fn run(&self, input: FinalAnswer) -> Result<FinalAnswer, ToolError> {
        if input.answer.trim().is_empty() {
            return Err(ToolError::InvalidInput("answer must not be empty".into()));
        }
        Ok(input)
    }
}
