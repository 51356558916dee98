//! Tool trait: the abstraction over agent capabilities.
//!
//! Every tool declares an input schema, an output schema and an executor.
//! The [`ToolRegistry`] validates input before the executor runs and output
//! after it returns, and converts every failure into a tagged
//! [`ToolResult`] so nothing escapes the registry boundary.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::message::Message;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID within a step (matches the model's tool_call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// How a tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Executor ran and its output satisfied the output schema.
    Success,
    /// The caller (the model) sent input that violates the input schema,
    /// or named a tool that does not exist.
    ValidationError,
    /// The executor failed or timed out.
    ExecutionError,
    /// The executor broke its own output contract.
    InternalError,
    /// The run was cancelled before the call finished.
    Cancelled,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// The tool that was called
    pub tool_name: String,

    pub status: ToolStatus,

    /// Structured output (`null` unless `status` is `Success`)
    #[serde(default)]
    pub output: serde_json::Value,

    /// Human-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock time spent in the call
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: serde_json::Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status: ToolStatus::Success,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(call: &ToolCall, status: ToolStatus, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    /// Map a [`ToolError`] onto the status taxonomy.
    pub fn from_error(call: &ToolCall, err: &ToolError) -> Self {
        let status = match err {
            ToolError::NotFound(_) | ToolError::InvalidInput(_) => ToolStatus::ValidationError,
            ToolError::ExecutionFailed { .. } | ToolError::Timeout { .. } => {
                ToolStatus::ExecutionError
            }
            ToolError::InvalidOutput { .. }
            | ToolError::Schema { .. }
            | ToolError::DuplicateName(_) => ToolStatus::InternalError,
        };
        Self::failure(call, status, err.to_string())
    }

    pub fn cancelled(call: &ToolCall) -> Self {
        Self::failure(call, ToolStatus::Cancelled, "cancelled before completion")
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Render this result as the tool message the model will see.
    pub fn to_message(&self) -> Message {
        if self.is_success() {
            let content = match &self.output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Message::tool_result(&self.call_id, content)
        } else {
            let status = serde_json::to_value(self.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            Message::tool_error(
                &self.call_id,
                format!("Error ({status}): {}", self.error.as_deref().unwrap_or("unknown")),
            )
        }
    }
}

/// The core Tool trait.
///
/// Implement this directly for tools whose schemas are only known at
/// runtime (e.g. tools discovered on an external server). Tools with fixed
/// shapes should implement [`TypedTool`] instead.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "final_answer").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema for the input payload.
    fn input_schema(&self) -> serde_json::Value;

    /// JSON Schema for the value `execute` returns.
    fn output_schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Execute the tool with already-validated input.
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema(),
        }
    }
}

/// A tool whose input and output shapes are Rust types.
///
/// Schemas are derived from the types with `schemars`, so they can never
/// drift from what the executor actually reads and writes.
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Input: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, input: Self::Input) -> Result<Self::Output, ToolError>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn name(&self) -> &str {
        TypedTool::name(self)
    }

    fn description(&self) -> &str {
        TypedTool::description(self)
    }

    fn input_schema(&self) -> serde_json::Value {
        schema_of::<T::Input>()
    }

    fn output_schema(&self) -> serde_json::Value {
        schema_of::<T::Output>()
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let typed: T::Input =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        let output = self.run(typed).await?;
        serde_json::to_value(output).map_err(|e| ToolError::InvalidOutput {
            tool_name: TypedTool::name(self).to_string(),
            reason: e.to_string(),
        })
    }
}

/// Generate a JSON Schema value for a type, without the `$schema` marker.
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    let mut value = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
    }
    value
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    input: jsonschema::Validator,
    output: jsonschema::Validator,
}

fn compile(tool_name: &str, schema: &serde_json::Value) -> Result<jsonschema::Validator, ToolError> {
    jsonschema::validator_for(schema).map_err(|e| ToolError::Schema {
        tool_name: tool_name.to_string(),
        reason: e.to_string(),
    })
}

fn violations(validator: &jsonschema::Validator, value: &serde_json::Value) -> Option<String> {
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

/// A registry of available tools.
///
/// The step loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Validate and execute tools when the LLM requests them
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a tool. Names must be unique and both schemas must compile.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        self.register_shared(Arc::from(tool))
    }

    /// Register a tool that is also held elsewhere.
    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }

        let input = compile(&name, &tool.input_schema())?;
        let output = compile(&name, &tool.output_schema())?;

        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool { tool, input, output });
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.index.get(name).map(|&i| self.tools[i].tool.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Get all tool definitions in registration order (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.tool.to_definition()).collect()
    }

    /// Execute a tool call.
    ///
    /// Never fails: unknown tools and input violations come back as
    /// [`ToolStatus::ValidationError`] without running the executor, executor
    /// failures as [`ToolStatus::ExecutionError`], and output violations as
    /// [`ToolStatus::InternalError`].
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let result = self.execute_inner(call).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => ToolResult::success(call, output).with_duration(elapsed),
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                ToolResult::from_error(call, &e).with_duration(elapsed)
            }
        }
    }

    async fn execute_inner(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        let entry = self
            .index
            .get(&call.name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        if let Some(reason) = violations(&entry.input, &call.arguments) {
            return Err(ToolError::InvalidInput(reason));
        }

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        let output = entry.tool.execute(call.arguments.clone()).await?;

        if let Some(reason) = violations(&entry.output, &output) {
            return Err(ToolError::InvalidOutput {
                tool_name: call.name.clone(),
                reason,
            });
        }
        Ok(output)
    }

    /// List all registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
