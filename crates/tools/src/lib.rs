//! Built-in tool implementations for Chatloop.
//!
//! - [`final_answer`]: the terminal tool the stop policy watches for
//! - [`external`]: connect to third-party tool servers and call their tools
//!   through the [`ExternalSessionBroker`]

pub mod external;
pub mod final_answer;

use chatloop_broker::ExternalSessionBroker;
use chatloop_core::error::ToolError;
use chatloop_core::tool::ToolRegistry;
use std::sync::Arc;

pub use external::{CallExternalToolTool, ConnectToolServerTool, ListExternalToolsTool};
pub use final_answer::{FINAL_ANSWER_TOOL, FinalAnswer, FinalAnswerTool};

/// A registry holding only the terminal tool, registered as `terminal_tool`.
pub fn default_registry(terminal_tool: &str) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(FinalAnswerTool::named(terminal_tool)))?;
    Ok(registry)
}

/// Add the broker-backed tools, acting on behalf of `user_id`.
pub fn register_external_tools(
    registry: &mut ToolRegistry,
    broker: Arc<ExternalSessionBroker>,
    user_id: &str,
    callback_url: &str,
) -> Result<(), ToolError> {
    registry.register(Box::new(ConnectToolServerTool::new(
        broker.clone(),
        user_id,
        callback_url,
    )))?;
    registry.register(Box::new(ListExternalToolsTool::new(broker.clone(), user_id)))?;
    registry.register(Box::new(CallExternalToolTool::new(broker, user_id)))?;
    Ok(())
}
