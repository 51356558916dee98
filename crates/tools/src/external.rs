//! Tools that reach third-party tool servers through the session broker.
//!
//! These let the model connect to a server on the user's behalf, discover
//! what it offers, and invoke remote tools. Broker failures come back to
//! the model as execution errors, never as crashes.

use async_trait::async_trait;
use chatloop_broker::{ConnectOutcome, ExternalSessionBroker};
use chatloop_core::error::{BrokerError, ToolError};
use chatloop_core::session::Credentials;
use chatloop_core::tool::TypedTool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

fn execution_failed(tool_name: &str, err: BrokerError) -> ToolError {
    debug!(tool = tool_name, error = %err, "Broker request failed");
    let reason = if err.requires_reauthorization() {
        format!("{err}. Reconnect to the server and ask the user to authorize again.")
    } else {
        err.to_string()
    };
    ToolError::ExecutionFailed {
        tool_name: tool_name.into(),
        reason,
    }
}

/// Sessions of other users are reported as missing.
async fn check_owner(
    broker: &ExternalSessionBroker,
    user_id: &str,
    session_id: &str,
) -> Result<(), BrokerError> {
    let session = broker.get_session(session_id).await?;
    if session.user_id != user_id {
        return Err(BrokerError::SessionNotFound(session_id.into()));
    }
    Ok(())
}

// ── connect_tool_server ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConnectInput {
    /// Endpoint URL of the tool server.
    pub server_url: String,
    /// API key, for servers that accept one instead of OAuth.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ConnectOutput {
    pub session_id: String,
    /// `connected`, or `requires_auth` when the user must visit `authorization_url`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
}

/// Starts a broker session for a fixed user.
pub struct ConnectToolServerTool {
    broker: Arc<ExternalSessionBroker>,
    user_id: String,
    callback_url: String,
}

impl ConnectToolServerTool {
    pub fn new(
        broker: Arc<ExternalSessionBroker>,
        user_id: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            user_id: user_id.into(),
            callback_url: callback_url.into(),
        }
    }
}

#[async_trait]
impl TypedTool for ConnectToolServerTool {
    type Input = ConnectInput;
    type Output = ConnectOutput;

    fn name(&self) -> &str {
        "connect_tool_server"
    }

    fn description(&self) -> &str {
        "Connect to an external tool server. If the server needs the user's permission, \
         returns an authorization URL the user must open before the server's tools can be used."
    }

    async fn run(&self, input: ConnectInput) -> Result<ConnectOutput, ToolError> {
        let credentials = input.api_key.map(|key| Credentials::ApiKey { key });
        let outcome = self
            .broker
            .initiate_connection(&self.user_id, &input.server_url, &self.callback_url, credentials)
            .await
            .map_err(|e| execution_failed(TypedTool::name(self), e))?;

        Ok(match outcome {
            ConnectOutcome::Connected { session_id } => ConnectOutput {
                session_id,
                status: "connected".into(),
                authorization_url: None,
            },
            ConnectOutcome::RequiresAuth {
                session_id,
                authorization_url,
            } => ConnectOutput {
                session_id,
                status: "requires_auth".into(),
                authorization_url: Some(authorization_url),
            },
        })
    }
}

// ── list_external_tools ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionInput {
    pub session_id: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ExternalToolSummary {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListOutput {
    pub tools: Vec<ExternalToolSummary>,
}

pub struct ListExternalToolsTool {
    broker: Arc<ExternalSessionBroker>,
    user_id: String,
}

impl ListExternalToolsTool {
    pub fn new(broker: Arc<ExternalSessionBroker>, user_id: impl Into<String>) -> Self {
        Self {
            broker,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl TypedTool for ListExternalToolsTool {
    type Input = SessionInput;
    type Output = ListOutput;

    fn name(&self) -> &str {
        "list_external_tools"
    }

    fn description(&self) -> &str {
        "List the tools offered by a connected external tool server."
    }

    async fn run(&self, input: SessionInput) -> Result<ListOutput, ToolError> {
        check_owner(&self.broker, &self.user_id, &input.session_id)
            .await
            .map_err(|e| execution_failed(TypedTool::name(self), e))?;
        let tools = self
            .broker
            .list_tools(&input.session_id)
            .await
            .map_err(|e| execution_failed(TypedTool::name(self), e))?;
        Ok(ListOutput {
            tools: tools
                .into_iter()
                .map(|t| ExternalToolSummary {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                })
                .collect(),
        })
    }
}

// ── call_external_tool ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CallInput {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct CallOutput {
    pub result: serde_json::Value,
}

pub struct CallExternalToolTool {
    broker: Arc<ExternalSessionBroker>,
    user_id: String,
}

impl CallExternalToolTool {
    pub fn new(broker: Arc<ExternalSessionBroker>, user_id: impl Into<String>) -> Self {
        Self {
            broker,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl TypedTool for CallExternalToolTool {
    type Input = CallInput;
    type Output = CallOutput;

    fn name(&self) -> &str {
        "call_external_tool"
    }

    fn description(&self) -> &str {
        "Invoke a tool on a connected external tool server."
    }

    async fn run(&self, input: CallInput) -> Result<CallOutput, ToolError> {
        check_owner(&self.broker, &self.user_id, &input.session_id)
            .await
            .map_err(|e| execution_failed(TypedTool::name(self), e))?;
        let result = self
            .broker
            .call_tool(&input.session_id, &input.tool_name, input.arguments)
            .await
            .map_err(|e| execution_failed(TypedTool::name(self), e))?;
        Ok(CallOutput { result })
    }
}
