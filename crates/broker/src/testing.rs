//! Scripted in-process connector for tests.
//!
//! Behaves like a tool server without any network: it can demand OAuth,
//! accept a single authorization code or API key, and echo tool calls.
//! Counters record every simulated I/O so tests can assert that none
//! happened.

use crate::transport::{ConnectRequest, Handshake, ToolDescriptor, ToolServerConnector, ToolServerTransport};
use async_trait::async_trait;
use chatloop_core::error::BrokerError;
use chatloop_core::session::{Credentials, PendingAuthorization};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Tool name that always reports a remote failure.
pub const FAILING_TOOL: &str = "always_fails";

/// Tool name whose call does not answer for an hour.
pub const SLOW_TOOL: &str = "slow_echo";

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub exchanges: AtomicUsize,
    pub opens: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    /// Total simulated network operations.
    pub fn io(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
            + self.exchanges.load(Ordering::SeqCst)
            + self.opens.load(Ordering::SeqCst)
            + self.tool_calls.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnector {
    requires_auth: bool,
    accepted_code: String,
    accepted_key: String,
    tools: Vec<ToolDescriptor>,
    unreachable: AtomicBool,
    pub counters: Arc<Counters>,
}

impl ScriptedConnector {
    /// A server that requires the OAuth handshake.
    pub fn oauth() -> Self {
        Self::new(true)
    }

    /// A server that accepts anonymous connections.
    pub fn open_server() -> Self {
        Self::new(false)
    }

    fn new(requires_auth: bool) -> Self {
        Self {
            requires_auth,
            accepted_code: "good-code".into(),
            accepted_key: "good-key".into(),
            tools: vec![
                ToolDescriptor {
                    name: "echo".into(),
                    description: "Echo the arguments back".into(),
                    input_schema: json!({"type": "object"}),
                },
                ToolDescriptor {
                    name: FAILING_TOOL.into(),
                    description: "Always fails".into(),
                    input_schema: json!({"type": "object"}),
                },
            ],
            unreachable: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn accepted_code(&self) -> &str {
        &self.accepted_code
    }

    pub fn accepted_key(&self) -> &str {
        &self.accepted_key
    }

    /// Simulate a network outage for every subsequent operation.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self, server_url: &str) -> Result<(), BrokerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection {
                server_url: server_url.into(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn accepts(&self, credentials: Option<&Credentials>) -> bool {
        match credentials {
            None => !self.requires_auth,
            Some(Credentials::ApiKey { key }) => *key == self.accepted_key,
            Some(Credentials::OAuth { access_token, .. }) => {
                *access_token == format!("token-for-{}", self.accepted_code)
            }
        }
    }

    fn transport(&self) -> Arc<dyn ToolServerTransport> {
        Arc::new(ScriptedTransport {
            tools: self.tools.clone(),
            counters: self.counters.clone(),
        })
    }
}

#[async_trait]
impl ToolServerConnector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Handshake, BrokerError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(request.server_url)?;

        match request.credentials {
            Some(creds) if self.accepts(Some(creds)) => Ok(Handshake::Connected(self.transport())),
            Some(_) => Err(BrokerError::Authorization("credentials rejected".into())),
            None if self.requires_auth => Ok(Handshake::AuthRequired(PendingAuthorization {
                token_endpoint: format!("{}/token", request.server_url),
                client_id: "scripted-client".into(),
                redirect_uri: request.callback_url.into(),
                code_verifier: format!("verifier-{}", request.state),
                authorization_url: format!(
                    "{}/authorize?state={}",
                    request.server_url, request.state
                ),
            })),
            None => Ok(Handshake::Connected(self.transport())),
        }
    }

    async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<Credentials, BrokerError> {
        self.counters.exchanges.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(&pending.token_endpoint)?;
        if code != self.accepted_code {
            return Err(BrokerError::Authorization("invalid or expired code".into()));
        }
        Ok(Credentials::OAuth {
            access_token: format!("token-for-{code}"),
            refresh_token: Some("refresh".into()),
            expires_at: None,
            token_type: "Bearer".into(),
        })
    }

    async fn open(
        &self,
        server_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ToolServerTransport>, BrokerError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(server_url)?;
        if !self.accepts(credentials) {
            return Err(BrokerError::Authorization("credentials rejected".into()));
        }
        Ok(self.transport())
    }
}

struct ScriptedTransport {
    tools: Vec<ToolDescriptor>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ToolServerTransport for ScriptedTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BrokerError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BrokerError> {
        self.counters.tool_calls.fetch_add(1, Ordering::SeqCst);
        if name == SLOW_TOOL {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(json!({ "tool": name, "echo": arguments }));
        }
        if name == FAILING_TOOL || !self.tools.iter().any(|t| t.name == name) {
            return Err(BrokerError::ToolFailed {
                tool_name: name.into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(json!({ "tool": name, "echo": arguments }))
    }

    async fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
