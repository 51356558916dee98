//! The seam between the broker and a concrete tool-server protocol.
//!
//! A [`ToolServerConnector`] performs handshakes and token exchanges; a
//! [`ToolServerTransport`] is one open, authenticated channel to a server.

use async_trait::async_trait;
use chatloop_core::error::BrokerError;
use chatloop_core::session::{Credentials, PendingAuthorization};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A tool advertised by a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Everything a connector needs to attempt the initial handshake.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub server_url: &'a str,
    /// Where the authorization server should redirect the user.
    pub callback_url: &'a str,
    /// Opaque value echoed back on the callback (the session id).
    pub state: &'a str,
    pub credentials: Option<&'a Credentials>,
}

/// Result of a handshake attempt.
pub enum Handshake {
    /// The server accepted the connection as-is.
    Connected(Arc<dyn ToolServerTransport>),
    /// The server demands interactive user authorization.
    AuthRequired(PendingAuthorization),
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(_) => f.write_str("Connected"),
            Self::AuthRequired(pending) => f.debug_tuple("AuthRequired").field(pending).finish(),
        }
    }
}

/// What `initiate_connection` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// Redirect the user to `authorization_url`; the session waits in
    /// `pending_auth` until the callback arrives.
    RequiresAuth {
        session_id: String,
        authorization_url: String,
    },
    Connected { session_id: String },
}

impl ConnectOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            Self::RequiresAuth { session_id, .. } | Self::Connected { session_id } => session_id,
        }
    }
}

/// Query parameters of an OAuth redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Carries the session id issued in the authorization URL.
    pub state: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Performs handshakes against tool servers.
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    /// Attempt a protocol handshake. Supplied credentials that the server
    /// rejects are reported as [`BrokerError::Authorization`].
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Handshake, BrokerError>;

    /// Exchange an authorization code for credentials.
    async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<Credentials, BrokerError>;

    /// Open a transport using already-obtained credentials.
    async fn open(
        &self,
        server_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ToolServerTransport>, BrokerError>;
}

/// One open channel to a tool server.
#[async_trait]
pub trait ToolServerTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BrokerError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BrokerError>;

    /// Release any held resources. Must be safe to call more than once.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_wire_shape() {
        let d: ToolDescriptor = serde_json::from_value(serde_json::json!({
            "name": "search",
            "description": "Search docs",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(d.name, "search");
        assert_eq!(d.input_schema["properties"]["q"]["type"], "string");
    }

    #[test]
    fn descriptor_defaults_missing_schema() {
        let d: ToolDescriptor = serde_json::from_value(serde_json::json!({"name": "ping"})).unwrap();
        assert_eq!(d.description, "");
        assert_eq!(d.input_schema["type"], "object");
    }

    #[test]
    fn connect_outcome_serializes_tagged() {
        let outcome = ConnectOutcome::RequiresAuth {
            session_id: "s1".into(),
            authorization_url: "https://auth/authorize".into(),
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["status"], "requires_auth");
        assert_eq!(outcome.session_id(), "s1");
    }
}
