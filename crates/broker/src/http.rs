//! HTTP tool-server connector.
//!
//! Speaks JSON-RPC 2.0 over HTTP POST (`initialize`, `tools/list`,
//! `tools/call`). When `initialize` is refused with 401/403 and no
//! credentials were supplied, the connector runs OAuth discovery:
//!
//! 1. `GET {origin}/.well-known/oauth-authorization-server`
//! 2. dynamic client registration, if a `registration_endpoint` is advertised
//! 3. a PKCE (S256) authorization URL carrying the session id as `state`
//!
//! The code that comes back on the callback is exchanged at the token
//! endpoint with `grant_type=authorization_code`.

use crate::transport::{ConnectRequest, Handshake, ToolDescriptor, ToolServerConnector, ToolServerTransport};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chatloop_core::error::BrokerError;
use chatloop_core::session::{Credentials, PendingAuthorization};
use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "Mcp-Session-Id";
const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";
/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 64;

/// Connects to tool servers over HTTP.
pub struct HttpConnector {
    client: reqwest::Client,
    client_name: String,
}

impl HttpConnector {
    pub fn new(client_name: impl Into<String>, timeout: Duration) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Protocol(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, client_name))
    }

    pub fn with_client(client: reqwest::Client, client_name: impl Into<String>) -> Self {
        Self {
            client,
            client_name: client_name.into(),
        }
    }

    async fn begin_authorization(&self, request: ConnectRequest<'_>) -> Result<PendingAuthorization, BrokerError> {
        let metadata = self.discover(request.server_url).await?;
        let client_id = match &metadata.registration_endpoint {
            Some(endpoint) => self.register(endpoint, request.callback_url).await?,
            None => self.client_name.clone(),
        };

        let pkce = Pkce::generate();
        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            BrokerError::Protocol(format!("Invalid authorization endpoint: {e}"))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &client_id)
                .append_pair("redirect_uri", request.callback_url)
                .append_pair("state", request.state)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256");
            if !metadata.scopes_supported.is_empty() {
                query.append_pair("scope", &metadata.scopes_supported.join(" "));
            }
        }

        Ok(PendingAuthorization {
            token_endpoint: metadata.token_endpoint,
            client_id,
            redirect_uri: request.callback_url.into(),
            code_verifier: pkce.verifier,
            authorization_url: url.into(),
        })
    }

    async fn discover(&self, server_url: &str) -> Result<AuthServerMetadata, BrokerError> {
        let well_known = Url::parse(server_url)
            .and_then(|u| u.join(WELL_KNOWN_PATH))
            .map_err(|e| connection_error(server_url, format!("invalid URL: {e}")))?;

        let response = self
            .client
            .get(well_known.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| connection_error(server_url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(connection_error(
                server_url,
                format!("authorization server metadata unavailable (HTTP {})", response.status()),
            ));
        }

        let metadata: AuthServerMetadata = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Invalid authorization server metadata: {e}")))?;
        debug!(
            server_url,
            authorization_endpoint = %metadata.authorization_endpoint,
            registration = metadata.registration_endpoint.is_some(),
            "Discovered authorization server"
        );
        Ok(metadata)
    }

    async fn register(&self, endpoint: &str, callback_url: &str) -> Result<String, BrokerError> {
        let response = self
            .client
            .post(endpoint)
            .json(&json!({
                "client_name": self.client_name,
                "redirect_uris": [callback_url],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await
            .map_err(|e| connection_error(endpoint, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Authorization(format!(
                "Client registration rejected (HTTP {status}): {body}"
            )));
        }

        let registered: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Invalid registration response: {e}")))?;
        info!(client_id = %registered.client_id, "Registered OAuth client");
        Ok(registered.client_id)
    }
}

#[async_trait]
impl ToolServerConnector for HttpConnector {
    async fn connect(&self, request: ConnectRequest<'_>) -> Result<Handshake, BrokerError> {
        let transport = HttpTransport::new(self.client.clone(), request.server_url, request.credentials);
        match transport.initialize(&self.client_name).await {
            Ok(()) => Ok(Handshake::Connected(Arc::new(transport))),
            Err(BrokerError::Authorization(reason)) if request.credentials.is_none() => {
                debug!(server_url = request.server_url, %reason, "Server requires authorization");
                let pending = self.begin_authorization(request).await?;
                Ok(Handshake::AuthRequired(pending))
            }
            Err(e) => Err(e),
        }
    }

    async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<Credentials, BrokerError> {
        let response = self
            .client
            .post(&pending.token_endpoint)
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", pending.redirect_uri.as_str()),
                ("client_id", pending.client_id.as_str()),
                ("code_verifier", pending.code_verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| connection_error(&pending.token_endpoint, e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(connection_error(
                &pending.token_endpoint,
                format!("token endpoint returned HTTP {status}"),
            ));
        }
        if !status.is_success() {
            let reason = match response.json::<OAuthErrorBody>().await {
                Ok(body) => match body.error_description {
                    Some(description) => format!("{}: {description}", body.error),
                    None => body.error,
                },
                Err(_) => format!("token endpoint returned HTTP {status}"),
            };
            return Err(BrokerError::Authorization(reason));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Invalid token response: {e}")))?;
        Ok(Credentials::OAuth {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: token.token_type.unwrap_or_else(|| "Bearer".into()),
        })
    }

    async fn open(
        &self,
        server_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ToolServerTransport>, BrokerError> {
        let transport = HttpTransport::new(self.client.clone(), server_url, credentials);
        transport.initialize(&self.client_name).await?;
        Ok(Arc::new(transport))
    }
}

/// One initialized JSON-RPC channel.
struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    bearer: Option<String>,
    session_id: OnceLock<String>,
    next_id: AtomicU64,
}

impl HttpTransport {
    fn new(client: reqwest::Client, endpoint: &str, credentials: Option<&Credentials>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bearer: credentials.map(|c| c.bearer().to_string()),
            session_id: OnceLock::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn initialize(&self, client_name: &str) -> Result<(), BrokerError> {
        let result = self
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": client_name, "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await?;
        debug!(
            endpoint = %self.endpoint,
            server = %result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            "Tool server initialized"
        );

        if let Err(e) = self.notify("notifications/initialized").await {
            debug!(endpoint = %self.endpoint, error = %e, "initialized notification failed");
        }
        Ok(())
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(session_id) = self.session_id.get() {
            request = request.header(SESSION_HEADER, session_id);
        }
        request
    }

    async fn notify(&self, method: &str) -> Result<(), BrokerError> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| connection_error(&self.endpoint, e.to_string()))?;
        if !response.status().is_success() {
            return Err(connection_error(&self.endpoint, format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| connection_error(&self.endpoint, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BrokerError::Authorization(format!(
                "{} refused {method} (HTTP {status})",
                self.endpoint
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(connection_error(&self.endpoint, format!("HTTP {status}: {text}")));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let _ = self.session_id.set(session_id.to_string());
        }
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response
            .text()
            .await
            .map_err(|e| connection_error(&self.endpoint, e.to_string()))?;
        let reply = if is_event_stream {
            parse_event_stream(&text, id)?
        } else {
            serde_json::from_str::<RpcResponse>(&text)
                .map_err(|e| BrokerError::Protocol(format!("{method}: invalid JSON-RPC response: {e}")))?
        };

        if let Some(error) = reply.error {
            return Err(BrokerError::Protocol(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        reply
            .result
            .ok_or_else(|| BrokerError::Protocol(format!("{method}: response carries no result")))
    }
}

#[async_trait]
impl ToolServerTransport for HttpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BrokerError> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page: ToolsPage = serde_json::from_value(self.rpc("tools/list", params).await?)
                .map_err(|e| BrokerError::Protocol(format!("tools/list: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(BrokerError::Protocol(format!(
                            "tools/list: cursor '{next}' repeated"
                        )));
                    }
                    cursor = Some(next);
                }
                _ => return Ok(tools),
            }
        }
        Err(BrokerError::Protocol(format!(
            "tools/list: more than {MAX_TOOL_PAGES} pages"
        )))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BrokerError> {
        let mut result = self
            .rpc("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        if result["isError"].as_bool().unwrap_or(false) {
            return Err(BrokerError::ToolFailed {
                tool_name: name.into(),
                reason: content_text(&result["content"]).unwrap_or_else(|| "remote tool reported an error".into()),
            });
        }

        if let Some(structured) = result.get_mut("structuredContent").map(Value::take) {
            return Ok(structured);
        }
        match result.get_mut("content").map(Value::take) {
            Some(content) => Ok(content),
            None => Ok(result),
        }
    }

    async fn close(&self) {
        // Only servers that issued a session id track one.
        let Some(session_id) = self.session_id.get() else {
            return;
        };
        let mut request = self.client.delete(&self.endpoint).header(SESSION_HEADER, session_id);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Err(e) = request.send().await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to close tool server session");
        }
    }
}

/// Joined `text` items of a tool result's content array.
fn content_text(content: &Value) -> Option<String> {
    let parts: Vec<&str> = content
        .as_array()?
        .iter()
        .filter_map(|item| item["text"].as_str())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Find the JSON-RPC reply for `id` in a `text/event-stream` body.
fn parse_event_stream(body: &str, id: u64) -> Result<RpcResponse, BrokerError> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<RpcResponse>(data.trim()).ok())
        .find(|reply| reply.id.as_ref().and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| BrokerError::Protocol(format!("event stream carries no reply for request {id}")))
}

fn connection_error(server_url: &str, reason: String) -> BrokerError {
    BrokerError::Connection {
        server_url: server_url.into(),
        reason,
    }
}

/// PKCE code verifier and S256 challenge.
struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    fn generate() -> Self {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&bytes);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Form, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    const TOKEN: &str = "secret-token";

    #[derive(Clone)]
    struct MockServer {
        base: String,
    }

    async fn mcp(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"));
        if !authorized {
            return AxumStatus::UNAUTHORIZED.into_response();
        }

        let id = body["id"].clone();
        let method = body["method"].as_str().unwrap_or_default();
        let has_session = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "sess-1");

        let result = match method {
            "initialize" => {
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1"}
                }});
                return ([(SESSION_HEADER, "sess-1")], Json(reply)).into_response();
            }
            "notifications/initialized" => return AxumStatus::ACCEPTED.into_response(),
            _ if !has_session => {
                return Json(json!({"jsonrpc": "2.0", "id": id,
                    "error": {"code": -32000, "message": "missing session"}}))
                .into_response();
            }
            "tools/list" if body["params"]["cursor"].is_null() => json!({
                "tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}],
                "nextCursor": "page-2"
            }),
            "tools/list" => json!({"tools": [{"name": "fail"}]}),
            "tools/call" if body["params"]["name"] == "fail" => json!({
                "isError": true,
                "content": [{"type": "text", "text": "remote exploded"}]
            }),
            "tools/call" => json!({
                "content": [{"type": "text", "text": "ok"}],
                "structuredContent": {"echo": body["params"]["arguments"].clone()}
            }),
            other => {
                return Json(json!({"jsonrpc": "2.0", "id": id,
                    "error": {"code": -32601, "message": format!("unknown method {other}")}}))
                .into_response();
            }
        };
        Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
    }

    /// Like `mcp`, but every `tools/list` page points at the same next page.
    async fn looping_mcp(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        if body["method"] == "tools/list" {
            return Json(json!({"jsonrpc": "2.0", "id": body["id"].clone(), "result": {
                "tools": [{"name": "echo"}],
                "nextCursor": "again"
            }}))
            .into_response();
        }
        mcp(headers, Json(body)).await
    }

    async fn metadata(State(server): State<MockServer>) -> Json<Value> {
        Json(json!({
            "issuer": server.base,
            "authorization_endpoint": format!("{}/authorize", server.base),
            "token_endpoint": format!("{}/token", server.base),
            "registration_endpoint": format!("{}/register", server.base),
            "scopes_supported": ["tools"],
        }))
    }

    async fn register(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["token_endpoint_auth_method"], "none");
        Json(json!({"client_id": "registered-client"}))
    }

    async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
        let valid = form.get("grant_type").map(String::as_str) == Some("authorization_code")
            && form.get("code").map(String::as_str) == Some("good-code")
            && form.get("client_id").map(String::as_str) == Some("registered-client")
            && form.get("code_verifier").is_some_and(|v| !v.is_empty());
        if !valid {
            return (
                AxumStatus::BAD_REQUEST,
                Json(json!({"error": "invalid_grant", "error_description": "code expired"})),
            )
                .into_response();
        }
        Json(json!({
            "access_token": TOKEN,
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1"
        }))
        .into_response()
    }

    async fn spawn_mock() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new()
            .route("/mcp", post(mcp))
            .route("/looping", post(looping_mcp))
            .route(WELL_KNOWN_PATH, get(metadata))
            .route("/register", post(register))
            .route("/token", post(token))
            .with_state(MockServer { base: base.clone() });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    fn connector() -> HttpConnector {
        HttpConnector::new("chatloop-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_server_yields_pkce_authorization_url() {
        let base = spawn_mock().await;
        let server_url = format!("{base}/mcp");
        let handshake = connector()
            .connect(ConnectRequest {
                server_url: &server_url,
                callback_url: "https://app.example.com/oauth/callback",
                state: "session-42",
                credentials: None,
            })
            .await
            .unwrap();

        let Handshake::AuthRequired(pending) = handshake else {
            panic!("expected AuthRequired");
        };
        assert_eq!(pending.client_id, "registered-client");
        assert_eq!(pending.token_endpoint, format!("{base}/token"));

        let url = Url::parse(&pending.authorization_url).unwrap();
        assert!(url.as_str().starts_with(&format!("{base}/authorize")));
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["state"], "session-42");
        assert_eq!(query["redirect_uri"], "https://app.example.com/oauth/callback");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["scope"], "tools");
        assert_eq!(query["code_challenge"], Pkce::challenge_for(&pending.code_verifier));
    }

    #[tokio::test]
    async fn code_exchange_and_tool_calls() {
        let base = spawn_mock().await;
        let server_url = format!("{base}/mcp");
        let connector = connector();
        let pending = PendingAuthorization {
            token_endpoint: format!("{base}/token"),
            client_id: "registered-client".into(),
            redirect_uri: "https://app.example.com/oauth/callback".into(),
            code_verifier: "verifier".into(),
            authorization_url: String::new(),
        };

        let err = connector.exchange_code(&pending, "stale-code").await.unwrap_err();
        assert!(matches!(err, BrokerError::Authorization(ref m) if m.contains("invalid_grant")));

        let credentials = connector.exchange_code(&pending, "good-code").await.unwrap();
        assert_eq!(credentials.bearer(), TOKEN);
        assert!(!credentials.is_expired());

        let transport = connector.open(&server_url, Some(&credentials)).await.unwrap();
        let tools = transport.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fail"]);

        let out = transport.call_tool("echo", json!({"q": "rust"})).await.unwrap();
        assert_eq!(out, json!({"echo": {"q": "rust"}}));

        let err = transport.call_tool("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::ToolFailed { ref reason, .. } if reason == "remote exploded"));
        transport.close().await;
    }

    #[tokio::test]
    async fn repeating_cursor_ends_tool_listing() {
        let base = spawn_mock().await;
        let key = Credentials::ApiKey { key: TOKEN.into() };
        let transport = connector()
            .open(&format!("{base}/looping"), Some(&key))
            .await
            .unwrap();

        let err = transport.list_tools().await.unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(ref m) if m.contains("repeated")));
    }

    #[tokio::test]
    async fn rejected_api_key_is_an_authorization_error() {
        let base = spawn_mock().await;
        let server_url = format!("{base}/mcp");
        let key = Credentials::ApiKey { key: "wrong".into() };
        let err = connector()
            .connect(ConnectRequest {
                server_url: &server_url,
                callback_url: "https://app/cb",
                state: "s",
                credentials: Some(&key),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authorization(_)));
    }

    #[tokio::test]
    async fn accepted_api_key_connects_directly() {
        let base = spawn_mock().await;
        let server_url = format!("{base}/mcp");
        let key = Credentials::ApiKey { key: TOKEN.into() };
        let handshake = connector()
            .connect(ConnectRequest {
                server_url: &server_url,
                callback_url: "https://app/cb",
                state: "s",
                credentials: Some(&key),
            })
            .await
            .unwrap();
        assert!(matches!(handshake, Handshake::Connected(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connector()
            .open(&format!("http://{addr}/mcp"), None)
            .await
            .err().unwrap();
        assert!(matches!(err, BrokerError::Connection { .. }));
    }

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge, Pkce::challenge_for(&pkce.verifier));
        // RFC 7636 appendix B
        assert_eq!(
            Pkce::challenge_for("dBjftJeZ4CVP-mJ92K9qqp7w6v2r0Hh6KezZ_t1TOZc"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn event_stream_reply_is_matched_by_id() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let reply = parse_event_stream(body, 7).unwrap();
        assert_eq!(reply.result.unwrap()["ok"], true);
        assert!(parse_event_stream(body, 8).is_err());
    }
}
