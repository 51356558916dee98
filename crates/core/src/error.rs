//! Error types for the Chatloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Chatloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Broker errors ---
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the model capability. Always fatal for the current run.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures inside the tool boundary. The registry turns every variant into
/// a tagged [`ToolResult`](crate::tool::ToolResult); none of them unwind
/// past a step.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Tool output violates its schema: {tool_name}: {reason}")]
    InvalidOutput { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Invalid tool schema: {tool_name}: {reason}")]
    Schema { tool_name: String, reason: String },
}

/// Failures of the external-session broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Network or transport failure while talking to a tool server.
    #[error("Connection to {server_url} failed: {reason}")]
    Connection { server_url: String, reason: String },

    /// Invalid or expired code, denied consent, rejected credentials.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Session {0} is not connected")]
    NotConnected(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} is {status}, expected {expected}")]
    InvalidState {
        session_id: String,
        status: String,
        expected: String,
    },

    /// The tool server answered, but not with something we understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote tool ran and reported failure.
    #[error("Remote tool {tool_name} failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },

    #[error("Session storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl BrokerError {
    /// Whether re-running the OAuth handshake is the expected remedy.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::Authorization(_) | Self::NotConnected(_) | Self::SessionNotFound(_)
        )
    }
}

/// Failures of a durable session store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted record {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}
