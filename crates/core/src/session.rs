//! External tool-server sessions and their durable store.
//!
//! An [`ExternalSession`] tracks one user's connection to one third-party
//! tool server through an OAuth-style handshake:
//!
//! ```text
//! pending_auth ──(code exchanged)──▶ connected ──(disconnect)──▶ disconnected
//!       └──────────────(error / disconnect)──────────────────────────┘
//! ```
//!
//! Direct-credential connections start at `connected`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    PendingAuth,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingAuth => "pending_auth",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_auth" => Ok(Self::PendingAuth),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Credential material for a tool server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// A static key sent as a bearer token.
    ApiKey { key: String },
    /// Tokens obtained from an authorization-code exchange.
    OAuth {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default = "default_token_type")]
        token_type: String,
    },
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Credentials {
    /// The value for an `Authorization: Bearer` header.
    pub fn bearer(&self) -> &str {
        match self {
            Self::ApiKey { key } => key,
            Self::OAuth { access_token, .. } => access_token,
        }
    }

    /// Whether an OAuth access token has passed its expiry.
    pub fn is_expired(&self) -> bool {
        match self {
            Self::ApiKey { .. } => false,
            Self::OAuth { expires_at, .. } => expires_at.is_some_and(|t| t <= Utc::now()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"[REDACTED]").finish(),
            Self::OAuth { expires_at, token_type, refresh_token, .. } => f
                .debug_struct("OAuth")
                .field("access_token", &"[REDACTED]")
                .field("has_refresh_token", &refresh_token.is_some())
                .field("expires_at", expires_at)
                .field("token_type", token_type)
                .finish(),
        }
    }
}

/// State carried between issuing the authorization URL and exchanging the
/// code that comes back on the callback.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub token_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// PKCE verifier matching the challenge in the authorization URL.
    pub code_verifier: String,
    pub authorization_url: String,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("code_verifier", &"[REDACTED]")
            .finish()
    }
}

/// A tracked, potentially-authenticated connection to a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSession {
    /// Opaque id generated by the broker (also the OAuth `state` value)
    pub id: String,
    /// Owning user, from the host application's identity primitive
    pub user_id: String,
    pub server_url: String,
    pub callback_url: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingAuthorization>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalSession {
    pub fn new(
        user_id: impl Into<String>,
        server_url: impl Into<String>,
        callback_url: impl Into<String>,
        status: SessionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            server_url: server_url.into(),
            callback_url: callback_url.into(),
            status,
            credentials: None,
            pending: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// Copy without credential or PKCE material, for API surfaces.
    pub fn redacted(&self) -> Self {
        Self {
            credentials: None,
            pending: None,
            ..self.clone()
        }
    }

    /// Whether the last update is older than `max_age` at `now`.
    pub fn is_stale(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.updated_at > max_age
    }
}

/// Durable storage for external sessions.
///
/// Each `put` must be atomic: a reader (or a process restarting after a
/// crash) sees either the previous record or the new one, never a mix.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "file", "memory").
    fn name(&self) -> &str;

    /// Insert or replace a session record.
    async fn put(&self, session: &ExternalSession) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<ExternalSession>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// All records, used to rebuild the in-memory table at startup.
    async fn load_all(&self) -> Result<Vec<ExternalSession>, StoreError>;
}
