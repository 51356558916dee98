//! Configuration loading, validation, and management for Chatloop.
//!
//! Loads configuration from `~/.chatloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.chatloop/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model provider settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Step loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// External-session broker settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// HTTP gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard upper bound on model invocations per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Tool whose successful call ends the run
    #[serde(default = "default_terminal_tool")]
    pub terminal_tool: String,

    /// Show the model only the most recent N messages each step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last_messages: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_steps() -> u32 {
    10
}
fn default_model_timeout() -> u64 {
    120
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_terminal_tool() -> String {
    "final_answer".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            model_timeout_secs: default_model_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            terminal_tool: default_terminal_tool(),
            keep_last_messages: None,
            system_prompt: None,
        }
    }
}

/// Which durable store backs the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_store_kind")]
    pub store: StoreKind,

    /// Path of the file or SQLite database (defaults under the config dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Sessions not updated for this long are deleted by the sweeper
    #[serde(default = "default_session_max_age")]
    pub session_max_age_hours: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    /// Client name used for dynamic OAuth client registration
    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Upper bound for `session_max_age_hours` (100 years).
pub const MAX_SESSION_AGE_HOURS: u64 = 24 * 365 * 100;

/// Upper bound for `sweep_interval_minutes` (one year).
pub const MAX_SWEEP_INTERVAL_MINUTES: u64 = 60 * 24 * 365;

fn default_store_kind() -> StoreKind {
    StoreKind::Sqlite
}
fn default_session_max_age() -> u64 {
    168
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_client_name() -> String {
    "chatloop".into()
}
fn default_connect_timeout() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            store: default_store_kind(),
            store_path: None,
            session_max_age_hours: default_session_max_age(),
            sweep_interval_minutes: default_sweep_interval(),
            client_name: default_client_name(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BrokerConfig {
    /// Resolved store location for file-backed stores.
    pub fn resolved_store_path(&self) -> PathBuf {
        if let Some(path) = &self.store_path {
            return path.clone();
        }
        let file = match self.store {
            StoreKind::Sqlite => "sessions.db",
            StoreKind::File | StoreKind::Memory => "sessions.json",
        };
        AppConfig::config_dir().join(file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Externally reachable base URL, used to build OAuth callback URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            public_url: None,
        }
    }
}

impl GatewayConfig {
    /// The redirect URI tool servers should send users back to.
    pub fn callback_url(&self) -> String {
        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port));
        format!("{}/oauth/callback", base.trim_end_matches('/'))
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatloop/config.toml).
    ///
    /// Also checks environment variables:
    /// - `CHATLOOP_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `CHATLOOP_MODEL`
    /// - `CHATLOOP_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("CHATLOOP_API_KEY") {
            self.provider.api_key = Some(key);
        } else if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        if let Ok(model) = std::env::var("CHATLOOP_MODEL") {
            self.provider.model = model;
        }

        if let Ok(url) = std::env::var("CHATLOOP_BASE_URL") {
            self.provider.base_url = url;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.temperature < 0.0 || self.provider.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if self.agent.model_timeout_secs == 0 || self.agent.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent timeouts must be greater than 0".into(),
            ));
        }

        if self.agent.keep_last_messages == Some(0) {
            return Err(ConfigError::ValidationError(
                "agent.keep_last_messages must be at least 1 when set".into(),
            ));
        }

        if self.broker.session_max_age_hours == 0
            || self.broker.session_max_age_hours > MAX_SESSION_AGE_HOURS
        {
            return Err(ConfigError::ValidationError(format!(
                "broker.session_max_age_hours must be between 1 and {MAX_SESSION_AGE_HOURS}"
            )));
        }

        if self.broker.sweep_interval_minutes > MAX_SWEEP_INTERVAL_MINUTES {
            return Err(ConfigError::ValidationError(format!(
                "broker.sweep_interval_minutes must be at most {MAX_SWEEP_INTERVAL_MINUTES}"
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
