//! # Chatloop Core
//!
//! Domain types, traits, and error definitions for the Chatloop agent runtime.
//! This crate has **zero framework dependencies**: it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the step loop is defined as a trait here:
//! the model capability ([`Provider`]), tools ([`Tool`]), lifecycle observers
//! ([`StepHookSink`]) and durable session storage ([`SessionStore`]).
//! Implementations live in their respective crates, so tests can swap in
//! scripted stubs without touching the loop.

pub mod error;
pub mod hooks;
pub mod message;
pub mod provider;
pub mod session;
pub mod step;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{BrokerError, Error, ProviderError, Result, StoreError, ToolError};
pub use hooks::{NoopHooks, StepHookSink};
pub use message::{Conversation, ConversationId, Message, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use session::{
    Credentials, ExternalSession, PendingAuthorization, SessionStatus, SessionStore,
};
pub use step::{RunError, RunOutcome, StepOverride, StepRecord, TerminationReason};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult, ToolStatus, TypedTool};
