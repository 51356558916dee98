//! External-session broker for Chatloop.
//!
//! Establishes and tracks authenticated connections to third-party tool
//! servers on behalf of users:
//!
//! - **[`ExternalSessionBroker`]**: the per-session state machine
//!   (`pending_auth → connected → disconnected`), backed by a durable
//!   [`SessionStore`](chatloop_core::SessionStore) with an in-memory cache
//! - **[`transport`]**: the connector/transport seam the broker talks through
//! - **[`http`]**: JSON-RPC over HTTP with OAuth discovery and PKCE
//! - **[`audit`]**: a record of every remote tool invocation

pub mod audit;
pub mod broker;
pub mod http;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use audit::{AuditEntry, AuditLog, AuditSink, TracingAuditSink};
pub use broker::ExternalSessionBroker;
pub use http::HttpConnector;
pub use transport::{
    CallbackParams, ConnectOutcome, ConnectRequest, Handshake, ToolDescriptor, ToolServerConnector,
    ToolServerTransport,
};
