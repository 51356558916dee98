//! Durable session stores for Chatloop.
//!
//! All backends implement [`chatloop_core::SessionStore`]. The broker keeps
//! its own in-memory table as the authoritative cache and uses a store as
//! the recovery source after a restart.

pub mod file_backend;
pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileSessionStore;
pub use in_memory::InMemorySessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;
