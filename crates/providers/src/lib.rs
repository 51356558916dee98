//! Model provider implementations for Chatloop.
//!
//! All providers implement the `chatloop_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
