//! Step-loop observers for Chatloop.
//!
//! [`TracingHooks`] logs each step as a structured event,
//! [`RecordingHooks`] keeps step records with running usage totals, and
//! [`FanoutHooks`] combines several sinks behind one
//! [`StepHookSink`](chatloop_core::StepHookSink).

pub mod model;
pub mod recorder;
pub mod sinks;

pub use model::{RunSummary, UsageSnapshot};
pub use recorder::RecordingHooks;
pub use sinks::{FanoutHooks, TracingHooks};
