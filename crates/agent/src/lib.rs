//! The step loop: a bounded request → act → observe cycle.
//!
//! Each step:
//!
//! 1. **Configure** the step (model, system instruction, message window)
//! 2. **Ask** the model for a response, offering every registered tool
//! 3. **Act** on its tool calls concurrently, collecting one result per call
//! 4. **Observe**: append the step, notify hooks, consult the stop policy
//!
//! The loop ends when a stop condition fires, the step budget runs out, the
//! model fails, or the caller cancels.

pub mod configurator;
pub mod loop_runner;
pub mod stop;

#[cfg(test)]
mod test_helpers;

pub use configurator::{FixedOverride, FnConfigurator, NoOverride, StepConfigurator};
pub use loop_runner::{RunRequest, StepLoop};
pub use stop::{StepBudgetExhausted, StopCondition, StopContext, StopPolicy, TerminalToolFired, TextResponse};
