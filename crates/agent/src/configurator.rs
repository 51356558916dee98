//! Per-step configuration.
//!
//! Before every model call the loop asks a [`StepConfigurator`] for a
//! [`StepOverride`]: a different model, a replacement system instruction,
//! or a shorter message window. Configurators are pure functions of the
//! step number and what has happened so far.

use chatloop_core::message::Conversation;
use chatloop_core::step::{StepOverride, StepRecord};

pub trait StepConfigurator: Send + Sync {
    fn configure(&self, step: u32, conversation: &Conversation, prior_steps: &[StepRecord]) -> StepOverride;
}

/// Leaves every step at the loop's defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverride;

impl StepConfigurator for NoOverride {
    fn configure(&self, _step: u32, _conversation: &Conversation, _prior: &[StepRecord]) -> StepOverride {
        StepOverride::default()
    }
}

/// Applies the same override to every step.
#[derive(Debug, Clone)]
pub struct FixedOverride(pub StepOverride);

impl StepConfigurator for FixedOverride {
    fn configure(&self, _step: u32, _conversation: &Conversation, _prior: &[StepRecord]) -> StepOverride {
        self.0.clone()
    }
}

/// Adapts a closure.
pub struct FnConfigurator<F>(pub F);

impl<F> StepConfigurator for FnConfigurator<F>
where
    F: Fn(u32, &Conversation, &[StepRecord]) -> StepOverride + Send + Sync,
{
    fn configure(&self, step: u32, conversation: &Conversation, prior_steps: &[StepRecord]) -> StepOverride {
        (self.0)(step, conversation, prior_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_sees_step_number() {
        let cfg = FnConfigurator(|step: u32, _: &Conversation, _: &[StepRecord]| StepOverride {
            model: (step == 0).then(|| "planner".to_string()),
            ..Default::default()
        });
        let conv = Conversation::new();
        assert_eq!(cfg.configure(0, &conv, &[]).model.as_deref(), Some("planner"));
        assert!(cfg.configure(1, &conv, &[]).is_empty());
    }

    #[test]
    fn fixed_override_repeats() {
        let cfg = FixedOverride(StepOverride {
            keep_last: Some(6),
            ..Default::default()
        });
        let conv = Conversation::new();
        assert_eq!(cfg.configure(3, &conv, &[]).keep_last, Some(6));
        assert!(NoOverride.configure(3, &conv, &[]).is_empty());
    }
}
