//! The step loop implementation.

use crate::configurator::{NoOverride, StepConfigurator};
use crate::stop::StopPolicy;
use chatloop_config::{AgentConfig, ProviderConfig};
use chatloop_core::error::ToolError;
use chatloop_core::hooks::{NoopHooks, StepHookSink};
use chatloop_core::message::{Conversation, Role};
use chatloop_core::provider::{Provider, ProviderRequest};
use chatloop_core::step::{RunError, RunOutcome, StepRecord, TerminationReason};
use chatloop_core::tool::{ToolCall, ToolRegistry, ToolResult};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input to [`StepLoop::run`].
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub conversation: Conversation,
    /// System instruction. When absent, a leading `system` message in the
    /// conversation is used instead.
    pub system: Option<String>,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Drives the bounded request → act → observe cycle.
///
/// Steps run strictly one after another. Within a step every tool call is
/// dispatched concurrently; the assistant message and all of its tool
/// results are appended together once every result is in, so the
/// conversation never holds a half-finished step.
pub struct StepLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    policy: StopPolicy,
    configurator: Arc<dyn StepConfigurator>,
    hooks: Arc<dyn StepHookSink>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    model_timeout: Duration,
    tool_timeout: Duration,
    keep_last: Option<usize>,
}

impl StepLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        policy: StopPolicy,
    ) -> Self {
        Self {
            provider,
            tools,
            policy,
            configurator: Arc::new(NoOverride),
            hooks: Arc::new(NoopHooks),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            model_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(60),
            keep_last: None,
        }
    }

    /// Build a loop from configuration: budget, timeouts, terminal tool,
    /// window, and sampling settings.
    pub fn from_config(
        agent: &AgentConfig,
        provider_config: &ProviderConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let policy = StopPolicy::new(agent.max_steps).with_terminal_tool(&agent.terminal_tool);
        let mut step_loop = Self::new(provider, &provider_config.model, tools, policy)
            .with_temperature(provider_config.temperature)
            .with_max_tokens(provider_config.max_tokens)
            .with_model_timeout(Duration::from_secs(agent.model_timeout_secs))
            .with_tool_timeout(Duration::from_secs(agent.tool_timeout_secs));
        step_loop.keep_last = agent.keep_last_messages;
        step_loop
    }

    pub fn with_configurator(mut self, configurator: Arc<dyn StepConfigurator>) -> Self {
        self.configurator = configurator;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StepHookSink>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Default window applied when the configurator does not set one.
    pub fn with_keep_last(mut self, keep_last: usize) -> Self {
        self.keep_last = Some(keep_last);
        self
    }

    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    /// Run until the stop policy, a fatal model failure, or cancellation
    /// ends it. Never fails: every ending is described by the outcome's
    /// [`TerminationReason`].
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let RunRequest {
            mut conversation,
            system,
            cancel,
        } = request;
        let system = system.or_else(|| conversation.system_instruction().map(String::from));
        let mut steps: Vec<StepRecord> = Vec::new();

        if let Err(reason) = Self::check_input(&conversation, system.as_deref()) {
            warn!(conversation_id = %conversation.id, %reason, "Rejected run input");
            return self.finish(conversation, invalid_input(reason), steps, None);
        }

        info!(
            conversation_id = %conversation.id,
            messages = conversation.len(),
            max_steps = self.policy.max_steps(),
            "Starting run"
        );

        for step in 0..self.policy.max_steps() {
            if cancel.is_cancelled() {
                return self.finish(conversation, TerminationReason::Cancelled, steps, None);
            }

            let overrides = self.configurator.configure(step, &conversation, &steps);
            let model = overrides.model.clone().unwrap_or_else(|| self.model.clone());
            let request = ProviderRequest {
                model: model.clone(),
                system: overrides.system.clone().or_else(|| system.clone()),
                messages: conversation.window(overrides.keep_last.or(self.keep_last)),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: self.tools.definitions(),
            };

            self.hooks.on_step_start(step);
            let started_at = Utc::now();
            debug!(step, model = %model, messages = request.messages.len(), "Invoking model");

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(step, "Run cancelled during model call");
                    return self.finish(conversation, TerminationReason::Cancelled, steps, None);
                }
                result = tokio::time::timeout(self.model_timeout, self.provider.complete(request)) => result,
            };
            let response = match response {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(step, error = %e, "Model call failed");
                    return self.finish(conversation, model_failure(e.to_string()), steps, None);
                }
                Err(_) => {
                    warn!(step, timeout_secs = self.model_timeout.as_secs(), "Model call timed out");
                    let detail = format!("model call timed out after {:?}", self.model_timeout);
                    return self.finish(conversation, model_failure(detail), steps, None);
                }
            };

            let mut assistant = response.message;
            assistant.role = Role::Assistant;
            let calls = assign_call_ids(step, std::mem::take(&mut assistant.tool_calls));
            assistant.tool_calls = calls.clone();

            let results = self.dispatch(step, &calls, &cancel).await;

            let text = assistant.content.clone();
            conversation.push(assistant);
            conversation.extend(results.iter().map(ToolResult::to_message));

            let record = StepRecord {
                step,
                model: if response.model.is_empty() { model } else { response.model },
                text,
                tool_calls: calls,
                tool_results: results,
                usage: response.usage,
                applied_override: (!overrides.is_empty()).then_some(overrides),
                started_at,
                finished_at: Utc::now(),
            };
            debug!(
                step,
                tool_calls = record.tool_calls.len(),
                failed = record.tool_results.iter().filter(|r| !r.is_success()).count(),
                "Step finished"
            );
            self.hooks.on_step_finish(&record);
            steps.push(record);

            if let Some(reason) = self.policy.evaluate(&steps) {
                let final_answer = match &reason {
                    TerminationReason::TerminalTool { tool_name } => steps
                        .last()
                        .and_then(|s| s.successful_result_of(tool_name))
                        .map(|r| r.output.clone()),
                    _ => None,
                };
                return self.finish(conversation, reason, steps, final_answer);
            }
            if cancel.is_cancelled() {
                info!(step, "Run cancelled after step");
                return self.finish(conversation, TerminationReason::Cancelled, steps, None);
            }
        }

        // The policy's budget condition fires on the last step; this is a backstop.
        self.finish(conversation, TerminationReason::BudgetExhausted, steps, None)
    }

    fn check_input(conversation: &Conversation, system: Option<&str>) -> Result<(), String> {
        if conversation.is_empty() && system.is_none_or(|s| s.trim().is_empty()) {
            return Err("conversation is empty and no system instruction was given".into());
        }
        let dangling = conversation.unresolved_tool_calls();
        if !dangling.is_empty() {
            return Err(format!(
                "conversation has unresolved tool calls: {}",
                dangling.join(", ")
            ));
        }
        Ok(())
    }

    /// Run every call of a step concurrently; results keep call order.
    async fn dispatch(&self, step: u32, calls: &[ToolCall], cancel: &CancellationToken) -> Vec<ToolResult> {
        if !calls.is_empty() {
            debug!(step, count = calls.len(), "Dispatching tool calls");
        }
        join_all(calls.iter().map(|call| self.execute_call(call, cancel))).await
    }

    async fn execute_call(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(tool = %call.name, call_id = %call.id, "Tool call cancelled");
                ToolResult::cancelled(call).with_duration(elapsed())
            }
            outcome = tokio::time::timeout(self.tool_timeout, self.tools.execute(call)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    let err = ToolError::Timeout {
                        tool_name: call.name.clone(),
                        timeout_ms: self.tool_timeout.as_millis() as u64,
                    };
                    warn!(tool = %call.name, call_id = %call.id, "Tool call timed out");
                    ToolResult::from_error(call, &err).with_duration(elapsed())
                }
            },
        }
    }

    fn finish(
        &self,
        conversation: Conversation,
        reason: TerminationReason,
        steps: Vec<StepRecord>,
        final_answer: Option<serde_json::Value>,
    ) -> RunOutcome {
        let outcome = RunOutcome {
            conversation,
            reason,
            steps,
            final_answer,
        };
        info!(
            conversation_id = %outcome.conversation.id,
            steps = outcome.steps.len(),
            reason = %outcome.reason,
            total_tokens = outcome.total_usage().total_tokens,
            "Run finished"
        );
        self.hooks.on_run_finish(&outcome);
        outcome
    }
}

fn invalid_input(detail: String) -> TerminationReason {
    TerminationReason::Error {
        error: RunError::InvalidInput(detail),
    }
}

fn model_failure(detail: String) -> TerminationReason {
    TerminationReason::Error {
        error: RunError::ModelFailure(detail),
    }
}

/// Give every call a unique, non-empty id so each tool message can be
/// matched to exactly one call.
fn assign_call_ids(step: u32, calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(i, mut call)| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("step{step}_call{i}");
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}
