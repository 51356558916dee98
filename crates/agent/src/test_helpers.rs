//! Shared test helpers for step-loop tests.

use async_trait::async_trait;
use chatloop_core::error::{ProviderError, ToolError};
use chatloop_core::message::Message;
use chatloop_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use chatloop_core::tool::{Tool, ToolCall};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the scripted provider does on one call.
pub enum Turn {
    Respond(ProviderResponse),
    Fail(ProviderError),
    /// Never answers (for timeout and cancellation tests).
    Hang,
}

/// A provider that plays back scripted turns and records every request.
///
/// Once the script runs out, the last turn repeats.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    repeat: Mutex<Option<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            repeat: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Calls `tool` forever.
    pub fn always_calls(tool: &str) -> Self {
        Self::new(vec![Turn::Respond(tool_calls(vec![(tool, json!({"text": "again"}))]))])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let next = self.turns.lock().unwrap().pop_front();
        match next {
            Some(Turn::Respond(response)) => {
                *self.repeat.lock().unwrap() = Some(response.clone());
                Ok(response)
            }
            Some(Turn::Fail(err)) => Err(err),
            Some(Turn::Hang) => std::future::pending().await,
            None => self
                .repeat
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ProviderError::NotConfigured("script is empty".into())),
        }
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// A text-only response.
pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(content),
        usage: usage(),
        model: "mock-model".into(),
    }
}

/// A response requesting the given tool calls, with ids `call_0`, `call_1`, ...
pub fn tool_calls(calls: Vec<(&str, Value)>) -> ProviderResponse {
    let calls = calls
        .into_iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall::new(format!("call_{i}"), name, args))
        .collect();
    ProviderResponse {
        message: Message::assistant_with_calls("", calls),
        usage: usage(),
        model: "mock-model".into(),
    }
}

pub fn final_answer(answer: &str) -> ProviderResponse {
    tool_calls(vec![("final_answer", json!({"answer": answer}))])
}

/// Echoes `text` back, optionally after a delay. Counts executions.
pub struct EchoTool {
    pub name: &'static str,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl EchoTool {
    pub fn new(name: &'static str) -> Self {
        Self::slow(name, Duration::ZERO)
    }

    pub fn slow(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Echo the text back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(json!({ "echo": input["text"] }))
    }
}
