//! `chatloop run`: one bounded run of the step loop.

use super::runtime::{CmdResult, open_broker};
use chatloop_agent::{RunRequest, StepLoop};
use chatloop_config::AppConfig;
use chatloop_core::message::{Conversation, Message};
use chatloop_core::step::{RunOutcome, TerminationReason};
use chatloop_providers::OpenAiCompatProvider;
use chatloop_telemetry::{FanoutHooks, RecordingHooks, TracingHooks};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct RunArgs {
    pub message: String,
    pub max_steps: Option<u32>,
    pub system: Option<String>,
    pub user: String,
    pub json: bool,
}

pub async fn run(args: RunArgs) -> CmdResult<()> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(max_steps) = args.max_steps {
        config.agent.max_steps = max_steps;
        config.validate()?;
    }

    if !config.has_api_key() {
        eprintln!("  warning: no API key configured (set CHATLOOP_API_KEY or OPENAI_API_KEY)");
    }

    let provider = Arc::new(OpenAiCompatProvider::from_config(&config.provider)?);
    let broker = open_broker(&config).await?;

    let mut registry = chatloop_tools::default_registry(&config.agent.terminal_tool)?;
    chatloop_tools::register_external_tools(&mut registry, broker, &args.user, &config.gateway.callback_url())?;

    let recorder = Arc::new(RecordingHooks::new());
    let hooks = FanoutHooks::new().with(Arc::new(TracingHooks)).with(recorder.clone());
    let step_loop =
        StepLoop::from_config(&config.agent, &config.provider, provider, Arc::new(registry)).with_hooks(Arc::new(hooks));

    let mut conversation = Conversation::new();
    conversation.push(Message::user(&args.message));
    let mut request = RunRequest::new(conversation);
    if let Some(system) = args.system.or(config.agent.system_prompt.clone()) {
        request = request.with_system(system);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let outcome = step_loop.run(request.with_cancel(cancel)).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
        eprintln!("  {}", recorder.snapshot());
    }

    match outcome.reason {
        TerminationReason::Error { error } => Err(error.to_string().into()),
        _ => Ok(()),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    match (&outcome.reason, &outcome.final_answer) {
        (TerminationReason::TerminalTool { .. }, Some(answer)) => match answer.get("answer").and_then(|a| a.as_str()) {
            Some(text) => println!("{text}"),
            None => println!("{answer}"),
        },
        _ => {
            if let Some(text) = outcome.final_text().filter(|t| !t.is_empty()) {
                println!("{text}");
            }
        }
    }
    eprintln!("  [{}]", outcome.reason);
}
