//! `chatloop serve`: start the HTTP gateway with the session sweeper.

use super::runtime::{CmdResult, open_broker, session_max_age, sweep_interval};
use chatloop_config::AppConfig;
use chatloop_gateway::GatewayState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(port: Option<u16>) -> CmdResult<()> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let broker = open_broker(&config).await?;
    let max_age = session_max_age(&config.broker)?;
    let shutdown = CancellationToken::new();

    let sweeper = broker.spawn_sweeper(
        sweep_interval(&config.broker),
        max_age,
        shutdown.child_token(),
    );

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            on_signal.cancel();
        }
    });

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    info!(callback_url = %config.gateway.callback_url(), "OAuth redirect target");
    let state = Arc::new(GatewayState::new(broker, max_age));
    let served = chatloop_gateway::serve(state, &addr, shutdown.clone()).await;

    shutdown.cancel();
    let _ = sweeper.await;
    served?;
    Ok(())
}
