//! `chatloop sessions`: inspect and manage tool-server sessions.

use super::runtime::{CmdResult, max_age_from_hours, open_broker, session_max_age};
use chatloop_config::AppConfig;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum SessionsAction {
    /// List a user's sessions
    List {
        #[arg(long)]
        user: String,
    },

    /// Delete sessions that have not been updated recently
    Sweep {
        /// Override `broker.session_max_age_hours`
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Disconnect a session and drop its credentials
    Disconnect { id: String },
}

pub async fn run(action: SessionsAction) -> CmdResult<()> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let broker = open_broker(&config).await?;

    match action {
        SessionsAction::List { user } => {
            let sessions = broker.list_sessions(&user).await;
            if sessions.is_empty() {
                println!("No sessions for {user}.");
            }
            for s in sessions {
                println!(
                    "{}  {:<13} {}  (updated {})",
                    s.id,
                    s.status,
                    s.server_url,
                    s.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SessionsAction::Sweep { max_age_hours } => {
            let max_age = match max_age_hours {
                Some(hours) => max_age_from_hours(hours)?,
                None => session_max_age(&config.broker)?,
            };
            let removed = broker.sweep(max_age).await;
            println!("Removed {removed} stale session(s).");
        }
        SessionsAction::Disconnect { id } => {
            broker.disconnect(&id).await?;
            println!("Disconnected {id}.");
        }
    }
    Ok(())
}
