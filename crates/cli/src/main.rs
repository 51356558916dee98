//! Chatloop CLI: the main entry point.
//!
//! Commands:
//! - `run`      : Run the step loop once for a message
//! - `serve`    : Start the HTTP gateway (OAuth callbacks, session API)
//! - `sessions` : Inspect and manage external tool-server sessions
//! - `config`   : Show, validate, or initialize configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "chatloop",
    about = "Chatloop: bounded tool-using model runs",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent on a single message
    Run {
        /// The user message
        #[arg(short, long)]
        message: String,

        /// Override the step budget
        #[arg(long)]
        max_steps: Option<u32>,

        /// Override the system instruction
        #[arg(long)]
        system: Option<String>,

        /// User on whose behalf external tool servers are connected
        #[arg(long, default_value = "local")]
        user: String,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage external tool-server sessions
    Sessions {
        #[command(subcommand)]
        action: commands::sessions::SessionsAction,
    },

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        action: Option<commands::config_cmd::ConfigAction>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            message,
            max_steps,
            system,
            user,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                message,
                max_steps,
                system,
                user,
                json,
            })
            .await?
        }
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Sessions { action } => commands::sessions::run(action).await?,
        Commands::Config { action } => commands::config_cmd::run(action)?,
    }

    Ok(())
}
