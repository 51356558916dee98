//! `chatloop config`: configuration management.

use super::runtime::CmdResult;
use chatloop_config::AppConfig;
use clap::Subcommand;

#[derive(Subcommand, Default)]
pub enum ConfigAction {
    /// Print the effective configuration (keys redacted)
    #[default]
    Show,

    /// Validate the configuration file
    Validate,

    /// Write a default config file if none exists
    Init,
}

pub fn run(action: Option<ConfigAction>) -> CmdResult<()> {
    let path = AppConfig::config_dir().join("config.toml");
    match action.unwrap_or_default() {
        ConfigAction::Show => {
            let config = AppConfig::load()?;
            println!("# {}", path.display());
            println!("{config:#?}");
        }
        ConfigAction::Validate => match AppConfig::load() {
            Ok(config) => {
                println!("Config OK ({})", path.display());
                if !config.has_api_key() {
                    println!("  warning: no API key set");
                }
                println!("  model:      {}", config.provider.model);
                println!("  max_steps:  {}", config.agent.max_steps);
                println!("  store:      {:?}", config.broker.store);
                println!("  callback:   {}", config.gateway.callback_url());
            }
            Err(e) => return Err(format!("Config error: {e}").into()),
        },
        ConfigAction::Init => {
            if path.exists() {
                println!("Config already exists at {}", path.display());
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, AppConfig::default_toml())?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
