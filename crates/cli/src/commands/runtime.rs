//! Shared wiring: session store and broker from configuration.

use chatloop_broker::{ExternalSessionBroker, HttpConnector};
use chatloop_config::{AppConfig, BrokerConfig, StoreKind};
use chatloop_core::session::SessionStore;
use chatloop_store::{FileSessionStore, InMemorySessionStore, SqliteSessionStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type CmdResult<T> = Result<T, Box<dyn std::error::Error>>;

pub async fn open_store(config: &BrokerConfig) -> CmdResult<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.store {
        StoreKind::Memory => Arc::new(InMemorySessionStore::new()),
        StoreKind::File => {
            let path = config.resolved_store_path();
            Arc::new(FileSessionStore::open(path).await?)
        }
        StoreKind::Sqlite => {
            let path = config.resolved_store_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteSessionStore::new(&path.to_string_lossy()).await?)
        }
    };
    Ok(store)
}

/// Build the broker and reload every persisted session.
pub async fn open_broker(config: &AppConfig) -> CmdResult<Arc<ExternalSessionBroker>> {
    let store = open_store(&config.broker).await?;
    let connector = HttpConnector::new(
        &config.broker.client_name,
        Duration::from_secs(config.broker.connect_timeout_secs),
    )?;
    let broker = Arc::new(ExternalSessionBroker::new(Arc::new(connector), store));
    let recovered = broker.recover().await?;
    info!(store = broker.store_name(), recovered, "Session broker ready");
    Ok(broker)
}

pub fn session_max_age(config: &BrokerConfig) -> CmdResult<chrono::Duration> {
    max_age_from_hours(config.session_max_age_hours)
}

pub fn max_age_from_hours(hours: u64) -> CmdResult<chrono::Duration> {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .ok_or_else(|| format!("max age of {hours} hours is out of range").into())
}

/// Sweep period from `sweep_interval_minutes`, at least one minute.
pub fn sweep_interval(config: &BrokerConfig) -> Duration {
    Duration::from_secs(config.sweep_interval_minutes.max(1).saturating_mul(60))
}
