//! SQLite session store.
//!
//! One row per session. Each `put` is a single upsert statement, so a row is
//! always either the old record or the new one.

use async_trait::async_trait;
use chatloop_core::error::StoreError;
use chatloop_core::session::{ExternalSession, SessionStatus, SessionStore};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open a store from a file path.
    ///
    /// The database and table are created automatically.
    /// Pass `":memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // An in-memory database exists per connection, so pin it to one.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS external_sessions (
                id           TEXT PRIMARY KEY NOT NULL,
                user_id      TEXT NOT NULL,
                server_url   TEXT NOT NULL,
                callback_url TEXT NOT NULL,
                status       TEXT NOT NULL,
                credentials  TEXT,
                pending      TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("external_sessions table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_external_sessions_user ON external_sessions(user_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("user_id index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<ExternalSession, StoreError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StoreError::Storage(format!("id column: {e}")))?;
        let corrupted = |reason: String| StoreError::Corrupted {
            id: id.clone(),
            reason,
        };

        let get_text = |col: &str| -> Result<String, StoreError> {
            row.try_get::<String, _>(col)
                .map_err(|e| corrupted(format!("{col} column: {e}")))
        };
        let get_opt = |col: &str| -> Result<Option<String>, StoreError> {
            row.try_get::<Option<String>, _>(col)
                .map_err(|e| corrupted(format!("{col} column: {e}")))
        };
        let parse_time = |col: &str| -> Result<DateTime<Utc>, StoreError> {
            let raw = get_text(col)?;
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| corrupted(format!("{col}: {e}")))
        };

        let status = SessionStatus::from_str(&get_text("status")?).map_err(&corrupted)?;
        let credentials = get_opt("credentials")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| corrupted(format!("credentials: {e}")))?;
        let pending = get_opt("pending")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| corrupted(format!("pending: {e}")))?;

        Ok(ExternalSession {
            id: id.clone(),
            user_id: get_text("user_id")?,
            server_url: get_text("server_url")?,
            callback_url: get_text("callback_url")?,
            status,
            credentials,
            pending,
            created_at: parse_time("created_at")?,
            updated_at: parse_time("updated_at")?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, session: &ExternalSession) -> Result<(), StoreError> {
        let credentials = session
            .credentials
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("credentials serialization: {e}")))?;
        let pending = session
            .pending
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("pending serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO external_sessions
                (id, user_id, server_url, callback_url, status, credentials, pending, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                credentials = excluded.credentials,
                pending = excluded.pending,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.server_url)
        .bind(&session.callback_url)
        .bind(session.status.as_str())
        .bind(credentials)
        .bind(pending)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT failed: {e}")))?;

        debug!(session_id = %session.id, status = %session.status, "Stored session");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExternalSession>, StoreError> {
        let row = sqlx::query("SELECT * FROM external_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("SELECT failed: {e}")))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM external_sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_all(&self) -> Result<Vec<ExternalSession>, StoreError> {
        let rows = sqlx::query("SELECT * FROM external_sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("SELECT failed: {e}")))?;
        rows.iter().map(Self::row_to_session).collect()
    }
}
