//! File-based session store: a single JSON document on disk.
//!
//! Records are loaded into memory on creation and the whole document is
//! rewritten on every mutation. Writes go to a sibling temp file which is
//! then renamed over the original, so a crash mid-write leaves the previous
//! version intact.
//!
//! Storage location: `~/.chatloop/sessions.json`

use async_trait::async_trait;
use chatloop_core::error::StoreError;
use chatloop_core::session::{ExternalSession, SessionStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A file-backed session store.
pub struct FileSessionStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ExternalSession>>,
}

impl FileSessionStore {
    /// Open (or lazily create) a store at `path`.
    ///
    /// Unreadable individual records are skipped with a warning; an
    /// unparseable document is an error, so a corrupted file is never
    /// silently overwritten.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = Self::load_from_disk(&path).await?;
        debug!(path = %path.display(), count = records.len(), "File session store loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_from_disk(path: &Path) -> Result<BTreeMap<String, ExternalSession>, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
                id: path.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(raw
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value::<ExternalSession>(value) {
                Ok(session) => Some((id, session)),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping corrupted session record");
                    None
                }
            })
            .collect())
    }

    /// Write the whole document atomically (temp file + rename).
    async fn flush(&self, records: &BTreeMap<String, ExternalSession>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Storage(format!("Failed to create store directory: {e}"))
            })?;
        }

        let content = serde_json::to_vec_pretty(records)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize sessions: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to replace store file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn put(&self, session: &ExternalSession) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let previous = records.insert(session.id.clone(), session.clone());
        if let Err(e) = self.flush(&records).await {
            // Keep memory in step with disk.
            match previous {
                Some(prev) => records.insert(session.id.clone(), prev),
                None => records.remove(&session.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExternalSession>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let Some(previous) = records.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<ExternalSession>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
