//! In-memory store: useful for testing and ephemeral deployments.

use async_trait::async_trait;
use chatloop_core::error::StoreError;
use chatloop_core::session::{ExternalSession, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A store that keeps records in a map and forgets them on exit.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    records: Arc<RwLock<HashMap<String, ExternalSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, session: &ExternalSession) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExternalSession>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn load_all(&self) -> Result<Vec<ExternalSession>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloop_core::session::SessionStatus;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemorySessionStore::new();
        let session = ExternalSession::new("u1", "https://a", "https://cb", SessionStatus::PendingAuth);

        store.put(&session).await.unwrap();
        assert_eq!(store.get(&session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(store.len().await, 1);

        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
        assert!(store.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_replaces_existing_record() {
        let store = InMemorySessionStore::new();
        let mut session = ExternalSession::new("u1", "https://a", "https://cb", SessionStatus::PendingAuth);
        store.put(&session).await.unwrap();

        session.status = SessionStatus::Connected;
        store.put(&session).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SessionStatus::Connected);
    }
}
