//! The external-session broker.
//!
//! Each session lives in its own slot guarded by a `tokio::sync::Mutex`, so
//! updates to one session are serialized while different sessions proceed
//! in parallel. A mutation writes the new record to the durable store first
//! and only then replaces the in-memory copy; a failed write leaves the
//! session exactly as it was.

use crate::audit::{AuditEntry, AuditLog};
use crate::transport::{
    CallbackParams, ConnectOutcome, ConnectRequest, Handshake, ToolDescriptor, ToolServerConnector,
    ToolServerTransport,
};
use chatloop_core::error::BrokerError;
use chatloop_core::session::{Credentials, ExternalSession, SessionStatus, SessionStore};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

struct Slot {
    session: ExternalSession,
    transport: Option<Arc<dyn ToolServerTransport>>,
    /// Set by the sweeper; holders of a stale `Arc` must treat the
    /// session as gone.
    removed: bool,
}

impl Slot {
    fn new(session: ExternalSession, transport: Option<Arc<dyn ToolServerTransport>>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            session,
            transport,
            removed: false,
        }))
    }
}

pub struct ExternalSessionBroker {
    connector: Arc<dyn ToolServerConnector>,
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
    audit: AuditLog,
}

impl ExternalSessionBroker {
    pub fn new(connector: Arc<dyn ToolServerConnector>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            connector,
            store,
            sessions: RwLock::new(HashMap::new()),
            audit: AuditLog::new(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Load every stored session into memory. Transports are not opened
    /// here; connected sessions reopen on first use.
    pub async fn recover(&self) -> Result<usize, BrokerError> {
        let records = self.store.load_all().await?;
        let mut sessions = self.sessions.write().await;
        let mut recovered = 0;
        for session in records {
            if sessions.contains_key(&session.id) {
                continue;
            }
            sessions.insert(session.id.clone(), Slot::new(session, None));
            recovered += 1;
        }
        info!(recovered, store = self.store.name(), "Recovered external sessions");
        Ok(recovered)
    }

    /// Start a connection to `server_url` for `user_id`.
    ///
    /// Without credentials the server may ask for interactive authorization,
    /// in which case the session is stored as `pending_auth` and the caller
    /// gets an authorization URL. With credentials the session is either
    /// connected immediately or nothing is retained.
    pub async fn initiate_connection(
        &self,
        user_id: &str,
        server_url: &str,
        callback_url: &str,
        credentials: Option<Credentials>,
    ) -> Result<ConnectOutcome, BrokerError> {
        validate_server_url(server_url)?;

        let mut session =
            ExternalSession::new(user_id, server_url, callback_url, SessionStatus::PendingAuth);
        let request = ConnectRequest {
            server_url,
            callback_url,
            state: &session.id,
            credentials: credentials.as_ref(),
        };

        let handshake = self.connector.connect(request).await.inspect_err(|e| {
            warn!(server_url, user_id, error = %e, "Tool server handshake failed");
        })?;

        match handshake {
            Handshake::Connected(transport) => {
                session.status = SessionStatus::Connected;
                session.credentials = credentials;
                if let Err(e) = self.store.put(&session).await {
                    transport.close().await;
                    return Err(e.into());
                }

                let session_id = session.id.clone();
                self.sessions
                    .write()
                    .await
                    .insert(session_id.clone(), Slot::new(session, Some(transport)));
                info!(session_id = %session_id, user_id, server_url, "External session connected");
                Ok(ConnectOutcome::Connected { session_id })
            }
            Handshake::AuthRequired(_) if credentials.is_some() => Err(BrokerError::Authorization(
                "server requires interactive authorization; supplied credentials were not accepted"
                    .into(),
            )),
            Handshake::AuthRequired(pending) => {
                let authorization_url = pending.authorization_url.clone();
                session.pending = Some(pending);
                self.store.put(&session).await?;

                let session_id = session.id.clone();
                self.sessions
                    .write()
                    .await
                    .insert(session_id.clone(), Slot::new(session, None));
                info!(session_id = %session_id, user_id, server_url, "External session awaiting authorization");
                Ok(ConnectOutcome::RequiresAuth {
                    session_id,
                    authorization_url,
                })
            }
        }
    }

    /// Exchange an authorization code and move the session to `connected`.
    /// On any failure the session stays `pending_auth`.
    pub async fn complete_authorization(&self, session_id: &str, code: &str) -> Result<(), BrokerError> {
        let mut slot = self.lock_slot(session_id).await?;
        if slot.session.status != SessionStatus::PendingAuth {
            return Err(BrokerError::InvalidState {
                session_id: session_id.into(),
                status: slot.session.status.to_string(),
                expected: SessionStatus::PendingAuth.to_string(),
            });
        }
        let pending = slot.session.pending.clone().ok_or_else(|| {
            BrokerError::Protocol(format!("session {session_id} has no pending authorization"))
        })?;

        let credentials = self
            .connector
            .exchange_code(&pending, code)
            .await
            .inspect_err(|e| warn!(session_id, error = %e, "Authorization code exchange failed"))?;

        let mut next = slot.session.clone();
        next.status = SessionStatus::Connected;
        next.credentials = Some(credentials);
        next.pending = None;
        next.updated_at = Utc::now();
        self.commit(&mut slot, next).await?;

        info!(session_id, "External session authorized");
        Ok(())
    }

    /// Handle the OAuth redirect. Returns the session id on success.
    ///
    /// A redirect carrying `error` ends the pending session as
    /// `disconnected` and reports the reason as an authorization failure.
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<String, BrokerError> {
        if let Some(error) = params.error {
            let reason = match params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            let mut slot = self.lock_slot(&params.state).await?;
            if slot.session.status == SessionStatus::PendingAuth {
                let mut next = slot.session.clone();
                next.status = SessionStatus::Disconnected;
                next.pending = None;
                next.updated_at = Utc::now();
                self.commit(&mut slot, next).await?;
            }
            warn!(session_id = %params.state, reason = %reason, "Authorization denied at callback");
            return Err(BrokerError::Authorization(reason));
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BrokerError::Authorization("callback carried neither code nor error".into()))?;
        self.complete_authorization(&params.state, &code).await?;
        Ok(params.state)
    }

    pub async fn list_tools(&self, session_id: &str) -> Result<Vec<ToolDescriptor>, BrokerError> {
        let slot = self.lock_slot(session_id).await?;
        let transport = self.connected_transport(slot).await?;
        transport.list_tools().await
    }

    /// Invoke a remote tool. Every invocation, including one refused for a
    /// session that is not connected, is written to the audit log.
    pub async fn call_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, BrokerError> {
        let slot = self.lock_slot(session_id).await?;
        let mut audit = AuditOnDrop {
            audit: &self.audit,
            session_id,
            user_id: slot.session.user_id.clone(),
            tool_name,
            outcome: None,
        };

        let result = match self.connected_transport(slot).await {
            Ok(transport) => transport.call_tool(tool_name, arguments).await,
            Err(e) => Err(e),
        };

        audit.outcome = Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        result
    }

    /// Move the session to `disconnected` and release its transport.
    /// Disconnecting an already-disconnected session is a no-op.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), BrokerError> {
        let mut slot = self.lock_slot(session_id).await?;
        if slot.session.status == SessionStatus::Disconnected {
            debug!(session_id, "Session already disconnected");
            return Ok(());
        }

        let mut next = slot.session.clone();
        next.status = SessionStatus::Disconnected;
        next.credentials = None;
        next.pending = None;
        next.updated_at = Utc::now();
        self.commit(&mut slot, next).await?;

        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
        info!(session_id, "External session disconnected");
        Ok(())
    }

    /// Delete every session last updated more than `max_age` ago, whatever
    /// its status, from both memory and the store. Returns how many were
    /// removed.
    pub async fn sweep(&self, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut removed = 0;
        for (id, slot) in slots {
            let mut guard = slot.lock().await;
            if guard.removed || !guard.session.is_stale(max_age, now) {
                continue;
            }
            if let Err(e) = self.store.delete(&id).await {
                warn!(session_id = %id, error = %e, "Failed to delete stale session; keeping it");
                continue;
            }
            guard.removed = true;
            if let Some(transport) = guard.transport.take() {
                transport.close().await;
            }
            self.sessions.write().await.remove(&id);
            removed += 1;
        }

        // Records in the store that were never loaded into memory.
        match self.store.load_all().await {
            Ok(records) => {
                for session in records {
                    if !session.is_stale(max_age, now)
                        || self.sessions.read().await.contains_key(&session.id)
                    {
                        continue;
                    }
                    match self.store.delete(&session.id).await {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(e) => warn!(session_id = %session.id, error = %e, "Failed to delete stale session"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to scan session store during sweep"),
        }

        if removed > 0 {
            info!(removed, "Swept stale external sessions");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: chrono::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        broker.sweep(max_age).await;
                    }
                }
            }
        })
    }

    /// A redacted snapshot of one session.
    pub async fn get_session(&self, session_id: &str) -> Result<ExternalSession, BrokerError> {
        let slot = self.lock_slot(session_id).await?;
        Ok(slot.session.redacted())
    }

    /// Redacted snapshots of a user's sessions, oldest first.
    pub async fn list_sessions(&self, user_id: &str) -> Vec<ExternalSession> {
        let slots: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            if !guard.removed && guard.session.user_id == user_id {
                out.push(guard.session.redacted());
            }
        }
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lock_slot(&self, session_id: &str) -> Result<OwnedMutexGuard<Slot>, BrokerError> {
        let slot = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.into()))?;
        let guard = slot.lock_owned().await;
        if guard.removed {
            return Err(BrokerError::SessionNotFound(session_id.into()));
        }
        Ok(guard)
    }

    /// Store first, then memory.
    async fn commit(&self, slot: &mut Slot, next: ExternalSession) -> Result<(), BrokerError> {
        self.store.put(&next).await?;
        slot.session = next;
        Ok(())
    }

    /// The transport of a connected session, opened on first use. The slot
    /// lock is released before the caller performs any remote call.
    async fn connected_transport(
        &self,
        mut slot: OwnedMutexGuard<Slot>,
    ) -> Result<Arc<dyn ToolServerTransport>, BrokerError> {
        if !slot.session.is_connected() {
            return Err(BrokerError::NotConnected(slot.session.id.clone()));
        }
        if let Some(transport) = &slot.transport {
            return Ok(transport.clone());
        }

        debug!(session_id = %slot.session.id, "Reopening tool server transport");
        let transport = self
            .connector
            .open(&slot.session.server_url, slot.session.credentials.as_ref())
            .await?;
        slot.transport = Some(transport.clone());
        Ok(transport)
    }
}

/// Writes the audit entry for one `call_tool` when dropped. A call whose
/// future is dropped before the server answers is recorded as failed.
struct AuditOnDrop<'a> {
    audit: &'a AuditLog,
    session_id: &'a str,
    user_id: String,
    tool_name: &'a str,
    outcome: Option<Result<(), String>>,
}

impl Drop for AuditOnDrop<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err("call abandoned before the server answered".into()));
        self.audit.record(AuditEntry {
            timestamp: Utc::now(),
            session_id: self.session_id.into(),
            user_id: std::mem::take(&mut self.user_id),
            tool_name: self.tool_name.into(),
            success: outcome.is_ok(),
            error: outcome.err(),
        });
    }
}

fn validate_server_url(server_url: &str) -> Result<(), BrokerError> {
    let invalid = |reason: String| BrokerError::Connection {
        server_url: server_url.into(),
        reason,
    };
    let url = Url::parse(server_url).map_err(|e| invalid(format!("invalid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FAILING_TOOL, SLOW_TOOL, ScriptedConnector};
    use async_trait::async_trait;
    use chatloop_core::error::StoreError;
    use chatloop_store::InMemorySessionStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SERVER: &str = "https://tools.example.com/mcp";
    const CALLBACK: &str = "https://app.example.com/oauth/callback";

    fn broker_with(connector: Arc<ScriptedConnector>) -> (ExternalSessionBroker, InMemorySessionStore) {
        let store = InMemorySessionStore::new();
        let broker = ExternalSessionBroker::new(connector, Arc::new(store.clone()))
            .with_audit(AuditLog::with_sinks(vec![]));
        (broker, store)
    }

    async fn pending_session(broker: &ExternalSessionBroker) -> (String, String) {
        match broker.initiate_connection("alice", SERVER, CALLBACK, None).await.unwrap() {
            ConnectOutcome::RequiresAuth {
                session_id,
                authorization_url,
            } => (session_id, authorization_url),
            other => panic!("expected RequiresAuth, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oauth_handshake_reaches_connected() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, store) = broker_with(connector.clone());

        let (session_id, url) = pending_session(&broker).await;
        assert!(url.contains(&format!("state={session_id}")));

        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::PendingAuth);
        assert!(stored.pending.is_some());

        broker
            .complete_authorization(&session_id, connector.accepted_code())
            .await
            .unwrap();

        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
        assert!(stored.pending.is_none());
        assert!(matches!(stored.credentials, Some(Credentials::OAuth { .. })));

        let tools = broker.list_tools(&session_id).await.unwrap();
        assert!(tools.iter().any(|t| t.name == "echo"));
    }

    #[tokio::test]
    async fn invalid_code_leaves_session_pending() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, store) = broker_with(connector);
        let (session_id, _) = pending_session(&broker).await;

        let err = broker.complete_authorization(&session_id, "expired").await.unwrap_err();
        assert!(matches!(err, BrokerError::Authorization(_)));

        let snapshot = broker.get_session(&session_id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::PendingAuth);
        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::PendingAuth);
        assert!(stored.pending.is_some());
    }

    #[tokio::test]
    async fn completing_a_connected_session_is_invalid_state() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let (session_id, _) = pending_session(&broker).await;
        broker
            .complete_authorization(&session_id, connector.accepted_code())
            .await
            .unwrap();

        let exchanges_before = connector.counters.exchanges.load(Ordering::SeqCst);
        let err = broker
            .complete_authorization(&session_id, connector.accepted_code())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState { .. }));
        assert_eq!(connector.counters.exchanges.load(Ordering::SeqCst), exchanges_before);
    }

    #[tokio::test]
    async fn pending_session_refuses_tools_without_io() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let (session_id, _) = pending_session(&broker).await;
        let io_before = connector.counters.io();

        let err = broker.list_tools(&session_id).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));
        let err = broker.call_tool(&session_id, "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));

        assert_eq!(connector.counters.io(), io_before);
        let audit = broker.audit().entries_for_session(&session_id);
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
    }

    #[tokio::test]
    async fn tool_calls_are_audited() {
        let connector = Arc::new(ScriptedConnector::open_server());
        let (broker, _) = broker_with(connector);
        let outcome = broker.initiate_connection("bob", SERVER, CALLBACK, None).await.unwrap();
        let ConnectOutcome::Connected { session_id } = outcome else {
            panic!("expected Connected");
        };

        let out = broker
            .call_tool(&session_id, "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out["echo"]["x"], 1);

        let err = broker.call_tool(&session_id, FAILING_TOOL, json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::ToolFailed { .. }));

        let audit = broker.audit().entries_for_session(&session_id);
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].tool_name, "echo");
        assert!(audit[0].success);
        assert_eq!(audit[0].user_id, "bob");
        assert!(!audit[1].success);
        assert!(audit[1].error.as_deref().unwrap().contains("scripted failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_tool_call_is_audited_as_failed() {
        let connector = Arc::new(ScriptedConnector::open_server());
        let (broker, _) = broker_with(connector.clone());
        let outcome = broker.initiate_connection("bob", SERVER, CALLBACK, None).await.unwrap();
        let ConnectOutcome::Connected { session_id } = outcome else {
            panic!("expected Connected");
        };

        let call = broker.call_tool(&session_id, SLOW_TOOL, json!({}));
        let timed_out = tokio::time::timeout(Duration::from_secs(5), call).await;
        assert!(timed_out.is_err());
        assert_eq!(connector.counters.tool_calls.load(Ordering::SeqCst), 1);

        let audit = broker.audit().entries_for_session(&session_id);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].tool_name, SLOW_TOOL);
        assert!(!audit[0].success);
        assert!(audit[0].error.as_deref().unwrap().contains("abandoned"));
    }

    #[tokio::test]
    async fn direct_credentials_connect_immediately() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, store) = broker_with(connector.clone());
        let creds = Credentials::ApiKey {
            key: connector.accepted_key().into(),
        };

        let outcome = broker
            .initiate_connection("carol", SERVER, CALLBACK, Some(creds))
            .await
            .unwrap();
        let ConnectOutcome::Connected { session_id } = outcome else {
            panic!("expected Connected");
        };
        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);

        // The handshake transport is reused.
        broker.list_tools(&session_id).await.unwrap();
        assert_eq!(connector.counters.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_retain_nothing() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, store) = broker_with(connector);

        let err = broker
            .initiate_connection(
                "carol",
                SERVER,
                CALLBACK,
                Some(Credentials::ApiKey { key: "wrong".into() }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authorization(_)));
        assert_eq!(broker.session_count().await, 0);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn network_failure_is_a_connection_error() {
        let connector = Arc::new(ScriptedConnector::oauth());
        connector.set_unreachable(true);
        let (broker, store) = broker_with(connector);

        let err = broker
            .initiate_connection("dave", SERVER, CALLBACK, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection { .. }));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn invalid_server_url_is_rejected_before_io() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let err = broker
            .initiate_connection("dave", "ftp://tools.example.com", CALLBACK, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection { .. }));
        assert_eq!(connector.counters.io(), 0);
    }

    #[tokio::test]
    async fn callback_error_marks_session_disconnected() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, store) = broker_with(connector);
        let (session_id, _) = pending_session(&broker).await;

        let err = broker
            .handle_callback(CallbackParams {
                state: session_id.clone(),
                error: Some("access_denied".into()),
                error_description: Some("user declined".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access_denied"));

        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert!(stored.pending.is_none());
    }

    #[tokio::test]
    async fn callback_with_code_connects() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let (session_id, _) = pending_session(&broker).await;

        let returned = broker
            .handle_callback(CallbackParams {
                state: session_id.clone(),
                code: Some(connector.accepted_code().into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(returned, session_id);
        assert!(broker.get_session(&session_id).await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let connector = Arc::new(ScriptedConnector::open_server());
        let (broker, store) = broker_with(connector.clone());
        let outcome = broker.initiate_connection("erin", SERVER, CALLBACK, None).await.unwrap();
        let session_id = outcome.session_id().to_string();

        broker.disconnect(&session_id).await.unwrap();
        broker.disconnect(&session_id).await.unwrap();
        assert_eq!(connector.counters.closes.load(Ordering::SeqCst), 1);

        let stored = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert!(matches!(
            broker.call_tool(&session_id, "echo", json!({})).await,
            Err(BrokerError::NotConnected(_))
        ));
        assert!(matches!(
            broker.disconnect("no-such-session").await,
            Err(BrokerError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_removes_stale_sessions_everywhere() {
        let connector = Arc::new(ScriptedConnector::open_server());
        let (broker, store) = broker_with(connector);

        let mut stale = ExternalSession::new("frank", SERVER, CALLBACK, SessionStatus::Connected);
        stale.updated_at = Utc::now() - chrono::Duration::hours(3);
        store.put(&stale).await.unwrap();
        let mut orphan = ExternalSession::new("frank", SERVER, CALLBACK, SessionStatus::PendingAuth);
        orphan.updated_at = Utc::now() - chrono::Duration::hours(5);

        broker.recover().await.unwrap();
        // Written after recovery, so only the store knows about it.
        store.put(&orphan).await.unwrap();
        let fresh = broker.initiate_connection("frank", SERVER, CALLBACK, None).await.unwrap();

        let removed = broker.sweep(chrono::Duration::hours(1)).await;
        assert_eq!(removed, 2);

        assert!(store.get(&stale.id).await.unwrap().is_none());
        assert!(store.get(&orphan.id).await.unwrap().is_none());
        assert!(matches!(
            broker.get_session(&stale.id).await,
            Err(BrokerError::SessionNotFound(_))
        ));
        let remaining = broker.list_sessions("frank").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.session_id());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let connector = Arc::new(ScriptedConnector::open_server());
        let (broker, store) = broker_with(connector);
        let broker = Arc::new(broker);

        let mut stale = ExternalSession::new("gina", SERVER, CALLBACK, SessionStatus::Disconnected);
        stale.updated_at = Utc::now() - chrono::Duration::days(30);
        store.put(&stale).await.unwrap();
        broker.recover().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = broker.spawn_sweeper(Duration::from_secs(60), chrono::Duration::days(7), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(broker.session_count().await, 0);
        assert_eq!(store.len().await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recovered_sessions_reopen_lazily() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let store = InMemorySessionStore::new();
        let mut session = ExternalSession::new("hank", SERVER, CALLBACK, SessionStatus::Connected);
        session.credentials = Some(Credentials::ApiKey {
            key: connector.accepted_key().into(),
        });
        store.put(&session).await.unwrap();

        let broker = ExternalSessionBroker::new(connector.clone(), Arc::new(store));
        assert_eq!(broker.recover().await.unwrap(), 1);
        assert_eq!(connector.counters.opens.load(Ordering::SeqCst), 0);

        broker.list_tools(&session.id).await.unwrap();
        broker.call_tool(&session.id, "echo", json!({})).await.unwrap();
        assert_eq!(connector.counters.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshots_are_redacted_and_scoped_to_user() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let outcome = broker
            .initiate_connection(
                "ivy",
                SERVER,
                CALLBACK,
                Some(Credentials::ApiKey {
                    key: connector.accepted_key().into(),
                }),
            )
            .await
            .unwrap();
        pending_session(&broker).await;

        let snapshot = broker.get_session(outcome.session_id()).await.unwrap();
        assert!(snapshot.credentials.is_none());
        assert_eq!(broker.list_sessions("ivy").await.len(), 1);
        assert_eq!(broker.list_sessions("alice").await.len(), 1);
        assert!(broker.list_sessions("nobody").await.is_empty());
    }

    /// Delegates to an in-memory store but can be told to fail writes.
    struct FlakyStore {
        inner: InMemorySessionStore,
        fail_puts: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn put(&self, session: &ExternalSession) -> Result<(), StoreError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("disk full".into()));
            }
            self.inner.put(session).await
        }

        async fn get(&self, id: &str) -> Result<Option<ExternalSession>, StoreError> {
            self.inner.get(id).await
        }

        async fn delete(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn load_all(&self) -> Result<Vec<ExternalSession>, StoreError> {
            self.inner.load_all().await
        }
    }

    #[tokio::test]
    async fn failed_store_write_leaves_memory_unchanged() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::new(),
            fail_puts: AtomicBool::new(false),
        });
        let broker = ExternalSessionBroker::new(connector.clone(), store.clone())
            .with_audit(AuditLog::with_sinks(vec![]));
        let (session_id, _) = pending_session(&broker).await;

        store.fail_puts.store(true, Ordering::SeqCst);
        let err = broker
            .complete_authorization(&session_id, connector.accepted_code())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Storage(_)));
        assert_eq!(
            broker.get_session(&session_id).await.unwrap().status,
            SessionStatus::PendingAuth
        );

        // Once storage recovers, the same code can still complete the flow.
        store.fail_puts.store(false, Ordering::SeqCst);
        broker
            .complete_authorization(&session_id, connector.accepted_code())
            .await
            .unwrap();
        assert!(broker.get_session(&session_id).await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn sessions_progress_independently() {
        let connector = Arc::new(ScriptedConnector::oauth());
        let (broker, _) = broker_with(connector.clone());
        let broker = Arc::new(broker);

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(pending_session(&broker).await.0);
        }

        let tasks: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let broker = broker.clone();
                let code = connector.accepted_code().to_string();
                tokio::spawn(async move { broker.complete_authorization(&id, &code).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for id in &ids {
            assert!(broker.get_session(id).await.unwrap().is_connected());
        }
    }
}
