//! Session-management routes under `/v1/sessions`.

use crate::{ApiError, SharedState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chatloop_broker::ToolDescriptor;
use chatloop_core::session::ExternalSession;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<ExternalSession>,
}

/// `GET /v1/sessions?user_id=`: the user's sessions, credentials redacted.
pub async fn list_handler(State(state): State<SharedState>, Query(query): Query<ListQuery>) -> Json<SessionList> {
    Json(SessionList {
        sessions: state.broker.list_sessions(&query.user_id).await,
    })
}

pub async fn get_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ExternalSession>, ApiError> {
    Ok(Json(state.broker.get_session(&id).await?))
}

/// `DELETE /v1/sessions/{id}`: idempotent once the session exists.
pub async fn disconnect_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.broker.disconnect(&id).await?;
    info!(session_id = %id, "Session disconnected via API");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ToolList {
    pub tools: Vec<ToolDescriptor>,
}

pub async fn tools_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ToolList>, ApiError> {
    Ok(Json(ToolList {
        tools: state.broker.list_tools(&id).await?,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepQuery {
    /// Overrides the configured staleness cutoff.
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub removed: usize,
}

/// `POST /v1/sessions/sweep[?max_age_hours=]`
pub async fn sweep_handler(
    State(state): State<SharedState>,
    Query(query): Query<SweepQuery>,
) -> Result<Json<SweepResponse>, ApiError> {
    let max_age = match query.max_age_hours {
        Some(hours) => i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .ok_or_else(|| ApiError::BadRequest(format!("max_age_hours {hours} is out of range")))?,
        None => state.session_max_age,
    };
    let removed = state.broker.sweep(max_age).await;
    info!(removed, "Sweep requested via API");
    Ok(Json(SweepResponse { removed }))
}

#[cfg(test)]
mod tests {
    use crate::build_router;
    use crate::test_support::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chatloop_broker::testing::ScriptedConnector;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn send(app: axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn lists_only_the_users_sessions() {
        let state = state(ScriptedConnector::oauth());
        pending_session(&state, "alice").await;
        pending_session(&state, "alice").await;
        pending_session(&state, "bob").await;

        let (status, body) = send(build_router(state), "GET", "/v1/sessions?user_id=alice").await;
        assert_eq!(status, StatusCode::OK);
        let sessions = body["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s["user_id"] == "alice"));
        assert!(sessions.iter().all(|s| s.get("pending").is_none()));
    }

    #[tokio::test]
    async fn get_unknown_session_is_404() {
        let (status, body) = send(build_router(state(ScriptedConnector::oauth())), "GET", "/v1/sessions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn delete_disconnects_and_is_idempotent() {
        let state = state(ScriptedConnector::oauth());
        let id = pending_session(&state, "alice").await;
        let uri = format!("/v1/sessions/{id}");

        let (status, _) = send(build_router(state.clone()), "DELETE", &uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(build_router(state.clone()), "DELETE", &uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(build_router(state), "GET", &uri).await;
        assert_eq!(body["status"], "disconnected");
    }

    #[tokio::test]
    async fn tools_require_a_connected_session() {
        let state = state(ScriptedConnector::oauth());
        let id = pending_session(&state, "alice").await;
        let (status, _) = send(build_router(state), "GET", &format!("/v1/sessions/{id}/tools")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn tools_of_connected_session() {
        let state = state(ScriptedConnector::open_server());
        let id = pending_session(&state, "alice").await;
        let (status, body) = send(build_router(state), "GET", &format!("/v1/sessions/{id}/tools")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn sweep_with_zero_age_removes_everything_stale() {
        let state = state(ScriptedConnector::oauth());
        pending_session(&state, "alice").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let (status, body) = send(build_router(state.clone()), "POST", "/v1/sessions/sweep?max_age_hours=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
        assert_eq!(state.broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_with_out_of_range_age_is_400() {
        let state = state(ScriptedConnector::oauth());
        pending_session(&state, "alice").await;

        let (status, body) = send(
            build_router(state.clone()),
            "POST",
            "/v1/sessions/sweep?max_age_hours=18446744073709551615",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));
        assert_eq!(state.broker.session_count().await, 1);
    }

    #[tokio::test]
    async fn sweep_with_default_age_keeps_fresh_sessions() {
        let state = state(ScriptedConnector::oauth());
        pending_session(&state, "alice").await;
        let (_, body) = send(build_router(state), "POST", "/v1/sessions/sweep").await;
        assert_eq!(body["removed"], 0);
    }
}
