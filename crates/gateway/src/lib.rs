//! HTTP gateway for Chatloop.
//!
//! Hosts the OAuth redirect target that completes tool-server
//! authorizations, plus a small session-management API over the broker.
//!
//! Built on Axum.

pub mod sessions;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chatloop_broker::{CallbackParams, ExternalSessionBroker};
use chatloop_core::error::BrokerError;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub broker: Arc<ExternalSessionBroker>,
    /// Default staleness cutoff for `POST /v1/sessions/sweep`
    pub session_max_age: chrono::Duration,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl GatewayState {
    pub fn new(broker: Arc<ExternalSessionBroker>, session_max_age: chrono::Duration) -> Self {
        Self {
            broker,
            session_max_age,
            started_at: chrono::Utc::now(),
        }
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth/callback", get(oauth_callback_handler))
        .route("/v1/sessions", get(sessions::list_handler))
        .route("/v1/sessions/sweep", post(sessions::sweep_handler))
        .route(
            "/v1/sessions/{id}",
            get(sessions::get_handler).delete(sessions::disconnect_handler),
        )
        .route("/v1/sessions/{id}/tools", get(sessions::tools_handler))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    state: SharedState,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Errors ---

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    error: String,
}

/// Errors rendered as JSON with a matching status.
pub(crate) enum ApiError {
    Broker(BrokerError),
    BadRequest(String),
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err)
    }
}

pub(crate) fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Authorization(_) | BrokerError::InvalidState { .. } => StatusCode::BAD_REQUEST,
        BrokerError::NotConnected(_) => StatusCode::CONFLICT,
        BrokerError::Connection { .. } | BrokerError::Protocol(_) | BrokerError::ToolFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::Broker(err) => (status_for(&err), err.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        if status.is_server_error() {
            warn!(error = %error, "Request failed");
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
    store: String,
    uptime_secs: i64,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.broker.session_count().await,
        store: state.broker.store_name().to_string(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// The redirect target of the tool server's authorization page.
///
/// A human lands here, so the response is a short HTML page.
async fn oauth_callback_handler(
    State(state): State<SharedState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.broker.handle_callback(params).await {
        Ok(session_id) => {
            info!(session_id = %session_id, "Authorization completed via callback");
            (
                StatusCode::OK,
                Html(page(
                    "Authorization complete",
                    "The tool server is connected. You can close this window.",
                )),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "Authorization callback failed");
            let status = match status_for(&err) {
                StatusCode::NOT_FOUND => StatusCode::BAD_REQUEST,
                other => other,
            };
            (status, Html(page("Authorization failed", &err.to_string()))).into_response()
        }
    }
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chatloop_broker::testing::ScriptedConnector;
    use chatloop_core::session::SessionStatus;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(state(ScriptedConnector::oauth()));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn callback_success_connects_the_session() {
        let state = state(ScriptedConnector::oauth());
        let session_id = pending_session(&state, "alice").await;
        let app = build_router(state.clone());

        let uri = format!("/oauth/callback?state={session_id}&code=good-code");
        let response = app.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("Authorization complete"));
        let session = state.broker.get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn callback_with_error_marks_session_disconnected() {
        let state = state(ScriptedConnector::oauth());
        let session_id = pending_session(&state, "alice").await;
        let app = build_router(state.clone());

        let uri = format!("/oauth/callback?state={session_id}&error=access_denied&error_description=nope");
        let response = app.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("access_denied"));
        let session = state.broker.get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let app = build_router(state(ScriptedConnector::oauth()));
        let response = app
            .oneshot(get("/oauth/callback?state=nope&code=good-code"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn callback_with_bad_code_is_rejected() {
        let state = state(ScriptedConnector::oauth());
        let session_id = pending_session(&state, "alice").await;
        let app = build_router(state);
        let response = app
            .oneshot(get(&format!("/oauth/callback?state={session_id}&code=stolen")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<b>&\""), "&lt;b&gt;&amp;&quot;");
    }
}
