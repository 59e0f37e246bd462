use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::detector::Detector;
use crate::pty::PtyBroker;
use crate::recorder::Recorder;
use crate::shutdown::{FinishSignal, ShutdownCoordinator};
use crate::state::{ConnectionState, SessionState};

/// Shared handles every HTTP/WebSocket handler needs.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<PtyBroker>,
    pub recorder: Arc<Recorder>,
    pub detector: Arc<Detector>,
    pub session_state: Arc<SessionState>,
    pub finish: FinishSignal,
    pub shutdown: ShutdownCoordinator,
    pub candidate_name: String,
}

/// Structured error responses for the reconnect endpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum ApiError {
    /// 400 - No token in the query string.
    MissingToken,
    /// 401 - Token does not match this session.
    InvalidToken,
    /// 409 - Session already has a live connection.
    SessionActive,
    /// 410 - Reconnect window has expired.
    WindowExpired,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingToken => StatusCode::BAD_REQUEST,
            ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::SessionActive => StatusCode::CONFLICT,
            ApiError::WindowExpired => StatusCode::GONE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::MissingToken => "missing_token",
            ApiError::InvalidToken => "invalid_token",
            ApiError::SessionActive => "session_active",
            ApiError::WindowExpired => "window_expired",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ApiError::MissingToken => "Missing reconnect token",
            ApiError::InvalidToken => "Invalid reconnect token",
            ApiError::SessionActive => "Session is already active",
            ApiError::WindowExpired => "Reconnection window expired",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Build the engine router: the WebSocket channel, the reconnect probe, and
/// the health check.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/reconnect", get(reconnect))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::ws::handle_socket(socket, state))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "candidate": state.candidate_name,
    }))
}

#[derive(Deserialize)]
struct ReconnectQuery {
    token: Option<String>,
}

/// `GET /reconnect?token=<opaque>`: authorize resuming a disconnected
/// session and hand back the terminal geometry plus the rolling output
/// buffer for replay.
async fn reconnect(
    Query(query): Query<ReconnectQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingToken)?;

    if !state.session_state.can_reconnect(&token) {
        return Err(match state.session_state.state() {
            ConnectionState::Expired => ApiError::WindowExpired,
            ConnectionState::Active => ApiError::SessionActive,
            ConnectionState::Disconnected => ApiError::InvalidToken,
        });
    }

    let size = state.session_state.terminal_size();
    let buffer = state.session_state.terminal_buffer();
    tracing::info!(
        token_prefix = &token[..8.min(token.len())],
        buffer_bytes = buffer.len(),
        "reconnection approved"
    );

    Ok(Json(serde_json::json!({
        "status": "ok",
        "message": "Reconnection allowed",
        "terminal": {
            "cols": size.cols,
            "rows": size.rows,
            "buffer": String::from_utf8_lossy(&buffer),
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt; // for oneshot()

    async fn test_router(reconnect_window: Duration) -> (Router, AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(
            dir.path().to_str().unwrap(),
            "apitest",
            reconnect_window,
        )
        .unwrap();
        let recorder = Recorder::new(manager.session_dir(), Duration::from_secs(60)).unwrap();
        let state = AppState {
            broker: Arc::new(PtyBroker::spawn("/bin/sh", 12345).unwrap()),
            recorder,
            detector: Arc::new(Detector::new(30)),
            session_state: manager.state(),
            finish: FinishSignal::new(),
            shutdown: ShutdownCoordinator::new(),
            candidate_name: "apitest".to_string(),
        };
        (router(state.clone()), state, dir)
    }

    async fn get_json(
        app: &Router,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_candidate() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        let (status, json) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["candidate"], "apitest");
        state.broker.close();
    }

    #[tokio::test]
    async fn reconnect_without_token_is_400() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        let (status, json) = get_json(&app, "/reconnect").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "missing_token");
        state.broker.close();
    }

    #[tokio::test]
    async fn reconnect_while_active_is_409() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        let token = state.session_state.reconnect_token().to_string();
        let (status, _) = get_json(&app, &format!("/reconnect?token={token}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        state.broker.close();
    }

    #[tokio::test]
    async fn reconnect_with_wrong_token_is_401() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        state.session_state.disconnect();
        let (status, json) = get_json(&app, "/reconnect?token=bogus").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "invalid_token");
        state.broker.close();
    }

    #[tokio::test]
    async fn reconnect_replays_rolling_buffer() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        state.session_state.update_terminal_buffer(b"$ echo restored\r\nrestored\r\n");
        state.session_state.update_terminal_size(120, 40);
        state.session_state.disconnect();

        let token = state.session_state.reconnect_token().to_string();
        let (status, json) = get_json(&app, &format!("/reconnect?token={token}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["message"], "Reconnection allowed");
        assert_eq!(json["terminal"]["cols"], 120);
        assert_eq!(json["terminal"]["rows"], 40);
        assert_eq!(json["terminal"]["buffer"], "$ echo restored\r\nrestored\r\n");
        state.broker.close();
    }

    #[tokio::test]
    async fn reconnect_after_window_is_410() {
        let (app, state, _dir) = test_router(Duration::from_millis(20)).await;
        state.session_state.disconnect();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let token = state.session_state.reconnect_token().to_string();
        let (status, json) = get_json(&app, &format!("/reconnect?token={token}")).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(json["error"]["code"], "window_expired");
        state.broker.close();
    }

    #[tokio::test]
    async fn ws_route_exists() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        // Without an upgrade handshake the route still answers (not 404).
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        state.broker.close();
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (app, state, _dir) = test_router(Duration::from_secs(300)).await;
        let (status, _) = get_json(&app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        state.broker.close();
    }
}
