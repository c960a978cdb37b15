//! HTTP handlers

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::db::Database;
use crate::hub::{serve_socket, HubHandle, MAX_FRAME_SIZE};
use crate::models::OwnerId;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Live-connection hub
    pub hub: HubHandle,
    /// Backends probed by `/health`; `None` reports them as unavailable
    pub db: Option<Database>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `unavailable`
    pub status: String,
    /// Crate version
    pub version: String,
    /// Registered live connections
    pub connections: usize,
}

/// Health check endpoint: 200 while Redis and Postgres answer, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Health check failed");
                false
            }
        },
        None => false,
    };

    let (code, status) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: state.hub.connection_count(),
        }),
    )
}

/// Query parameters of the live-connection handshake
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Owner the connection belongs to
    pub user_id: Option<String>,
}

/// Upgrade to a live connection for `?user_id=`
pub async fn connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(owner) = params.user_id.as_deref().and_then(OwnerId::parse) else {
        return error_response(StatusCode::BAD_REQUEST, "user_id is required");
    };

    if state.hub.is_shut_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    debug!(owner = %owner, "Upgrading live connection");
    let hub = state.hub.clone();
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_socket(hub, socket, owner))
}

fn error_response(code: StatusCode, message: &str) -> Response {
    (code, Json(json!({ "error": message }))).into_response()
}
