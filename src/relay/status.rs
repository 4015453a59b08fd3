//! Read-only HTTP status endpoint

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::relay::server::{RelayEngine, RelayStats};
use crate::relay::session::SessionSummary;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    #[serde(flatten)]
    pub stats: RelayStats,
    pub sessions: Vec<SessionSummary>,
}

/// Get relay status
pub async fn get_status(State(engine): State<Arc<RelayEngine>>) -> Json<ApiResponse<StatusSnapshot>> {
    let started_at = engine.started_at();
    let status = StatusSnapshot {
        started_at,
        uptime_seconds: (Utc::now() - started_at).num_seconds(),
        stats: engine.stats(),
        sessions: engine.sessions().summaries(),
    };
    Json(ApiResponse::ok(status))
}

/// Get one session
pub async fn get_session(
    State(engine): State<Arc<RelayEngine>>,
    Path(session_id): Path<i32>,
) -> (StatusCode, Json<ApiResponse<SessionSummary>>) {
    match engine.session(session_id) {
        Some(summary) => (StatusCode::OK, Json(ApiResponse::ok(summary))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session {session_id}"))),
        ),
    }
}

pub fn router(engine: Arc<RelayEngine>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/status/sessions/:session_id", get(get_session))
        .with_state(engine)
}

/// Serve the status endpoint until `shutdown` completes
pub async fn serve<F>(bind: SocketAddr, engine: Arc<RelayEngine>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Status endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
}
