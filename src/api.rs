//! HTTP surface over [`SessionManager`]
//!
//! JSON in, JSON out. Errors map onto status codes through
//! [`IntoResponse`] for the crate [`Error`].

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::{RecordedEntry, RecordingSession};
use crate::session::{
    ExportSummary, InterceptionRulesRequest, RuleKeysRequest, SessionManager,
    SessionStatusView, StartHybridRequest, StartInterceptionRequest, StartRecordingRequest,
};
use crate::{Error, Result};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });
        (status, Json(body)).into_response()
    }
}

/// Paging parameters of the entries endpoint
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EntriesQuery {
    /// Entries to skip
    #[serde(default)]
    pub offset: usize,
    /// Maximum entries to return
    pub limit: Option<usize>,
}

/// Target of the export endpoint
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExportQuery {
    /// Subdirectory of the export root; defaults to the session id
    pub dir: Option<String>,
}

/// Result of an explicit harvest
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectResponse {
    /// Harvested session
    pub session_id: String,
    /// Newly stored entries
    pub collected: usize,
}

/// Build the router
pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/recordings", post(start_recording))
        .route("/hybrid", post(start_hybrid))
        .route("/interceptions", post(start_interception))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(session_status).delete(delete_session))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/entries", get(list_entries))
        .route("/sessions/{id}/collect", post(collect_now))
        .route("/sessions/{id}/export", post(export_raw))
        .route(
            "/sessions/{id}/interception-rules",
            post(add_rules).put(replace_rules).delete(remove_rules),
        )
        .with_state(manager)
}

/// Serve the API on `addr` until `shutdown` fires
pub async fn serve(
    manager: SessionManager,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("serve", format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal_with_context("serve", e.to_string()))
}

async fn start_recording(
    State(manager): State<SessionManager>,
    Json(req): Json<StartRecordingRequest>,
) -> Result<(StatusCode, Json<RecordingSession>)> {
    let session = manager.start_recording(req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn start_hybrid(
    State(manager): State<SessionManager>,
    Json(req): Json<StartHybridRequest>,
) -> Result<(StatusCode, Json<RecordingSession>)> {
    let session = manager.start_hybrid(req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn start_interception(
    State(manager): State<SessionManager>,
    Json(req): Json<StartInterceptionRequest>,
) -> Result<(StatusCode, Json<RecordingSession>)> {
    let session = manager.start_interception(req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(State(manager): State<SessionManager>) -> Result<Json<Vec<RecordingSession>>> {
    Ok(Json(manager.list().await?))
}

async fn session_status(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusView>> {
    Ok(Json(manager.status(&id).await?))
}

async fn delete_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<Json<RecordingSession>> {
    Ok(Json(manager.stop(&id).await?))
}

async fn list_entries(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<RecordedEntry>>> {
    Ok(Json(manager.entries(&id, query.offset, query.limit).await?))
}

async fn collect_now(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<Json<CollectResponse>> {
    let collected = manager.collect_now(&id).await?;
    Ok(Json(CollectResponse {
        session_id: id,
        collected,
    }))
}

async fn export_raw(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<ExportSummary>> {
    Ok(Json(manager.export_raw(&id, query.dir.as_deref()).await?))
}

async fn add_rules(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Json(req): Json<InterceptionRulesRequest>,
) -> Result<Json<RecordingSession>> {
    Ok(Json(manager.add_interception_rules(&id, req.rules).await?))
}

async fn replace_rules(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Json(req): Json<InterceptionRulesRequest>,
) -> Result<Json<RecordingSession>> {
    Ok(Json(manager.replace_interception_rules(&id, req.rules).await?))
}

async fn remove_rules(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
    Json(req): Json<RuleKeysRequest>,
) -> Result<Json<RecordingSession>> {
    Ok(Json(manager.remove_interception_rules(&id, req.rules).await?))
}
