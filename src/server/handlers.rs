//! HTTP endpoint handlers and their wire DTOs.
//!
//! Session-scoped endpoints resolve the caller through `X-User-ID` and
//! the manager's ownership check; any mismatch surfaces as 404.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};

use crate::config::WorkspaceType;
use crate::core::session::COMMAND_MAX_BYTES;
use crate::core::{Credentials, OutputChunk, SessionStatus, SessionSummary};

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub workspace_type: Option<WorkspaceType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub workspace_path: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub clear: bool,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    pub session_id: String,
    pub output: Vec<OutputChunk>,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub active_sessions: usize,
    pub memory_alloc_mb: u64,
}

/// Pulls the caller identity from `X-User-ID`. Absence is 404, not 400:
/// without an identity no session can be owned, and the error must not
/// differ from an ownership mismatch.
fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError::NotFound)
}

/// Unwraps a JSON body, folding every rejection into a 400.
fn require_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::InvalidInput(rejection.body_text())),
    }
}

fn process_memory_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        active_sessions: state.manager.active_count().await,
        memory_alloc_mb: process_memory_mb(),
    })
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request = require_json(payload)?;
    let session = state
        .manager
        .create_session(&request.user_id, request.credentials, request.workspace_type)
        .await?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id.clone(),
        status: session.status().await,
        workspace_path: session.workspace.display().to_string(),
    }))
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let request = require_json(payload)?;
    if request.command.len() > COMMAND_MAX_BYTES {
        return Err(ApiError::InvalidInput(format!(
            "command exceeds {COMMAND_MAX_BYTES} bytes"
        )));
    }
    let session = state
        .manager
        .get_session_for_user(&session_id, &user_id)
        .await?;
    session.send_command(request.command.as_bytes()).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn get_output(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<OutputQuery>,
    headers: HeaderMap,
) -> Result<Json<OutputResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let session = state
        .manager
        .get_session_for_user(&session_id, &user_id)
        .await?;
    let output = session.output(query.clear).await;
    Ok(Json(OutputResponse {
        session_id,
        output,
        status: session.status().await,
    }))
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>, ApiError> {
    let user_id = require_user(&headers)?;
    let session = state
        .manager
        .get_session_for_user(&session_id, &user_id)
        .await?;
    Ok(Json(session.summary().await))
}

pub async fn resize(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    let request = require_json(payload)?;
    let session = state
        .manager
        .get_session_for_user(&session_id, &user_id)
        .await?;
    session.resize(request.cols, request.rows).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, ApiError> {
    let user_id = require_user(&headers)?;
    state
        .manager
        .terminate_session_for_user(&session_id, &user_id)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let user_id = require_user(&headers)?;
    Ok(Json(state.manager.list_sessions_for_user(&user_id).await))
}
