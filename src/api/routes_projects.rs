//! Projects, sessions, and iterations: the scoping hierarchy every other
//! resource hangs off.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::middleware_auth::{
    audit, require_open, AuditStatus, Audited, RequireAuth, RequireWriter,
};
use super::AppState;
use crate::db::{IterationRow, ProjectRow, SessionRow};
use crate::error::ApiError;

const MAX_PROJECT_NAME_LEN: usize = 200;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    name: String,
}

/// POST /api/v1/projects: admin only.
pub async fn handler_api_projects_create(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    body: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<Audited<(StatusCode, Json<ProjectRow>)>, ApiError> {
    if !caller.claims.is_admin() || caller.claims.project_id.is_some() {
        return Err(ApiError::Forbidden(
            "Creating projects requires an unscoped admin credential".to_string(),
        ));
    }
    let Json(req) = body?;
    let name = req.name.trim();
    if name.is_empty() || name.len() > MAX_PROJECT_NAME_LEN {
        return Err(ApiError::InvalidInput(format!(
            "name must be 1-{} characters",
            MAX_PROJECT_NAME_LEN
        )));
    }

    let project = state.db.create_project(name).await?;
    info!(project_id = %project.id, "project created");
    let status = audit(
        &state,
        &caller,
        "project.create",
        format!("project:{}", project.id),
        &json!({ "name": project.name }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(project))))
}

/// GET /api/v1/projects/{project_id}
pub async fn handler_api_project_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ProjectRow>, ApiError> {
    caller.authorize_project(project_id)?;
    let project = state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("project", project_id))?;
    Ok(Json(project))
}

/// GET /api/v1/projects/{project_id}/sessions
///
/// A session-scoped credential sees only its own session.
pub async fn handler_api_sessions_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_project(project_id)?;
    if state.db.get_project(project_id).await?.is_none() {
        return Err(ApiError::not_found("project", project_id));
    }
    let mut sessions = state.db.list_sessions(project_id).await?;
    if let Some(scoped) = caller.claims.session_id {
        sessions.retain(|s| s.id == scoped);
    }
    Ok(Json(json!({ "sessions": sessions })))
}

/// POST /api/v1/projects/{project_id}/sessions
pub async fn handler_api_sessions_create(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(project_id): Path<Uuid>,
) -> Result<Audited<(StatusCode, Json<SessionRow>)>, ApiError> {
    caller.authorize_project(project_id)?;
    if caller.claims.session_id.is_some() {
        return Err(ApiError::Forbidden(
            "A session-scoped credential cannot create sessions".to_string(),
        ));
    }
    if state.db.get_project(project_id).await?.is_none() {
        return Err(ApiError::not_found("project", project_id));
    }

    let session = state.db.create_session(project_id).await?;
    info!(project_id = %project_id, session_id = %session.id, "session created");
    let status = audit(
        &state,
        &caller,
        "session.create",
        format!("session:{}", session.id),
        &json!({ "projectId": project_id }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(session))))
}

/// GET /api/v1/sessions/{session_id}
pub async fn handler_api_session_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionRow>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    Ok(Json(session))
}

/// POST /api/v1/sessions/{session_id}/close: idempotent; only the first
/// close is audited.
pub async fn handler_api_session_close(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
) -> Result<Audited<Json<SessionRow>>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let closed = state
        .db
        .close_session(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session", session_id))?;
    if !closed.changed {
        return Ok(Audited(AuditStatus::Recorded, Json(closed.row)));
    }

    info!(session_id = %session_id, "session closed");
    let status = audit(
        &state,
        &caller,
        "session.close",
        format!("session:{}", session_id),
        &json!({}),
    )
    .await;
    Ok(Audited(status, Json(closed.row)))
}

/// GET /api/v1/sessions/{session_id}/iterations
pub async fn handler_api_iterations_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let iterations = state.db.list_iterations(session_id).await?;
    Ok(Json(json!({ "iterations": iterations })))
}

/// POST /api/v1/sessions/{session_id}/iterations: open the next ordinal.
pub async fn handler_api_iterations_open(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
) -> Result<Audited<(StatusCode, Json<IterationRow>)>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;

    let iteration = state.db.open_iteration(session_id).await?;
    info!(session_id = %session_id, ordinal = iteration.ordinal, "iteration opened");
    let status = audit(
        &state,
        &caller,
        "iteration.open",
        format!("session:{}", session_id),
        &json!({ "ordinal": iteration.ordinal }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(iteration))))
}
