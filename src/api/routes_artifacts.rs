//! Artifact broker endpoints.
//!
//! The broker signs URLs and keeps the authoritative artifact record; it never
//! sees file bytes. Lifecycle: `presign-put` (row becomes `pending`) → caller
//! uploads → `complete` (row becomes `complete`) → `presign-get`.
//!
//! Ownership is decided by the row's `session_id`, never by object listings.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::middleware_auth::{
    audit, require_open, AuditStatus, Audited, RequireAuth, RequireWriter,
};
use super::AppState;
use crate::artifacts::{content_type_allowed, normalize_content_type, object_key, sanitize_filename};
use crate::db::ArtifactRow;
use crate::error::ApiError;
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignPutRequest {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    content_type: String,
    iteration: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignPutResponse {
    artifact_id: Uuid,
    key: String,
    url: String,
    method: &'static str,
    headers: BTreeMap<String, String>,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignGetResponse {
    artifact_id: Uuid,
    key: String,
    url: String,
    method: &'static str,
    expires_at: chrono::DateTime<Utc>,
}

fn storage_error(err: StorageError) -> ApiError {
    warn!(error = %err, "presign failed");
    ApiError::UpstreamStorage(err.to_string())
}

/// GET /api/v1/sessions/{session_id}/artifacts
pub async fn handler_api_artifacts_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let artifacts = state.db.list_artifacts(session_id).await?;
    Ok(Json(json!({ "artifacts": artifacts })))
}

/// POST /api/v1/sessions/{session_id}/artifacts/presign-put
pub async fn handler_api_artifact_presign_put(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
    body: Result<Json<PresignPutRequest>, JsonRejection>,
) -> Result<Audited<Json<PresignPutResponse>>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;
    let Json(req) = body?;

    if !content_type_allowed(&req.content_type, &state.config.allowed_content_types) {
        return Err(ApiError::InvalidInput(format!(
            "content type {:?} is not allowed",
            req.content_type
        )));
    }
    let content_type = normalize_content_type(&req.content_type);
    let max_iteration = state.db.max_iteration(session_id).await?;
    if req.iteration < 1 || req.iteration > max_iteration {
        return Err(ApiError::InvalidInput(format!(
            "iteration {} has not been opened for this session",
            req.iteration
        )));
    }

    let filename = sanitize_filename(&req.filename);
    let key = object_key(session.project_id, session_id, req.iteration, &filename);
    let presigned = state
        .storage
        .presign_put(&key, &content_type, state.config.storage.presign_ttl, Utc::now())
        .map_err(storage_error)?;

    let artifact = state
        .db
        .upsert_pending_artifact(session_id, req.iteration, &key, &filename, &content_type)
        .await?;
    state.prom_metrics.record_presign("PUT");
    info!(session_id = %session_id, artifact_id = %artifact.id, key = %key, "upload presigned");

    let status = audit(
        &state,
        &caller,
        "artifact.presign_put",
        format!("artifact:{}", artifact.id),
        &json!({
            "sessionId": session_id,
            "iteration": req.iteration,
            "key": key,
            "filename": req.filename,
            "contentType": content_type,
        }),
    )
    .await;
    Ok(Audited(
        status,
        Json(PresignPutResponse {
            artifact_id: artifact.id,
            key,
            url: presigned.url,
            method: presigned.method,
            headers: presigned.headers,
            expires_at: presigned.expires_at,
        }),
    ))
}

/// GET /api/v1/sessions/{session_id}/artifacts/{artifact_id}/presign-get
pub async fn handler_api_artifact_presign_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path((session_id, artifact_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<PresignGetResponse>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let artifact = state
        .db
        .get_artifact(artifact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("artifact", artifact_id))?;
    if artifact.session_id != session_id {
        return Err(ApiError::Forbidden(
            "Artifact belongs to a different session".to_string(),
        ));
    }
    if !artifact.is_complete() {
        return Err(ApiError::Conflict(format!(
            "artifact {} has not been finalized",
            artifact_id
        )));
    }

    let presigned = state
        .storage
        .presign_get(&artifact.key, state.config.storage.presign_ttl, Utc::now())
        .map_err(storage_error)?;
    state.prom_metrics.record_presign("GET");
    info!(session_id = %session_id, artifact_id = %artifact_id, "download presigned");
    Ok(Json(PresignGetResponse {
        artifact_id,
        key: artifact.key,
        url: presigned.url,
        method: presigned.method,
        expires_at: presigned.expires_at,
    }))
}

/// POST /api/v1/artifacts/{artifact_id}/complete: idempotent; only the
/// `pending → complete` transition is audited.
pub async fn handler_api_artifact_complete(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(artifact_id): Path<Uuid>,
) -> Result<Audited<Json<ArtifactRow>>, ApiError> {
    let artifact = state
        .db
        .get_artifact(artifact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("artifact", artifact_id))?;
    caller
        .authorize_session(&state, artifact.session_id)
        .await
        .map_err(|e| match e {
            ApiError::NotFound(_) => ApiError::not_found("artifact", artifact_id),
            other => other,
        })?;
    let transition = state
        .db
        .complete_artifact(artifact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("artifact", artifact_id))?;
    if !transition.changed {
        return Ok(Audited(AuditStatus::Recorded, Json(transition.row)));
    }

    let completed = transition.row;
    info!(artifact_id = %artifact_id, key = %completed.key, "artifact finalized");
    let status = audit(
        &state,
        &caller,
        "artifact.complete",
        format!("artifact:{}", artifact_id),
        &json!({ "key": completed.key, "sessionId": completed.session_id }),
    )
    .await;
    Ok(Audited(status, Json(completed)))
}
