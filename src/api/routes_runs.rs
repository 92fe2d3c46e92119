//! Run recorder endpoints: test runs, coverage runs, security checks.
//!
//! Each `POST` appends one row; each `…/latest` returns `{"latest": row}` or
//! `{"latest": null}` when the session has no history yet.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::middleware_auth::{audit, require_open, Audited, RequireAuth, RequireWriter};
use super::AppState;
use crate::db::{CoverageRunRow, SecurityCheckRow, SecurityStatus, TestRunRow};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct TestRunRequest {
    passed: bool,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CoverageRunRequest {
    percent: f64,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityCheckRequest {
    #[serde(default)]
    status: String,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Metadata is optional but must be an object when present.
fn metadata_object(metadata: Option<Value>) -> Result<Value, ApiError> {
    match metadata {
        None | Some(Value::Null) => Ok(json!({})),
        Some(v @ Value::Object(_)) => Ok(v),
        Some(_) => Err(ApiError::InvalidInput(
            "metadata must be a JSON object".to_string(),
        )),
    }
}

pub(crate) fn validate_percent(percent: f64) -> Result<f64, ApiError> {
    if percent.is_finite() && (0.0..=100.0).contains(&percent) {
        Ok(percent)
    } else {
        Err(ApiError::InvalidInput(format!(
            "percent must be within 0-100, got {}",
            percent
        )))
    }
}

pub(crate) fn parse_security_status(status: &str) -> Result<SecurityStatus, ApiError> {
    match status {
        "pass" => Ok(SecurityStatus::Pass),
        "fail" => Ok(SecurityStatus::Fail),
        other => Err(ApiError::InvalidInput(format!(
            "status must be \"pass\" or \"fail\", got {:?}",
            other
        ))),
    }
}

// ── Test runs ───────────────────────────────────────────────────

/// POST /api/v1/sessions/{session_id}/test-runs
pub async fn handler_api_test_run_record(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
    body: Result<Json<TestRunRequest>, JsonRejection>,
) -> Result<Audited<(StatusCode, Json<TestRunRow>)>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;
    let Json(req) = body?;
    let metadata = metadata_object(req.metadata)?;

    let row = state
        .db
        .insert_test_run(session_id, req.passed, &metadata, req.timestamp)
        .await?;
    info!(session_id = %session_id, run_id = row.id, passed = row.passed, "test run recorded");
    let status = audit(
        &state,
        &caller,
        "test_run.record",
        format!("session:{}", session_id),
        &json!({ "runId": row.id, "passed": row.passed, "metadata": metadata }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(row))))
}

/// GET /api/v1/sessions/{session_id}/test-runs/latest
pub async fn handler_api_test_run_latest(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let latest = state.db.latest_test_run(session_id).await?;
    Ok(Json(json!({ "latest": latest })))
}

// ── Coverage runs ───────────────────────────────────────────────

/// POST /api/v1/sessions/{session_id}/coverage-runs
pub async fn handler_api_coverage_run_record(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
    body: Result<Json<CoverageRunRequest>, JsonRejection>,
) -> Result<Audited<(StatusCode, Json<CoverageRunRow>)>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;
    let Json(req) = body?;
    let percent = validate_percent(req.percent)?;
    let metadata = metadata_object(req.metadata)?;

    let row = state
        .db
        .insert_coverage_run(session_id, percent, &metadata, req.timestamp)
        .await?;
    info!(session_id = %session_id, run_id = row.id, percent, "coverage run recorded");
    let status = audit(
        &state,
        &caller,
        "coverage_run.record",
        format!("session:{}", session_id),
        &json!({ "runId": row.id, "percent": percent, "metadata": metadata }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(row))))
}

/// GET /api/v1/sessions/{session_id}/coverage-runs/latest
pub async fn handler_api_coverage_run_latest(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let latest = state.db.latest_coverage_run(session_id).await?;
    Ok(Json(json!({ "latest": latest })))
}

// ── Security checks ─────────────────────────────────────────────

/// POST /api/v1/sessions/{session_id}/security-checks
pub async fn handler_api_security_check_record(
    State(state): State<Arc<AppState>>,
    RequireWriter(caller): RequireWriter,
    Path(session_id): Path<Uuid>,
    body: Result<Json<SecurityCheckRequest>, JsonRejection>,
) -> Result<Audited<(StatusCode, Json<SecurityCheckRow>)>, ApiError> {
    let session = caller.authorize_session(&state, session_id).await?;
    require_open(&session)?;
    let Json(req) = body?;
    let check_status = parse_security_status(&req.status)?;
    let metadata = metadata_object(req.metadata)?;

    let row = state
        .db
        .insert_security_check(session_id, check_status, &metadata, req.timestamp)
        .await?;
    info!(session_id = %session_id, check_id = row.id, status = %row.status, "security check recorded");
    let status = audit(
        &state,
        &caller,
        "security_check.record",
        format!("session:{}", session_id),
        &json!({ "checkId": row.id, "status": row.status, "metadata": metadata }),
    )
    .await;
    Ok(Audited(status, (StatusCode::CREATED, Json(row))))
}

/// GET /api/v1/sessions/{session_id}/security-checks/latest
pub async fn handler_api_security_check_latest(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let latest = state.db.latest_security_check(session_id).await?;
    Ok(Json(json!({ "latest": latest })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_bounds() {
        assert!(validate_percent(0.0).is_ok());
        assert!(validate_percent(100.0).is_ok());
        assert!(validate_percent(72.5).is_ok());
        for bad in [-0.1, 100.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(validate_percent(bad), Err(ApiError::InvalidInput(_))));
        }
    }

    #[test]
    fn security_status_is_strict() {
        assert_eq!(parse_security_status("pass").unwrap(), SecurityStatus::Pass);
        assert_eq!(parse_security_status("fail").unwrap(), SecurityStatus::Fail);
        for bad in ["", "PASS", "warn"] {
            assert!(matches!(parse_security_status(bad), Err(ApiError::InvalidInput(_))));
        }
    }

    #[test]
    fn metadata_must_be_object() {
        assert_eq!(metadata_object(None).unwrap(), json!({}));
        assert_eq!(metadata_object(Some(Value::Null)).unwrap(), json!({}));
        assert_eq!(metadata_object(Some(json!({"a": 1}))).unwrap(), json!({"a": 1}));
        assert!(metadata_object(Some(json!("x"))).is_err());
    }
}
