//! Readiness gate endpoint.
//!
//! Read-only: it works on closed sessions as well as open ones.

use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::middleware_auth::RequireAuth;
use super::AppState;
use crate::error::ApiError;
use crate::gates::{evaluate, GateReport};

/// GET /api/v1/sessions/{session_id}/gates/evaluate
///
/// Recomputed on every call from one consistent snapshot; nothing is stored.
pub async fn handler_api_gates_evaluate(
    State(state): State<Arc<AppState>>,
    RequireAuth(caller): RequireAuth,
    Path(session_id): Path<Uuid>,
) -> Result<Json<GateReport>, ApiError> {
    caller.authorize_session(&state, session_id).await?;
    let snapshot = state.db.gate_snapshot(session_id).await?;
    let report = evaluate(&snapshot, &state.gate_policy);
    state.prom_metrics.record_gate_verdict(report.overall);
    debug!(
        session_id = %session_id,
        overall = report.overall,
        blocking = ?report.details.blocking,
        "gates evaluated"
    );
    Ok(Json(report))
}
