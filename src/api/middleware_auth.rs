//! Bearer-credential extractors, scope checks, and the audit helper shared by
//! every `/api/v1` handler.
//!
//! - [`RequireAuth`]: any valid minted credential (reads).
//! - [`RequireWriter`]: a valid credential that passes the rate limiter and
//!   whose role may write (mutations).
//!
//! Scope checks load the target session from the store so a project-scoped
//! credential can never reach a session of another project, whatever ids the
//! caller puts in the path.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::AppState;
use crate::audit::AuditEvent;
use crate::auth::{fingerprint, Claims};
use crate::db::SessionRow;
use crate::error::ApiError;
use crate::rate_limit::RateDecision;

/// A verified caller: its claims plus the fingerprint of the bearer token.
#[derive(Debug, Clone)]
pub struct Caller {
    pub claims: Claims,
    pub fingerprint: String,
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Malformed Authorization header".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Expected a Bearer credential".to_string()))?;
    Ok(token)
}

fn authenticate(parts: &Parts, state: &AppState) -> Result<Caller, ApiError> {
    let token = bearer_token(parts)?;
    let claims = state.minter.verify(token)?;
    Ok(Caller {
        claims,
        fingerprint: fingerprint(token),
    })
}

/// Axum extractor that requires any valid credential.
///
/// Returns 401 if no valid credential is present.
pub struct RequireAuth(pub Caller);

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(RequireAuth(authenticate(parts, state)?))
    }
}

/// Axum extractor for mutating endpoints: authenticates, counts the request
/// against the caller's rate-limit window, then requires a write role.
///
/// Returns 401, 429, or 403 in that order.
pub struct RequireWriter(pub Caller);

impl FromRequestParts<Arc<AppState>> for RequireWriter {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let caller = authenticate(parts, state)?;

        if let RateDecision::Limited { retry_after } =
            state.limiter.check(&caller.fingerprint).await
        {
            state.prom_metrics.rate_limited.inc();
            warn!(
                actor = %caller.fingerprint,
                method = %parts.method,
                path = %parts.uri.path(),
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            // Round up so a client honouring Retry-After never retries early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            return Err(ApiError::RateLimited {
                retry_after_secs: secs.max(1),
            });
        }

        if !caller.claims.role.can_write() {
            return Err(ApiError::Forbidden(format!(
                "role {} is read-only",
                caller.claims.role
            )));
        }
        Ok(RequireWriter(caller))
    }
}

impl Caller {
    /// Load `session_id` and check the credential covers it.
    ///
    /// A session-scoped credential naming another session is rejected before
    /// any lookup. Otherwise: unknown session → 404, session in a project the
    /// credential does not cover → 403.
    pub async fn authorize_session(
        &self,
        state: &AppState,
        session_id: Uuid,
    ) -> Result<SessionRow, ApiError> {
        if let Some(scoped) = self.claims.session_id {
            if scoped != session_id {
                return Err(ApiError::Forbidden(
                    "Credential is scoped to a different session".to_string(),
                ));
            }
        }
        let session = state
            .db
            .get_session(session_id)
            .await?
            .ok_or_else(|| ApiError::not_found("session", session_id))?;
        if !self.claims.covers_session(session.project_id, session.id) {
            return Err(ApiError::Forbidden(
                "Credential does not cover this session".to_string(),
            ));
        }
        Ok(session)
    }

    /// Check the credential covers a whole project (project reads, session
    /// creation). Session-scoped credentials never do.
    pub fn authorize_project(&self, project_id: Uuid) -> Result<(), ApiError> {
        if self.claims.covers_project(project_id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "Credential does not cover this project".to_string(),
            ))
        }
    }
}

/// Closed sessions are read-only. Handlers reject early here; the write
/// itself re-checks under the session's row lock.
pub fn require_open(session: &SessionRow) -> Result<(), ApiError> {
    if session.is_closed() {
        Err(ApiError::Conflict(format!("session {} is closed", session.id)))
    } else {
        Ok(())
    }
}

// ── Audit ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditStatus {
    Recorded,
    Degraded,
}

/// Append a redacted audit entry for a mutation that already succeeded.
/// Failures are logged and counted, never propagated.
pub async fn audit(
    state: &AppState,
    caller: &Caller,
    action: &'static str,
    target_entity: String,
    payload: &Value,
) -> AuditStatus {
    let event = AuditEvent::new(
        &caller.fingerprint,
        action,
        target_entity,
        state.redactor.redact(payload),
    );
    match state.db.insert_audit_event(&event).await {
        Ok(_) => AuditStatus::Recorded,
        Err(e) => {
            state.prom_metrics.audit_write_failures.inc();
            warn!(
                action,
                target = %event.target_entity,
                actor = %event.actor_fingerprint,
                error = %e,
                "audit write failed"
            );
            AuditStatus::Degraded
        }
    }
}

/// A response whose audit append may have failed; sets `x-audit-degraded`
/// when it did.
pub struct Audited<T>(pub AuditStatus, pub T);

impl<T: IntoResponse> IntoResponse for Audited<T> {
    fn into_response(self) -> Response {
        let mut response = self.1.into_response();
        if self.0 == AuditStatus::Degraded {
            response
                .headers_mut()
                .insert("x-audit-degraded", HeaderValue::from_static("true"));
        }
        response
    }
}
