//! Credential minting and introspection.
//!
//! `POST /api/v1/auth/token` is the only endpoint that accepts the shared
//! secret. Minting is stateless: nothing is stored, and the response carries
//! the credential exactly once.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::middleware_auth::RequireAuth;
use super::AppState;
use crate::auth::{fingerprint, MintedToken, Scope, ScopeRequest};
use crate::error::ApiError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    scope: ScopeRequest,
}

/// POST /api/v1/auth/token: exchange the shared secret for a scoped credential.
pub async fn handler_api_token_mint(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<MintedToken>, ApiError> {
    let Json(req) = body?;
    state.minter.verify_api_key(&req.api_key)?;

    let scope = Scope::validate(&req.scope)?;
    if let Some(project_id) = scope.project_id {
        if state.db.get_project(project_id).await?.is_none() {
            return Err(ApiError::InvalidScope(format!(
                "project {} does not exist",
                project_id
            )));
        }
    }
    if let (Some(session_id), Some(project_id)) = (scope.session_id, scope.project_id) {
        match state.db.get_session(session_id).await? {
            Some(session) if session.project_id == project_id => {}
            Some(_) => {
                return Err(ApiError::InvalidScope(format!(
                    "session {} does not belong to project {}",
                    session_id, project_id
                )))
            }
            None => {
                return Err(ApiError::InvalidScope(format!(
                    "session {} does not exist",
                    session_id
                )))
            }
        }
    }

    let minted = state.minter.issue(scope, Utc::now())?;
    info!(
        actor = %fingerprint(&minted.token),
        role = %scope.role,
        project_id = ?scope.project_id,
        session_id = ?scope.session_id,
        "credential minted"
    );
    Ok(Json(minted))
}

/// GET /api/v1/auth/me: describe the presented credential.
pub async fn handler_api_me(RequireAuth(caller): RequireAuth) -> Json<serde_json::Value> {
    let expires_at = Utc.timestamp_opt(caller.claims.exp, 0).single();
    Json(json!({
        "fingerprint": caller.fingerprint,
        "scope": caller.claims.scope(),
        "expiresAt": expires_at,
    }))
}
