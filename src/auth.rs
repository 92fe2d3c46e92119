//! # Auth: Scoped Credential Minting and Verification
//!
//! The server holds one shared secret (`GATEHOUSE_API_KEY`). Callers exchange it
//! at `POST /api/v1/auth/token` for a short-lived HS256 JWT carrying a scope:
//! an optional project, an optional session, and a role. Every other endpoint
//! accepts only these minted credentials and verifies them statelessly
//! (signature, issuer, expiry). There is no revocation list; a credential is
//! valid until its `exp`.
//!
//! ## Scope rules
//!
//! - A `session_id` requires a `project_id` that owns the session.
//! - `agent` and `viewer` credentials must name a project; only `admin` may be
//!   unscoped.
//! - A session-scoped credential covers exactly that session; a project-scoped
//!   credential covers every session of the project.
//!
//! The shared secret is compared in constant time over SHA-256 digests so
//! neither content nor length leaks through timing.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;

const ISSUER: &str = "gatehouse";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Agent,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "agent" => Some(Role::Agent),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn can_write(self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Agent => write!(f, "agent"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// Scope as requested by a minting caller, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRequest {
    pub project_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub role: String,
}

/// A validated scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub role: Role,
}

impl Scope {
    /// Check the shape of a requested scope. Session ownership is verified
    /// separately against the store.
    pub fn validate(req: &ScopeRequest) -> Result<Scope, ApiError> {
        let role = Role::parse(&req.role)
            .ok_or_else(|| ApiError::InvalidScope(format!("Unknown role: {:?}", req.role)))?;
        if req.session_id.is_some() && req.project_id.is_none() {
            return Err(ApiError::InvalidScope(
                "sessionId requires a projectId".to_string(),
            ));
        }
        if role != Role::Admin && req.project_id.is_none() {
            return Err(ApiError::InvalidScope(format!(
                "role {} requires a projectId",
                role
            )));
        }
        Ok(Scope {
            project_id: req.project_id,
            session_id: req.session_id,
            role,
        })
    }
}

/// JWT claims of a minted credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl Claims {
    pub fn scope(&self) -> Scope {
        Scope {
            project_id: self.project_id,
            session_id: self.session_id,
            role: self.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this credential may act on resources of `project_id` at all.
    pub fn covers_project(&self, project_id: Uuid) -> bool {
        (self.is_admin() && self.project_id.is_none()) || self.project_id == Some(project_id)
    }

    /// Whether this credential may act on `session_id`, which belongs to `project_id`.
    pub fn covers_session(&self, project_id: Uuid, session_id: Uuid) -> bool {
        if self.is_admin() && self.project_id.is_none() {
            return true;
        }
        if self.project_id != Some(project_id) {
            return false;
        }
        match self.session_id {
            Some(scoped) => scoped == session_id,
            None => true,
        }
    }
}

/// Result of a successful mint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintedToken {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
    pub scope: Scope,
}

pub struct TokenMinter {
    api_key_digest: Option<[u8; 32]>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    signing_enabled: bool,
    ttl: Duration,
}

impl TokenMinter {
    pub fn new(api_key: Option<&str>, signing_key: &[u8], ttl: Duration) -> Self {
        TokenMinter {
            api_key_digest: api_key.map(sha256),
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
            signing_enabled: !signing_key.is_empty(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Constant-time check of a presented shared secret.
    pub fn verify_api_key(&self, presented: &str) -> Result<(), ApiError> {
        let Some(expected) = self.api_key_digest.as_ref() else {
            return Err(ApiError::Unauthorized(
                "Credential minting is not configured".to_string(),
            ));
        };
        let presented = sha256(presented);
        if bool::from(presented[..].ct_eq(&expected[..])) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized("Invalid API key".to_string()))
        }
    }

    /// Sign a credential for an already-validated scope.
    pub fn issue(&self, scope: Scope, now: DateTime<Utc>) -> Result<MintedToken, ApiError> {
        if !self.signing_enabled {
            return Err(ApiError::Unauthorized(
                "Credential minting is not configured".to_string(),
            ));
        }
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("token ttl out of range: {}", e)))?;
        let expires_at = now + ttl;
        let claims = Claims {
            iss: ISSUER.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            role: scope.role,
            project_id: scope.project_id,
            session_id: scope.session_id,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to sign credential: {}", e)))?;
        Ok(MintedToken {
            token,
            token_type: "Bearer",
            expires_at,
            expires_in: self.ttl.as_secs(),
            scope,
        })
    }

    /// Verify signature, issuer, and expiry of a bearer credential.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        if !self.signing_enabled {
            return Err(ApiError::Unauthorized(
                "Credential verification is not configured".to_string(),
            ));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ApiError::Unauthorized("Credential expired".to_string())
                }
                _ => ApiError::Unauthorized("Invalid credential".to_string()),
            }
        })?;
        Ok(data.claims)
    }
}

/// Stable, non-reversible identifier for a credential: the first 16 hex chars
/// of its SHA-256 digest. Used as the audit actor and the rate-limiter key.
pub fn fingerprint(token: &str) -> String {
    let digest = sha256(token);
    hex::encode(&digest[..8])
}

fn sha256(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}
