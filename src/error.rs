//! API error taxonomy and its HTTP mapping.
//!
//! Handlers return `Result<_, ApiError>`; the `IntoResponse` impl renders
//! `{"error": <message>, "code": <kind>}` with the matching status. Internal
//! failures are logged with full detail but reported to the caller generically.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::db::WriteRefused;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    InvalidScope(String),
    #[error("object storage error: {0}")]
    UpstreamStorage(String),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidInput(_) | ApiError::InvalidScope(_) => StatusCode::BAD_REQUEST,
            ApiError::UpstreamStorage(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind, returned as `code` in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::InvalidScope(_) => "invalid_scope",
            ApiError::UpstreamStorage(_) => "upstream_storage_error",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("{} {} not found", what, id))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<WriteRefused>() {
            Ok(refused) => return ApiError::from(refused),
            Err(other) => other,
        };
        match err.downcast::<sqlx::Error>() {
            Ok(db_err) => ApiError::from(db_err),
            Err(other) => ApiError::Internal(other),
        }
    }
}

impl From<WriteRefused> for ApiError {
    fn from(err: WriteRefused) -> Self {
        match err {
            WriteRefused::SessionMissing(_) => ApiError::NotFound(err.to_string()),
            WriteRefused::SessionClosed(_) | WriteRefused::ArtifactFinalized(_) => {
                ApiError::Conflict(err.to_string())
            }
        }
    }
}

/// Unique and check violations surface as `Conflict`; anything else from the
/// database is an internal error.
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            match db_err.code().as_deref() {
                // unique_violation, check_violation
                Some("23505") | Some("23514") => {
                    return ApiError::Conflict(format!(
                        "constraint violation: {}",
                        db_err.constraint().unwrap_or("unknown")
                    ));
                }
                // foreign_key_violation
                Some("23503") => {
                    return ApiError::NotFound("referenced entity not found".to_string());
                }
                _ => {}
            }
        }
        ApiError::Internal(err.into())
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                error!(error = %format!("{:#}", e), "internal error serving request");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let mut response = (
            status,
            Json(serde_json::json!({"error": message, "code": self.code()})),
        )
            .into_response();
        match &self {
            ApiError::Unauthorized(_) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            ApiError::RateLimited { retry_after_secs } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        let cases = vec![
            (ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::RateLimited { retry_after_secs: 3 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ApiError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::InvalidScope("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::UpstreamStorage("x".into()), StatusCode::BAD_GATEWAY),
            (
                ApiError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{}", err.code());
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let resp = ApiError::RateLimited { retry_after_secs: 17 }.into_response();
        assert_eq!(resp.headers()[header::RETRY_AFTER], "17");
    }

    #[test]
    fn unauthorized_sets_www_authenticate() {
        let resp = ApiError::Unauthorized("missing".into()).into_response();
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn plain_anyhow_errors_are_internal() {
        let err = ApiError::from(anyhow::anyhow!("pool closed"));
        assert_eq!(err.code(), "internal");
        // Internal details never leak into the message.
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn refused_writes_keep_their_kind_through_anyhow() {
        let id = uuid::Uuid::new_v4();
        let closed = ApiError::from(anyhow::Error::from(WriteRefused::SessionClosed(id)));
        assert_eq!(closed.status(), StatusCode::CONFLICT);
        assert_eq!(closed.to_string(), format!("session {} is closed", id));

        let finalized = ApiError::from(anyhow::Error::from(WriteRefused::ArtifactFinalized(
            "projects/a/sessions/b/iterations/1/x".into(),
        )));
        assert_eq!(finalized.code(), "conflict");

        let missing = ApiError::from(anyhow::Error::from(WriteRefused::SessionMissing(id)));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn row_not_found_from_sqlx_is_internal() {
        let err = ApiError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
