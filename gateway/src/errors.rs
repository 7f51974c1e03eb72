use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::quota::WindowType;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing api token")]
    MissingCredential,

    #[error("unknown api token")]
    UnknownCredential,

    #[error("api token expired")]
    CredentialExpired,

    #[error("api token revoked")]
    CredentialRevoked,

    #[error("api token disabled")]
    CredentialDisabled,

    #[error("caller ip not allowed")]
    IpNotAllowed,

    #[error("invalid username or password")]
    InvalidLogin,

    #[error("admin session missing or expired")]
    SessionRequired,

    #[error("{window} quota exceeded")]
    QuotaExceeded {
        window: WindowType,
        retry_after_secs: u64,
    },

    #[error("row outside token scope")]
    ScopeViolation,

    #[error("not found")]
    NotFound,

    #[error("no updatable fields provided")]
    NoFieldsProvided,

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Machine-readable error code, attached to error responses so the usage
/// recorder can log why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub &'static str);

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Store(StoreError::from(e))
    }
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingCredential => "missing_credential",
            AppError::UnknownCredential => "unknown_credential",
            AppError::CredentialExpired => "credential_expired",
            AppError::CredentialRevoked => "credential_revoked",
            AppError::CredentialDisabled => "credential_disabled",
            AppError::IpNotAllowed => "ip_not_allowed",
            AppError::InvalidLogin => "invalid_login",
            AppError::SessionRequired => "session_required",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::ScopeViolation => "scope_violation",
            AppError::NotFound => "not_found",
            AppError::NoFieldsProvided => "no_fields_provided",
            AppError::Validation(_) => "validation_failed",
            AppError::Store(StoreError::Unavailable(_)) => "store_unavailable",
            AppError::Store(_) | AppError::Internal(_) => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingCredential
            | AppError::UnknownCredential
            | AppError::CredentialExpired
            | AppError::CredentialRevoked
            | AppError::CredentialDisabled
            | AppError::IpNotAllowed
            | AppError::InvalidLogin
            | AppError::SessionRequired => StatusCode::UNAUTHORIZED,
            AppError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ScopeViolation => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::NoFieldsProvided | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the credential failures the authenticator produces.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AppError::MissingCredential
                | AppError::UnknownCredential
                | AppError::CredentialExpired
                | AppError::CredentialRevoked
                | AppError::CredentialDisabled
                | AppError::IpNotAllowed
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (error_type, msg) = match &self {
            AppError::MissingCredential => (
                "authentication_error",
                "missing x-api-token header".to_string(),
            ),
            AppError::UnknownCredential
            | AppError::CredentialExpired
            | AppError::CredentialRevoked
            | AppError::CredentialDisabled
            | AppError::IpNotAllowed
            | AppError::InvalidLogin
            | AppError::SessionRequired => ("authentication_error", self.to_string()),
            AppError::QuotaExceeded { window, .. } => (
                "rate_limit_error",
                format!("{} request quota exceeded", window),
            ),
            AppError::ScopeViolation => (
                "permission_error",
                "ticket is outside this token's scope".to_string(),
            ),
            AppError::NotFound => ("not_found_error", "resource not found".to_string()),
            AppError::NoFieldsProvided | AppError::Validation(_) => {
                ("invalid_request_error", self.to_string())
            }
            AppError::Store(StoreError::Unavailable(e)) => {
                tracing::error!("Store unavailable: {}", e);
                (
                    "unavailable_error",
                    "service temporarily unavailable".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!("Database error: {}", e);
                ("internal_error", "internal server error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                ("internal_error", "internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if let AppError::QuotaExceeded {
            retry_after_secs, ..
        } = self
        {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.max(1).to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response.extensions_mut().insert(ErrorCode(code));

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_quota_exceeded_sets_retry_after() {
        let resp = AppError::QuotaExceeded {
            window: WindowType::Minute,
            retry_after_secs: 17,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "17");
        assert_eq!(
            resp.extensions().get::<ErrorCode>(),
            Some(&ErrorCode("quota_exceeded"))
        );
        let body = body_json(resp).await;
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["message"], "minute request quota exceeded");
    }

    #[tokio::test]
    async fn test_missing_distinct_from_unknown() {
        let missing = body_json(AppError::MissingCredential.into_response()).await;
        let unknown = body_json(AppError::UnknownCredential.into_response()).await;
        assert_eq!(missing["error"]["code"], "missing_credential");
        assert_eq!(unknown["error"]["code"], "unknown_credential");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::CredentialExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::ScopeViolation.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::NoFieldsProvided.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Store(StoreError::Unavailable("pool timed out".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Store(StoreError::Database("syntax".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_internal_errors_hide_detail() {
        let resp = AppError::Internal(anyhow::anyhow!("secret detail")).into_response();
        let body = body_json(resp).await;
        assert_eq!(body["error"]["message"], "internal server error");
    }
}
