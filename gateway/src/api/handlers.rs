use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::middleware::session::{clear_session_cookie, session_cookie, session_token};
use crate::models::admin::AdminIdentity;
use crate::models::audit::{AuditAction, AuditLogEntry, AuditLogRow, UsageLogEntry, UsageQuery};
use crate::models::quota::WindowUsage;
use crate::models::token::{Environment, NewToken, Token, TokenSpec, TokenUpdate, TokenView};
use crate::query::columns;
use crate::AppState;

const MAX_LIST_LIMIT: i64 = 500;
const DEFAULT_LIST_LIMIT: i64 = 50;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub username: String,
}

#[derive(Deserialize, Default)]
pub struct PaginationParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PaginationParams {
    fn clamped(&self) -> (i64, i64) {
        (
            self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
            self.offset.unwrap_or(0).max(0),
        )
    }
}

#[derive(Serialize)]
pub struct CreateTokenResponse {
    /// Full secret. Shown once, never stored.
    pub token: String,
    pub record: TokenView,
    pub message: String,
}

#[derive(Deserialize, Default)]
pub struct RevokeRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct QuotaResponse {
    pub token_id: i64,
    pub windows: Vec<WindowUsage>,
}

// ── Token validation ─────────────────────────────────────────

/// Fields an administrator may set, checked together after a create or a
/// projected update.
struct TokenShape<'a> {
    name: &'a str,
    is_super: bool,
    filter_column: Option<&'a str>,
    filter_value: Option<&'a str>,
    rate_limits: [i32; 3],
    allowed_ips: &'a [String],
}

impl<'a> From<&'a Token> for TokenShape<'a> {
    fn from(t: &'a Token) -> Self {
        Self {
            name: &t.name,
            is_super: t.is_super,
            filter_column: t.filter_column.as_deref(),
            filter_value: t.filter_value.as_deref(),
            rate_limits: [
                t.rate_limit_per_minute,
                t.rate_limit_per_hour,
                t.rate_limit_per_day,
            ],
            allowed_ips: &t.allowed_ips,
        }
    }
}

impl<'a> From<&'a TokenSpec> for TokenShape<'a> {
    fn from(s: &'a TokenSpec) -> Self {
        Self {
            name: &s.name,
            is_super: s.is_super,
            filter_column: s.filter_column.as_deref(),
            filter_value: s.filter_value.as_deref(),
            rate_limits: [
                s.rate_limit_per_minute,
                s.rate_limit_per_hour,
                s.rate_limit_per_day,
            ],
            allowed_ips: &s.allowed_ips,
        }
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

fn validate_token(shape: &TokenShape<'_>, allow_unscoped: bool) -> Result<(), AppError> {
    if shape.name.trim().is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    if shape.rate_limits.iter().any(|v| *v < 0) {
        return Err(AppError::Validation(
            "rate limits must be zero (unlimited) or positive".into(),
        ));
    }
    if let Some(bad) = shape.allowed_ips.iter().find(|ip| ip.trim().parse::<IpAddr>().is_err()) {
        return Err(AppError::Validation(format!(
            "allowed_ips entry '{}' is not an IP address",
            bad
        )));
    }

    let column = non_blank(shape.filter_column);
    let value = non_blank(shape.filter_value);
    if let Some(column) = column {
        if !columns::is_column_reference(column) {
            return Err(AppError::Validation(format!(
                "filter_column '{}' is not a column name",
                column
            )));
        }
    }
    match (column, value) {
        (Some(_), None) | (None, Some(_)) => Err(AppError::Validation(
            "filter_column and filter_value must be set together".into(),
        )),
        (None, None) if !shape.is_super && !allow_unscoped => Err(AppError::Validation(
            "token must be super or carry a filter_column/filter_value pair".into(),
        )),
        _ => Ok(()),
    }
}

/// An omitted environment follows the deployment's own tag.
fn parse_environment(raw: Option<&str>, deployment: &str) -> Result<Environment, AppError> {
    match raw {
        Some(raw) => Environment::parse(raw)
            .ok_or_else(|| AppError::Validation(format!("unknown environment '{}'", raw))),
        None => Ok(Environment::parse(deployment).unwrap_or(Environment::Development)),
    }
}

fn snapshot(token: &Token) -> Option<serde_json::Value> {
    serde_json::to_value(TokenView::from(token)).ok()
}

// ── Session Handlers ─────────────────────────────────────────

/// POST /admin/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let issued = state
        .sessions
        .login(&payload.username, &payload.password)
        .await?;

    let cookie = session_cookie(&issued.token, state.sessions.ttl());
    let body = LoginResponse {
        token: issued.token,
        expires_at: issued.expires_at,
        username: issued.identity.username,
    };
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

/// POST /admin/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(token) = session_token(&headers) {
        state.sessions.logout(&token).await?;
    }
    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, clear_session_cookie())],
    )
        .into_response())
}

/// GET /admin/me
pub async fn me(Extension(identity): Extension<AdminIdentity>) -> Json<AdminIdentity> {
    Json(identity)
}

// ── Token Handlers ───────────────────────────────────────────

/// GET /admin/tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Vec<TokenView>>, AppError> {
    let (limit, offset) = params.clamped();
    let tokens = state.store.list_tokens(limit, offset).await?;
    Ok(Json(tokens.iter().map(TokenView::from).collect()))
}

/// GET /admin/tokens/:id
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TokenView>, AppError> {
    let token = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(TokenView::from(&token)))
}

/// POST /admin/tokens. The response is the only place the secret appears.
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Json(spec): Json<TokenSpec>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), AppError> {
    validate_token(&TokenShape::from(&spec), state.config.allow_unscoped_tokens)?;
    let environment = parse_environment(spec.environment.as_deref(), &state.config.env)?;

    let issued = NewToken::issue(spec, environment, Some(admin.admin_id));
    let now = state.clock.now();
    let token = state.store.create_token(&issued.record, now).await?;

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenCreate,
            token.id,
            None,
            snapshot(&token),
            now,
        ))
        .await?;

    tracing::info!(
        admin_id = admin.admin_id,
        token_id = token.id,
        token = %token.masked_secret,
        "api token created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: issued.secret,
            record: TokenView::from(&token),
            message: "Store this token now; it cannot be shown again.".into(),
        }),
    ))
}

/// PATCH /admin/tokens/:id
pub async fn update_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(id): Path<i64>,
    Json(mut update): Json<TokenUpdate>,
) -> Result<Json<TokenView>, AppError> {
    if update.is_empty() {
        return Err(AppError::NoFieldsProvided);
    }
    if let Some(env) = update.environment.take() {
        let env = parse_environment(Some(&env), &state.config.env)?;
        update.environment = Some(env.as_str().to_string());
    }

    let old = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;

    let mut projected = old.clone();
    update.apply_to(&mut projected);
    validate_token(&TokenShape::from(&projected), state.config.allow_unscoped_tokens)?;

    let now = state.clock.now();
    let token = state
        .store
        .update_token(id, &update, now)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenUpdate,
            id,
            snapshot(&old),
            snapshot(&token),
            now,
        ))
        .await?;

    Ok(Json(TokenView::from(&token)))
}

/// POST /admin/tokens/:id/disable
pub async fn disable_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(id): Path<i64>,
) -> Result<Json<TokenView>, AppError> {
    let old = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    let now = state.clock.now();
    let token = state
        .store
        .disable_token(id, now)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenDisable,
            id,
            snapshot(&old),
            snapshot(&token),
            now,
        ))
        .await?;
    Ok(Json(TokenView::from(&token)))
}

/// POST /admin/tokens/:id/enable. A revoked token stays revoked.
pub async fn enable_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(id): Path<i64>,
) -> Result<Json<TokenView>, AppError> {
    let old = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    if old.is_revoked() {
        return Err(AppError::Validation(
            "revoked tokens cannot be re-enabled".into(),
        ));
    }
    let now = state.clock.now();
    let token = state
        .store
        .enable_token(id, now)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenEnable,
            id,
            snapshot(&old),
            snapshot(&token),
            now,
        ))
        .await?;
    Ok(Json(TokenView::from(&token)))
}

/// POST /admin/tokens/:id/revoke
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(id): Path<i64>,
    body: Option<Json<RevokeRequest>>,
) -> Result<Json<TokenView>, AppError> {
    let reason = body.and_then(|Json(r)| r.reason);
    let old = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    let now = state.clock.now();
    let token = state
        .store
        .revoke_token(id, reason.as_deref(), now)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenRevoke,
            id,
            snapshot(&old),
            snapshot(&token),
            now,
        ))
        .await?;

    tracing::info!(admin_id = admin.admin_id, token_id = id, "api token revoked");
    Ok(Json(TokenView::from(&token)))
}

/// DELETE /admin/tokens/:id
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let old = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    if !state.store.delete_token(id).await? {
        return Err(AppError::NotFound);
    }

    state
        .audit
        .record(&AuditLogEntry::for_token(
            admin.admin_id,
            AuditAction::TokenDelete,
            id,
            snapshot(&old),
            None,
            state.clock.now(),
        ))
        .await?;

    tracing::info!(admin_id = admin.admin_id, token_id = id, "api token deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/tokens/:id/quota
pub async fn token_quota(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QuotaResponse>, AppError> {
    let token = state
        .store
        .find_token_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    let windows = state.quota.usage(token.id, token.ceilings()).await?;
    Ok(Json(QuotaResponse {
        token_id: token.id,
        windows,
    }))
}

// ── Log Handlers ─────────────────────────────────────────────

/// GET /admin/audit
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Vec<AuditLogRow>>, AppError> {
    let (limit, offset) = params.clamped();
    Ok(Json(state.store.list_audit_logs(limit, offset).await?))
}

/// GET /admin/usage
pub async fn list_usage_logs(
    State(state): State<Arc<AppState>>,
    Query(mut query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageLogEntry>>, AppError> {
    query.limit = Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT));
    query.offset = Some(query.offset.unwrap_or(0).max(0));
    Ok(Json(state.store.list_usage_logs(&query).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TokenSpec {
        TokenSpec {
            name: "avt".into(),
            filter_column: Some("flm_name".into()),
            filter_value: Some("AVT".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_vendor_and_super_tokens_accepted() {
        assert!(validate_token(&TokenShape::from(&spec()), false).is_ok());
        let sup = TokenSpec {
            name: "ops".into(),
            is_super: true,
            ..Default::default()
        };
        assert!(validate_token(&TokenShape::from(&sup), false).is_ok());
    }

    #[test]
    fn test_unscoped_token_needs_opt_in() {
        let open = TokenSpec {
            name: "open".into(),
            ..Default::default()
        };
        assert!(matches!(
            validate_token(&TokenShape::from(&open), false),
            Err(AppError::Validation(_))
        ));
        assert!(validate_token(&TokenShape::from(&open), true).is_ok());
    }

    #[test]
    fn test_half_pair_and_bad_column_rejected() {
        let half = TokenSpec {
            filter_value: None,
            ..spec()
        };
        assert!(validate_token(&TokenShape::from(&half), true).is_err());

        let hostile = TokenSpec {
            filter_column: Some("m.flm_name = m.flm_name OR 1".into()),
            ..spec()
        };
        assert!(validate_token(&TokenShape::from(&hostile), false).is_err());
    }

    #[test]
    fn test_negative_limits_and_bad_ips_rejected() {
        let neg = TokenSpec {
            rate_limit_per_hour: -1,
            ..spec()
        };
        assert!(validate_token(&TokenShape::from(&neg), false).is_err());
        let ips = TokenSpec {
            allowed_ips: vec!["10.0.0.0/8".into()],
            ..spec()
        };
        assert!(validate_token(&TokenShape::from(&ips), false).is_err());
    }

    #[test]
    fn test_pagination_clamped() {
        let p = PaginationParams {
            limit: Some(10_000),
            offset: Some(-5),
        };
        assert_eq!(p.clamped(), (MAX_LIST_LIMIT, 0));
        assert_eq!(PaginationParams::default().clamped(), (DEFAULT_LIST_LIMIT, 0));
    }
}
