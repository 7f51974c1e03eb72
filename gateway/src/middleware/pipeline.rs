//! Request pipeline for the data plane: authenticate, scope, meter, then log
//! exactly once whatever the outcome.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::scope::resolve_scope;
use crate::errors::{AppError, ErrorCode};
use crate::models::audit::UsageLogEntry;
use crate::models::quota::QuotaDecision;
use crate::models::scope::Scope;
use crate::models::token::{mask_secret, Token};
use crate::AppState;

pub const TOKEN_HEADER: &str = "x-api-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// What handlers behind [`data_plane`] know about the caller.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub token_id: i64,
    pub scope: Scope,
    pub correlation_id: String,
}

/// Reuses an inbound `x-request-id` when it is short printable ASCII,
/// otherwise mints one. Echoed on every response.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .filter(|v| v.bytes().all(|b| b.is_ascii_graphic()))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(CorrelationId(req_id.clone()));
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    resp
}

/// Injects security headers into every response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove("server");
    resp
}

/// Caller address. The first `x-forwarded-for` hop is only believed when the
/// deployment sits behind a trusted proxy.
pub fn caller_ip(req: &Request, trust_forwarded_for: bool) -> Option<String> {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    caller_ip: Option<&str>,
) -> Result<(Token, Scope), AppError> {
    // A header that is present but not visible ASCII can never match an
    // issued secret; it is a bad credential, not a missing one.
    let raw = headers.get(TOKEN_HEADER).map(|v| v.to_str().ok());
    let credential = raw.flatten().map(str::trim).filter(|v| !v.is_empty());

    let result = match (raw, credential) {
        (_, Some(credential)) => state.authenticator.authenticate(credential, caller_ip).await,
        (Some(None), _) => Err(AppError::UnknownCredential),
        _ => Err(AppError::MissingCredential),
    };
    let token = result.map_err(|e| {
        if e.is_auth_failure() {
            state.metrics.record_auth_failure(e.code());
            tracing::warn!(
                token = %credential.map(mask_secret).unwrap_or_default(),
                caller_ip = caller_ip.unwrap_or("-"),
                code = e.code(),
                "credential rejected"
            );
        }
        e
    })?;

    let scope = resolve_scope(&token);
    tracing::debug!(token_id = token.id, scope = scope.label(), "credential accepted");
    Ok((token, scope))
}

async fn enforce_quota(state: &AppState, token: &Token) -> Result<(), AppError> {
    match state
        .quota
        .check_and_consume(token.id, token.ceilings())
        .await?
    {
        QuotaDecision::Allowed => Ok(()),
        QuotaDecision::Denied { window, resets_at } => {
            state.metrics.record_quota_denial(window);
            Err(AppError::QuotaExceeded {
                window,
                retry_after_secs: state.quota.retry_after_secs(resets_at),
            })
        }
    }
}

/// Data-plane guard. Every request that reaches it produces exactly one usage
/// log entry, including those rejected before a token resolved.
pub async fn data_plane(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let user_agent = header_str(req.headers(), "user-agent");
    let ip = caller_ip(&req, state.config.trust_forwarded_for);

    let mut token_id = None;
    let mut scope_label = None;

    let result = match authorize(&state, req.headers(), ip.as_deref()).await {
        Ok((token, scope)) => {
            token_id = Some(token.id);
            scope_label = Some(scope.label());
            match enforce_quota(&state, &token).await {
                Ok(()) => {
                    req.extensions_mut().insert(RequestContext {
                        token_id: token.id,
                        scope,
                        correlation_id: correlation_id.clone(),
                    });
                    Ok(next.run(req).await)
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    let mut response = result.unwrap_or_else(IntoResponse::into_response);
    if let Ok(val) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let status = response.status();
    let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    let error = response
        .extensions()
        .get::<ErrorCode>()
        .map(|c| c.0.to_string());

    state.metrics.record_request("data", status.as_u16(), latency_ms);
    tracing::info!(
        correlation_id = %correlation_id,
        token_id = ?token_id,
        scope = scope_label.unwrap_or("-"),
        method = %method,
        path = %path,
        status = status.as_u16(),
        latency_ms,
        "data request"
    );

    state.usage.record(UsageLogEntry {
        token_id,
        scope: scope_label.map(str::to_string),
        method,
        path,
        status_code: status.as_u16() as i16,
        latency_ms,
        caller_ip: ip,
        user_agent,
        correlation_id,
        error,
        created_at: state.clock.now(),
    });

    response
}
