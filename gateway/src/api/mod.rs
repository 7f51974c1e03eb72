use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::{pipeline, session};
use crate::AppState;

pub mod handlers;
pub mod tickets;

/// Full application: data plane under `/api/v1`, admin plane under `/admin`,
/// probes and metrics at the root.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .nest("/api/v1", data_router(state.clone()))
        .nest("/admin", admin_router(state.clone()))
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_404)
        .layer(middleware::from_fn(pipeline::security_headers))
        .layer(middleware::from_fn(pipeline::request_id))
        .layer(TraceLayer::new_for_http());

    if let Some(origin) = state.config.cors_allowed_origin.as_deref() {
        match HeaderValue::from_str(origin) {
            Ok(origin) => {
                router = router.layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::exact(origin))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::PATCH,
                            axum::http::Method::DELETE,
                        ])
                        .allow_headers([
                            header::CONTENT_TYPE,
                            header::HeaderName::from_static(pipeline::TOKEN_HEADER),
                            header::HeaderName::from_static(session::SESSION_HEADER),
                        ])
                        .allow_credentials(true),
                );
            }
            Err(e) => tracing::warn!("ignoring invalid CORS_ALLOWED_ORIGIN: {}", e),
        }
    }

    router.with_state(state)
}

/// Data plane. Every matched route runs behind the token pipeline.
pub fn data_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tickets", get(tickets::list_tickets))
        .route(
            "/tickets/:id",
            get(tickets::get_ticket).patch(tickets::update_ticket),
        )
        .route("/tickets/filters", get(tickets::list_filter_fields))
        .route("/tickets/filters/:field", get(tickets::filter_values))
        .route_layer(middleware::from_fn_with_state(state, pipeline::data_plane))
}

/// Admin plane. Only `/login` is reachable without a session.
pub fn admin_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let protected = Router::new()
        .route("/logout", post(handlers::logout))
        .route("/me", get(handlers::me))
        .route(
            "/tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route(
            "/tokens/:id",
            get(handlers::get_token)
                .patch(handlers::update_token)
                .delete(handlers::delete_token),
        )
        .route("/tokens/:id/disable", post(handlers::disable_token))
        .route("/tokens/:id/enable", post(handlers::enable_token))
        .route("/tokens/:id/revoke", post(handlers::revoke_token))
        .route("/tokens/:id/quota", get(handlers::token_quota))
        .route("/audit", get(handlers::list_audit_logs))
        .route("/usage", get(handlers::list_usage_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::require_admin,
        ));

    Router::new()
        .route("/login", post(handlers::login))
        .merge(protected)
        .route_layer(middleware::from_fn_with_state(state, track_admin))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

/// Request count and latency for the admin plane.
async fn track_admin(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let resp = next.run(req).await;
    let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    state
        .metrics
        .record_request("admin", resp.status().as_u16(), latency_ms);
    resp
}
