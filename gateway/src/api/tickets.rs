//! Thin data-plane surface over the scoped query builder.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::middleware::pipeline::RequestContext;
use crate::models::ticket::{TicketPage, TicketPatch, TicketRow};
use crate::query::{self, columns, ListParams};
use crate::AppState;

#[derive(Serialize)]
pub struct FilterValues {
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Serialize)]
pub struct FilterFields {
    pub fields: Vec<&'static str>,
}

/// GET /api/v1/tickets
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(raw): Query<HashMap<String, String>>,
) -> Result<Json<TicketPage>, AppError> {
    let params = ListParams::from_query(raw)?;
    let limits = state.config.page_limits();
    let q = query::build_list_query(&ctx.scope, &params, &state.projection, &limits);

    let total = state.dataset.fetch_count(&q.count).await?;
    let data = state.dataset.fetch_rows(&q.data).await?;

    let (page, per_page) = match params.paging(&limits) {
        Some((page, per_page)) => (Some(page), per_page),
        None => (None, limits.unpaged_cap),
    };
    Ok(Json(TicketPage {
        data,
        total,
        page,
        per_page,
    }))
}

/// GET /api/v1/tickets/:id. Rows outside the token's scope are reported as
/// missing.
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<i64>,
) -> Result<Json<TicketRow>, AppError> {
    let stmt = query::build_get_query(&ctx.scope, id, &state.projection);
    let row = state
        .dataset
        .fetch_optional_row(&stmt)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(row))
}

/// PATCH /api/v1/tickets/:id
pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<i64>,
    Json(patch): Json<TicketPatch>,
) -> Result<Json<TicketRow>, AppError> {
    let stmt = query::build_update_query(&ctx.scope, id, &patch)?;
    let affected = state.dataset.execute(&stmt).await?;

    if let Err(e) = query::classify_update(affected, &ctx.scope) {
        if matches!(e, AppError::ScopeViolation) {
            tracing::warn!(
                token_id = ctx.token_id,
                ticket_id = id,
                correlation_id = %ctx.correlation_id,
                "update outside token scope"
            );
        }
        return Err(e);
    }

    state.metadata.invalidate_all();
    tracing::info!(
        token_id = ctx.token_id,
        ticket_id = id,
        fields = ?patch.keys().collect::<Vec<_>>(),
        "ticket updated"
    );

    let read_back = query::build_read_back_query(&ctx.scope, id, &state.projection);
    let row = state
        .dataset
        .fetch_optional_row(&read_back)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(row))
}

/// GET /api/v1/tickets/filters
pub async fn list_filter_fields() -> Json<FilterFields> {
    Json(FilterFields {
        fields: columns::filter_fields().collect(),
    })
}

/// GET /api/v1/tickets/filters/:field. Distinct values visible to this scope,
/// cached per scope.
pub async fn filter_values(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(field): Path<String>,
) -> Result<Json<FilterValues>, AppError> {
    let stmt = query::build_distinct_query(&ctx.scope, &field)
        .ok_or_else(|| AppError::Validation(format!("'{}' is not a filterable field", field)))?;

    let dataset = state.dataset.clone();
    let values = state
        .metadata
        .get_or_refresh(&ctx.scope, &field, || async move {
            dataset.fetch_strings(&stmt).await
        })
        .await?;

    Ok(Json(FilterValues { field, values }))
}
