//! Scoped statement construction.
//!
//! Every caller-supplied value becomes a `$n` parameter. The only text spliced
//! into SQL comes from the allowlists in [`columns`](super::columns), the
//! validated [`Projection`], or a scope column set by an administrator.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::Deserialize;

use super::columns::{
    self, SortDirection, DEFAULT_SORT_COLUMN, DEFAULT_SORT_DIRECTION, SEARCH_COLUMNS,
};
use super::projection::{Projection, BASE_FROM};
use crate::errors::AppError;
use crate::models::scope::Scope;
use crate::models::ticket::TicketPatch;

/// Scoped reads always use the built-in projection.
static BUILTIN_PROJECTION: Lazy<Projection> = Lazy::new(Projection::default);

/// Upper bound on distinct filter values returned per field.
const DISTINCT_VALUES_CAP: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub count: Statement,
    pub data: Statement,
}

/// Paging limits from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_per_page: u32,
    pub max_per_page: u32,
    /// Row cap applied when the caller asks for no page at all.
    pub unpaged_cap: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_per_page: 50,
            max_per_page: 500,
            unpaged_cap: 500,
        }
    }
}

/// Caller list options. Unknown filter keys are dropped when the query is built.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub search: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl ListParams {
    /// Split a flat query string map: reserved keys become options, the rest
    /// are field filters.
    pub fn from_query(mut raw: HashMap<String, String>) -> Result<Self, AppError> {
        let page = parse_u32(raw.remove("page"), "page")?;
        let per_page = parse_u32(raw.remove("per_page"), "per_page")?;
        Ok(Self {
            page,
            per_page,
            sort_by: raw.remove("sort_by"),
            sort_dir: raw.remove("sort_dir"),
            search: raw.remove("search"),
            filters: raw.into_iter().collect(),
        })
    }

    /// `(page, per_page)` when paging is active.
    pub fn paging(&self, limits: &PageLimits) -> Option<(u32, u32)> {
        self.page.map(|page| {
            let per_page = self
                .per_page
                .unwrap_or(limits.default_per_page)
                .clamp(1, limits.max_per_page.max(1));
            (page.max(1), per_page)
        })
    }
}

fn parse_u32(raw: Option<String>, name: &str) -> Result<Option<u32>, AppError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("'{name}' must be a non-negative integer"))),
    }
}

/// Collects parameters and hands out their placeholders.
#[derive(Debug, Default, Clone)]
struct Binds(Vec<SqlValue>);

impl Binds {
    fn push(&mut self, value: SqlValue) -> String {
        self.0.push(value);
        format!("${}", self.0.len())
    }
}

fn scope_condition(scope: &Scope, binds: &mut Binds) -> Option<String> {
    match scope {
        Scope::ColumnEquals { column, value } => {
            let p = binds.push(SqlValue::Text(value.clone()));
            Some(format!("{column} = {p}"))
        }
        Scope::Unrestricted | Scope::NoRestriction => None,
    }
}

fn projection_for<'a>(scope: &Scope, operator: &'a Projection) -> &'a Projection {
    if scope.is_restricted() {
        &BUILTIN_PROJECTION
    } else {
        operator
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

/// Escape LIKE wildcards so search text only ever matches literally.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn order_by(params: &ListParams) -> String {
    let (column, direction) = match params.sort_by.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(key) => match columns::sort_column(key) {
            Some(column) => (column, SortDirection::parse(params.sort_dir.as_deref())),
            None => {
                tracing::debug!(sort_by = key, "unknown sort key, using default ordering");
                (DEFAULT_SORT_COLUMN, DEFAULT_SORT_DIRECTION)
            }
        },
        None => (DEFAULT_SORT_COLUMN, SortDirection::parse(params.sort_dir.as_deref())),
    };
    let dir = direction.as_sql();
    format!(" ORDER BY {column} {dir}, t.ticket_id {dir}")
}

/// Build the `COUNT` and bounded `SELECT` for a list request.
pub fn build_list_query(
    scope: &Scope,
    params: &ListParams,
    projection: &Projection,
    limits: &PageLimits,
) -> ListQuery {
    let mut binds = Binds::default();
    let mut conditions = Vec::new();

    if let Some(cond) = scope_condition(scope, &mut binds) {
        conditions.push(cond);
    }

    for (field, value) in &params.filters {
        if value.is_empty() {
            continue;
        }
        match columns::filter_column(field) {
            Some(column) => {
                let p = binds.push(SqlValue::Text(value.clone()));
                conditions.push(format!("{column} = {p}"));
            }
            None => tracing::debug!(field = %field, "ignoring unknown filter field"),
        }
    }

    if let Some(search) = params.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let p = binds.push(SqlValue::Text(format!("%{}%", escape_like(search))));
        conditions.push(format!(
            "({} ILIKE {p} OR {} ILIKE {p})",
            SEARCH_COLUMNS[0], SEARCH_COLUMNS[1]
        ));
    }

    let filter = where_clause(&conditions);
    let count = Statement {
        sql: format!("SELECT COUNT(*) FROM {BASE_FROM}{filter}"),
        params: binds.0.clone(),
    };

    let select_list = projection_for(scope, projection).select_list();
    let mut sql = format!("SELECT {select_list} FROM {BASE_FROM}{filter}{}", order_by(params));
    match params.paging(limits) {
        Some((page, per_page)) => {
            let offset = i64::from(page - 1) * i64::from(per_page);
            let limit_p = binds.push(SqlValue::Int(i64::from(per_page)));
            let offset_p = binds.push(SqlValue::Int(offset));
            sql.push_str(&format!(" LIMIT {limit_p} OFFSET {offset_p}"));
        }
        None => {
            let limit_p = binds.push(SqlValue::Int(i64::from(limits.unpaged_cap.max(1))));
            sql.push_str(&format!(" LIMIT {limit_p}"));
        }
    }

    ListQuery {
        count,
        data: Statement {
            sql,
            params: binds.0,
        },
    }
}

/// Single-row read. A row outside the scope is indistinguishable from a missing one.
pub fn build_get_query(scope: &Scope, ticket_id: i64, projection: &Projection) -> Statement {
    let mut binds = Binds::default();
    let mut conditions = vec![format!("t.ticket_id = {}", binds.push(SqlValue::Int(ticket_id)))];
    if let Some(cond) = scope_condition(scope, &mut binds) {
        conditions.push(cond);
    }
    let select_list = projection_for(scope, projection).select_list();
    Statement {
        sql: format!("SELECT {select_list} FROM {BASE_FROM}{}", where_clause(&conditions)),
        params: binds.0,
    }
}

/// Row read back after a committed update. Only the projection follows the
/// scope: the write may have moved the row out of it.
pub fn build_read_back_query(scope: &Scope, ticket_id: i64, projection: &Projection) -> Statement {
    let mut binds = Binds::default();
    let id_p = binds.push(SqlValue::Int(ticket_id));
    let select_list = projection_for(scope, projection).select_list();
    Statement {
        sql: format!("SELECT {select_list} FROM {BASE_FROM} WHERE t.ticket_id = {id_p}"),
        params: binds.0,
    }
}

/// Scoped mutation. The scope predicate lives in the same statement, so a
/// restricted token aimed at a foreign row updates nothing. Visibility is
/// decided over the same join as reads, so a ticket without a machine row is
/// writable exactly when it is readable.
pub fn build_update_query(
    scope: &Scope,
    ticket_id: i64,
    patch: &TicketPatch,
) -> Result<Statement, AppError> {
    if patch.is_empty() {
        return Err(AppError::NoFieldsProvided);
    }

    let mut binds = Binds::default();
    let mut assignments = Vec::with_capacity(patch.len() + 1);
    for (field, value) in patch {
        let column = columns::updatable_column(field).ok_or_else(|| {
            AppError::Validation(format!("field '{field}' does not exist or is read-only"))
        })?;
        let p = binds.push(match value {
            Some(v) => SqlValue::Text(v.clone()),
            None => SqlValue::Null,
        });
        assignments.push(format!("{column} = {p}"));
    }
    assignments.push("updated_at = NOW()".to_string());

    let id_p = binds.push(SqlValue::Int(ticket_id));
    let sql = match scope_condition(scope, &mut binds) {
        Some(cond) => format!(
            "UPDATE tickets AS t SET {} WHERE t.ticket_id = {id_p} \
             AND t.ticket_id IN (SELECT t.ticket_id FROM {BASE_FROM} WHERE {cond})",
            assignments.join(", ")
        ),
        None => format!(
            "UPDATE tickets AS t SET {} WHERE t.ticket_id = {id_p}",
            assignments.join(", ")
        ),
    };

    Ok(Statement {
        sql,
        params: binds.0,
    })
}

/// Map an update's affected-row count to the caller-facing outcome.
pub fn classify_update(rows_affected: u64, scope: &Scope) -> Result<(), AppError> {
    match (rows_affected, scope.is_restricted()) {
        (0, true) => Err(AppError::ScopeViolation),
        (0, false) => Err(AppError::NotFound),
        _ => Ok(()),
    }
}

/// Distinct values of one filterable field within `scope`. `None` for fields
/// that are not filterable.
pub fn build_distinct_query(scope: &Scope, field: &str) -> Option<Statement> {
    let column = columns::filter_column(field)?;
    let mut binds = Binds::default();
    let mut conditions = vec![format!("{column} IS NOT NULL")];
    if let Some(cond) = scope_condition(scope, &mut binds) {
        conditions.push(cond);
    }
    let limit_p = binds.push(SqlValue::Int(DISTINCT_VALUES_CAP));
    Some(Statement {
        sql: format!(
            "SELECT DISTINCT {column} FROM {BASE_FROM}{} ORDER BY {column} LIMIT {limit_p}",
            where_clause(&conditions)
        ),
        params: binds.0,
    })
}
