use crate::models::scope::Scope;
use crate::models::token::Token;
use crate::query::columns;

/// Derive the data-visibility scope of a token. `is_super` wins over any
/// filter pair; a half-filled or blank pair means no restriction.
pub fn resolve_scope(token: &Token) -> Scope {
    if token.is_super {
        return Scope::Unrestricted;
    }

    let column = token.filter_column.as_deref().map(str::trim).unwrap_or("");
    let value = token.filter_value.as_deref().map(str::trim).unwrap_or("");
    if column.is_empty() || value.is_empty() {
        return Scope::NoRestriction;
    }

    Scope::ColumnEquals {
        column: columns::scope_column(column),
        value: value.to_string(),
    }
}
