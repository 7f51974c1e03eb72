//! Column allowlists. Logical names supplied by callers are translated here;
//! nothing a caller sends is ever spliced into SQL text directly.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default ordering when the requested sort key is unknown.
pub const DEFAULT_SORT_COLUMN: &str = "t.created_at";
pub const DEFAULT_SORT_DIRECTION: SortDirection = SortDirection::Desc;

/// Columns matched by free-text search.
pub const SEARCH_COLUMNS: [&str; 2] = ["t.ticket_number", "t.terminal_id"];

/// Logical scope column names a token may carry.
const SCOPE_COLUMNS: &[(&str, &str)] = &[
    ("flm_name", "m.flm_name"),
    ("slm_name", "m.slm_name"),
    ("bank_name", "m.bank_name"),
    ("location", "m.location"),
    ("terminal_id", "t.terminal_id"),
];

const SORT_COLUMNS: &[(&str, &str)] = &[
    ("ticket_number", "t.ticket_number"),
    ("terminal_id", "t.terminal_id"),
    ("status", "t.status"),
    ("priority", "t.priority"),
    ("created_at", "t.created_at"),
    ("updated_at", "t.updated_at"),
    ("flm_name", "m.flm_name"),
    ("bank_name", "m.bank_name"),
    ("location", "m.location"),
];

const FILTER_COLUMNS: &[(&str, &str)] = &[
    ("status", "t.status"),
    ("priority", "t.priority"),
    ("terminal_id", "t.terminal_id"),
    ("flm_name", "m.flm_name"),
    ("slm_name", "m.slm_name"),
    ("bank_name", "m.bank_name"),
];

/// Ticket columns a PATCH may touch. Values are bare column names because
/// `UPDATE … SET` does not take a table alias.
const UPDATABLE_COLUMNS: &[(&str, &str)] = &[
    ("status", "status"),
    ("priority", "priority"),
    ("remarks", "remarks"),
    ("assigned_to", "assigned_to"),
];

static COLUMN_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap());

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    let key = key.trim();
    table
        .iter()
        .find(|(logical, _)| logical.eq_ignore_ascii_case(key))
        .map(|(_, column)| *column)
}

/// Resolve a token's `filter_column`. Unknown names are returned verbatim:
/// only administrators can set this field, and operator-added columns must
/// keep working without a code change.
pub fn scope_column(logical: &str) -> String {
    lookup(SCOPE_COLUMNS, logical)
        .map(str::to_string)
        .unwrap_or_else(|| logical.trim().to_string())
}

/// Shape check applied when an administrator writes a raw column reference.
pub fn is_column_reference(raw: &str) -> bool {
    COLUMN_REF.is_match(raw.trim())
}

pub fn sort_column(key: &str) -> Option<&'static str> {
    lookup(SORT_COLUMNS, key)
}

pub fn filter_column(key: &str) -> Option<&'static str> {
    lookup(FILTER_COLUMNS, key)
}

pub fn updatable_column(key: &str) -> Option<&'static str> {
    lookup(UPDATABLE_COLUMNS, key)
}

pub fn filter_fields() -> impl Iterator<Item = &'static str> {
    FILTER_COLUMNS.iter().map(|(logical, _)| *logical)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// Exactly `asc` or `desc`, any case. Everything else is `DESC`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "asc" => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_column_maps_known_names() {
        assert_eq!(scope_column("flm_name"), "m.flm_name");
        assert_eq!(scope_column("FLM_NAME"), "m.flm_name");
        assert_eq!(scope_column(" terminal_id "), "t.terminal_id");
    }

    #[test]
    fn test_scope_column_passes_unknown_through() {
        assert_eq!(scope_column("m.region_code"), "m.region_code");
    }

    #[test]
    fn test_column_reference_shape() {
        assert!(is_column_reference("m.region_code"));
        assert!(is_column_reference("region_code"));
        assert!(!is_column_reference("m.flm_name; DROP TABLE x"));
        assert!(!is_column_reference("1=1 OR m.flm_name"));
        assert!(!is_column_reference("a.b.c"));
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!(SortDirection::parse(Some("ASC")), SortDirection::Asc);
        assert_eq!(SortDirection::parse(Some("asc")), SortDirection::Asc);
        assert_eq!(SortDirection::parse(Some("desc")), SortDirection::Desc);
        assert_eq!(SortDirection::parse(Some("ascending")), SortDirection::Desc);
        assert_eq!(SortDirection::parse(None), SortDirection::Desc);
    }

    #[test]
    fn test_hostile_keys_are_not_in_allowlists() {
        assert!(sort_column(";drop table x;").is_none());
        assert!(filter_column("status = status OR 1=1").is_none());
        assert!(updatable_column("ticket_id").is_none());
    }
}
