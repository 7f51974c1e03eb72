use serde::Serialize;

/// Data-visibility restriction derived from a token. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Super token: every row is visible.
    Unrestricted,
    /// Vendor token: only rows where `column = value`.
    ColumnEquals { column: String, value: String },
    /// Neither super nor a complete filter pair. Reads like `Unrestricted`
    /// but is recorded separately so wide-open vendor tokens stay visible.
    NoRestriction,
}

impl Scope {
    pub fn is_restricted(&self) -> bool {
        matches!(self, Scope::ColumnEquals { .. })
    }

    /// Label written to usage logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Scope::Unrestricted => "super",
            Scope::ColumnEquals { .. } => "vendor",
            Scope::NoRestriction => "unscoped",
        }
    }

    /// Stable key for per-scope caches. Unrestricted and unscoped share data
    /// visibility, so they share a key.
    pub fn cache_key(&self) -> String {
        match self {
            Scope::Unrestricted | Scope::NoRestriction => "all".to_string(),
            Scope::ColumnEquals { column, value } => format!("{column}={value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_distinguish_super_from_unscoped() {
        assert_eq!(Scope::Unrestricted.label(), "super");
        assert_eq!(Scope::NoRestriction.label(), "unscoped");
        assert!(!Scope::NoRestriction.is_restricted());
        assert!(Scope::ColumnEquals {
            column: "m.flm_name".into(),
            value: "AVT".into()
        }
        .is_restricted());
    }

    #[test]
    fn test_cache_key_separates_vendors() {
        let a = Scope::ColumnEquals {
            column: "m.flm_name".into(),
            value: "AVT".into(),
        };
        let b = Scope::ColumnEquals {
            column: "m.flm_name".into(),
            value: "OTHER".into(),
        };
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(Scope::Unrestricted.cache_key(), Scope::NoRestriction.cache_key());
    }
}
