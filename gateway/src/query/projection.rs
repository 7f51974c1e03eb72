//! Projection used by unrestricted reads.
//!
//! Operators may override the column expressions through a YAML file, but the
//! output aliases must match [`SCAN_CONTRACT`] exactly, in order. The check runs
//! once at startup so a bad file stops the process instead of mis-scanning rows.

use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::models::ticket::SCAN_CONTRACT;

/// Fixed join every ticket read uses. Scope, filter and sort columns reference
/// the `t` and `m` aliases.
pub const BASE_FROM: &str = "tickets AS t LEFT JOIN machines AS m ON m.terminal_id = t.terminal_id";

const DEFAULT_EXPRESSIONS: [&str; 14] = [
    "t.ticket_id",
    "t.ticket_number",
    "t.terminal_id",
    "t.status",
    "t.priority",
    "t.problem",
    "t.remarks",
    "t.assigned_to",
    "t.created_at",
    "t.updated_at",
    "m.location",
    "m.flm_name",
    "m.slm_name",
    "m.bank_name",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectionColumn {
    pub alias: String,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Projection {
    pub columns: Vec<ProjectionColumn>,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            columns: SCAN_CONTRACT
                .iter()
                .zip(DEFAULT_EXPRESSIONS.iter())
                .map(|(alias, expr)| ProjectionColumn {
                    alias: (*alias).to_string(),
                    expr: (*expr).to_string(),
                })
                .collect(),
        }
    }
}

impl Projection {
    /// Load and validate an operator projection file.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading projection config {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid projection config {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let projection: Projection = serde_yaml::from_str(raw)?;
        projection.validate()?;
        Ok(projection)
    }

    /// Column count and alias order must match the scan contract.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.columns.len() != SCAN_CONTRACT.len() {
            bail!(
                "projection has {} columns, scan contract expects {}",
                self.columns.len(),
                SCAN_CONTRACT.len()
            );
        }
        for (i, (col, expected)) in self.columns.iter().zip(SCAN_CONTRACT.iter()).enumerate() {
            if col.alias != *expected {
                bail!(
                    "projection column {} is aliased '{}', scan contract expects '{}'",
                    i,
                    col.alias,
                    expected
                );
            }
            if col.expr.trim().is_empty() {
                bail!("projection column '{}' has an empty expression", col.alias);
            }
            if col.expr.contains(';') || col.expr.contains("--") {
                bail!("projection column '{}' contains a statement separator or comment", col.alias);
            }
        }
        Ok(())
    }

    /// `expr AS alias, …`
    pub fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} AS {}", c.expr.trim(), c.alias))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
