// Joined ticket + machine row. Only the columns the scoping layer needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::BTreeMap;

/// Output aliases, in scan order. Every projection must produce exactly these.
pub const SCAN_CONTRACT: [&str; 14] = [
    "ticket_id",
    "ticket_number",
    "terminal_id",
    "status",
    "priority",
    "problem",
    "remarks",
    "assigned_to",
    "created_at",
    "updated_at",
    "location",
    "flm_name",
    "slm_name",
    "bank_name",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketRow {
    pub ticket_id: i64,
    pub ticket_number: String,
    pub terminal_id: String,
    pub status: String,
    pub priority: Option<String>,
    pub problem: Option<String>,
    pub remarks: Option<String>,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub flm_name: Option<String>,
    pub slm_name: Option<String>,
    pub bank_name: Option<String>,
}

impl TicketRow {
    /// Scan by position, following [`SCAN_CONTRACT`].
    pub fn from_positional(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            ticket_id: row.try_get(0)?,
            ticket_number: row.try_get(1)?,
            terminal_id: row.try_get(2)?,
            status: row.try_get(3)?,
            priority: row.try_get(4)?,
            problem: row.try_get(5)?,
            remarks: row.try_get(6)?,
            assigned_to: row.try_get(7)?,
            created_at: row.try_get(8)?,
            updated_at: row.try_get(9)?,
            location: row.try_get(10)?,
            flm_name: row.try_get(11)?,
            slm_name: row.try_get(12)?,
            bank_name: row.try_get(13)?,
        })
    }
}

/// Caller-supplied update body: logical field name → new value.
pub type TicketPatch = BTreeMap<String, Option<String>>;

/// Paged list response.
#[derive(Debug, Serialize)]
pub struct TicketPage {
    pub data: Vec<TicketRow>,
    pub total: i64,
    pub page: Option<u32>,
    pub per_page: u32,
}
