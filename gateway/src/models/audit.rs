use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One data-plane request, written after the response status is known.
/// `token_id` is `None` when the request failed before a token resolved.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageLogEntry {
    pub token_id: Option<i64>,
    pub scope: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: i16,
    pub latency_ms: i64,
    pub caller_ip: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for the usage-log listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageQuery {
    pub token_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "token.create")]
    TokenCreate,
    #[serde(rename = "token.update")]
    TokenUpdate,
    #[serde(rename = "token.disable")]
    TokenDisable,
    #[serde(rename = "token.enable")]
    TokenEnable,
    #[serde(rename = "token.revoke")]
    TokenRevoke,
    #[serde(rename = "token.delete")]
    TokenDelete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TokenCreate => "token.create",
            AuditAction::TokenUpdate => "token.update",
            AuditAction::TokenDisable => "token.disable",
            AuditAction::TokenEnable => "token.enable",
            AuditAction::TokenRevoke => "token.revoke",
            AuditAction::TokenDelete => "token.delete",
        }
    }
}

/// Administrative mutation record. Snapshots never contain clear secrets.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub admin_id: i64,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn for_token(
        admin_id: i64,
        action: AuditAction,
        token_id: i64,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            admin_id,
            action,
            resource_type: "api_token".to_string(),
            resource_id: token_id.to_string(),
            old_value,
            new_value,
            created_at: at,
        }
    }
}

/// Audit row as read back by the admin listing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogRow {
    pub id: i64,
    pub admin_id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_action_wire_names() {
        assert_eq!(
            serde_json::to_value(AuditAction::TokenRevoke).unwrap(),
            "token.revoke"
        );
        assert_eq!(AuditAction::TokenDelete.as_str(), "token.delete");
    }

    #[test]
    fn test_for_token_sets_resource() {
        let entry = AuditLogEntry::for_token(3, AuditAction::TokenCreate, 42, None, None, Utc::now());
        assert_eq!(entry.resource_type, "api_token");
        assert_eq!(entry.resource_id, "42");
    }
}
