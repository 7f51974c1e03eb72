use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminAccount {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted session. `token_hash` is the SHA-256 of the bearer value.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminSession {
    pub token_hash: String,
    pub admin_id: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Authenticated operator, attached to admin-plane requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminIdentity {
    pub admin_id: i64,
    pub username: String,
    pub session_expires_at: DateTime<Utc>,
}
