pub mod dataset;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::admin::{AdminAccount, AdminSession};
use crate::models::audit::{AuditLogEntry, AuditLogRow, UsageLogEntry, UsageQuery};
use crate::models::quota::{QuotaDecision, WindowSlot, WindowType};
use crate::models::token::{NewToken, Token, TokenUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Pool exhausted or closed, or the connection itself failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for credentials, counters, sessions and logs.
/// Implementations: `PgStore` (PostgreSQL) and `MemoryStore` (single lock).
///
/// `consume_quota` must be atomic per token: concurrent callers may never
/// both observe a count below the ceiling and both increment past it.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // -- Token Operations --

    /// Exact-match lookup on the SHA-256 of the presented secret.
    async fn find_token_by_secret(&self, secret_hash: &str) -> StoreResult<Option<Token>>;

    async fn find_token_by_id(&self, id: i64) -> StoreResult<Option<Token>>;

    async fn list_tokens(&self, limit: i64, offset: i64) -> StoreResult<Vec<Token>>;

    async fn create_token(&self, token: &NewToken, now: DateTime<Utc>) -> StoreResult<Token>;

    /// Returns `None` when the token does not exist.
    async fn update_token(
        &self,
        id: i64,
        update: &TokenUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>>;

    async fn disable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>>;

    /// Reactivates a disabled token. Revocation is not undone.
    async fn enable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>>;

    /// Sets `revoked_at` once; a second revoke leaves the first timestamp.
    async fn revoke_token(
        &self,
        id: i64,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>>;

    async fn delete_token(&self, id: i64) -> StoreResult<bool>;

    // -- Rate Limit Windows --

    async fn get_counter(
        &self,
        token_id: i64,
        window: WindowType,
        window_start: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Unconditional increment, returns the new count.
    async fn increment_counter(&self, token_id: i64, slot: &WindowSlot) -> StoreResult<i64>;

    /// Check every slot in order and increment all of them only if none is
    /// at its ceiling.
    async fn consume_quota(&self, token_id: i64, slots: &[WindowSlot])
        -> StoreResult<QuotaDecision>;

    async fn purge_rate_windows(&self, ended_before: DateTime<Utc>) -> StoreResult<u64>;

    // -- Logs --

    async fn append_usage_log(&self, entry: &UsageLogEntry) -> StoreResult<()>;

    async fn list_usage_logs(&self, query: &UsageQuery) -> StoreResult<Vec<UsageLogEntry>>;

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> StoreResult<()>;

    async fn list_audit_logs(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditLogRow>>;

    // -- Admin Accounts & Sessions --

    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminAccount>>;

    async fn find_admin_by_id(&self, id: i64) -> StoreResult<Option<AdminAccount>>;

    async fn create_session(&self, session: &AdminSession) -> StoreResult<()>;

    async fn find_session_by_token(&self, token_hash: &str) -> StoreResult<Option<AdminSession>>;

    async fn touch_session(&self, token_hash: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn delete_session(&self, token_hash: &str) -> StoreResult<bool>;

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}
