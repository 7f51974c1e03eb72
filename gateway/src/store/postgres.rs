use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{CredentialStore, StoreResult};
use crate::models::admin::{AdminAccount, AdminSession};
use crate::models::audit::{AuditLogEntry, AuditLogRow, UsageLogEntry, UsageQuery};
use crate::models::quota::{QuotaDecision, WindowSlot, WindowType};
use crate::models::token::{NewToken, Token, TokenUpdate};

const TOKEN_COLUMNS: &str = "id, name, secret_hash, masked_secret, environment, is_active, \
     expires_at, revoked_at, revoked_reason, allowed_ips, rate_limit_per_minute, \
     rate_limit_per_hour, rate_limit_per_day, vendor_name, filter_column, filter_value, \
     is_super, created_by, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let sql = format!(
            "UPDATE api_tokens SET is_active = $2, updated_at = $3 WHERE id = $1 RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Token>(&sql)
            .bind(id)
            .bind(active)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    // -- Token Operations --

    async fn find_token_by_secret(&self, secret_hash: &str) -> StoreResult<Option<Token>> {
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE secret_hash = $1");
        let row = sqlx::query_as::<_, Token>(&sql)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_token_by_id(&self, id: i64) -> StoreResult<Option<Token>> {
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE id = $1");
        let row = sqlx::query_as::<_, Token>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_tokens(&self, limit: i64, offset: i64) -> StoreResult<Vec<Token>> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query_as::<_, Token>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn create_token(&self, token: &NewToken, now: DateTime<Utc>) -> StoreResult<Token> {
        let sql = format!(
            r#"INSERT INTO api_tokens (name, secret_hash, masked_secret, environment, is_active,
                   expires_at, allowed_ips, rate_limit_per_minute, rate_limit_per_hour,
                   rate_limit_per_day, vendor_name, filter_column, filter_value, is_super,
                   created_by, created_at, updated_at)
               VALUES ($1, $2, $3, $4, true, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
               RETURNING {TOKEN_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, Token>(&sql)
            .bind(&token.name)
            .bind(&token.secret_hash)
            .bind(&token.masked_secret)
            .bind(token.environment.as_str())
            .bind(token.expires_at)
            .bind(&token.allowed_ips)
            .bind(token.rate_limit_per_minute)
            .bind(token.rate_limit_per_hour)
            .bind(token.rate_limit_per_day)
            .bind(&token.vendor_name)
            .bind(&token.filter_column)
            .bind(&token.filter_value)
            .bind(token.is_super)
            .bind(token.created_by)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_token(
        &self,
        id: i64,
        update: &TokenUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE id = $1 FOR UPDATE");
        let Some(mut token) = sqlx::query_as::<_, Token>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        update.apply_to(&mut token);

        let sql = format!(
            r#"UPDATE api_tokens SET name = $2, environment = $3, expires_at = $4, allowed_ips = $5,
                   rate_limit_per_minute = $6, rate_limit_per_hour = $7, rate_limit_per_day = $8,
                   vendor_name = $9, filter_column = $10, filter_value = $11, is_super = $12,
                   updated_at = $13
               WHERE id = $1
               RETURNING {TOKEN_COLUMNS}"#
        );
        let updated = sqlx::query_as::<_, Token>(&sql)
            .bind(id)
            .bind(&token.name)
            .bind(&token.environment)
            .bind(token.expires_at)
            .bind(&token.allowed_ips)
            .bind(token.rate_limit_per_minute)
            .bind(token.rate_limit_per_hour)
            .bind(token.rate_limit_per_day)
            .bind(&token.vendor_name)
            .bind(&token.filter_column)
            .bind(&token.filter_value)
            .bind(token.is_super)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn disable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>> {
        self.set_active(id, false, now).await
    }

    async fn enable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>> {
        self.set_active(id, true, now).await
    }

    async fn revoke_token(
        &self,
        id: i64,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let sql = format!(
            r#"UPDATE api_tokens
               SET revoked_at = COALESCE(revoked_at, $2),
                   revoked_reason = COALESCE(revoked_reason, $3),
                   is_active = false,
                   updated_at = $2
               WHERE id = $1
               RETURNING {TOKEN_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, Token>(&sql)
            .bind(id)
            .bind(now)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_token(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Rate Limit Windows --

    async fn get_counter(
        &self,
        token_id: i64,
        window: WindowType,
        window_start: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT request_count FROM rate_limit_windows WHERE token_id = $1 AND window_type = $2 AND window_start = $3",
        )
        .bind(token_id)
        .bind(window.as_str())
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment_counter(&self, token_id: i64, slot: &WindowSlot) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO rate_limit_windows (token_id, window_type, window_start, window_end, request_count)
               VALUES ($1, $2, $3, $4, 1)
               ON CONFLICT (token_id, window_type, window_start) DO UPDATE SET
                   request_count = rate_limit_windows.request_count + 1
               RETURNING request_count"#,
        )
        .bind(token_id)
        .bind(slot.window.as_str())
        .bind(slot.start)
        .bind(slot.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn consume_quota(
        &self,
        token_id: i64,
        slots: &[WindowSlot],
    ) -> StoreResult<QuotaDecision> {
        if slots.is_empty() {
            return Ok(QuotaDecision::Allowed);
        }

        let mut tx = self.pool.begin().await?;

        // The no-op upsert creates the row if needed and holds its lock until
        // commit, so concurrent requests for the same token serialize here.
        // Slots arrive minute -> hour -> day, which keeps lock order fixed.
        for slot in slots {
            let count = sqlx::query_scalar::<_, i64>(
                r#"INSERT INTO rate_limit_windows (token_id, window_type, window_start, window_end, request_count)
                   VALUES ($1, $2, $3, $4, 0)
                   ON CONFLICT (token_id, window_type, window_start) DO UPDATE SET
                       request_count = rate_limit_windows.request_count
                   RETURNING request_count"#,
            )
            .bind(token_id)
            .bind(slot.window.as_str())
            .bind(slot.start)
            .bind(slot.end)
            .fetch_one(&mut *tx)
            .await?;

            if count >= i64::from(slot.ceiling) {
                tx.rollback().await?;
                return Ok(QuotaDecision::Denied {
                    window: slot.window,
                    resets_at: slot.end,
                });
            }
        }

        for slot in slots {
            sqlx::query(
                "UPDATE rate_limit_windows SET request_count = request_count + 1 \
                 WHERE token_id = $1 AND window_type = $2 AND window_start = $3",
            )
            .bind(token_id)
            .bind(slot.window.as_str())
            .bind(slot.start)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(QuotaDecision::Allowed)
    }

    async fn purge_rate_windows(&self, ended_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_end < $1")
            .bind(ended_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Logs --

    async fn append_usage_log(&self, entry: &UsageLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO usage_logs (token_id, scope, method, path, status_code, latency_ms,
                   caller_ip, user_agent, correlation_id, error, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(entry.token_id)
        .bind(&entry.scope)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(entry.status_code)
        .bind(entry.latency_ms)
        .bind(&entry.caller_ip)
        .bind(&entry.user_agent)
        .bind(&entry.correlation_id)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_usage_logs(&self, query: &UsageQuery) -> StoreResult<Vec<UsageLogEntry>> {
        let rows = sqlx::query_as::<_, UsageLogEntry>(
            r#"SELECT token_id, scope, method, path, status_code, latency_ms, caller_ip,
                      user_agent, correlation_id, error, created_at
               FROM usage_logs
               WHERE ($1::BIGINT IS NULL OR token_id = $1)
               ORDER BY created_at DESC, id DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(query.token_id)
        .bind(query.limit.unwrap_or(50))
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO admin_audit_logs (admin_id, action, resource_type, resource_id,
                   old_value, new_value, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(entry.admin_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_logs(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditLogRow>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            r#"SELECT id, admin_id, action, resource_type, resource_id, old_value, new_value, created_at
               FROM admin_audit_logs
               ORDER BY created_at DESC, id DESC
               LIMIT $1 OFFSET $2"#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Admin Accounts & Sessions --

    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminAccount>> {
        let row = sqlx::query_as::<_, AdminAccount>(
            "SELECT id, username, password_hash, is_active, created_at FROM admin_users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_admin_by_id(&self, id: i64) -> StoreResult<Option<AdminAccount>> {
        let row = sqlx::query_as::<_, AdminAccount>(
            "SELECT id, username, password_hash, is_active, created_at FROM admin_users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_session(&self, session: &AdminSession) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO admin_sessions (token_hash, admin_id, expires_at, created_at, last_accessed_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&session.token_hash)
        .bind(session.admin_id)
        .bind(session.expires_at)
        .bind(session.created_at)
        .bind(session.last_accessed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session_by_token(&self, token_hash: &str) -> StoreResult<Option<AdminSession>> {
        let row = sqlx::query_as::<_, AdminSession>(
            "SELECT token_hash, admin_id, expires_at, created_at, last_accessed_at FROM admin_sessions WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_session(&self, token_hash: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE admin_sessions SET last_accessed_at = $2 WHERE token_hash = $1")
            .bind(token_hash)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, token_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM admin_sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM admin_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
