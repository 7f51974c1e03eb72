//! In-process store for tests and local runs. Every operation takes one lock,
//! which gives `consume_quota` the same all-or-nothing behaviour as the
//! Postgres transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;

use super::{CredentialStore, StoreError, StoreResult};
use crate::models::admin::{AdminAccount, AdminSession};
use crate::models::audit::{AuditLogEntry, AuditLogRow, UsageLogEntry, UsageQuery};
use crate::models::quota::{QuotaDecision, WindowSlot, WindowType};
use crate::models::token::{NewToken, Token, TokenUpdate};

type WindowKey = (i64, WindowType, DateTime<Utc>);

#[derive(Default)]
struct Inner {
    next_token_id: i64,
    tokens: BTreeMap<i64, Token>,
    windows: HashMap<WindowKey, (i64, DateTime<Utc>)>,
    usage: Vec<UsageLogEntry>,
    audit: Vec<AuditLogRow>,
    next_admin_id: i64,
    admins: BTreeMap<i64, AdminAccount>,
    sessions: HashMap<String, AdminSession>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_audit_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an operator account. `password_hash` is a PHC argon2 string.
    pub fn insert_admin(&self, username: &str, password_hash: &str, is_active: bool) -> AdminAccount {
        let mut inner = self.lock();
        inner.next_admin_id += 1;
        let account = AdminAccount {
            id: inner.next_admin_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_active,
            created_at: Utc::now(),
        };
        inner.admins.insert(account.id, account.clone());
        account
    }

    /// Make subsequent audit writes fail, to exercise error propagation.
    pub fn set_fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    pub fn usage_logs(&self) -> Vec<UsageLogEntry> {
        self.lock().usage.clone()
    }

    pub fn audit_logs(&self) -> Vec<AuditLogRow> {
        self.lock().audit.clone()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .skip(usize::try_from(offset.max(0)).unwrap_or(0))
        .take(usize::try_from(limit.max(0)).unwrap_or(0))
        .collect()
}

#[async_trait]
impl CredentialStore for MemoryStore {
    // -- Token Operations --

    async fn find_token_by_secret(&self, secret_hash: &str) -> StoreResult<Option<Token>> {
        let inner = self.lock();
        Ok(inner
            .tokens
            .values()
            .find(|t| bool::from(t.secret_hash.as_bytes().ct_eq(secret_hash.as_bytes())))
            .cloned())
    }

    async fn find_token_by_id(&self, id: i64) -> StoreResult<Option<Token>> {
        Ok(self.lock().tokens.get(&id).cloned())
    }

    async fn list_tokens(&self, limit: i64, offset: i64) -> StoreResult<Vec<Token>> {
        let inner = self.lock();
        Ok(page(inner.tokens.values().rev().cloned(), limit, offset))
    }

    async fn create_token(&self, token: &NewToken, now: DateTime<Utc>) -> StoreResult<Token> {
        let mut inner = self.lock();
        inner.next_token_id += 1;
        let record = Token {
            id: inner.next_token_id,
            name: token.name.clone(),
            secret_hash: token.secret_hash.clone(),
            masked_secret: token.masked_secret.clone(),
            environment: token.environment.as_str().to_string(),
            is_active: true,
            expires_at: token.expires_at,
            revoked_at: None,
            revoked_reason: None,
            allowed_ips: token.allowed_ips.clone(),
            rate_limit_per_minute: token.rate_limit_per_minute,
            rate_limit_per_hour: token.rate_limit_per_hour,
            rate_limit_per_day: token.rate_limit_per_day,
            vendor_name: token.vendor_name.clone(),
            filter_column: token.filter_column.clone(),
            filter_value: token.filter_value.clone(),
            is_super: token.is_super,
            created_by: token.created_by,
            created_at: now,
            updated_at: now,
        };
        inner.tokens.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_token(
        &self,
        id: i64,
        update: &TokenUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let mut inner = self.lock();
        Ok(inner.tokens.get_mut(&id).map(|token| {
            update.apply_to(token);
            token.updated_at = now;
            token.clone()
        }))
    }

    async fn disable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>> {
        let mut inner = self.lock();
        Ok(inner.tokens.get_mut(&id).map(|token| {
            token.is_active = false;
            token.updated_at = now;
            token.clone()
        }))
    }

    async fn enable_token(&self, id: i64, now: DateTime<Utc>) -> StoreResult<Option<Token>> {
        let mut inner = self.lock();
        Ok(inner.tokens.get_mut(&id).map(|token| {
            token.is_active = true;
            token.updated_at = now;
            token.clone()
        }))
    }

    async fn revoke_token(
        &self,
        id: i64,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let mut inner = self.lock();
        Ok(inner.tokens.get_mut(&id).map(|token| {
            if token.revoked_at.is_none() {
                token.revoked_at = Some(now);
                token.revoked_reason = reason.map(str::to_string);
            }
            token.is_active = false;
            token.updated_at = now;
            token.clone()
        }))
    }

    async fn delete_token(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock().tokens.remove(&id).is_some())
    }

    // -- Rate Limit Windows --

    async fn get_counter(
        &self,
        token_id: i64,
        window: WindowType,
        window_start: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(self
            .lock()
            .windows
            .get(&(token_id, window, window_start))
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }

    async fn increment_counter(&self, token_id: i64, slot: &WindowSlot) -> StoreResult<i64> {
        let mut inner = self.lock();
        let entry = inner
            .windows
            .entry((token_id, slot.window, slot.start))
            .or_insert((0, slot.end));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn consume_quota(
        &self,
        token_id: i64,
        slots: &[WindowSlot],
    ) -> StoreResult<QuotaDecision> {
        let mut inner = self.lock();

        for slot in slots {
            let count = inner
                .windows
                .get(&(token_id, slot.window, slot.start))
                .map(|(count, _)| *count)
                .unwrap_or(0);
            if count >= i64::from(slot.ceiling) {
                return Ok(QuotaDecision::Denied {
                    window: slot.window,
                    resets_at: slot.end,
                });
            }
        }

        for slot in slots {
            inner
                .windows
                .entry((token_id, slot.window, slot.start))
                .or_insert((0, slot.end))
                .0 += 1;
        }
        Ok(QuotaDecision::Allowed)
    }

    async fn purge_rate_windows(&self, ended_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.windows.len();
        inner.windows.retain(|_, (_, end)| *end >= ended_before);
        Ok((before - inner.windows.len()) as u64)
    }

    // -- Logs --

    async fn append_usage_log(&self, entry: &UsageLogEntry) -> StoreResult<()> {
        self.lock().usage.push(entry.clone());
        Ok(())
    }

    async fn list_usage_logs(&self, query: &UsageQuery) -> StoreResult<Vec<UsageLogEntry>> {
        let inner = self.lock();
        let matching = inner
            .usage
            .iter()
            .rev()
            .filter(|e| query.token_id.is_none() || e.token_id == query.token_id)
            .cloned();
        Ok(page(matching, query.limit.unwrap_or(50), query.offset.unwrap_or(0)))
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit log write rejected".into()));
        }
        let mut inner = self.lock();
        let id = inner.audit.len() as i64 + 1;
        inner.audit.push(AuditLogRow {
            id,
            admin_id: entry.admin_id,
            action: entry.action.as_str().to_string(),
            resource_type: entry.resource_type.clone(),
            resource_id: entry.resource_id.clone(),
            old_value: entry.old_value.clone(),
            new_value: entry.new_value.clone(),
            created_at: entry.created_at,
        });
        Ok(())
    }

    async fn list_audit_logs(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditLogRow>> {
        let inner = self.lock();
        Ok(page(inner.audit.iter().rev().cloned(), limit, offset))
    }

    // -- Admin Accounts & Sessions --

    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminAccount>> {
        Ok(self
            .lock()
            .admins
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn find_admin_by_id(&self, id: i64) -> StoreResult<Option<AdminAccount>> {
        Ok(self.lock().admins.get(&id).cloned())
    }

    async fn create_session(&self, session: &AdminSession) -> StoreResult<()> {
        self.lock()
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_session_by_token(&self, token_hash: &str) -> StoreResult<Option<AdminSession>> {
        Ok(self.lock().sessions.get(token_hash).cloned())
    }

    async fn touch_session(&self, token_hash: &str, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(session) = self.lock().sessions.get_mut(token_hash) {
            session.last_accessed_at = at;
        }
        Ok(())
    }

    async fn delete_session(&self, token_hash: &str) -> StoreResult<bool> {
        Ok(self.lock().sessions.remove(token_hash).is_some())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::{Environment, TokenSpec};
    use chrono::{Duration, TimeZone};

    fn slot(window: WindowType, ceiling: u32, start: DateTime<Utc>) -> WindowSlot {
        WindowSlot {
            window,
            start,
            end: start + window.length(),
            ceiling,
        }
    }

    #[tokio::test]
    async fn test_consume_quota_denies_without_incrementing() {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let slots = vec![
            slot(WindowType::Minute, 5, start),
            slot(WindowType::Hour, 1, start),
        ];

        assert!(store.consume_quota(1, &slots).await.unwrap().is_allowed());
        let decision = store.consume_quota(1, &slots).await.unwrap();
        assert!(matches!(
            decision,
            QuotaDecision::Denied {
                window: WindowType::Hour,
                ..
            }
        ));
        // the denied attempt left the minute counter untouched
        assert_eq!(store.get_counter(1, WindowType::Minute, start).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let issued = crate::models::token::NewToken::issue(
            TokenSpec {
                name: "ops".into(),
                is_super: true,
                ..Default::default()
            },
            Environment::Test,
            None,
        );
        let token = store.create_token(&issued.record, t0).await.unwrap();

        store.revoke_token(token.id, Some("leaked"), t0).await.unwrap();
        let again = store
            .revoke_token(token.id, Some("again"), t0 + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.revoked_at, Some(t0));
        assert_eq!(again.revoked_reason.as_deref(), Some("leaked"));
        assert!(!again.is_active);
    }

    #[tokio::test]
    async fn test_purges() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .increment_counter(1, &slot(WindowType::Minute, 1, t0))
            .await
            .unwrap();
        assert_eq!(store.purge_rate_windows(t0 + Duration::days(2)).await.unwrap(), 1);

        let account = store.insert_admin("root", "x", true);
        store
            .create_session(&AdminSession {
                token_hash: "h".into(),
                admin_id: account.id,
                expires_at: t0,
                created_at: t0,
                last_accessed_at: t0,
            })
            .await
            .unwrap();
        assert_eq!(store.purge_expired_sessions(t0).await.unwrap(), 1);
        assert_eq!(store.session_count(), 0);
    }
}
