//! Operator sessions for the admin plane.

use std::sync::Arc;

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::admin::{AdminIdentity, AdminSession};
use crate::models::token::hash_secret;
use crate::store::CredentialStore;
use crate::AppState;

pub const SESSION_HEADER: &str = "x-admin-session";
pub const SESSION_COOKIE: &str = "admin_session";

const MIN_PASSWORD_LEN: usize = 8;

/// Result of a successful login. `token` is only ever shown here.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub identity: AdminIdentity,
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unknown user, wrong password and disabled account are indistinguishable
    /// to the caller.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedSession, AppError> {
        let account = self
            .store
            .find_admin_by_username(username.trim())
            .await?
            .ok_or(AppError::InvalidLogin)?;

        if !account.is_active || !verify_password(password, &account.password_hash) {
            tracing::warn!(username = %account.username, "admin login rejected");
            return Err(AppError::InvalidLogin);
        }

        let token = generate_session_token();
        let now = self.clock.now();
        let session = AdminSession {
            token_hash: hash_secret(&token),
            admin_id: account.id,
            expires_at: now + self.ttl,
            created_at: now,
            last_accessed_at: now,
        };
        self.store.create_session(&session).await?;

        tracing::info!(admin_id = account.id, expires_at = %session.expires_at, "admin session created");
        Ok(IssuedSession {
            token,
            expires_at: session.expires_at,
            identity: AdminIdentity {
                admin_id: account.id,
                username: account.username,
                session_expires_at: session.expires_at,
            },
        })
    }

    /// Resolve a session token. Touches `last_accessed_at`; expiry is never
    /// extended.
    pub async fn validate(&self, token: &str) -> Result<AdminIdentity, AppError> {
        let token_hash = hash_secret(token.trim());
        let session = self
            .store
            .find_session_by_token(&token_hash)
            .await?
            .ok_or(AppError::SessionRequired)?;

        let now = self.clock.now();
        if session.expires_at <= now {
            return Err(AppError::SessionRequired);
        }

        let account = self
            .store
            .find_admin_by_id(session.admin_id)
            .await?
            .filter(|a| a.is_active)
            .ok_or(AppError::SessionRequired)?;

        self.store.touch_session(&token_hash, now).await?;

        Ok(AdminIdentity {
            admin_id: account.id,
            username: account.username,
            session_expires_at: session.expires_at,
        })
    }

    pub async fn logout(&self, token: &str) -> Result<bool, AppError> {
        Ok(self.store.delete_session(&hash_secret(token.trim())).await?)
    }
}

fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    if plain.len() < MIN_PASSWORD_LEN {
        anyhow::bail!("password must be at least {} characters", MIN_PASSWORD_LEN);
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?
        .to_string();
    Ok(hash)
}

/// A malformed stored hash verifies as false.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!("stored admin password hash is malformed: {}", e);
            false
        }
    }
}

/// Session token from the `x-admin-session` header, else the `admin_session`
/// cookie. The header wins when both are present.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(v.to_string());
    }

    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value for a fresh session.
pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/admin; Max-Age={}",
        ttl.num_seconds().max(0)
    )
}

/// `Set-Cookie` value that clears the session cookie.
pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Strict; Path=/admin; Max-Age=0")
}

/// Admin-plane guard. Attaches the [`AdminIdentity`] to the request.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = session_token(req.headers()).ok_or(AppError::SessionRequired)?;
    let identity = state.sessions.validate(&token).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn manager() -> (SessionManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        store.insert_admin("ops", &hash_password("correct horse").unwrap(), true);
        store.insert_admin("former", &hash_password("correct horse").unwrap(), false);
        (
            SessionManager::new(store.clone(), clock.clone(), Duration::hours(24)),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn test_login_validate_logout() {
        let (sessions, store, clock) = manager();
        let issued = sessions.login("ops", "correct horse").await.unwrap();
        assert_eq!(issued.token.len(), 64);
        assert_eq!(issued.expires_at, t0() + Duration::hours(24));

        clock.advance(Duration::hours(1));
        let identity = sessions.validate(&issued.token).await.unwrap();
        assert_eq!(identity.username, "ops");
        assert_eq!(identity.session_expires_at, t0() + Duration::hours(24));

        assert!(sessions.logout(&issued.token).await.unwrap());
        assert_eq!(store.session_count(), 0);
        assert!(matches!(
            sessions.validate(&issued.token).await,
            Err(AppError::SessionRequired)
        ));
    }

    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let (sessions, _, _) = manager();
        for (user, pass) in [("ops", "wrong pass"), ("nobody", "correct horse"), ("former", "correct horse")] {
            assert!(matches!(
                sessions.login(user, pass).await,
                Err(AppError::InvalidLogin)
            ));
        }
    }

    #[tokio::test]
    async fn test_use_does_not_extend_expiry() {
        let (sessions, _, clock) = manager();
        let issued = sessions.login("ops", "correct horse").await.unwrap();
        clock.advance(Duration::hours(23));
        assert!(sessions.validate(&issued.token).await.is_ok());
        clock.advance(Duration::hours(1));
        assert!(matches!(
            sessions.validate(&issued.token).await,
            Err(AppError::SessionRequired)
        ));
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("theme=dark; admin_session=from-cookie"));
        assert_eq!(session_token(&headers).as_deref(), Some("from-cookie"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(session_token(&headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_short_password_rejected() {
        assert!(hash_password("short").is_err());
        let hash = hash_password("long enough").unwrap();
        assert!(verify_password("long enough", &hash));
        assert!(!verify_password("long enougH", &hash));
        assert!(!verify_password("long enough", "not-a-phc-string"));
    }
}
