use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::token::{hash_secret, Token};
use crate::store::CredentialStore;

/// Resolves a presented secret to a usable token.
///
/// Has no side effects: counters and usage logs belong to the pipeline.
pub struct TokenAuthenticator {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl TokenAuthenticator {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn authenticate(
        &self,
        credential: &str,
        caller_ip: Option<&str>,
    ) -> Result<Token, AppError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AppError::MissingCredential);
        }

        let token = self
            .store
            .find_token_by_secret(&hash_secret(credential))
            .await?
            .ok_or(AppError::UnknownCredential)?;

        check_token(&token, self.clock.now(), caller_ip)?;
        Ok(token)
    }
}

/// Validity checks in precedence order. Expiry is checked first so an
/// expired token reports as expired even when it is also revoked or disabled.
pub fn check_token(token: &Token, now: DateTime<Utc>, caller_ip: Option<&str>) -> Result<(), AppError> {
    if token.is_expired(now) {
        return Err(AppError::CredentialExpired);
    }
    if token.is_revoked() {
        return Err(AppError::CredentialRevoked);
    }
    if !token.is_active {
        return Err(AppError::CredentialDisabled);
    }
    if !ip_allowed(&token.allowed_ips, caller_ip) {
        return Err(AppError::IpNotAllowed);
    }
    Ok(())
}

/// Exact string membership. An empty allowlist admits everyone; an unknown
/// caller address never matches a non-empty one.
fn ip_allowed(allowed: &[String], caller_ip: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match caller_ip {
        Some(ip) => allowed.iter().any(|a| a.trim() == ip),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::token::{Environment, NewToken, TokenSpec};
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    async fn setup(spec: TokenSpec) -> (TokenAuthenticator, Arc<MemoryStore>, String, i64) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let issued = NewToken::issue(spec, Environment::Test, None);
        let token = store.create_token(&issued.record, t0()).await.unwrap();
        (
            TokenAuthenticator::new(store.clone(), clock),
            store,
            issued.secret,
            token.id,
        )
    }

    fn vendor_spec() -> TokenSpec {
        TokenSpec {
            name: "avt".into(),
            filter_column: Some("flm_name".into()),
            filter_value: Some("AVT".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_valid_token_authenticates() {
        let (auth, _, secret, id) = setup(vendor_spec()).await;
        let token = auth.authenticate(&secret, Some("10.0.0.1")).await.unwrap();
        assert_eq!(token.id, id);
    }

    #[tokio::test]
    async fn test_unknown_and_missing() {
        let (auth, _, _, _) = setup(vendor_spec()).await;
        assert!(matches!(
            auth.authenticate("test_nope", None).await,
            Err(AppError::UnknownCredential)
        ));
        assert!(matches!(
            auth.authenticate("   ", None).await,
            Err(AppError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_expired_dominates_revoked_and_disabled() {
        let (auth, store, secret, id) = setup(TokenSpec {
            expires_at: Some(t0() - Duration::seconds(1)),
            ..vendor_spec()
        })
        .await;
        store.revoke_token(id, Some("leak"), t0()).await.unwrap();
        store.disable_token(id, t0()).await.unwrap();

        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::CredentialExpired)
        ));
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let (auth, _, secret, _) = setup(TokenSpec {
            expires_at: Some(t0()),
            ..vendor_spec()
        })
        .await;
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::CredentialExpired)
        ));
    }

    #[tokio::test]
    async fn test_revoked_before_disabled() {
        let (auth, store, secret, id) = setup(vendor_spec()).await;
        store.disable_token(id, t0()).await.unwrap();
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::CredentialDisabled)
        ));
        store.revoke_token(id, None, t0()).await.unwrap();
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::CredentialRevoked)
        ));
    }

    #[tokio::test]
    async fn test_ip_allowlist() {
        let (auth, _, secret, _) = setup(TokenSpec {
            allowed_ips: vec!["10.0.0.1".into()],
            ..vendor_spec()
        })
        .await;
        assert!(auth.authenticate(&secret, Some("10.0.0.1")).await.is_ok());
        assert!(matches!(
            auth.authenticate(&secret, Some("10.0.0.2")).await,
            Err(AppError::IpNotAllowed)
        ));
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::IpNotAllowed)
        ));
    }
}
