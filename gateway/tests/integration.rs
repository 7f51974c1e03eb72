//! Integration tests for credential checks and quota enforcement.
//!
//! These run against `MemoryStore` and a `ManualClock`, so no database is
//! needed. The Postgres-backed equivalents live in `tests/postgres.rs`.

use std::sync::Arc;

use chrono::{Duration, Offset, TimeZone, Utc};
use datagate::clock::{Clock, ManualClock};
use datagate::errors::AppError;
use datagate::middleware::authn::TokenAuthenticator;
use datagate::middleware::rate_limit::QuotaEnforcer;
use datagate::models::quota::{QuotaDecision, WindowType};
use datagate::models::token::{Environment, NewToken, Token, TokenSpec};
use datagate::store::memory::MemoryStore;
use datagate::store::CredentialStore;

fn clock_at(h: u32, m: u32, s: u32) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap(),
    ))
}

async fn seed_token(store: &MemoryStore, clock: &dyn Clock, spec: TokenSpec) -> (String, Token) {
    let issued = NewToken::issue(spec, Environment::Test, None);
    let token = store.create_token(&issued.record, clock.now()).await.unwrap();
    (issued.secret, token)
}

fn vendor_spec(per_minute: i32) -> TokenSpec {
    TokenSpec {
        name: "avt-readonly".into(),
        rate_limit_per_minute: per_minute,
        filter_column: Some("flm_name".into()),
        filter_value: Some("AVT".into()),
        ..Default::default()
    }
}

mod authentication_tests {
    use super::*;

    /// A token that is expired, revoked and disabled all at once reports as expired.
    #[tokio::test]
    async fn test_expiry_dominates_revocation_and_disable() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(12, 0, 0);
        let (secret, token) = seed_token(&store, clock.as_ref(), vendor_spec(0)).await;

        store
            .update_token(
                token.id,
                &datagate::models::token::TokenUpdate {
                    expires_at: Some(Some(clock.now() - Duration::minutes(5))),
                    ..Default::default()
                },
                clock.now(),
            )
            .await
            .unwrap();
        store.revoke_token(token.id, Some("leaked"), clock.now()).await.unwrap();
        store.disable_token(token.id, clock.now()).await.unwrap();

        let auth = TokenAuthenticator::new(store.clone(), clock.clone());
        let err = auth.authenticate(&secret, None).await.unwrap_err();
        assert!(matches!(err, AppError::CredentialExpired), "got {err:?}");
    }

    /// Expiry is inclusive: a token expiring exactly now is already expired.
    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(12, 0, 0);
        let spec = TokenSpec {
            expires_at: Some(clock.now() + Duration::seconds(30)),
            ..vendor_spec(0)
        };
        let (secret, _) = seed_token(&store, clock.as_ref(), spec).await;
        let auth = TokenAuthenticator::new(store.clone(), clock.clone());

        assert!(auth.authenticate(&secret, None).await.is_ok());
        clock.advance(Duration::seconds(30));
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::CredentialExpired)
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_blank_credentials_are_distinct() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(12, 0, 0);
        let auth = TokenAuthenticator::new(store, clock);

        assert!(matches!(
            auth.authenticate("   ", None).await,
            Err(AppError::MissingCredential)
        ));
        assert!(matches!(
            auth.authenticate("dev_doesnotexist", None).await,
            Err(AppError::UnknownCredential)
        ));
    }

    #[tokio::test]
    async fn test_ip_allowlist_enforced() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(12, 0, 0);
        let spec = TokenSpec {
            allowed_ips: vec!["10.0.0.7".into()],
            ..vendor_spec(0)
        };
        let (secret, _) = seed_token(&store, clock.as_ref(), spec).await;
        let auth = TokenAuthenticator::new(store, clock);

        assert!(auth.authenticate(&secret, Some("10.0.0.7")).await.is_ok());
        assert!(matches!(
            auth.authenticate(&secret, Some("10.0.0.8")).await,
            Err(AppError::IpNotAllowed)
        ));
        assert!(matches!(
            auth.authenticate(&secret, None).await,
            Err(AppError::IpNotAllowed)
        ));
    }
}

mod quota_tests {
    use super::*;

    /// Two per minute: allowed, allowed, denied, then allowed again in the
    /// next minute.
    #[tokio::test]
    async fn test_minute_window_denies_third_request() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(9, 15, 10);
        let (_, token) = seed_token(&store, clock.as_ref(), vendor_spec(2)).await;
        let quota = QuotaEnforcer::new(store.clone(), clock.clone(), Utc.fix());

        assert_eq!(
            quota.check_and_consume(token.id, token.ceilings()).await.unwrap(),
            QuotaDecision::Allowed
        );
        assert_eq!(
            quota.check_and_consume(token.id, token.ceilings()).await.unwrap(),
            QuotaDecision::Allowed
        );
        match quota.check_and_consume(token.id, token.ceilings()).await.unwrap() {
            QuotaDecision::Denied { window, resets_at } => {
                assert_eq!(window, WindowType::Minute);
                assert_eq!(resets_at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 16, 0).unwrap());
            }
            other => panic!("expected denial, got {other:?}"),
        }

        clock.advance(Duration::seconds(50));
        assert_eq!(
            quota.check_and_consume(token.id, token.ceilings()).await.unwrap(),
            QuotaDecision::Allowed
        );
    }

    /// A denied request consumes nothing in any window.
    #[tokio::test]
    async fn test_denial_does_not_consume_other_windows() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(9, 0, 0);
        let spec = TokenSpec {
            rate_limit_per_hour: 100,
            ..vendor_spec(1)
        };
        let (_, token) = seed_token(&store, clock.as_ref(), spec).await;
        let quota = QuotaEnforcer::new(store.clone(), clock.clone(), Utc.fix());

        assert!(quota.check_and_consume(token.id, token.ceilings()).await.unwrap().is_allowed());
        assert!(!quota.check_and_consume(token.id, token.ceilings()).await.unwrap().is_allowed());
        assert!(!quota.check_and_consume(token.id, token.ceilings()).await.unwrap().is_allowed());

        let usage = quota.usage(token.id, token.ceilings()).await.unwrap();
        let hour = usage.iter().find(|u| u.window == WindowType::Hour).unwrap();
        assert_eq!(hour.count, 1);
    }

    #[tokio::test]
    async fn test_zero_ceilings_are_unlimited() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(9, 0, 0);
        let (_, token) = seed_token(&store, clock.as_ref(), vendor_spec(0)).await;
        let quota = QuotaEnforcer::new(store.clone(), clock, Utc.fix());

        for _ in 0..100 {
            assert!(quota.check_and_consume(token.id, token.ceilings()).await.unwrap().is_allowed());
        }
        assert!(quota.usage(token.id, token.ceilings()).await.unwrap().is_empty());
    }

    /// 50 concurrent requests against a limit of 10 admit exactly 10.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_exceed_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock_at(9, 0, 0);
        let (_, token) = seed_token(&store, clock.as_ref(), vendor_spec(10)).await;
        let quota = Arc::new(QuotaEnforcer::new(store.clone(), clock, Utc.fix()));

        let handles = (0..50).map(|_| {
            let quota = quota.clone();
            let ceilings = token.ceilings();
            let id = token.id;
            tokio::spawn(async move { quota.check_and_consume(id, ceilings).await })
        });
        let results = futures::future::join_all(handles).await;

        let allowed = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(QuotaDecision::is_allowed)
            .count();
        assert_eq!(allowed, 10);
    }
}
