//! datagate: access-control and query-scoping layer over the ticket dataset.
//!
//! The binary in `main.rs` is a thin shell; everything it serves is built
//! here so integration tests in `tests/` can drive the same routers.

use std::sync::Arc;
use std::time::Duration;

pub mod api;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod query;
pub mod store;

use cache::FieldMetadataCache;
use clock::Clock;
use config::Config;
use middleware::audit::{AuditRecorder, UsageRecorder};
use middleware::authn::TokenAuthenticator;
use middleware::metrics::PrometheusRecorder;
use middleware::rate_limit::QuotaEnforcer;
use middleware::session::SessionManager;
use query::Projection;
use store::dataset::Dataset;
use store::CredentialStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn CredentialStore>,
    pub dataset: Arc<dyn Dataset>,
    pub clock: Arc<dyn Clock>,
    pub authenticator: TokenAuthenticator,
    pub quota: QuotaEnforcer,
    pub usage: UsageRecorder,
    pub audit: AuditRecorder,
    pub sessions: SessionManager,
    /// Validated at startup; only unrestricted reads use it.
    pub projection: Projection,
    pub metadata: FieldMetadataCache,
    pub metrics: PrometheusRecorder,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn CredentialStore>,
        dataset: Arc<dyn Dataset>,
        clock: Arc<dyn Clock>,
        projection: Projection,
    ) -> Self {
        Self {
            authenticator: TokenAuthenticator::new(store.clone(), clock.clone()),
            quota: QuotaEnforcer::new(store.clone(), clock.clone(), config.day_offset()),
            usage: UsageRecorder::new(store.clone()),
            audit: AuditRecorder::new(store.clone()),
            sessions: SessionManager::new(store.clone(), clock.clone(), config.session_ttl()),
            metadata: FieldMetadataCache::new(Duration::from_secs(config.metadata_cache_ttl_secs)),
            metrics: PrometheusRecorder::new(),
            projection,
            config,
            store,
            dataset,
            clock,
        }
    }
}
