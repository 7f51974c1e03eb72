//! Background job: purge expired admin sessions and stale rate-limit windows.
//!
//! Runs hourly. Window rows are kept for two days after they close so the
//! admin quota view and ad-hoc debugging still see yesterday's counters.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::FieldMetadataCache;
use crate::clock::Clock;
use crate::store::CredentialStore;

const RATE_WINDOW_RETENTION_DAYS: i64 = 2;

/// Spawn the background cleanup task. Call this once at startup.
pub fn spawn(
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    metadata: FieldMetadataCache,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(3600)); // every hour
        loop {
            interval.tick().await;
            if let Err(e) = run_once(store.as_ref(), clock.as_ref()).await {
                tracing::error!("cleanup job failed: {}", e);
            }
            let evicted = metadata.evict_expired();
            if evicted > 0 {
                tracing::debug!(entries = evicted, "evicted expired metadata cache entries");
            }
        }
    })
}

/// One cleanup pass. Returns `(sessions, windows)` removed.
pub async fn run_once(store: &dyn CredentialStore, clock: &dyn Clock) -> anyhow::Result<(u64, u64)> {
    let now = clock.now();

    let sessions = store.purge_expired_sessions(now).await?;
    if sessions > 0 {
        tracing::info!(rows = sessions, "purged expired admin sessions");
    }

    let cutoff = now - chrono::Duration::days(RATE_WINDOW_RETENTION_DAYS);
    let windows = store.purge_rate_windows(cutoff).await?;
    if windows > 0 {
        tracing::info!(rows = windows, "purged stale rate limit windows");
    }

    Ok((sessions, windows))
}
