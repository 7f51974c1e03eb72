use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::scope::Scope;

/// Entry stored in the DashMap with an expiry timestamp.
#[derive(Clone)]
struct CacheEntry {
    values: Vec<String>,
    expires_at: Instant,
    generation: u64,
}

/// Distinct filter values per (scope, field), held for a fixed TTL.
///
/// Keys include the scope so values visible to one vendor are never served
/// to another. Entries are checked on read and evicted lazily.
///
/// Every entry is stamped with the generation current when its refresh
/// started. [`invalidate_all`](Self::invalidate_all) bumps the generation, so
/// a refresh that was in flight across an invalidation is never served.
#[derive(Clone)]
pub struct FieldMetadataCache {
    local: Arc<DashMap<String, CacheEntry>>,
    generation: Arc<AtomicU64>,
    ttl: Duration,
}

impl FieldMetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    fn key(scope: &Scope, field: &str) -> String {
        format!("{}|{}", scope.cache_key(), field.to_ascii_lowercase())
    }

    pub fn get(&self, scope: &Scope, field: &str) -> Option<Vec<String>> {
        let key = Self::key(scope, field);
        if let Some(entry) = self.local.get(&key) {
            if Instant::now() < entry.expires_at
                && entry.generation == self.generation.load(Ordering::Acquire)
            {
                return Some(entry.values.clone());
            }
            // expired or stale, drop the ref before removing
            drop(entry);
            self.local.remove(&key);
        }
        None
    }

    /// Cached values, or the result of `refresh` (stored on success).
    /// Concurrent misses may both refresh; the last write wins.
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        scope: &Scope,
        field: &str,
        refresh: F,
    ) -> Result<Vec<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
    {
        if let Some(values) = self.get(scope, field) {
            return Ok(values);
        }
        let started = self.generation.load(Ordering::Acquire);
        let values = refresh().await?;
        if self.generation.load(Ordering::Acquire) == started {
            self.local.insert(
                Self::key(scope, field),
                CacheEntry {
                    values: values.clone(),
                    expires_at: Instant::now() + self.ttl,
                    generation: started,
                },
            );
        }
        Ok(values)
    }

    /// Drop everything, e.g. after a write changed the dataset.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.local.clear();
    }

    /// Remove expired entries. Called from the cleanup job.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        let current = self.generation.load(Ordering::Acquire);
        self.local
            .retain(|_, e| e.expires_at > now && e.generation == current);
        before - self.local.len()
    }
}
