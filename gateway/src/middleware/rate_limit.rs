use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};

use crate::clock::Clock;
use crate::models::quota::{QuotaDecision, WindowSlot, WindowType, WindowUsage};
use crate::models::token::RateCeilings;
use crate::store::{CredentialStore, StoreError};

/// Per-token request quotas over fixed minute, hour and day windows.
///
/// Counting is delegated to the store's atomic `consume_quota`; this type only
/// decides which windows apply and where they start.
pub struct QuotaEnforcer {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    day_offset: FixedOffset,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, day_offset: FixedOffset) -> Self {
        Self {
            store,
            clock,
            day_offset,
        }
    }

    /// Windows with a nonzero ceiling, in check order.
    pub fn slots(&self, ceilings: RateCeilings, now: DateTime<Utc>) -> Vec<WindowSlot> {
        WindowType::ORDERED
            .iter()
            .filter_map(|&window| {
                let ceiling = ceiling_for(ceilings, window);
                if ceiling == 0 {
                    return None;
                }
                let (start, end) = window.bounds(now, self.day_offset);
                Some(WindowSlot {
                    window,
                    start,
                    end,
                    ceiling,
                })
            })
            .collect()
    }

    pub async fn check_and_consume(
        &self,
        token_id: i64,
        ceilings: RateCeilings,
    ) -> Result<QuotaDecision, StoreError> {
        let slots = self.slots(ceilings, self.clock.now());
        if slots.is_empty() {
            return Ok(QuotaDecision::Allowed);
        }

        let decision = self.store.consume_quota(token_id, &slots).await?;
        if let QuotaDecision::Denied { window, resets_at } = &decision {
            tracing::warn!(
                token_id,
                window = %window,
                resets_at = %resets_at,
                "quota exhausted"
            );
        }
        Ok(decision)
    }

    /// Current counters for every configured window. Read-only.
    pub async fn usage(
        &self,
        token_id: i64,
        ceilings: RateCeilings,
    ) -> Result<Vec<WindowUsage>, StoreError> {
        let mut usage = Vec::new();
        for slot in self.slots(ceilings, self.clock.now()) {
            let count = self.store.get_counter(token_id, slot.window, slot.start).await?;
            usage.push(WindowUsage {
                window: slot.window,
                window_start: slot.start,
                count,
                ceiling: slot.ceiling,
            });
        }
        Ok(usage)
    }

    /// Whole seconds until `resets_at`, never less than one.
    pub fn retry_after_secs(&self, resets_at: DateTime<Utc>) -> u64 {
        let secs = (resets_at - self.clock.now()).num_seconds();
        u64::try_from(secs).unwrap_or(0).max(1)
    }
}

fn ceiling_for(ceilings: RateCeilings, window: WindowType) -> u32 {
    match window {
        WindowType::Minute => ceilings.per_minute,
        WindowType::Hour => ceilings.per_hour,
        WindowType::Day => ceilings.per_day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn enforcer(start: DateTime<Utc>) -> (QuotaEnforcer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let utc = FixedOffset::east_opt(0).unwrap();
        (
            QuotaEnforcer::new(Arc::new(MemoryStore::new()), clock.clone(), utc),
            clock,
        )
    }

    #[test]
    fn test_zero_ceilings_are_skipped() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let (q, _) = enforcer(now);
        let slots = q.slots(
            RateCeilings {
                per_minute: 0,
                per_hour: 100,
                per_day: 0,
            },
            now,
        );
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].window, WindowType::Hour);
    }

    #[tokio::test]
    async fn test_unlimited_token_always_allowed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let (q, _) = enforcer(now);
        for _ in 0..100 {
            assert!(q
                .check_and_consume(1, RateCeilings::default())
                .await
                .unwrap()
                .is_allowed());
        }
    }

    #[tokio::test]
    async fn test_hour_denial_reports_hour_window() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let (q, clock) = enforcer(now);
        let ceilings = RateCeilings {
            per_minute: 10,
            per_hour: 2,
            per_day: 0,
        };
        assert!(q.check_and_consume(7, ceilings).await.unwrap().is_allowed());
        clock.advance(Duration::minutes(1));
        assert!(q.check_and_consume(7, ceilings).await.unwrap().is_allowed());
        clock.advance(Duration::minutes(1));
        let decision = q.check_and_consume(7, ceilings).await.unwrap();
        assert_eq!(
            decision,
            QuotaDecision::Denied {
                window: WindowType::Hour,
                resets_at: Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap(),
            }
        );
        assert_eq!(
            q.retry_after_secs(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()),
            28 * 60
        );
    }

    #[tokio::test]
    async fn test_usage_reports_counts() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let (q, _) = enforcer(now);
        let ceilings = RateCeilings {
            per_minute: 5,
            per_hour: 0,
            per_day: 50,
        };
        q.check_and_consume(3, ceilings).await.unwrap();
        q.check_and_consume(3, ceilings).await.unwrap();
        let usage = q.usage(3, ceilings).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|u| u.count == 2));
    }
}
