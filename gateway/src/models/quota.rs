use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rate-limit window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    Minute,
    Hour,
    Day,
}

impl WindowType {
    /// Check order used by the quota enforcer.
    pub const ORDERED: [WindowType; 3] = [WindowType::Minute, WindowType::Hour, WindowType::Day];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Minute => "minute",
            WindowType::Hour => "hour",
            WindowType::Day => "day",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            WindowType::Minute => Duration::minutes(1),
            WindowType::Hour => Duration::hours(1),
            WindowType::Day => Duration::days(1),
        }
    }

    /// `[start, end)` of the window containing `now`. Day windows start at
    /// midnight in `day_offset`; minute and hour windows truncate in UTC.
    pub fn bounds(
        &self,
        now: DateTime<Utc>,
        day_offset: FixedOffset,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let shift = match self {
            WindowType::Day => i64::from(day_offset.local_minus_utc()),
            _ => 0,
        };
        let len = self.length().num_seconds();
        let local = now.timestamp() + shift;
        let into_window = local.rem_euclid(len);
        let start = now
            - Duration::seconds(into_window)
            - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos()));
        (start, start + self.length())
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One window the enforcer wants checked and consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSlot {
    pub window: WindowType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub ceiling: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied {
        window: WindowType,
        resets_at: DateTime<Utc>,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Current counter value for one window, as shown to administrators.
#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub window: WindowType,
    pub window_start: DateTime<Utc>,
    pub count: i64,
    pub ceiling: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_minute_bounds_truncate_seconds() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 13, 47, 31).unwrap() + Duration::milliseconds(250);
        let (start, end) = WindowType::Minute.bounds(now, utc());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 10, 13, 47, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 10, 13, 48, 0).unwrap());
    }

    #[test]
    fn test_hour_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 13, 47, 31).unwrap();
        let (start, _) = WindowType::Hour.bounds(now, utc());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 10, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_day_bounds_follow_reference_offset() {
        // 20:30 UTC on the 10th is 03:30 on the 11th at UTC+7.
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 20, 30, 0).unwrap();
        let plus7 = FixedOffset::east_opt(7 * 3600).unwrap();
        let (start, end) = WindowType::Day.bounds(now, plus7);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 10, 17, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));

        let (utc_start, _) = WindowType::Day.bounds(now, utc());
        assert_eq!(utc_start, Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
    }
}
