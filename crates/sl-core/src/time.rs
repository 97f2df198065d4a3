//! # Time Ranges & Granularity
//!
//! A histogram query covers a [`TimeRange`] and cuts it into buckets of one
//! [`Granularity`]. When the caller supplies no explicit granularity it is
//! resolved from the width of the range: wider ranges get coarser buckets so
//! the bucket count stays bounded.
//!
//! | Range width (whole seconds) | Bucket     |
//! |-----------------------------|------------|
//! | ≤ 15 minutes                | 10 seconds |
//! | ≤ 1 hour                    | 1 minute   |
//! | ≤ 4 hours                   | 5 minutes  |
//! | ≤ 24 hours                  | 30 minutes |
//! | ≤ 7 days                    | 1 hour     |
//! | ≤ 180 days                  | 1 day      |
//! | otherwise                   | 1 month    |
//!
//! Fixed-length units align by integer truncation. Months are calendar
//! months in UTC and are stepped with `chrono`.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SECOND_MS: u64 = 1_000;
pub const MINUTE_MS: u64 = 60 * SECOND_MS;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;
/// Nominal month length, only used to order granularities.
pub const MONTH_MS: u64 = 30 * DAY_MS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeRangeError {
    #[error("empty time range: start {start_ms} is not before end {end_ms}")]
    Empty { start_ms: u64, end_ms: u64 },
    #[error("timestamp {0} is outside the representable calendar range")]
    OutOfCalendar(u64),
}

/// Query time window in epoch milliseconds. Both ends are inclusive for
/// bucketing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    #[serde(rename = "startEpochMs")]
    pub start_ms: u64,
    #[serde(rename = "endEpochMs")]
    pub end_ms: u64,
}

impl TimeRange {
    pub fn new(start_ms: u64, end_ms: u64) -> Result<Self, TimeRangeError> {
        let range = Self { start_ms, end_ms };
        range.validate()?;
        Ok(range)
    }

    /// Deserialized ranges bypass [`TimeRange::new`]; callers check them here.
    pub fn validate(&self) -> Result<(), TimeRangeError> {
        if self.start_ms >= self.end_ms {
            return Err(TimeRangeError::Empty {
                start_ms: self.start_ms,
                end_ms: self.end_ms,
            });
        }
        Ok(())
    }

    pub fn width_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl TimeUnit {
    /// Exact length in milliseconds, `None` for calendar months.
    pub fn fixed_ms(self) -> Option<u64> {
        match self {
            Self::Second => Some(SECOND_MS),
            Self::Minute => Some(MINUTE_MS),
            Self::Hour => Some(HOUR_MS),
            Self::Day => Some(DAY_MS),
            Self::Month => None,
        }
    }

    pub fn nominal_ms(self) -> u64 {
        self.fixed_ms().unwrap_or(MONTH_MS)
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Second => write!(f, "second"),
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
            Self::Month => write!(f, "month"),
        }
    }
}

/// Bucket width: `num` units of `unit`, e.g. 5 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Granularity {
    pub num: u32,
    pub unit: TimeUnit,
}

// =============================================================================
// Resolution
// =============================================================================

const TIERS: [(u64, Granularity); 6] = [
    (15 * 60, Granularity::new(10, TimeUnit::Second)),
    (60 * 60, Granularity::new(1, TimeUnit::Minute)),
    (4 * 60 * 60, Granularity::new(5, TimeUnit::Minute)),
    (24 * 60 * 60, Granularity::new(30, TimeUnit::Minute)),
    (7 * 24 * 60 * 60, Granularity::new(1, TimeUnit::Hour)),
    (180 * 24 * 60 * 60, Granularity::new(1, TimeUnit::Day)),
];

const COARSEST: Granularity = Granularity::new(1, TimeUnit::Month);

impl Granularity {
    pub const fn new(num: u32, unit: TimeUnit) -> Self {
        Self { num, unit }
    }

    /// Granularity for a range of `span_secs` whole seconds. A span exactly
    /// on a tier boundary stays in that tier.
    pub fn for_span_secs(span_secs: u64) -> Self {
        TIERS
            .iter()
            .find(|(upper, _)| span_secs <= *upper)
            .map(|(_, g)| *g)
            .unwrap_or(COARSEST)
    }

    pub fn for_range(range: &TimeRange) -> Self {
        Self::for_span_secs(range.width_ms() / SECOND_MS)
    }

    /// Bucket width in milliseconds for fixed units, `None` for months.
    pub fn step_ms(&self) -> Option<u64> {
        self.unit.fixed_ms().map(|ms| ms * u64::from(self.num.max(1)))
    }

    /// Comparable width; months count as 30 days.
    pub fn nominal_ms(&self) -> u64 {
        self.unit.nominal_ms() * u64::from(self.num.max(1))
    }

    /// Start of the bucket enclosing `ts_ms`.
    pub fn align(&self, ts_ms: u64) -> Result<u64, TimeRangeError> {
        match self.step_ms() {
            Some(step) => Ok(align_fixed(ts_ms, step)),
            None => {
                let dt = to_datetime(ts_ms)?;
                let first = Utc
                    .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                    .single()
                    .ok_or(TimeRangeError::OutOfCalendar(ts_ms))?;
                from_datetime(first, ts_ms)
            }
        }
    }

    /// Start of the bucket following the one that starts at `bucket_ms`.
    pub fn advance(&self, bucket_ms: u64) -> Result<u64, TimeRangeError> {
        match self.step_ms() {
            Some(step) => bucket_ms
                .checked_add(step)
                .ok_or(TimeRangeError::OutOfCalendar(bucket_ms)),
            None => {
                let next = to_datetime(bucket_ms)?
                    .checked_add_months(Months::new(self.num.max(1)))
                    .ok_or(TimeRangeError::OutOfCalendar(bucket_ms))?;
                from_datetime(next, bucket_ms)
            }
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num == 1 {
            write!(f, "1 {}", self.unit)
        } else {
            write!(f, "{} {}s", self.num, self.unit)
        }
    }
}

/// Truncate `ts_ms` down to a multiple of `step_ms`. `step_ms == 0` is the
/// identity.
pub fn align_fixed(ts_ms: u64, step_ms: u64) -> u64 {
    if step_ms == 0 {
        return ts_ms;
    }
    ts_ms - ts_ms % step_ms
}

fn to_datetime(ts_ms: u64) -> Result<DateTime<Utc>, TimeRangeError> {
    i64::try_from(ts_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or(TimeRangeError::OutOfCalendar(ts_ms))
}

fn from_datetime(dt: DateTime<Utc>, origin_ms: u64) -> Result<u64, TimeRangeError> {
    u64::try_from(dt.timestamp_millis()).map_err(|_| TimeRangeError::OutOfCalendar(origin_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(start: u64, end: u64) -> Granularity {
        Granularity::for_range(&TimeRange::new(start, end).unwrap())
    }

    #[test]
    fn test_scenario_ranges_from_zero() {
        assert_eq!(resolve(0, 15 * MINUTE_MS + 1), Granularity::new(10, TimeUnit::Second));
        assert_eq!(resolve(0, 4 * HOUR_MS + 1), Granularity::new(5, TimeUnit::Minute));
        assert_eq!(resolve(0, 181 * DAY_MS + 1), Granularity::new(1, TimeUnit::Month));
    }

    #[test]
    fn test_tier_table() {
        let cases = [
            (15 * MINUTE_MS + 1, Granularity::new(10, TimeUnit::Second)),
            (30 * MINUTE_MS, Granularity::new(1, TimeUnit::Minute)),
            (60 * MINUTE_MS, Granularity::new(1, TimeUnit::Minute)),
            (2 * HOUR_MS, Granularity::new(5, TimeUnit::Minute)),
            (4 * HOUR_MS, Granularity::new(5, TimeUnit::Minute)),
            (20 * HOUR_MS, Granularity::new(30, TimeUnit::Minute)),
            (24 * HOUR_MS, Granularity::new(30, TimeUnit::Minute)),
            (6 * DAY_MS, Granularity::new(1, TimeUnit::Hour)),
            (7 * DAY_MS, Granularity::new(1, TimeUnit::Hour)),
            (179 * DAY_MS, Granularity::new(1, TimeUnit::Day)),
            (180 * DAY_MS, Granularity::new(1, TimeUnit::Day)),
            (181 * DAY_MS, Granularity::new(1, TimeUnit::Month)),
        ];
        for (end, want) in cases {
            assert_eq!(resolve(1, end), want, "range [1, {}]", end);
        }
    }

    #[test]
    fn test_boundary_stays_in_tier() {
        assert_eq!(resolve(0, 15 * MINUTE_MS), Granularity::new(10, TimeUnit::Second));
        assert_eq!(resolve(0, 15 * MINUTE_MS + SECOND_MS), Granularity::new(1, TimeUnit::Minute));
    }

    #[test]
    fn test_monotonic_in_width() {
        let mut prev = 0;
        let mut end = 1;
        while end < 400 * DAY_MS {
            let g = resolve(0, end);
            assert!(g.nominal_ms() >= prev, "granularity shrank at width {}", end);
            prev = g.nominal_ms();
            end = end * 3 / 2 + 7;
        }
    }

    #[test]
    fn test_empty_range_rejected() {
        assert_eq!(
            TimeRange::new(10, 10),
            Err(TimeRangeError::Empty { start_ms: 10, end_ms: 10 })
        );
        assert!(TimeRange::new(11, 10).is_err());
    }

    #[test]
    fn test_fixed_alignment() {
        let g = Granularity::new(5, TimeUnit::Minute);
        assert_eq!(g.align(5 * MINUTE_MS + 17).unwrap(), 5 * MINUTE_MS);
        assert_eq!(g.align(10 * MINUTE_MS).unwrap(), 10 * MINUTE_MS);
        assert_eq!(g.advance(10 * MINUTE_MS).unwrap(), 15 * MINUTE_MS);
    }

    #[test]
    fn test_month_alignment_and_stepping() {
        let g = Granularity::new(1, TimeUnit::Month);
        // 2024-02-15T12:00:00Z
        let mid_feb = 1_707_998_400_000;
        // 2024-02-01T00:00:00Z
        let feb_1 = 1_706_745_600_000;
        // 2024-03-01T00:00:00Z, 29 days later (leap year)
        let mar_1 = 1_709_251_200_000;
        assert_eq!(g.align(mid_feb).unwrap(), feb_1);
        assert_eq!(g.advance(feb_1).unwrap(), mar_1);
        assert_eq!(mar_1 - feb_1, 29 * DAY_MS);
    }

    #[test]
    fn test_display() {
        assert_eq!(Granularity::new(10, TimeUnit::Second).to_string(), "10 seconds");
        assert_eq!(Granularity::new(1, TimeUnit::Month).to_string(), "1 month");
    }
}
