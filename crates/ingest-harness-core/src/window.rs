//! Collection windows.
//!
//! Upstream APIs bound history differently, so the mapping from a since-cursor
//! to the range a run actually requests is a per-connector [`WindowPolicy`]:
//!
//! - [`WindowPolicy::Since`]: the cursor itself is the lower bound and "now"
//!   the upper bound. Used by APIs that filter on an updated/created date.
//! - [`WindowPolicy::DayRange`]: whole days, ending the day before "now"
//!   (the current day is still accumulating), never reaching back further
//!   than `max_lookback_days`. Used by daily usage reports.
//! - [`WindowPolicy::Custom`]: any other rule.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// The time range a collection run requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectWindow {
    /// Inclusive lower bound; `None` means "everything the source has".
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: DateTime<Utc>,
}

impl CollectWindow {
    /// Lazily iterate over every calendar day in the window.
    ///
    /// Yields nothing when the window has no lower bound or is empty. The
    /// iterator cannot be rewound; build a new one from the window to rescan.
    pub fn days(&self) -> DayInputs {
        DayInputs {
            next: self.since.map(|s| s.date_naive()),
            last: self.until.date_naive(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.since.is_some_and(|s| s > self.until)
    }
}

/// Lazy, finite sequence of days produced by [`CollectWindow::days`].
#[derive(Debug, Clone)]
pub struct DayInputs {
    next: Option<NaiveDate>,
    last: NaiveDate,
}

impl Iterator for DayInputs {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let day = self.next?;
        if day > self.last {
            self.next = None;
            return None;
        }
        self.next = day.succ_opt();
        Some(day)
    }
}

type WindowFn = dyn Fn(Option<DateTime<Utc>>, DateTime<Utc>) -> Result<CollectWindow> + Send + Sync;

/// How a connector turns a since-cursor into a request window.
#[derive(Clone)]
pub enum WindowPolicy {
    Since,
    DayRange {
        /// Hard clamp: the source keeps no more history than this.
        max_lookback_days: i64,
        /// Lookback used when there is no cursor at all.
        default_lookback_days: i64,
    },
    Custom(Arc<WindowFn>),
}

impl fmt::Debug for WindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Since => f.write_str("Since"),
            Self::DayRange {
                max_lookback_days,
                default_lookback_days,
            } => f
                .debug_struct("DayRange")
                .field("max_lookback_days", max_lookback_days)
                .field("default_lookback_days", default_lookback_days)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl WindowPolicy {
    /// Day range whose default lookback equals its clamp.
    pub fn day_range(max_lookback_days: i64) -> Self {
        Self::DayRange {
            max_lookback_days,
            default_lookback_days: max_lookback_days,
        }
    }

    pub fn resolve(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<CollectWindow> {
        match self {
            Self::Since => Ok(CollectWindow { since, until: now }),
            Self::DayRange {
                max_lookback_days,
                default_lookback_days,
            } => {
                if *max_lookback_days <= 0 {
                    bail!("max_lookback_days must be > 0");
                }
                let today = now.date_naive();
                let last_day = today - Duration::days(1);
                let floor = today - Duration::days(*max_lookback_days);
                let first_day = since
                    .map(|s| s.date_naive())
                    .unwrap_or(today - Duration::days(*default_lookback_days))
                    .max(floor);
                Ok(CollectWindow {
                    since: Some(midnight(first_day)),
                    until: midnight(last_day),
                })
            }
            Self::Custom(f) => f(since, now),
        }
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 15, 30, 0).unwrap()
    }

    #[test]
    fn test_day_range_without_cursor_is_clamped() {
        let now = at(2025, 1, 10);
        let w = WindowPolicy::day_range(365).resolve(None, now).unwrap();
        assert_eq!(w.since, Some(Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap()));
        assert_eq!(w.until, Utc.with_ymd_and_hms(2025, 1, 9, 0, 0, 0).unwrap());
        assert_eq!(w.days().count(), 365);
    }

    #[test]
    fn test_day_range_old_cursor_is_clamped() {
        let now = at(2025, 1, 10);
        let w = WindowPolicy::day_range(28)
            .resolve(Some(at(2020, 1, 1)), now)
            .unwrap();
        assert_eq!(w.since.unwrap().date_naive(), NaiveDate::from_ymd_opt(2024, 12, 13).unwrap());
    }

    #[test]
    fn test_day_range_recent_cursor_is_kept() {
        let now = at(2025, 1, 10);
        let w = WindowPolicy::day_range(365)
            .resolve(Some(at(2025, 1, 5)), now)
            .unwrap();
        let days: Vec<_> = w.days().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2025-01-05", "2025-01-06", "2025-01-07", "2025-01-08", "2025-01-09"]);
    }

    #[test]
    fn test_day_range_cursor_today_is_empty() {
        let now = at(2025, 1, 10);
        let w = WindowPolicy::day_range(365).resolve(Some(now), now).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.days().count(), 0);
    }

    #[test]
    fn test_unbounded_window_has_no_days() {
        let w = CollectWindow {
            since: None,
            until: at(2025, 1, 10),
        };
        assert_eq!(w.days().next(), None);
    }

    #[test]
    fn test_since_policy_passes_cursor_through() {
        let now = at(2025, 1, 10);
        let w = WindowPolicy::Since.resolve(Some(at(2024, 6, 1)), now).unwrap();
        assert_eq!(w.since, Some(at(2024, 6, 1)));
        assert_eq!(w.until, now);
        assert_eq!(WindowPolicy::Since.resolve(None, now).unwrap().since, None);
    }

    #[test]
    fn test_custom_policy() {
        let policy = WindowPolicy::Custom(Arc::new(|_, now| {
            Ok(CollectWindow {
                since: Some(now - Duration::days(7)),
                until: now,
            })
        }));
        let now = at(2025, 1, 10);
        assert_eq!(policy.resolve(None, now).unwrap().days().count(), 8);
    }
}
