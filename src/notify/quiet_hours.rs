use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::Preferences;

const DEFAULT_START: u32 = 23 * 60;
const DEFAULT_END: u32 = 8 * 60;

/// A daily do-not-disturb window in a named timezone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietHours {
    /// Minutes since local midnight.
    start: u32,
    end: u32,
    tz: Tz,
}

impl QuietHours {
    /// Unparseable times fall back to 23:00–08:00; an unknown zone to UTC.
    pub fn new(start: &str, end: &str, timezone: &str) -> Self {
        let tz = timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone, "unknown timezone, quiet hours evaluated in UTC");
            Tz::UTC
        });
        Self {
            start: parse_hhmm(start).unwrap_or(DEFAULT_START),
            end: parse_hhmm(end).unwrap_or(DEFAULT_END),
            tz,
        }
    }

    pub fn from_prefs(prefs: &Preferences) -> Self {
        Self::new(&prefs.quiet_start, &prefs.quiet_end, &prefs.timezone)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        in_window(local.hour() * 60 + local.minute(), self.start, self.end)
    }
}

/// `[start, end)` in minutes, wrapping past midnight when `start > end`.
/// `start == end` is an empty window.
pub fn in_window(minute: u32, start: u32, end: u32) -> bool {
    if start > end {
        minute >= start || minute < end
    } else {
        minute >= start && minute < end
    }
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let q = QuietHours::new("23:00", "08:00", "UTC");
        assert!(q.contains(utc(23, 30)));
        assert!(q.contains(utc(7, 30)));
        assert!(q.contains(utc(0, 0)));
        assert!(!q.contains(utc(12, 0)));
        assert!(!q.contains(utc(8, 0)));
    }

    #[test]
    fn same_day_window_is_half_open() {
        let q = QuietHours::new("02:00", "06:00", "UTC");
        assert!(q.contains(utc(2, 0)));
        assert!(q.contains(utc(5, 59)));
        assert!(!q.contains(utc(6, 0)));
        assert!(!q.contains(utc(1, 59)));
        assert!(!q.contains(utc(23, 30)));
    }

    #[test]
    fn evaluates_in_the_configured_zone() {
        // 04:00 UTC in January is 23:00 in New York.
        let q = QuietHours::new("23:00", "08:00", "America/New_York");
        assert!(q.contains(utc(4, 0)));
        // 17:00 UTC is 12:00 local.
        assert!(!q.contains(utc(17, 0)));
    }

    #[test]
    fn bad_inputs_fall_back() {
        let q = QuietHours::new("late", "25:00", "Mars/Olympus");
        assert!(q.contains(utc(23, 30)));
        assert!(!q.contains(utc(12, 0)));
    }

    #[test]
    fn equal_bounds_never_quiet() {
        assert!(!in_window(600, 600, 600));
    }
}
