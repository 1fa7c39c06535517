//! Market-hours gate: answers "should monitoring be active now" against the
//! exchange's civil time, so DST transitions never shift the window.
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::time::Duration;

/// Days probed by `next_open` before giving up (one full week plus today).
const LOOKAHEAD_DAYS: i64 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketHours {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekdays: Vec<Weekday>,
}

impl MarketHours {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime, weekdays: Vec<Weekday>) -> Self {
        Self {
            tz,
            open,
            close,
            weekdays,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn open(&self) -> NaiveTime {
        self.open
    }

    pub fn close(&self) -> NaiveTime {
        self.close
    }

    /// True on configured weekdays between `open` and `close`, both inclusive.
    /// Test mode is always active.
    pub fn is_active(&self, now: DateTime<Utc>, test_mode: bool) -> bool {
        if test_mode {
            return true;
        }
        let local = now.with_timezone(&self.tz);
        if !self.weekdays.contains(&local.weekday()) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }

    /// The next instant the gate opens. Returns `now` when already inside the window
    /// and `None` when no weekday is configured.
    pub fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_active(now, false) {
            return Some(now);
        }
        let today = now.with_timezone(&self.tz).date_naive();
        (0..LOOKAHEAD_DAYS)
            .filter_map(|offset| today.checked_add_signed(ChronoDuration::days(offset)))
            .filter(|date| self.weekdays.contains(&date.weekday()))
            .filter_map(|date| self.local_instant(date, self.open))
            .find(|candidate| *candidate > now)
    }

    /// Time remaining before today's close, if the window is open right now.
    pub fn until_close(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_active(now, false) {
            return None;
        }
        let today = now.with_timezone(&self.tz).date_naive();
        let close = self.local_instant(today, self.close)?;
        (close - now).to_std().ok()
    }

    fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(time);
        // A local time inside a DST gap does not exist; slide forward past the gap.
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Los_Angeles,
            open: NaiveTime::from_hms_opt(6, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(13, 15, 0).unwrap_or_default(),
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    fn pacific(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Los_Angeles
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_window_edges_on_weekday() {
        let gate = MarketHours::default();
        // 2025-03-05 is a Wednesday.
        assert!(!gate.is_active(pacific(2025, 3, 5, 6, 29), false));
        assert!(gate.is_active(pacific(2025, 3, 5, 6, 30), false));
        assert!(gate.is_active(pacific(2025, 3, 5, 13, 15), false));
        assert!(!gate.is_active(pacific(2025, 3, 5, 13, 16), false));
    }

    #[test]
    fn test_weekend_is_inactive() {
        let gate = MarketHours::default();
        assert!(!gate.is_active(pacific(2025, 3, 8, 9, 0), false));
        assert!(!gate.is_active(pacific(2025, 3, 9, 9, 0), false));
    }

    #[test]
    fn test_test_mode_always_active() {
        let gate = MarketHours::default();
        assert!(gate.is_active(pacific(2025, 3, 8, 3, 0), true));
        assert!(gate.is_active(pacific(2025, 3, 5, 23, 59), true));
    }

    #[test]
    fn test_dst_transition_uses_civil_time() {
        let gate = MarketHours::default();
        // Friday before the March 2025 DST switch: 06:30 PST is 14:30 UTC.
        let pre = Utc.with_ymd_and_hms(2025, 3, 7, 14, 30, 0).unwrap();
        assert!(gate.is_active(pre, false));
        assert!(!gate.is_active(Utc.with_ymd_and_hms(2025, 3, 7, 14, 29, 0).unwrap(), false));
        // Monday after: 06:30 PDT is 13:30 UTC, an hour earlier in UTC.
        let post = Utc.with_ymd_and_hms(2025, 3, 10, 13, 30, 0).unwrap();
        assert!(gate.is_active(post, false));
        assert!(!gate.is_active(Utc.with_ymd_and_hms(2025, 3, 10, 13, 29, 0).unwrap(), false));
    }

    #[test]
    fn test_next_open_skips_weekend_across_dst() {
        let gate = MarketHours::default();
        let friday_after_close = pacific(2025, 3, 7, 14, 0);
        let next = gate.next_open(friday_after_close).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 13, 30, 0).unwrap());
    }

    #[test]
    fn test_next_open_same_day_before_open() {
        let gate = MarketHours::default();
        let early = pacific(2025, 3, 5, 5, 0);
        assert_eq!(gate.next_open(early), Some(pacific(2025, 3, 5, 6, 30)));
    }

    #[test]
    fn test_next_open_when_active_is_now() {
        let gate = MarketHours::default();
        let now = pacific(2025, 3, 5, 9, 0);
        assert_eq!(gate.next_open(now), Some(now));
    }

    #[test]
    fn test_next_open_without_weekdays() {
        let gate = MarketHours::new(
            Los_Angeles,
            NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(13, 15, 0).unwrap(),
            vec![],
        );
        assert_eq!(gate.next_open(pacific(2025, 3, 5, 9, 0)), None);
    }

    #[test]
    fn test_until_close() {
        let gate = MarketHours::default();
        assert_eq!(
            gate.until_close(pacific(2025, 3, 5, 13, 0)),
            Some(Duration::from_secs(15 * 60))
        );
        assert_eq!(gate.until_close(pacific(2025, 3, 5, 14, 0)), None);
    }
}
