//! RequestWindow - リクエスト受付の残り時間
//!
//! 割り当て処理は配布時刻の 24 時間前に走り、そこで listing が closed になる。
//! 一覧画面では「N days N hours N minutes left to request!」と表示する。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// 配布の何時間前にリクエスト受付を締め切るか
pub const ALLOCATION_LEAD_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    closes_at: DateTime<Utc>,
}

impl RequestWindow {
    pub fn for_distribution(distribution_time: DateTime<Utc>) -> Self {
        Self {
            closes_at: distribution_time - TimeDelta::hours(ALLOCATION_LEAD_HOURS),
        }
    }

    pub fn closes_at(&self) -> DateTime<Utc> {
        self.closes_at
    }

    /// 締め切りまでの残り時間（過ぎたら 0）
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.closes_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now < self.closes_at
    }

    pub fn countdown(&self, now: DateTime<Utc>) -> Countdown {
        Countdown(self.remaining(now))
    }
}

/// Countdown は残り時間を「D days H hours M minutes」で表示する
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown(pub Duration);

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_minutes = self.0.as_secs() / 60;
        let minutes = total_minutes % 60;
        let hours = (total_minutes / 60) % 24;
        let days = total_minutes / (60 * 24);
        write!(f, "{days} days {hours} hours {minutes} minutes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_closes_a_day_before_distribution() {
        let distribution = Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap();
        let w = RequestWindow::for_distribution(distribution);
        assert_eq!(w.closes_at(), Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap());
    }

    #[test]
    fn countdown_formats_days_hours_minutes() {
        let distribution = Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 7, 29, 59).unwrap();
        let w = RequestWindow::for_distribution(distribution);

        assert!(w.is_open(now));
        assert_eq!(w.countdown(now).to_string(), "2 days 2 hours 30 minutes");
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let distribution = Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        let w = RequestWindow::for_distribution(distribution);

        assert!(!w.is_open(now));
        assert_eq!(w.remaining(now), Duration::ZERO);
        assert_eq!(w.countdown(now).to_string(), "0 days 0 hours 0 minutes");
    }
}
