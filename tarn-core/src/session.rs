//! Trading session windows and calendar
//!
//! Sessions are local-time `{start, end}` windows; futures night sessions
//! cross midnight, so a window with `start > end` wraps. Weekends and
//! configured holidays are non-trading days.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// One trading window in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `time` falls inside the window. Windows with `start > end`
    /// wrap past midnight (e.g. 21:00 - 02:30).
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Market calendar: weekends plus explicit holidays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingCalendar {
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl TradingCalendar {
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !self.holidays.contains(&date)
    }
}

/// True when `now` falls inside any session window on a trading day.
pub fn is_trading_time(
    now: DateTime<Local>,
    sessions: &[SessionWindow],
    calendar: &TradingCalendar,
) -> bool {
    if !calendar.is_trading_day(now.date_naive()) {
        return false;
    }
    let time = now.time();
    sessions.iter().any(|window| window.contains(time))
}
