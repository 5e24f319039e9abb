//! Time windows over which limits are defined.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Time window for rate limiting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// All windows, shortest first.
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::Second,
        TimeWindow::Minute,
        TimeWindow::Hour,
        TimeWindow::Day,
    ];

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Length of the window in whole seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Name used in store keys and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "sec" | "s" => Ok(TimeWindow::Second),
            "minute" | "min" | "m" => Ok(TimeWindow::Minute),
            "hour" | "h" => Ok(TimeWindow::Hour),
            "day" | "d" => Ok(TimeWindow::Day),
            other => Err(format!("unknown time window '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_time_window_parse() {
        assert_eq!("minute".parse::<TimeWindow>(), Ok(TimeWindow::Minute));
        assert_eq!("HOUR".parse::<TimeWindow>(), Ok(TimeWindow::Hour));
        assert_eq!("d".parse::<TimeWindow>(), Ok(TimeWindow::Day));
        assert!("fortnight".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn test_time_window_ordering() {
        let mut windows = vec![TimeWindow::Day, TimeWindow::Second, TimeWindow::Hour];
        windows.sort();
        assert_eq!(
            windows,
            vec![TimeWindow::Second, TimeWindow::Hour, TimeWindow::Day]
        );
    }
}
