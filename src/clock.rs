//! Injectable clock (spec §4.1: "time is read from an injectable clock,
//! real by default, mockable in tests").

use chrono::{DateTime, Local, Timelike};

/// `0..6`, Sunday = 0, matching spec's `ProxyFact.time.day_of_week`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClockTime {
    pub day_of_week: u8,
    pub hour: u8,
    pub minute: u8,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;

    fn wall_clock_time(&self) -> WallClockTime {
        let now = self.now();
        WallClockTime {
            day_of_week: now.format("%w").to_string().parse().unwrap_or(0),
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Test clock pinned to a fixed instant.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wall_clock_time_reports_sunday_as_zero() {
        // 2024-01-07 is a Sunday.
        let dt = Local.with_ymd_and_hms(2024, 1, 7, 10, 30, 0).unwrap();
        let clock = FixedClock(dt);
        let wct = clock.wall_clock_time();
        assert_eq!(wct.day_of_week, 0);
        assert_eq!(wct.hour, 10);
        assert_eq!(wct.minute, 30);
    }
}
