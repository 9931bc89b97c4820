/// clock.rs — logical/wall-clock timeline with market-calendar gating
/// (§4.A Clock).
use crate::calendar::CalendarCache;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;

const WINDOW_OPEN: (u32, u32) = (9, 31);
const WINDOW_CLOSE: (u32, u32) = (15, 59);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Backtest,
    Live,
}

pub struct Clock {
    pub mode: ClockMode,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub current: DateTime<Utc>,
    calendar: CalendarCache,
}

impl Clock {
    pub fn new_backtest(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            mode: ClockMode::Backtest,
            start,
            end,
            current: start,
            calendar: CalendarCache::new(),
        }
    }

    pub fn new_live(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            mode: ClockMode::Live,
            start,
            end,
            current: Utc::now(),
            calendar: CalendarCache::new(),
        }
    }

    /// Advances `current` by one minute (Backtest) or re-reads
    /// wall-clock (Live), per §4.A.
    pub fn tick(&mut self) {
        match self.mode {
            ClockMode::Backtest => self.current += Duration::minutes(1),
            ClockMode::Live => self.current = Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current > self.end
    }

    pub async fn ensure_calendar_loaded(
        &mut self,
        provider: &dyn crate::calendar::CalendarProvider,
    ) -> anyhow::Result<()> {
        let start_date = self.start.with_timezone(&New_York).date_naive();
        let end_date = self.end.with_timezone(&New_York).date_naive();
        self.calendar.ensure_loaded(provider, start_date, end_date).await
    }

    /// `is_market_open()`: true iff `current`'s date (in America/New_York
    /// local time) is a cached open date AND the local time-of-day
    /// falls within `[09:31, 15:59]` inclusive.
    pub fn is_market_open(&self) -> bool {
        let local = self.current.with_timezone(&New_York);
        let date = local.date_naive();
        if !self.calendar.is_open(date) {
            return false;
        }
        let open = NaiveTime::from_hms_opt(WINDOW_OPEN.0, WINDOW_OPEN.1, 0).unwrap();
        let close = NaiveTime::from_hms_opt(WINDOW_CLOSE.0, WINDOW_CLOSE.1, 0).unwrap();
        let t = local.time();
        t >= open && t <= close
    }

    pub fn is_end_of_day(&self) -> bool {
        let local = self.current.with_timezone(&New_York);
        (local.time().hour(), local.time().minute()) == WINDOW_CLOSE
    }
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarProvider;
    use chrono::{NaiveDate, TimeZone};

    struct FixedCalendar(Vec<NaiveDate>);

    #[async_trait::async_trait]
    impl CalendarProvider for FixedCalendar {
        async fn valid_days(&self, _start: NaiveDate, _end: NaiveDate) -> anyhow::Result<Vec<NaiveDate>> {
            Ok(self.0.clone())
        }
    }

    fn ny_to_utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn market_open_window_boundaries() {
        let start = ny_to_utc(2024, 7, 1, 9, 31);
        let end = ny_to_utc(2024, 7, 1, 15, 59);
        let mut clock = Clock::new_backtest(start, end);
        let provider = FixedCalendar(vec![NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()]);
        clock.ensure_calendar_loaded(&provider).await.unwrap();

        clock.current = ny_to_utc(2024, 7, 1, 9, 30);
        assert!(!clock.is_market_open(), "09:30 is before the window");

        clock.current = ny_to_utc(2024, 7, 1, 9, 31);
        assert!(clock.is_market_open());

        clock.current = ny_to_utc(2024, 7, 1, 15, 59);
        assert!(clock.is_market_open());

        clock.current = ny_to_utc(2024, 7, 1, 16, 0);
        assert!(!clock.is_market_open(), "16:00 is after the window");
    }

    #[tokio::test]
    async fn closed_calendar_day_is_never_open() {
        let start = ny_to_utc(2024, 7, 4, 9, 31);
        let end = ny_to_utc(2024, 7, 4, 15, 59);
        let mut clock = Clock::new_backtest(start, end);
        let provider = FixedCalendar(vec![]); // July 4th, market holiday
        clock.ensure_calendar_loaded(&provider).await.unwrap();
        clock.current = ny_to_utc(2024, 7, 4, 10, 0);
        assert!(!clock.is_market_open());
    }

    #[test]
    fn backtest_tick_advances_by_one_minute() {
        let start = ny_to_utc(2024, 7, 1, 9, 31);
        let mut clock = Clock::new_backtest(start, start);
        clock.tick();
        assert_eq!(clock.current, start + Duration::minutes(1));
    }
}
