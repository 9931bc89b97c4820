/// fusion.rs — merges minute bars into per-symbol hourly history
/// (§4.C BarFusion).
use crate::bar::{Bar, SymbolHistory};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;

/// Tracks, per symbol, how many compaction cycles have elapsed so the
/// periodic defragmentation pass (§4.C) can be driven off logical
/// time rather than wall-clock.
#[derive(Debug, Default)]
pub struct BarFusion {
    last_compaction: HashMap<String, DateTime<Utc>>,
}

fn same_hour(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.ordinal() == b.ordinal() && a.hour() == b.hour()
}

impl BarFusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `minute` into `history`, creating a fresh hourly bar or
    /// updating the open one in place, per §4.C's exact rules.
    pub fn merge(&mut self, history: &mut SymbolHistory, minute: Bar) {
        let needs_new_bar = match history.last() {
            None => true,
            Some(last) => !same_hour(last.timestamp, minute.timestamp) && minute.timestamp > last.timestamp,
        };

        if needs_new_bar {
            history.push(minute);
        } else if let Some(last) = history.last_mut() {
            last.high = last.high.max(minute.high);
            last.low = last.low.min(minute.low);
            last.close = minute.close;
            last.volume += minute.volume;
            last.trade_count += minute.trade_count;
            last.trading_value += minute.trading_value;
            last.vwap = if last.volume > 0.0 {
                last.trading_value / last.volume
            } else {
                0.0
            };
        }
    }

    /// Runs the periodic compaction pass for `symbol` if at least 24
    /// logical hours have elapsed since the last one.
    pub fn maybe_compact(&mut self, symbol: &str, history: &mut SymbolHistory, now: DateTime<Utc>) {
        let due = match self.last_compaction.get(symbol) {
            Some(prev) => now.signed_duration_since(*prev).num_hours() >= 24,
            None => true,
        };
        if due {
            history.compact();
            self.last_compaction.insert(symbol.to_string(), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute(ts: DateTime<Utc>, close: f64, volume: f64, vwap: f64) -> Bar {
        Bar::new(ts, close, close, close, close, volume, 1, vwap)
    }

    #[test]
    fn first_bar_creates_history() {
        let mut fusion = BarFusion::new();
        let mut hist = SymbolHistory::new(10);
        let ts = Utc.with_ymd_and_hms(2024, 7, 1, 9, 31, 0).unwrap();
        fusion.merge(&mut hist, minute(ts, 100.0, 10.0, 100.0));
        assert_eq!(hist.len(), 1);
    }

    #[test]
    fn same_hour_updates_in_place() {
        let mut fusion = BarFusion::new();
        let mut hist = SymbolHistory::new(10);
        let t0 = Utc.with_ymd_and_hms(2024, 7, 1, 9, 31, 0).unwrap();
        fusion.merge(&mut hist, minute(t0, 100.0, 10.0, 100.0));

        let t1 = Utc.with_ymd_and_hms(2024, 7, 1, 9, 45, 0).unwrap();
        fusion.merge(&mut hist, minute(t1, 102.0, 5.0, 101.0));

        assert_eq!(hist.len(), 1);
        let last = hist.last().unwrap();
        assert_eq!(last.close, 102.0);
        assert_eq!(last.volume, 15.0);
        assert_eq!(last.trade_count, 2);
        // trading_value = 10*100 + 5*101 = 1505; vwap = 1505/15
        assert!((last.vwap - (1505.0 / 15.0)).abs() < 1e-9);
    }

    #[test]
    fn new_hour_appends_fresh_bar() {
        let mut fusion = BarFusion::new();
        let mut hist = SymbolHistory::new(10);
        let t0 = Utc.with_ymd_and_hms(2024, 7, 1, 9, 31, 0).unwrap();
        fusion.merge(&mut hist, minute(t0, 100.0, 10.0, 100.0));

        let t1 = Utc.with_ymd_and_hms(2024, 7, 1, 10, 1, 0).unwrap();
        fusion.merge(&mut hist, minute(t1, 103.0, 3.0, 103.0));

        assert_eq!(hist.len(), 2);
    }

    #[test]
    fn fusion_is_not_idempotent_on_volume() {
        let mut fusion = BarFusion::new();
        let mut hist = SymbolHistory::new(10);
        let t0 = Utc.with_ymd_and_hms(2024, 7, 1, 9, 31, 0).unwrap();
        let m = minute(t0, 100.0, 10.0, 100.0);
        fusion.merge(&mut hist, m);
        fusion.merge(&mut hist, m);
        assert_eq!(hist.last().unwrap().volume, 20.0);
    }

    #[test]
    fn oldest_bar_dropped_when_over_capacity() {
        let mut fusion = BarFusion::new();
        let mut hist = SymbolHistory::new(2);
        for h in 9..13 {
            let ts = Utc.with_ymd_and_hms(2024, 7, 1, h, 31, 0).unwrap();
            fusion.merge(&mut hist, minute(ts, 100.0 + h as f64, 1.0, 100.0));
        }
        assert_eq!(hist.len(), 2);
    }
}
