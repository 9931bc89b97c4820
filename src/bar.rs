/// bar.rs — OHLCV bar and the per-symbol bounded history that holds
/// them (§3 Bar, SymbolHistory).
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A single OHLCV + vwap record at some timeframe.
///
/// Invariant: `low <= min(open, close)` and `high >= max(open, close)`;
/// `trading_value >= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub vwap: f64,
    pub trading_value: f64,
}

impl Bar {
    /// Constructs a bar and computes `trading_value = volume * vwap`
    /// per §4.B's ingest rule.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_count: u64,
        vwap: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            vwap,
            trading_value: volume * vwap,
        }
    }

    pub fn satisfies_ohlc_invariant(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.trading_value >= 0.0
    }
}

/// An ordered, strictly-increasing-by-timestamp sequence of bars for a
/// single symbol, bounded to `capacity` entries (default 2000 hourly
/// bars per §3).
#[derive(Debug, Clone)]
pub struct SymbolHistory {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl SymbolHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn from_bars(bars: Vec<Bar>, capacity: usize) -> Self {
        let mut h = Self::new(capacity);
        for b in bars {
            h.push(b);
        }
        h
    }

    /// Appends a new bar, dropping the oldest if over capacity.
    pub fn push(&mut self, bar: Bar) {
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn last_mut(&mut self) -> Option<&mut Bar> {
        self.bars.back_mut()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Bar> {
        self.bars.iter()
    }

    /// Closing prices, oldest first — the series most indicators are
    /// computed over.
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    /// Reallocates the backing buffer in place. §4.C calls for a
    /// periodic compaction pass every >=24h of logical time; this is
    /// that pass. Purely a memory-layout operation, never changes
    /// contents.
    pub fn compact(&mut self) {
        let mut fresh = VecDeque::with_capacity(self.bars.len());
        fresh.extend(self.bars.drain(..));
        self.bars = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar_at(hour: u32, close: f64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap(),
            close,
            close,
            close,
            close,
            100.0,
            10,
            close,
        )
    }

    #[test]
    fn push_respects_capacity() {
        let mut h = SymbolHistory::new(3);
        for i in 0..5 {
            h.push(bar_at(i, 100.0 + i as f64));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.last().unwrap().close, 104.0);
    }

    #[test]
    fn trading_value_is_volume_times_vwap() {
        let b = Bar::new(Utc::now(), 1.0, 1.0, 1.0, 1.0, 200.0, 5, 10.0);
        assert_eq!(b.trading_value, 2000.0);
    }

    #[test]
    fn ohlc_invariant_holds_for_well_formed_bar() {
        let b = bar_at(9, 101.5);
        assert!(b.satisfies_ohlc_invariant());
    }

    #[test]
    fn compact_preserves_order_and_contents() {
        let mut h = SymbolHistory::new(10);
        for i in 0..5 {
            h.push(bar_at(i, 100.0 + i as f64));
        }
        h.compact();
        assert_eq!(h.len(), 5);
        assert_eq!(h.closes(), vec![100.0, 101.0, 102.0, 103.0, 104.0]);
    }
}
