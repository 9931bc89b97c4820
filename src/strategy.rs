/// strategy.rs — the per-symbol decision engine (§4.E StrategyEngine).
///
/// Produces a DecisionRecord from (hourly_history, minute_bar,
/// position_view). Each signal is computed in the fixed order listed
/// in §4.E; a failure in any one is caught by the caller (see
/// `engine.rs`), which logs and carries forward the previous record.
use crate::bar::{Bar, SymbolHistory};
use crate::config::StrategyConfig;
use crate::indicators::{find_extrema, Extremum, IndicatorSet};
use crate::positions::Position;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub buy: bool,
    pub sell: bool,
    pub keep_profit: bool,
    pub buy_reason: String,
    pub buy_strength: f64,
    pub sell_reason: String,
    pub stop_value: f64,
    pub stop_key: String,
    pub stop_trailing: f64,
    pub trading_value: f64,

    // intermediate signal flags, retained for audit/CSV output.
    pub touch_bb1_lower: bool,
    pub touch_bb2_lower: bool,
    pub breakout_raw_bb1: bool,
    pub breakout_raw_bb2: bool,
    pub po_divergence: i8,
    pub rsi_check: i8,
    pub sma_align_strength: f64,
    pub sma_breakthrough_count: f64,
    pub sma_below_close: f64,
    pub stoploss_downward_breakout: bool,
    pub resistance_upward_breakout: bool,
    pub new_stop_value_hubo: f64,
    pub new_stop_key_hubo: String,
    pub top_resist_downward_break: bool,
}

impl DecisionRecord {
    pub fn aligned(&self) -> bool {
        self.sma_align_strength > 0.99
    }
}

impl Default for DecisionRecord {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            timestamp: DateTime::<Utc>::MIN_UTC,
            price: 0.0,
            buy: false,
            sell: false,
            keep_profit: false,
            buy_reason: String::new(),
            buy_strength: 0.0,
            sell_reason: String::new(),
            stop_value: 0.0,
            stop_key: String::new(),
            stop_trailing: 0.0,
            trading_value: 0.0,
            touch_bb1_lower: false,
            touch_bb2_lower: false,
            breakout_raw_bb1: false,
            breakout_raw_bb2: false,
            po_divergence: 0,
            rsi_check: 0,
            sma_align_strength: 0.0,
            sma_breakthrough_count: 0.0,
            sma_below_close: 0.0,
            stoploss_downward_breakout: false,
            resistance_upward_breakout: false,
            new_stop_value_hubo: 0.0,
            new_stop_key_hubo: String::new(),
            top_resist_downward_break: false,
        }
    }
}

/// Bounded ring of the most recent decisions per symbol, depth 3.
#[derive(Debug, Default)]
pub struct DecisionRing {
    records: VecDeque<DecisionRecord>,
}

impl DecisionRing {
    const DEPTH: usize = 3;

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push_back(record);
        while self.records.len() > Self::DEPTH {
            self.records.pop_front();
        }
    }

    pub fn last(&self) -> Option<&DecisionRecord> {
        self.records.back()
    }
}

fn threshold(hourly_last: f64, close: f64, offset: f64) -> f64 {
    hourly_last + close * offset
}

/// §4.E signal 1: upward breakout with the 4-hour-stale fallback.
fn upward_breakout(
    hourly_last: f64,
    hourly_ts: DateTime<Utc>,
    minute_ts: DateTime<Utc>,
    low: f64,
    close: f64,
    prev_close: Option<f64>,
    offset: f64,
) -> bool {
    let stale = minute_ts.signed_duration_since(hourly_ts).num_hours() > 4;
    let test_low = if stale { prev_close.unwrap_or(low) } else { low };
    let t = threshold(hourly_last, close, offset);
    test_low <= t && close > t
}

/// §4.E signal 2: two-level touch/breakthrough detection.
/// Returns (touch, breakout_raw) — `breakout_raw` is retained in the
/// ring so the next tick's "keeping" state can be evaluated.
fn touch(
    hourly_last: f64,
    hourly_ts: DateTime<Utc>,
    minute_ts: DateTime<Utc>,
    low: f64,
    close: f64,
    prev_close: Option<f64>,
    margin: f64,
    prev_breakout_raw: bool,
    prev_touch: bool,
) -> (bool, bool) {
    let breakout_raw = upward_breakout(hourly_last, hourly_ts, minute_ts, low, close, prev_close, 0.0);
    let breakout_margin = upward_breakout(hourly_last, hourly_ts, minute_ts, low, close, prev_close, margin);
    let above_now = close > threshold(hourly_last, close, 0.0);
    let keeping = above_now && prev_breakout_raw && !prev_touch;
    let touch = (breakout_raw || keeping) && breakout_margin;
    (touch, breakout_raw)
}

/// §4.E signal 3: PO divergence. Bullish (+1) when price makes a lower
/// low while PO makes a higher low over the last two dips; bearish
/// (-1) when price makes a higher high while PO makes a lower high
/// over the last two peaks. Ties (both conditions true) resolve to
/// whichever extremum type is the most recent in the combined
/// peak/dip sequence of the price series.
fn po_divergence(closes: &[f64], po: &[Option<f64>]) -> i8 {
    let price_extrema = find_extrema(closes);
    let dips: Vec<(usize, f64)> = price_extrema
        .iter()
        .filter(|(_, k)| *k == Extremum::Dip)
        .map(|(i, _)| (*i, closes[*i]))
        .collect();
    let peaks: Vec<(usize, f64)> = price_extrema
        .iter()
        .filter(|(_, k)| *k == Extremum::Peak)
        .map(|(i, _)| (*i, closes[*i]))
        .collect();

    let po_at = |i: usize| -> Option<f64> { po.get(i).copied().flatten() };

    let bullish = dips.len() >= 2 && {
        let (i1, c1) = dips[dips.len() - 2];
        let (i2, c2) = dips[dips.len() - 1];
        match (po_at(i1), po_at(i2)) {
            (Some(p1), Some(p2)) => c2 < c1 && p2 > p1,
            _ => false,
        }
    };
    let bearish = peaks.len() >= 2 && {
        let (i1, c1) = peaks[peaks.len() - 2];
        let (i2, c2) = peaks[peaks.len() - 1];
        match (po_at(i1), po_at(i2)) {
            (Some(p1), Some(p2)) => c2 > c1 && p2 < p1,
            _ => false,
        }
    };

    match (bullish, bearish) {
        (true, false) => 1,
        (false, true) => -1,
        (true, true) => {
            let last_dip = dips.last().map(|(i, _)| *i);
            let last_peak = peaks.last().map(|(i, _)| *i);
            match (last_dip, last_peak) {
                (Some(d), Some(p)) if d > p => 1,
                (Some(d), Some(p)) if p > d => -1,
                _ => 0,
            }
        }
        (false, false) => 0,
    }
}

/// §4.E signal 4: RSI hill-counting.
fn rsi_check(rsi: &[Option<f64>], hill_window: usize, hills: usize) -> i8 {
    let current = match rsi.last().copied().flatten() {
        Some(v) => v,
        None => return 0,
    };
    let start = rsi.len().saturating_sub(hill_window);
    let window: Vec<f64> = rsi[start..].iter().filter_map(|v| *v).collect();
    let extrema = find_extrema(&window);

    let dips_below_30 = extrema
        .iter()
        .filter(|(i, k)| *k == Extremum::Dip && window[*i] < 30.0)
        .count();
    let peaks_above_70 = extrema
        .iter()
        .filter(|(i, k)| *k == Extremum::Peak && window[*i] > 70.0)
        .count();

    if current < 30.0 && dips_below_30 >= hills {
        1
    } else if current > 70.0 && peaks_above_70 >= hills {
        -1
    } else {
        0
    }
}

/// §4.E signal 5: signed, normalized adjacent-pair ordering over the
/// SMA list (ascending by period: shortest period first).
fn sma_align_strength(sma_values: &[(usize, f64)]) -> f64 {
    if sma_values.len() < 2 {
        return 0.0;
    }
    let n = sma_values.len();
    let signed: i32 = sma_values
        .windows(2)
        .map(|w| if w[0].1 > w[1].1 { 1 } else { -1 })
        .sum();
    signed as f64 / (n - 1) as f64
}

/// §4.E signal 6: count of SMA lines broken upward with margin, plus
/// the highest broken level (used later as a stop-loss candidate) and
/// the period that produced it, so the stop can be re-resolved against
/// that same SMA on later ticks (see `resolve_stop_key_level`).
fn sma_breakthrough(
    sma_values: &[(usize, f64)],
    hourly_ts: DateTime<Utc>,
    minute_ts: DateTime<Utc>,
    low: f64,
    close: f64,
    prev_close: Option<f64>,
    margin: f64,
) -> (f64, f64, Option<usize>) {
    let mut count = 0.0;
    let mut highest_broken = 0.0_f64;
    let mut highest_period = None;
    for &(period, level) in sma_values {
        if upward_breakout(level, hourly_ts, minute_ts, low, close, prev_close, margin) {
            count += 1.0;
            if highest_period.is_none() || level > highest_broken {
                highest_broken = level;
                highest_period = Some(period);
            }
        }
    }
    (count, highest_broken, highest_period)
}

pub struct StrategyEngine<'a> {
    cfg: &'a StrategyConfig,
    sma_periods: &'a [usize],
    sma_margin: f64,
    trail: f64,
}

impl<'a> StrategyEngine<'a> {
    pub fn new(cfg: &'a StrategyConfig, sma_periods: &'a [usize], sma_margin: f64, trail: f64) -> Self {
        Self { cfg, sma_periods, sma_margin, trail }
    }

    /// Produces this tick's DecisionRecord for one symbol. `history`
    /// is the hourly series *after* BarFusion has merged `minute` in;
    /// `position` is a read-only snapshot taken at tick start.
    pub fn evaluate(
        &self,
        symbol: &str,
        history: &SymbolHistory,
        minute: &Bar,
        position: Option<&Position>,
        prev: Option<&DecisionRecord>,
    ) -> DecisionRecord {
        let closes = history.closes();
        let indicators = IndicatorSet::compute(&closes, self.cfg, &crate::config::SmaConfig {
            periods: self.sma_periods.to_vec(),
            margin: self.sma_margin,
        });

        let hourly_last = history.last().copied();
        let hourly_ts = hourly_last.map(|b| b.timestamp).unwrap_or(minute.timestamp);
        let prev_close = closes.len().checked_sub(2).map(|i| closes[i]);
        let close = minute.close;
        let low = minute.low;

        let bb1_lower = indicators.bb1.last_lower().unwrap_or(f64::NEG_INFINITY);
        let bb2_lower = indicators.bb2.last_lower().unwrap_or(f64::NEG_INFINITY);
        let bb1_upper = indicators.bb1.last_upper();
        let bb2_upper = indicators.bb2.last_upper();

        let (prev_raw_bb1, prev_touch_bb1) = prev
            .map(|p| (p.breakout_raw_bb1, p.touch_bb1_lower))
            .unwrap_or((false, false));
        let (prev_raw_bb2, prev_touch_bb2) = prev
            .map(|p| (p.breakout_raw_bb2, p.touch_bb2_lower))
            .unwrap_or((false, false));

        let (touch_bb1, raw_bb1) = touch(
            bb1_lower, hourly_ts, minute.timestamp, low, close, prev_close,
            self.cfg.bb1.buy_margin, prev_raw_bb1, prev_touch_bb1,
        );
        let (touch_bb2, raw_bb2) = touch(
            bb2_lower, hourly_ts, minute.timestamp, low, close, prev_close,
            self.cfg.bb2.buy_margin, prev_raw_bb2, prev_touch_bb2,
        );

        let po_div = po_divergence(&closes, &indicators.po);
        let rsi_sig = rsi_check(&indicators.rsi, self.cfg.rsi.hill_window, self.cfg.rsi.hills);

        let sma_vals = indicators.sma_values(self.sma_periods);
        let align = sma_align_strength(&sma_vals);
        let (sma_count, sma_below_close, sma_below_close_period) =
            sma_breakthrough(&sma_vals, hourly_ts, minute.timestamp, low, close, prev_close, self.sma_margin);

        let aligned = align > 0.99;
        let bb1_or_bb2_or_sma = touch_bb1 || touch_bb2 || sma_count > 0.1;
        let blocked = po_div < 0 || rsi_sig < 0;
        let buy = aligned && bb1_or_bb2_or_sma && !blocked;

        let mut reasons = Vec::new();
        if touch_bb1 {
            reasons.push("bb1");
        }
        if touch_bb2 {
            reasons.push("bb2");
        }
        if sma_count > 0.1 {
            reasons.push("sma");
        }
        let buy_reason = reasons.join("-");
        let buy_strength = (touch_bb1 as i32 as f64)
            + (touch_bb2 as i32 as f64)
            + (sma_count > 0.1) as i32 as f64
            + po_div as f64
            + rsi_sig as f64;

        // Proposed stops at buy (§4.E "Proposed stops at buy"). The
        // "existing" candidate carries forward the position's own
        // stop_key rather than a non-indicator placeholder label, so
        // `resolve_stop_key_level` can keep tracking it unchanged if it
        // wins; the SMA candidate is labeled by the specific period that
        // produced `sma_below_close` for the same reason.
        let existing_stop = position.map(|p| p.stop_value).unwrap_or(0.0);
        let existing_key = position.map(|p| p.stop_key.clone()).unwrap_or_default();
        let mut candidates: Vec<(f64, String)> = vec![
            (bb1_lower * (1.0 - self.trail), "bb1_lower".to_string()),
            (bb2_lower * (1.0 - self.trail), "bb2_lower".to_string()),
            (existing_stop, existing_key.clone()),
        ];
        if sma_count > 0.1 {
            if let Some(period) = sma_below_close_period {
                candidates.push((sma_below_close * (1.0 - self.trail), format!("sma{period}")));
            }
        }
        let (stop_value, stop_key) = candidates
            .into_iter()
            .fold((f64::NEG_INFINITY, String::new()), |best, cand| if cand.0 > best.0 { cand } else { best });
        let stop_key = if buy { stop_key } else { existing_key };
        let stop_value = if buy { stop_value } else { existing_stop };

        let prev_trailing = position.map(|p| p.stop_trailing).unwrap_or(0.0);
        let stop_trailing = prev_trailing.max(close * (1.0 - self.trail));

        // Sell side: only meaningful when a position is held.
        let (
            sell,
            keep_profit,
            sell_reason,
            stoploss_downward_breakout,
            resistance_upward_breakout,
            new_stop_value_hubo,
            new_stop_key_hubo,
            top_resist_downward_break,
        ) = if let Some(pos) = position {
            let floor = pos.stop_value.max(pos.stop_trailing);
            let stop_loss = close < floor;

            let mut resistances: Vec<(f64, String)> = sma_vals
                .iter()
                .map(|(p, v)| (*v, format!("sma{p}")))
                .filter(|(v, _)| *v > pos.stop_value)
                .collect();
            if let Some(u) = bb1_upper {
                if u > pos.stop_value {
                    resistances.push((u, "bb1_upper".to_string()));
                }
            }
            if let Some(u) = bb2_upper {
                if u > pos.stop_value {
                    resistances.push((u, "bb2_upper".to_string()));
                }
            }

            let mut hubo_value = f64::NEG_INFINITY;
            let mut hubo_key = String::new();
            let mut resistance_break = false;
            for (level, key) in &resistances {
                if upward_breakout(*level, hourly_ts, minute.timestamp, low, close, prev_close, 0.0) {
                    resistance_break = true;
                    if *level > hubo_value {
                        hubo_value = *level;
                        hubo_key = key.clone();
                    }
                }
            }

            let top_break = if !resistances.is_empty() {
                let highest = resistances.iter().fold(f64::NEG_INFINITY, |m, (v, _)| m.max(*v));
                let high_clears_all = resistances.iter().all(|(v, _)| minute.high > *v);
                let close_at_or_below_one = resistances.iter().any(|(v, _)| close <= *v);
                high_clears_all && close_at_or_below_one && highest.is_finite()
            } else {
                false
            };

            // Guarded by "symbol not in positions" in the original —
            // since we're inside `if let Some(pos)`, this is always
            // unreachable, exactly as §9's Open Question resolution
            // describes. Kept as a literal no-op, not special-cased away.
            let eod = false;

            let keep = resistance_break && (po_div > 0 || rsi_sig > 0);
            let take_profit = resistance_break && !aligned;
            let sell = (stop_loss || take_profit || top_break || eod) && !keep;

            let mut sell_reasons = Vec::new();
            if stop_loss {
                sell_reasons.push("stop_loss");
            }
            if take_profit {
                sell_reasons.push("take_profit");
            }
            if top_break {
                sell_reasons.push("top_resist_break");
            }
            (
                sell,
                keep,
                sell_reasons.join("-"),
                stop_loss,
                resistance_break,
                if hubo_value.is_finite() { hubo_value } else { 0.0 },
                hubo_key,
                top_break,
            )
        } else {
            (false, false, String::new(), false, false, 0.0, String::new(), false)
        };

        DecisionRecord {
            symbol: symbol.to_string(),
            timestamp: minute.timestamp,
            price: close,
            buy,
            sell,
            keep_profit,
            buy_reason,
            buy_strength,
            sell_reason,
            stop_value,
            stop_key,
            stop_trailing,
            trading_value: minute.trading_value,
            touch_bb1_lower: touch_bb1,
            touch_bb2_lower: touch_bb2,
            breakout_raw_bb1: raw_bb1,
            breakout_raw_bb2: raw_bb2,
            po_divergence: po_div,
            rsi_check: rsi_sig,
            sma_align_strength: align,
            sma_breakthrough_count: sma_count,
            sma_below_close: sma_below_close,
            stoploss_downward_breakout,
            resistance_upward_breakout,
            new_stop_value_hubo,
            new_stop_key_hubo,
            top_resist_downward_break,
        }
    }

    /// §4.E "Trailing update on every tick for held positions": applied
    /// directly to the position, independent of buy/sell dispatch.
    pub fn trailing_update(position: &mut Position, price: f64, trail: f64, history: &SymbolHistory, cfg: &StrategyConfig) {
        position.stop_trailing = position.stop_trailing.max(price * (1.0 - trail));
        if !position.stop_key.is_empty() {
            if let Some(level) = resolve_stop_key_level(&position.stop_key, history, cfg) {
                position.stop_value = level;
            }
        }
    }

    /// §4.E keep_profit stop upgrade: if resistance broke upward and
    /// `new_stop_hubo >= stop_value`, upgrade the position's stop.
    pub fn apply_keep_profit_upgrade(position: &mut Position, decision: &DecisionRecord) {
        if decision.keep_profit && decision.new_stop_value_hubo >= position.stop_value {
            position.stop_value = decision.new_stop_value_hubo;
            position.stop_key = decision.new_stop_key_hubo.clone();
        }
    }
}

/// Re-resolves a position's `stop_key` against the latest history,
/// covering every indicator label assignable elsewhere in this file:
/// the buy-time candidates (`bb1_lower`/`bb2_lower`/`sma{p}`/carried-
/// forward `existing`) and the keep-profit upgrade's `hubo_key`
/// (`bb1_upper`/`bb2_upper`/`sma{p}`).
fn resolve_stop_key_level(stop_key: &str, history: &SymbolHistory, cfg: &StrategyConfig) -> Option<f64> {
    let closes = history.closes();
    match stop_key {
        "bb1_lower" => crate::indicators::bollinger(&closes, cfg.bb1.length, cfg.bb1.std_dev).last_lower(),
        "bb2_lower" => crate::indicators::bollinger(&closes, cfg.bb2.length, cfg.bb2.std_dev).last_lower(),
        "bb1_upper" => crate::indicators::bollinger(&closes, cfg.bb1.length, cfg.bb1.std_dev).last_upper(),
        "bb2_upper" => crate::indicators::bollinger(&closes, cfg.bb2.length, cfg.bb2.std_dev).last_upper(),
        key => key
            .strip_prefix("sma")
            .and_then(|p| p.parse::<usize>().ok())
            .and_then(|period| crate::indicators::sma(&closes, period).last().copied().flatten()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;
    use crate::config::{BollingerConfig, PoConfig, RsiConfig};
    use chrono::TimeZone;

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            bb1: BollingerConfig { length: 20, std_dev: 2.0, buy_margin: 0.01 },
            bb2: BollingerConfig { length: 4, std_dev: 4.0, buy_margin: 0.01 },
            rsi: RsiConfig { length: 14, hill_window: 32, hills: 3 },
            po: PoConfig { length: 14 },
        }
    }

    fn flat_history(n: usize, value: f64) -> SymbolHistory {
        let mut h = SymbolHistory::new(2000);
        for i in 0..n {
            h.push(Bar::new(
                Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i as i64),
                value, value, value, value, 100.0, 10, value,
            ));
        }
        h
    }

    #[test]
    fn flat_series_produces_no_buy_signal() {
        let cfg = cfg();
        let periods = vec![5, 20, 60];
        let engine = StrategyEngine::new(&cfg, &periods, 0.01, 0.01);
        let history = flat_history(100, 100.0);
        let minute = Bar::new(Utc.with_ymd_and_hms(2024, 7, 5, 9, 31, 0).unwrap(), 100.0, 100.0, 100.0, 100.0, 10.0, 1, 100.0);
        let decision = engine.evaluate("AAA", &history, &minute, None, None);
        assert!(!decision.buy);
        assert!(!decision.sell);
    }

    #[test]
    fn sma_align_strength_is_one_for_strict_ascending_order() {
        // shorter-period SMA above longer-period SMA everywhere => fully bullish aligned
        let vals = vec![(5, 110.0), (20, 100.0), (60, 90.0)];
        assert_eq!(sma_align_strength(&vals), 1.0);
    }

    #[test]
    fn sma_align_strength_is_minus_one_for_strict_descending_order() {
        let vals = vec![(5, 90.0), (20, 100.0), (60, 110.0)];
        assert_eq!(sma_align_strength(&vals), -1.0);
    }

    #[test]
    fn upward_breakout_detects_threshold_cross() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let minute_ts = ts + chrono::Duration::minutes(1);
        // threshold = 100 + 101*0.0 = 100; low=99 <= 100, close=101 > 100
        assert!(upward_breakout(100.0, ts, minute_ts, 99.0, 101.0, None, 0.0));
        assert!(!upward_breakout(100.0, ts, minute_ts, 99.0, 99.5, None, 0.0));
    }

    #[test]
    fn stale_hourly_bar_falls_back_to_prev_close() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let minute_ts = ts + chrono::Duration::hours(5); // > 4h stale
        // low would fail the test but prev_close succeeds
        assert!(upward_breakout(100.0, ts, minute_ts, 200.0, 101.0, Some(99.0), 0.0));
    }

    #[test]
    fn decision_ring_keeps_only_last_three() {
        let mut ring = DecisionRing::default();
        for i in 0..5 {
            let mut r = DecisionRecord::default();
            r.buy_strength = i as f64;
            ring.push(r);
        }
        assert_eq!(ring.records.len(), 3);
        assert_eq!(ring.last().unwrap().buy_strength, 4.0);
    }
}
