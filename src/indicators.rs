/// indicators.rs — Bollinger Bands, SMA, RSI, Price Oscillator, and
/// local-extrema (peak/dip) detection, computed over a closing-price
/// series (§4.D).
///
/// ─────────────────────────────────────────────────────────────────
/// Bollinger Bands at length n, k standard deviations:
///   mid_t    = SMA(close, n)_t
///   upper_t  = mid_t + k * stddev(close[t-n+1..=t])
///   lower_t  = mid_t - k * stddev(close[t-n+1..=t])
///   bandwidth_t = (upper_t - lower_t) / mid_t
///   percent_t   = (close_t - lower_t) / (upper_t - lower_t)
///
/// Price Oscillator:
///   PO_t = 100 * (close_t - SMA(close, 14)_t) / SMA(close, 14)_t
///
/// RSI(14) uses Wilder's smoothed average gain/loss.
/// ─────────────────────────────────────────────────────────────────
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct BollingerSeries {
    pub lower: Vec<Option<f64>>,
    pub mid: Vec<Option<f64>>,
    pub upper: Vec<Option<f64>>,
    pub bandwidth: Vec<Option<f64>>,
    pub percent: Vec<Option<f64>>,
}

impl BollingerSeries {
    pub fn last_lower(&self) -> Option<f64> {
        self.lower.last().copied().flatten()
    }
    pub fn last_upper(&self) -> Option<f64> {
        self.upper.last().copied().flatten()
    }
    pub fn last_mid(&self) -> Option<f64> {
        self.mid.last().copied().flatten()
    }
    pub fn prev_lower(&self) -> Option<f64> {
        nth_from_end(&self.lower, 1)
    }
    pub fn prev_upper(&self) -> Option<f64> {
        nth_from_end(&self.upper, 1)
    }
}

fn nth_from_end(v: &[Option<f64>], n: usize) -> Option<f64> {
    if v.len() > n {
        v[v.len() - 1 - n]
    } else {
        None
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn stddev(xs: &[f64], m: f64) -> f64 {
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    var.sqrt()
}

/// Simple moving average over the whole series, `None` until `length`
/// samples are available.
pub fn sma(series: &[f64], length: usize) -> Vec<Option<f64>> {
    if length == 0 {
        return vec![None; series.len()];
    }
    (0..series.len())
        .map(|i| {
            if i + 1 < length {
                None
            } else {
                Some(mean(&series[i + 1 - length..=i]))
            }
        })
        .collect()
}

pub fn bollinger(series: &[f64], length: usize, std_dev: f64) -> BollingerSeries {
    let mid = sma(series, length);
    let mut out = BollingerSeries {
        lower: vec![None; series.len()],
        mid: mid.clone(),
        upper: vec![None; series.len()],
        bandwidth: vec![None; series.len()],
        percent: vec![None; series.len()],
    };
    for i in 0..series.len() {
        if let Some(m) = mid[i] {
            if i + 1 >= length {
                let window = &series[i + 1 - length..=i];
                let sd = stddev(window, m);
                let upper = m + std_dev * sd;
                let lower = m - std_dev * sd;
                out.upper[i] = Some(upper);
                out.lower[i] = Some(lower);
                out.bandwidth[i] = if m != 0.0 { Some((upper - lower) / m) } else { None };
                out.percent[i] = if upper != lower {
                    Some((series[i] - lower) / (upper - lower))
                } else {
                    None
                };
            }
        }
    }
    out
}

/// Price Oscillator: 100 * (close - SMA(close,length)) / SMA(close,length).
pub fn price_oscillator(series: &[f64], length: usize) -> Vec<Option<f64>> {
    let base = sma(series, length);
    series
        .iter()
        .zip(base.iter())
        .map(|(c, s)| s.filter(|&s| s != 0.0).map(|s| 100.0 * (c - s) / s))
        .collect()
}

/// RSI via Wilder's smoothing, `None` until `length` samples of
/// change data exist (i.e. index >= length).
pub fn rsi(series: &[f64], length: usize) -> Vec<Option<f64>> {
    let n = series.len();
    let mut out = vec![None; n];
    if n < length + 1 {
        return out;
    }
    let changes: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = changes.iter().map(|c| c.max(0.0)).collect();
    let losses: Vec<f64> = changes.iter().map(|c| (-c).max(0.0)).collect();

    let mut avg_gain = mean(&gains[0..length]);
    let mut avg_loss = mean(&losses[0..length]);
    out[length] = Some(rsi_from_avgs(avg_gain, avg_loss));

    for i in length..changes.len() {
        avg_gain = (avg_gain * (length - 1) as f64 + gains[i]) / length as f64;
        avg_loss = (avg_loss * (length - 1) as f64 + losses[i]) / length as f64;
        out[i + 1] = Some(rsi_from_avgs(avg_gain, avg_loss));
    }
    out
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Local extrema over a series: a peak if the value is >= both
/// neighbors, a dip if <= both neighbors. The most recent index is
/// forced in as a peak/dip relative to the previous value alone, per
/// §4.D's closing sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Peak,
    Dip,
}

pub fn find_extrema(series: &[f64]) -> Vec<(usize, Extremum)> {
    let n = series.len();
    let mut out = Vec::new();
    if n == 0 {
        return out;
    }
    for i in 1..n.saturating_sub(1) {
        if series[i] >= series[i - 1] && series[i] >= series[i + 1] {
            out.push((i, Extremum::Peak));
        } else if series[i] <= series[i - 1] && series[i] <= series[i + 1] {
            out.push((i, Extremum::Dip));
        }
    }
    if n >= 2 {
        let last = n - 1;
        if series[last] > series[last - 1] {
            out.push((last, Extremum::Peak));
        } else if series[last] < series[last - 1] {
            out.push((last, Extremum::Dip));
        }
    }
    out
}

/// Bundles every per-symbol indicator series computed from a closing
/// price (and high/low, for the bands) history into one struct so
/// StrategyEngine doesn't recompute anything twice per tick.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub bb1: BollingerSeries,
    pub bb2: BollingerSeries,
    pub po: Vec<Option<f64>>,
    pub rsi: Vec<Option<f64>>,
    /// One SMA series per configured period, keyed by the period.
    pub sma: HashMap<usize, Vec<Option<f64>>>,
}

impl IndicatorSet {
    pub fn compute(
        closes: &[f64],
        cfg: &crate::config::StrategyConfig,
        sma_cfg: &crate::config::SmaConfig,
    ) -> Self {
        let mut sma_map = HashMap::new();
        for &p in &sma_cfg.periods {
            if closes.len() >= p {
                sma_map.insert(p, sma(closes, p));
            }
        }
        Self {
            bb1: bollinger(closes, cfg.bb1.length, cfg.bb1.std_dev),
            bb2: bollinger(closes, cfg.bb2.length, cfg.bb2.std_dev),
            po: price_oscillator(closes, cfg.po.length),
            rsi: rsi(closes, cfg.rsi.length),
            sma: sma_map,
        }
    }

    /// Last value of each configured SMA period, ordered by period
    /// ascending, skipping periods without enough samples yet.
    pub fn sma_values(&self, periods: &[usize]) -> Vec<(usize, f64)> {
        periods
            .iter()
            .filter_map(|p| {
                self.sma
                    .get(p)
                    .and_then(|s| s.last().copied().flatten())
                    .map(|v| (*p, v))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_none_until_enough_samples() {
        let s = sma(&[1.0, 2.0, 3.0], 3);
        assert_eq!(s, vec![None, None, Some(2.0)]);
    }

    #[test]
    fn sma_is_simple_average_of_window() {
        let s = sma(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(s[3], Some(3.5));
    }

    #[test]
    fn rsi_is_100_when_no_losses() {
        let series: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let r = rsi(&series, 14);
        assert_eq!(r[14], Some(100.0));
    }

    #[test]
    fn price_oscillator_is_zero_at_the_mean() {
        let series = vec![10.0; 20];
        let po = price_oscillator(&series, 14);
        assert!((po[19].unwrap()).abs() < 1e-9);
    }

    #[test]
    fn find_extrema_detects_simple_peak_and_dip() {
        let series = vec![1.0, 2.0, 1.0, 0.5, 1.5];
        let ex = find_extrema(&series);
        assert!(ex.contains(&(1, Extremum::Peak)));
        assert!(ex.contains(&(3, Extremum::Dip)));
        // last index forced in relative to previous value
        assert!(ex.iter().any(|(i, k)| *i == 4 && *k == Extremum::Peak));
    }

    #[test]
    fn bollinger_bands_widen_with_std_dev() {
        let series = vec![10.0, 12.0, 9.0, 11.0, 13.0, 8.0];
        let b1 = bollinger(&series, 4, 1.0);
        let b2 = bollinger(&series, 4, 2.0);
        let w1 = b1.last_upper().unwrap() - b1.last_lower().unwrap();
        let w2 = b2.last_upper().unwrap() - b2.last_lower().unwrap();
        assert!(w2 > w1);
    }
}
