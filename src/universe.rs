/// universe.rs — symbol-universe discovery (§6 Symbol universe): a
/// ranked list of tradable symbols by 60-day mean trading_value.
///
/// Grounded in `original_source`'s `EquityFilter`/`CryptoFilter` pair.
/// `CryptoFilter` is implemented for parity but, per spec's Non-goals,
/// is never called from `TradingLoop`.
use crate::bar::Bar;
use crate::market_data::{MarketDataProvider, Timeframe};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

fn mean_trading_value(bars: &[Bar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    bars.iter().map(|b| b.trading_value).sum::<f64>() / bars.len() as f64
}

fn rank_by_mean_trading_value(history: &HashMap<String, Vec<Bar>>, top_n: usize) -> Vec<String> {
    let mut ranked: Vec<(String, f64)> = history
        .iter()
        .map(|(symbol, bars)| (symbol.clone(), mean_trading_value(bars)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    ranked.into_iter().take(top_n).map(|(s, _)| s).collect()
}

/// Equity universe: top-K by 60-day mean trading_value among all
/// tradable assets, unioned with top-K among the Russell 2000.
pub struct EquityFilter<'a> {
    provider: &'a dyn MarketDataProvider,
    asset_filter_num: usize,
    russell_filter_num: usize,
}

impl<'a> EquityFilter<'a> {
    pub fn new(provider: &'a dyn MarketDataProvider, asset_filter_num: usize, russell_filter_num: usize) -> Self {
        Self { provider, asset_filter_num, russell_filter_num }
    }

    pub async fn filter_symbols(
        &self,
        tradable_symbols: &[String],
        russell_symbols: &[String],
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let start = as_of - chrono::Duration::days(60);
        let daily_bars = self.provider.get_bars(tradable_symbols, Timeframe::Hour, start, as_of).await?;
        let top_assets = rank_by_mean_trading_value(&daily_bars, self.asset_filter_num);

        let russell_bars = self.provider.get_bars(russell_symbols, Timeframe::Hour, start, as_of).await?;
        let top_russell = rank_by_mean_trading_value(&russell_bars, self.russell_filter_num);

        let mut union: Vec<String> = top_assets;
        for s in top_russell {
            if !union.contains(&s) {
                union.push(s);
            }
        }
        Ok(union)
    }
}

/// Reads the ticker column of a Russell-2000-holdings-style CSV
/// (`original_source`'s `IWM_holdings.csv`), skipping the header row.
pub fn read_tickers_from_csv(path: &str) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut tickers = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(ticker) = record.get(0) {
            tickers.push(ticker.to_string());
        }
    }
    Ok(tickers)
}

/// Crypto universe filter: top-(1-rate) quantile by 60-day mean
/// trading_value. Implemented for parity with `original_source`; the
/// engine's trading loop never constructs or calls this per the
/// spec's explicit Non-goal on crypto execution paths.
pub struct CryptoFilter<'a> {
    provider: &'a dyn MarketDataProvider,
    asset_filter_rate: f64,
}

impl<'a> CryptoFilter<'a> {
    pub fn new(provider: &'a dyn MarketDataProvider, asset_filter_rate: f64) -> Self {
        Self { provider, asset_filter_rate }
    }

    pub async fn filter_symbols(&self, symbols: &[String], as_of: DateTime<Utc>) -> Result<Vec<String>> {
        let start = as_of - chrono::Duration::days(120);
        let bars = self.provider.get_bars(symbols, Timeframe::Hour, start, as_of).await?;
        let mut values: Vec<f64> = bars.values().map(|b| mean_trading_value(b)).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let idx = ((1.0 - self.asset_filter_rate) * values.len() as f64) as usize;
        let threshold = values.get(idx.min(values.len() - 1)).copied().unwrap_or(f64::MAX);
        Ok(bars
            .into_iter()
            .filter(|(_, b)| mean_trading_value(b) > threshold)
            .map(|(s, _)| s)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::ReplayMarketData;
    use chrono::TimeZone;

    fn bar_with_value(ts: DateTime<Utc>, trading_value: f64) -> Bar {
        Bar::new(ts, 1.0, 1.0, 1.0, 1.0, trading_value, 1, 1.0)
    }

    #[tokio::test]
    async fn equity_filter_ranks_by_mean_trading_value_and_unions_russell() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let mut fixtures = HashMap::new();
        fixtures.insert("HIGH".to_string(), vec![bar_with_value(ts, 1_000_000.0)]);
        fixtures.insert("LOW".to_string(), vec![bar_with_value(ts, 10.0)]);
        fixtures.insert("RUS".to_string(), vec![bar_with_value(ts, 500.0)]);
        let provider = ReplayMarketData { fixtures };

        let filter = EquityFilter::new(&provider, 1, 1);
        let result = filter
            .filter_symbols(
                &["HIGH".to_string(), "LOW".to_string()],
                &["RUS".to_string()],
                ts,
            )
            .await
            .unwrap();
        assert!(result.contains(&"HIGH".to_string()));
        assert!(result.contains(&"RUS".to_string()));
        assert!(!result.contains(&"LOW".to_string()));
    }
}
