/// config.rs — Centralised configuration loaded from .env
///
/// All parameters consumed by the trading engine are defined here.
/// Loading happens once at startup; every module borrows &AppConfig.
use anyhow::Result;
use std::env;

/// Bollinger Band parameters for one of the two configured bands.
#[derive(Debug, Clone, Copy)]
pub struct BollingerConfig {
    pub length: usize,
    pub std_dev: f64,
    pub buy_margin: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RsiConfig {
    pub length: usize,
    pub hill_window: usize,
    pub hills: usize,
}

#[derive(Debug, Clone)]
pub struct SmaConfig {
    pub periods: Vec<usize>,
    pub margin: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PoConfig {
    pub length: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    pub bb1: BollingerConfig,
    pub bb2: BollingerConfig,
    pub rsi: RsiConfig,
    pub po: PoConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingConfig {
    pub local: f64,
    pub live: f64,
}

impl TrailingConfig {
    pub fn for_mode(&self, live: bool) -> f64 {
        if live { self.live } else { self.local }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Hourly bars kept per symbol (§3 SymbolHistory window).
    pub period_hours: usize,
    /// Symbols whose history has fewer bars than this are dropped.
    pub min_num_bars: usize,
}

#[derive(Debug, Clone)]
pub struct UniverseConfig {
    pub top_n: usize,
    pub asset_filter_num: usize,
    pub russell_filter_num: usize,
    pub russell_csv_path: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Alpaca credentials ───────────────────────────────────────────
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    /// Alpaca's market-data REST host is a distinct deployment from the
    /// trading API (`data.alpaca.markets` vs. `paper-api`/`api`), mirroring
    /// `original_source`'s separate `ClientType::STOCK_HISTORY` client.
    pub data_base_url: String,

    // ── Trading universe ─────────────────────────────────────────────
    pub universe: UniverseConfig,

    // ── Capital & position sizing ────────────────────────────────────
    pub initial_cash: f64,
    pub one_time_invest_ratio: f64,
    pub max_buy_per_min: usize,
    pub max_ratio_per_asset: f64,
    pub trailing: TrailingConfig,

    // ── Bar history ───────────────────────────────────────────────────
    pub history: HistoryConfig,

    // ── Strategy parameters ──────────────────────────────────────────
    pub strategy: StrategyConfig,
    pub sma: SmaConfig,

    // ── Concurrency ───────────────────────────────────────────────────
    /// Bounded worker pool size for MarketData fetches and per-symbol
    /// StrategyEngine evaluation; hard-capped at 30 per §5.
    pub max_workers: usize,

    // ── Persisted artifacts ───────────────────────────────────────────
    pub results_dir: String,
    pub run_prefix: String,
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // ignore missing .env

        let api_key = env::var("ALPACA_API_KEY").unwrap_or_default();
        let api_secret = env::var("ALPACA_API_SECRET").unwrap_or_default();
        let base_url = env::var("ALPACA_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".into());
        let data_base_url = env::var("ALPACA_DATA_URL")
            .unwrap_or_else(|_| "https://data.alpaca.markets".into());

        let sma_periods: Vec<usize> = env::var("SMA_PERIODS")
            .unwrap_or_else(|_| "5,20,60,120,240,480".into())
            .split(',')
            .filter_map(|s| s.trim().parse::<usize>().ok())
            .collect();

        let max_workers = parse_env::<usize>("MAX_WORKERS", 30)?.min(30);

        Ok(Self {
            api_key,
            api_secret,
            base_url,
            data_base_url,

            universe: UniverseConfig {
                top_n: parse_env("UNIVERSE_TOP_N", 250usize)?,
                asset_filter_num: parse_env("UNIVERSE_ASSET_FILTER_NUM", 250usize)?,
                russell_filter_num: parse_env("UNIVERSE_RUSSELL_FILTER_NUM", 250usize)?,
                russell_csv_path: env::var("UNIVERSE_RUSSELL_CSV")
                    .unwrap_or_else(|_| "Data/ExtData/IWM_holdings.csv".into()),
            },

            initial_cash: parse_env("INITIAL_CASH", 100_000.00)?,
            one_time_invest_ratio: parse_env("ONE_TIME_INVEST_RATIO", 0.05)?,
            max_buy_per_min: parse_env("MAX_BUY_PER_MIN", 2usize)?,
            max_ratio_per_asset: parse_env("MAX_RATIO_PER_ASSET", 0.10)?,
            trailing: TrailingConfig {
                local: parse_env("TRAILING_LOCAL", 0.01)?,
                live: parse_env("TRAILING_LIVE", 0.002)?,
            },

            history: HistoryConfig {
                period_hours: parse_env("HISTORY_PERIOD_HOURS", 2000usize)?,
                min_num_bars: parse_env("HISTORY_MIN_NUM_BARS", 480usize)?,
            },

            strategy: StrategyConfig {
                bb1: BollingerConfig {
                    length: parse_env("BB1_LENGTH", 20usize)?,
                    std_dev: parse_env("BB1_STD", 2.0)?,
                    buy_margin: parse_env("BB1_BUY_MARGIN", 0.01)?,
                },
                bb2: BollingerConfig {
                    length: parse_env("BB2_LENGTH", 4usize)?,
                    std_dev: parse_env("BB2_STD", 4.0)?,
                    buy_margin: parse_env("BB2_BUY_MARGIN", 0.01)?,
                },
                rsi: RsiConfig {
                    length: parse_env("RSI_LENGTH", 14usize)?,
                    hill_window: parse_env("RSI_HILL_WINDOW", 32usize)?,
                    hills: parse_env("RSI_HILLS", 3usize)?,
                },
                po: PoConfig {
                    length: parse_env("PO_LENGTH", 14usize)?,
                },
            },
            sma: SmaConfig {
                periods: if sma_periods.is_empty() {
                    vec![5, 20, 60, 120, 240, 480]
                } else {
                    sma_periods
                },
                margin: parse_env("SMA_MARGIN", 0.01)?,
            },

            max_workers,

            results_dir: env::var("RESULTS_DIR").unwrap_or_else(|_| "Results".into()),
            run_prefix: env::var("RUN_PREFIX").unwrap_or_else(|_| "trader".into()),
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_config_picks_mode() {
        let t = TrailingConfig { local: 0.01, live: 0.002 };
        assert_eq!(t.for_mode(false), 0.01);
        assert_eq!(t.for_mode(true), 0.002);
    }

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        env::remove_var("SOME_UNSET_TEST_KEY_XYZ");
        let v: f64 = parse_env("SOME_UNSET_TEST_KEY_XYZ", 42.0).unwrap();
        assert_eq!(v, 42.0);
    }
}
