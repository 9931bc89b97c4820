/// main.rs — Backtesting Entry Point
///
/// Runs the equities trading engine over a historical window:
///   1. Load config from .env
///   2. Discover the tradable symbol universe (top-N by trading_value,
///      unioned with the top Russell 2000 names)
///   3. Run the minute-cadence backtest loop
///   4. Export the run's CSV/Excel summary

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use equities_trader::calendar::AlpacaCalendar;
use equities_trader::config::AppConfig;
use equities_trader::engine::Engine;
use equities_trader::market_data::AlpacaMarketData;
use equities_trader::universe::{read_tickers_from_csv, EquityFilter};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Run the equities trading engine in backtest mode")]
struct Args {
    /// Start of the backtest window, RFC3339 (e.g. 2024-07-01T09:31:00Z)
    #[arg(long)]
    start: DateTime<Utc>,

    /// End of the backtest window, RFC3339 (inclusive)
    #[arg(long)]
    end: DateTime<Utc>,

    /// Explicit symbol list, overriding universe discovery
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║   EQUITIES TRADING ENGINE — BACKTEST MODE   ║");
    info!("╚══════════════════════════════════════════════╝");

    let args = Args::parse();
    let cfg = AppConfig::from_env()?;
    info!(
        start = %args.start,
        end = %args.end,
        initial_cash = cfg.initial_cash,
        max_buy_per_min = cfg.max_buy_per_min,
        "config loaded"
    );

    let market_data = AlpacaMarketData::new(cfg.data_base_url.clone(), cfg.api_key.clone(), cfg.api_secret.clone());
    let calendar = AlpacaCalendar::new(cfg.base_url.clone(), cfg.api_key.clone(), cfg.api_secret.clone());

    let symbols = match args.symbols {
        Some(s) => s,
        None => {
            info!("discovering symbol universe");
            let russell = read_tickers_from_csv(&cfg.universe.russell_csv_path)
                .with_context(|| format!("reading Russell holdings csv {}", cfg.universe.russell_csv_path))?;
            let filter = EquityFilter::new(&market_data, cfg.universe.asset_filter_num, cfg.universe.russell_filter_num);
            filter.filter_symbols(&russell, &russell, args.start).await.context("discovering symbol universe")?
        }
    };

    let mut engine = Engine::new(
        cfg,
        false,
        args.start,
        args.end,
        Box::new(market_data),
        Box::new(calendar),
        Arc::new(equities_trader::broker::SimBroker),
    )?;
    engine.initialize(symbols).await.context("initializing engine")?;
    engine.run_backtest().await?;

    Ok(())
}
