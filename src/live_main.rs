/// live_main.rs — Live Trading Entry Point
///
/// Runs the equities trading engine against a real brokerage account:
///   1. Load config from .env
///   2. Discover the tradable symbol universe
///   3. Warm up history, then enter the live minute-cadence scheduler
///      until the session's end time

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use equities_trader::broker::AlpacaBroker;
use equities_trader::calendar::AlpacaCalendar;
use equities_trader::config::AppConfig;
use equities_trader::engine::Engine;
use equities_trader::market_data::AlpacaMarketData;
use equities_trader::universe::{read_tickers_from_csv, EquityFilter};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Run the equities trading engine against a live brokerage account")]
struct Args {
    /// Session end time, RFC3339 — the loop exits once this passes
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
    info!("║     EQUITIES TRADING ENGINE — LIVE MODE     ║");
    info!("╚══════════════════════════════════════════════╝");
    if std::env::var("ALPACA_BASE_URL").map(|u| u.contains("paper")).unwrap_or(true) {
        info!("⚠ paper trading endpoint active");
    }

    let args = Args::parse();
    let cfg = AppConfig::from_env()?;
    let now = Utc::now();

    let market_data = AlpacaMarketData::new(cfg.data_base_url.clone(), cfg.api_key.clone(), cfg.api_secret.clone());
    let calendar = AlpacaCalendar::new(cfg.base_url.clone(), cfg.api_key.clone(), cfg.api_secret.clone());
    let broker = AlpacaBroker::new(cfg.base_url.clone(), cfg.api_key.clone(), cfg.api_secret.clone());

    let symbols = match args.symbols {
        Some(s) => s,
        None => {
            info!("discovering symbol universe");
            let russell = read_tickers_from_csv(&cfg.universe.russell_csv_path)
                .with_context(|| format!("reading Russell holdings csv {}", cfg.universe.russell_csv_path))?;
            let filter = EquityFilter::new(&market_data, cfg.universe.asset_filter_num, cfg.universe.russell_filter_num);
            filter.filter_symbols(&russell, &russell, now).await.context("discovering symbol universe")?
        }
    };

    let mut engine = Engine::new(cfg, true, now, args.end, Box::new(market_data), Box::new(calendar), Arc::new(broker))?;
    engine.initialize(symbols).await.context("initializing engine")?;
    engine.run_live().await?;

    Ok(())
}
