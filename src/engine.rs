/// engine.rs — the trading loop that composes every other component
/// once per minute (§4.I TradingLoop).
///
/// Grounded in `original_source`'s `Trader/Backtest/Backtest.py`
/// (`Trader.simulate_trade`'s `while current <= end: if market_open:
/// fetch -> evaluate -> execute` loop) for the backtest path, and
/// `Trader/TraderLive.py` (`TraderLive.run`'s `schedule.every().minute
/// .at(":05")` + outer `while: run_pending(); sleep(1)` poll) for the
/// live path, composed in the teacher's event-loop style from
/// `backtest.rs`/`live_main.rs`.
use crate::account::{Account, LiveAccount, LocalAccount};
use crate::bar::SymbolHistory;
use crate::broker::{Broker, OpenOrders};
use crate::calendar::CalendarProvider;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::fusion::BarFusion;
use crate::market_data::{self, MarketDataProvider};
use crate::orders::OrderManager;
use crate::positions::Position;
use crate::reporting::{AccountLogRow, OrderLogRow, ProphecyRow, Reporting, TraderLogRow};
use crate::strategy::{DecisionRecord, DecisionRing, StrategyEngine};
use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns every collaborator for one run and drives the per-minute
/// pipeline described in §2's data flow and §4.I. Constructed once;
/// no global singletons, per §9's capability-interface design note.
pub struct Engine {
    cfg: AppConfig,
    live: bool,
    clock: Clock,
    market_data: Box<dyn MarketDataProvider>,
    calendar: Box<dyn CalendarProvider>,
    broker: Arc<dyn Broker>,
    account: Box<dyn Account>,
    open_orders: OpenOrders,
    fusion: BarFusion,
    histories: HashMap<String, SymbolHistory>,
    symbols: Vec<String>,
    rings: HashMap<String, DecisionRing>,
    reporting: Reporting,
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        live: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        market_data: Box<dyn MarketDataProvider>,
        calendar: Box<dyn CalendarProvider>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let trail = cfg.trailing.for_mode(live);
        let account: Box<dyn Account> = if live {
            Box::new(LiveAccount::new(Arc::clone(&broker), trail))
        } else {
            Box::new(LocalAccount::new(cfg.initial_cash))
        };
        let clock = if live { Clock::new_live(start, end) } else { Clock::new_backtest(start, end) };
        let reporting = Reporting::new(&cfg.results_dir, &cfg.run_prefix, start, end, Utc::now())
            .context("initializing reporting sinks")?;

        Ok(Self {
            cfg,
            live,
            clock,
            market_data,
            calendar,
            broker,
            account,
            open_orders: OpenOrders::new(),
            fusion: BarFusion::new(),
            histories: HashMap::new(),
            symbols: Vec::new(),
            rings: HashMap::new(),
            reporting,
        })
    }

    /// Loads the market calendar and bulk hourly history for
    /// `candidate_symbols`, admitting only those that clear
    /// `history.min_num_bars` into the tradable universe (§3).
    pub async fn initialize(&mut self, candidate_symbols: Vec<String>) -> Result<()> {
        self.clock
            .ensure_calendar_loaded(self.calendar.as_ref())
            .await
            .context("loading market calendar")?;

        if self.live {
            self.account.update(0.0).await.context("initial account sync")?;
        }

        let as_of = self.clock.current;
        let histories = market_data::fetch_history(
            self.market_data.as_ref(),
            &candidate_symbols,
            as_of,
            self.cfg.history.period_hours,
            self.cfg.history.min_num_bars,
            self.cfg.max_workers,
        )
        .await;

        info!(
            requested = candidate_symbols.len(),
            admitted = histories.len(),
            "symbol universe initialized"
        );
        self.symbols = histories.keys().cloned().collect();
        self.histories = histories;
        Ok(())
    }

    /// Drives the clock one minute at a time from `start` to `end`
    /// inclusive, then exports the run's Excel summary.
    pub async fn run_backtest(&mut self) -> Result<()> {
        info!(start = %self.clock.start, end = %self.clock.end, symbols = self.symbols.len(), "starting backtest");
        while !self.clock.is_finished() {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "tick failed");
            }
            self.clock.tick();
        }
        let path = self.reporting.export_excel_summary().context("exporting excel summary")?;
        info!(path = %path.display(), "backtest complete");
        Ok(())
    }

    /// Polls the wall clock once a second, firing the per-minute
    /// pipeline at the first second-marker >= :05 of each new minute —
    /// this engine's equivalent of `schedule.every().minute.at(":05")`.
    /// Exits once `current` passes `end`.
    pub async fn run_live(&mut self) -> Result<()> {
        info!(end = %self.clock.end, "entering live scheduler loop");
        let mut last_fired: Option<(chrono::NaiveDate, u32, u32)> = None;

        while !self.clock.is_finished() {
            self.clock.tick();
            let now = self.clock.current;
            let key = (now.date_naive(), now.time().hour(), now.time().minute());

            if now.time().second() >= 5 && last_fired != Some(key) {
                last_fired = Some(key);
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "live tick failed");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        info!("live loop finished");
        Ok(())
    }

    /// Runs one minute's full pipeline: gate on market hours, fetch
    /// recent bars, fuse them into hourly history, evaluate the
    /// strategy per symbol, dispatch orders (sells before buys),
    /// ratchet stops for positions still held, and append to the audit
    /// trail. Per §7, errors from any one symbol are logged and that
    /// symbol is skipped — nothing here propagates out of a tick.
    async fn tick(&mut self) -> Result<()> {
        if !self.clock.is_market_open() {
            return Ok(());
        }
        let now = self.clock.current;

        let recent = market_data::fetch_recent(self.market_data.as_ref(), &self.symbols, now, self.cfg.max_workers).await;
        if recent.is_empty() {
            return Ok(());
        }

        let trail = self.cfg.trailing.for_mode(self.live);
        let strategy = StrategyEngine::new(&self.cfg.strategy, &self.cfg.sma.periods, self.cfg.sma.margin, trail);

        let mut decisions = Vec::with_capacity(recent.len());
        for (symbol, bar) in &recent {
            let history = match self.histories.get_mut(symbol) {
                Some(h) => h,
                None => continue,
            };
            self.fusion.merge(history, *bar);
            self.fusion.maybe_compact(symbol, history, now);

            let position = self.account.positions().get(symbol).cloned();
            let prev = self.rings.get(symbol).and_then(|r| r.last()).cloned();
            let decision = strategy.evaluate(symbol, history, bar, position.as_ref(), prev.as_ref());

            self.rings.entry(symbol.clone()).or_default().push(decision.clone());
            decisions.push(decision);
        }
        if decisions.is_empty() {
            return Ok(());
        }

        let pre_positions: HashMap<String, Option<Position>> = decisions
            .iter()
            .map(|d| (d.symbol.clone(), self.account.positions().get(&d.symbol).cloned()))
            .collect();

        let executed = {
            let mgr = OrderManager::new(&self.cfg, self.live);
            mgr.dispatch(&decisions, self.account.as_mut(), &mut self.open_orders, self.broker.as_ref()).await
        };

        // Trailing ratchet + keep-profit stop upgrade for positions
        // still held after this tick's dispatch (§4.E).
        for decision in &decisions {
            if !self.account.positions().contains(&decision.symbol) {
                continue;
            }
            let mut working = match self.account.positions().get(&decision.symbol) {
                Some(p) => p.clone(),
                None => continue,
            };
            if let Some(history) = self.histories.get(&decision.symbol) {
                StrategyEngine::trailing_update(&mut working, decision.price, trail, history, &self.cfg.strategy);
            }
            StrategyEngine::apply_keep_profit_upgrade(&mut working, decision);
            self.account
                .record_trailing(&decision.symbol, working.stop_value, &working.stop_key, working.stop_trailing);
            self.account.mark_price(&decision.symbol, decision.price);
        }

        self.log_tick(&decisions, &executed, &pre_positions, now)?;

        self.account.update(0.0).await.context("refreshing account state")?;
        self.log_account_snapshot(now)?;
        Ok(())
    }

    fn log_tick(
        &self,
        decisions: &[DecisionRecord],
        executed: &[DecisionRecord],
        pre_positions: &HashMap<String, Option<Position>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for d in decisions {
            if d.buy || d.sell || d.keep_profit {
                self.reporting.prophecy.append(&ProphecyRow::from(d)).context("logging prophecy row")?;
            }
        }

        for d in executed {
            let side = if d.sell { "sell" } else { "buy" };
            let (qty, avg_price) = if d.sell {
                pre_positions
                    .get(&d.symbol)
                    .and_then(|p| p.as_ref())
                    .map(|p| (p.quantity, p.avg_price))
                    .unwrap_or((0.0, 0.0))
            } else {
                self.account.positions().get(&d.symbol).map(|p| (p.quantity, p.avg_price)).unwrap_or((0.0, 0.0))
            };
            let cash_change = if d.sell { d.price * qty } else { -(d.price * qty) };
            let profit = if d.sell { (d.price - avg_price) * qty } else { 0.0 };

            self.reporting
                .trader
                .append(&TraderLogRow {
                    time: now,
                    action: side.to_string(),
                    symbol: d.symbol.clone(),
                    qty,
                    price: d.price,
                    avg_price,
                    cash_change,
                    profit,
                })
                .context("logging trader row")?;
            self.reporting
                .order
                .append(&OrderLogRow {
                    time: now,
                    symbol: d.symbol.clone(),
                    side: side.to_string(),
                    qty,
                    client_order_id: String::new(),
                })
                .context("logging order row")?;
        }
        Ok(())
    }

    fn log_account_snapshot(&self, now: DateTime<Utc>) -> Result<()> {
        self.reporting
            .account
            .append(&AccountLogRow {
                time: now,
                cash: self.account.cash(),
                positions_value: self.account.positions().value,
                total_value: self.account.total_value(),
            })
            .context("logging account snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;
    use crate::broker::SimBroker;
    use crate::calendar::CalendarProvider;
    use crate::market_data::ReplayMarketData;
    use chrono::{NaiveDate, TimeZone};

    struct AlwaysOpen;

    #[async_trait::async_trait]
    impl CalendarProvider for AlwaysOpen {
        async fn valid_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
            let mut days = Vec::new();
            let mut d = start;
            while d <= end {
                days.push(d);
                d = d.succ_opt().unwrap();
            }
            Ok(days)
        }
    }

    fn test_cfg(dir: &std::path::Path) -> AppConfig {
        let mut cfg = AppConfig::from_env().unwrap();
        cfg.results_dir = dir.to_string_lossy().to_string();
        cfg.history.min_num_bars = 1;
        cfg.max_workers = 2;
        cfg
    }

    #[tokio::test]
    async fn backtest_runs_a_short_window_without_error() {
        let dir = std::env::temp_dir().join(format!("engine_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let start = chrono_tz::America::New_York
            .with_ymd_and_hms(2024, 7, 1, 9, 31, 0)
            .unwrap()
            .with_timezone(&Utc);
        let end = start + chrono::Duration::minutes(2);

        let mut fixtures = HashMap::new();
        let mut bars = Vec::new();
        let mut t = start - chrono::Duration::hours(1);
        while t <= end {
            bars.push(Bar::new(t, 100.0, 100.0, 100.0, 100.0, 10.0, 1, 100.0));
            t += chrono::Duration::minutes(1);
        }
        fixtures.insert("AAA".to_string(), bars);
        let market_data = ReplayMarketData { fixtures };

        let cfg = test_cfg(&dir);
        let mut engine = Engine::new(
            cfg,
            false,
            start,
            end,
            Box::new(market_data),
            Box::new(AlwaysOpen),
            Arc::new(SimBroker),
        )
        .unwrap();

        engine.initialize(vec!["AAA".to_string()]).await.unwrap();
        engine.run_backtest().await.unwrap();
    }
}
