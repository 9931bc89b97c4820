/// orders.rs — sell-first/buy-next dispatch with concentration caps
/// (§4.H OrderManager).
use crate::account::Account;
use crate::broker::{Broker, OpenOrders, OrderSide};
use crate::config::AppConfig;
use crate::positions::NewAsset;
use crate::strategy::DecisionRecord;
use tracing::{info, warn};

pub struct OrderManager<'a> {
    cfg: &'a AppConfig,
    live: bool,
}

impl<'a> OrderManager<'a> {
    pub fn new(cfg: &'a AppConfig, live: bool) -> Self {
        Self { cfg, live }
    }

    /// Runs the full per-tick dispatch procedure described in §4.H:
    /// refresh open orders, sells before buys, buys capped and sorted
    /// by trading_value descending.
    pub async fn dispatch(
        &self,
        decisions: &[DecisionRecord],
        account: &mut dyn Account,
        open_orders: &mut OpenOrders,
        broker: &dyn Broker,
    ) -> Vec<DecisionRecord> {
        if self.live {
            if let Err(e) = open_orders.reconcile(broker).await {
                warn!(error = %e, "open order reconciliation failed");
            }
        }

        let mut executed = Vec::new();
        let mut sold_this_tick = std::collections::HashSet::new();

        for decision in decisions.iter().filter(|d| d.sell) {
            if self.live && open_orders.contains(&decision.symbol) {
                info!(symbol = %decision.symbol, "skip sell: order already open");
                continue;
            }
            if !account.positions().contains(&decision.symbol) {
                continue;
            }
            match self.sell(decision, account, open_orders, broker).await {
                Ok(true) => {
                    sold_this_tick.insert(decision.symbol.clone());
                    executed.push(decision.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "sell dispatch failed"),
            }
        }

        let mut buy_candidates: Vec<&DecisionRecord> = decisions
            .iter()
            .filter(|d| d.buy && !sold_this_tick.contains(&d.symbol))
            .collect();
        buy_candidates.sort_by(|a, b| b.trading_value.partial_cmp(&a.trading_value).unwrap());

        let mut buys_this_tick = 0usize;
        for decision in buy_candidates {
            if buys_this_tick >= self.cfg.max_buy_per_min {
                break;
            }
            if self.live && open_orders.contains(&decision.symbol) {
                info!(symbol = %decision.symbol, "skip buy: order already open");
                continue;
            }
            match self.buy(decision, account, open_orders, broker).await {
                Ok(true) => {
                    buys_this_tick += 1;
                    executed.push(decision.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "buy dispatch failed"),
            }
        }

        executed
    }

    async fn sell(
        &self,
        decision: &DecisionRecord,
        account: &mut dyn Account,
        open_orders: &mut OpenOrders,
        broker: &dyn Broker,
    ) -> anyhow::Result<bool> {
        let position = match account.positions().get(&decision.symbol) {
            Some(p) => p.clone(),
            None => return Ok(false),
        };

        if self.live {
            let ack = broker
                .submit_market_order(&decision.symbol, position.quantity, OrderSide::Sell)
                .await?;
            open_orders.insert(&decision.symbol, ack.client_order_id);
            // Position mutation deferred to the next broker
            // reconciliation (`Account::update`), not performed here.
            Ok(true)
        } else {
            account.remove_position(&decision.symbol);
            account.update(position.market_value).await?;
            Ok(true)
        }
    }

    async fn buy(
        &self,
        decision: &DecisionRecord,
        account: &mut dyn Account,
        open_orders: &mut OpenOrders,
        broker: &dyn Broker,
    ) -> anyhow::Result<bool> {
        if !self.is_affordable(decision, account) {
            return Ok(false);
        }

        let total_value = account.total_value();
        let invest_budget = (total_value * self.cfg.one_time_invest_ratio).floor();
        let price = decision.price;
        if price <= 0.0 {
            return Ok(false);
        }
        let qty = (invest_budget / price).floor().min((account.cash() / price).floor()).max(0.0);
        if qty <= 0.0 {
            return Ok(false);
        }
        let cost = price * qty;

        if self.live {
            let ack = broker.submit_market_order(&decision.symbol, qty, OrderSide::Buy).await?;
            open_orders.insert(&decision.symbol, ack.client_order_id);
            Ok(true)
        } else {
            account.add_position(NewAsset {
                symbol: decision.symbol.clone(),
                time: decision.timestamp,
                price,
                qty,
                cost,
                stop_value: decision.stop_value,
                stop_key: decision.stop_key.clone(),
                stop_trailing: decision.stop_trailing,
            });
            account.update(-cost).await?;
            Ok(true)
        }
    }

    /// §4.H Affordability gate: `cash >= 2*price`, and the position's
    /// post-fill market_value/totalValue must not exceed
    /// `max_ratio_per_asset` — evaluated against the value the buy
    /// would actually produce, satisfying §8's testable property.
    fn is_affordable(&self, decision: &DecisionRecord, account: &dyn Account) -> bool {
        let price = decision.price;
        if price <= 0.0 || account.cash() < 2.0 * price {
            return false;
        }
        let total_value = account.total_value();
        if total_value <= 0.0 {
            return false;
        }
        let invest_budget = (total_value * self.cfg.one_time_invest_ratio).floor();
        let qty = (invest_budget / price).floor().min((account.cash() / price).floor()).max(0.0);
        if qty <= 0.0 {
            return false;
        }
        let proposed_cost = price * qty;
        let existing_market_value = account
            .positions()
            .get(&decision.symbol)
            .map(|p| p.market_value)
            .unwrap_or(0.0);
        let post_fill_value = existing_market_value + proposed_cost;
        let post_fill_total = total_value; // cash moves into market_value 1:1, total unaffected
        post_fill_value / post_fill_total <= self.cfg.max_ratio_per_asset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::LocalAccount;
    use crate::broker::SimBroker;
    use chrono::Utc;

    fn decision(symbol: &str, price: f64, buy: bool, sell: bool, trading_value: f64) -> DecisionRecord {
        let mut d = DecisionRecord::default();
        d.symbol = symbol.into();
        d.timestamp = Utc::now();
        d.price = price;
        d.buy = buy;
        d.sell = sell;
        d.trading_value = trading_value;
        d.stop_trailing = price * 0.99;
        d
    }

    fn cfg() -> AppConfig {
        let mut c = AppConfig::from_env().unwrap();
        c.max_buy_per_min = 2;
        c.one_time_invest_ratio = 0.05;
        c.max_ratio_per_asset = 0.10;
        c
    }

    #[tokio::test]
    async fn single_buy_settles_with_expected_qty_and_cash() {
        let cfg = cfg();
        let mgr = OrderManager::new(&cfg, false);
        let mut account = LocalAccount::new(100_000.0);
        let mut open_orders = OpenOrders::new();
        let broker = SimBroker;

        let decisions = vec![decision("AAA", 100.0, true, false, 1_000_000.0)];
        let executed = mgr.dispatch(&decisions, &mut account, &mut open_orders, &broker).await;

        assert_eq!(executed.len(), 1);
        assert_eq!(account.positions().get("AAA").unwrap().quantity, 50.0);
        assert_eq!(account.cash(), 95_000.0);
        assert_eq!(account.total_value(), 100_000.0);
    }

    #[tokio::test]
    async fn concentration_cap_refuses_over_allocated_symbol() {
        let cfg = cfg();
        let mgr = OrderManager::new(&cfg, false);
        let mut account = LocalAccount::new(9_000.0);
        account.add_position(crate::positions::NewAsset {
            symbol: "X".into(),
            time: Utc::now(),
            price: 100.0,
            qty: 10.0,
            cost: 1_000.0,
            stop_value: 90.0,
            stop_key: "bb1_lower".into(),
            stop_trailing: 99.0,
        });
        // total_value = 9000 cash + 1000 market_value = 10000
        let mut open_orders = OpenOrders::new();
        let broker = SimBroker;

        let decisions = vec![decision("X", 100.0, true, false, 1_000_000.0)];
        let executed = mgr.dispatch(&decisions, &mut account, &mut open_orders, &broker).await;
        assert_eq!(executed.len(), 0, "buy for already-concentrated X must be refused");
    }

    #[tokio::test]
    async fn sells_execute_before_buys() {
        let cfg = cfg();
        let mgr = OrderManager::new(&cfg, false);
        let mut account = LocalAccount::new(0.0);
        account.add_position(crate::positions::NewAsset {
            symbol: "A".into(),
            time: Utc::now(),
            price: 100.0,
            qty: 50.0,
            cost: 5_000.0,
            stop_value: 90.0,
            stop_key: String::new(),
            stop_trailing: 99.0,
        });
        let mut open_orders = OpenOrders::new();
        let broker = SimBroker;

        let decisions = vec![
            decision("A", 100.0, false, true, 100.0),
            decision("B", 50.0, true, false, 1_000_000.0),
        ];
        let executed = mgr.dispatch(&decisions, &mut account, &mut open_orders, &broker).await;
        assert!(executed.iter().any(|d| d.symbol == "A"));
        assert!(executed.iter().any(|d| d.symbol == "B"), "B's buy is funded by A's sell proceeds");
        assert!(account.positions().contains("B"));
    }
}
