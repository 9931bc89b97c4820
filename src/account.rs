/// account.rs — cash + positions, simulated or broker-backed (§4.G
/// Account).
use crate::broker::Broker;
use crate::positions::{NewAsset, Position, Positions};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Local (simulated) and Live (broker-backed) accounts share this
/// trait so OrderManager/TradingLoop never branch on mode directly,
/// per §9's capability-interface design note.
#[async_trait::async_trait]
pub trait Account: Send + Sync {
    fn cash(&self) -> f64;
    fn positions(&self) -> &Positions;
    fn total_value(&self) -> f64;
    fn add_position(&mut self, asset: NewAsset);
    fn remove_position(&mut self, symbol: &str) -> Option<Position>;
    /// Marks a held position to the latest observed price (§3
    /// Position's "last-observed price" field). Live accounts no-op
    /// here since the broker is authoritative on the next `update()`.
    fn mark_price(&mut self, symbol: &str, price: f64);
    /// Ratchets a held position's stop_value/stop_key/stop_trailing
    /// to the given candidates (§4.E trailing update / keep-profit
    /// upgrade), without lowering either stop. Live accounts stage the
    /// candidates in a side table until the position is confirmed by
    /// the broker.
    fn record_trailing(&mut self, symbol: &str, stop_value: f64, stop_key: &str, stop_trailing: f64);
    /// Applies a cash delta (local) or re-reads cash/positions from
    /// the broker (live). `change` is ignored in live mode.
    async fn update(&mut self, change: f64) -> Result<()>;
}

#[derive(Debug)]
pub struct LocalAccount {
    cash: f64,
    positions: Positions,
}

impl LocalAccount {
    pub fn new(initial_cash: f64) -> Self {
        Self { cash: initial_cash, positions: Positions::new() }
    }
}

#[async_trait::async_trait]
impl Account for LocalAccount {
    fn cash(&self) -> f64 {
        self.cash
    }

    fn positions(&self) -> &Positions {
        &self.positions
    }

    fn total_value(&self) -> f64 {
        self.cash + self.positions.value
    }

    fn add_position(&mut self, asset: NewAsset) {
        self.positions.add(asset);
    }

    fn remove_position(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    fn mark_price(&mut self, symbol: &str, price: f64) {
        self.positions.update_price(symbol, price);
    }

    fn record_trailing(&mut self, symbol: &str, stop_value: f64, stop_key: &str, stop_trailing: f64) {
        self.positions.record_trailing(symbol, stop_value, stop_key, stop_trailing);
    }

    async fn update(&mut self, change: f64) -> Result<()> {
        self.cash += change;
        if self.cash < 0.0 {
            return Err(crate::error::EngineError::Invariant(format!(
                "local cash went negative ({})",
                self.cash
            ))
            .into());
        }
        Ok(())
    }
}

pub struct LiveAccount {
    cash: f64,
    positions: Positions,
    broker: Arc<dyn Broker>,
    /// side-table of stop_* carried forward across broker
    /// reconciliation, keyed by symbol (the original's `assets_info`).
    side_info: HashMap<String, (f64, String, f64)>,
    trail: f64,
}

impl LiveAccount {
    pub fn new(broker: Arc<dyn Broker>, trail: f64) -> Self {
        Self {
            cash: 0.0,
            positions: Positions::new(),
            broker,
            side_info: HashMap::new(),
            trail,
        }
    }

    /// Records stop_* for a symbol ahead of broker confirmation so
    /// reconciliation has something to carry forward once the
    /// position actually shows up in the broker's report. This does
    /// NOT mutate `positions` — per §9's Open Question resolution,
    /// position state changes only on confirmed fills.
    pub fn record_pending_stop(&mut self, symbol: &str, stop_value: f64, stop_key: String, stop_trailing: f64) {
        self.side_info.insert(symbol.to_string(), (stop_value, stop_key, stop_trailing));
    }
}

#[async_trait::async_trait]
impl Account for LiveAccount {
    fn cash(&self) -> f64 {
        self.cash
    }

    fn positions(&self) -> &Positions {
        &self.positions
    }

    fn total_value(&self) -> f64 {
        self.cash + self.positions.value
    }

    fn add_position(&mut self, _asset: NewAsset) {
        // Intentionally not implemented: live-mode position mutation
        // happens exclusively through `update`'s broker reconciliation.
        // Callers record pending stop info via `record_pending_stop`.
    }

    fn remove_position(&mut self, _symbol: &str) -> Option<Position> {
        None
    }

    fn mark_price(&mut self, _symbol: &str, _price: f64) {
        // Broker-reported current_price is authoritative; refreshed on
        // the next `update()` reconciliation.
    }

    fn record_trailing(&mut self, symbol: &str, stop_value: f64, stop_key: &str, stop_trailing: f64) {
        let (existing_value, existing_key, existing_trailing) = self
            .side_info
            .get(symbol)
            .cloned()
            .or_else(|| {
                self.positions
                    .get(symbol)
                    .map(|p| (p.stop_value, p.stop_key.clone(), p.stop_trailing))
            })
            .unwrap_or((0.0, String::new(), 0.0));
        let (value, key) = if stop_value > existing_value {
            (stop_value, stop_key.to_string())
        } else {
            (existing_value, existing_key)
        };
        let trailing = existing_trailing.max(stop_trailing);
        self.side_info.insert(symbol.to_string(), (value, key, trailing));
    }

    async fn update(&mut self, _change: f64) -> Result<()> {
        let reported = self.broker.get_all_positions().await?;
        let now = chrono::Utc::now();
        self.positions.reconcile_from_broker(&reported, &self.side_info, self.trail, now);
        self.side_info.retain(|symbol, _| self.positions.contains(symbol));
        let account = self.broker.get_account().await?;
        self.cash = account.cash;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_account_update_adds_signed_delta() {
        let mut acc = LocalAccount::new(1000.0);
        acc.update(-200.0).await.unwrap();
        assert_eq!(acc.cash(), 800.0);
        assert_eq!(acc.total_value(), 800.0);
    }

    #[tokio::test]
    async fn local_account_rejects_negative_cash() {
        let mut acc = LocalAccount::new(100.0);
        assert!(acc.update(-200.0).await.is_err());
    }
}
