/// positions.rs — in-memory position ledger with ratcheting stop
/// fields (§3 Position, §4.F Positions).
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One currently-held symbol.
///
/// Invariants: `quantity > 0`; `avg_price == cost_basis / quantity`;
/// `stop_value` and `stop_trailing` are monotonically non-decreasing
/// for the life of the position (never ratchet down).
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub first_acquired: DateTime<Utc>,
    pub price: f64,
    pub avg_price: f64,
    pub quantity: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub stop_value: f64,
    pub stop_key: String,
    pub stop_trailing: f64,
}

/// Inputs for opening or adding to a position, mirroring the fields
/// BuyerLocal/BuyerLive assemble from a DecisionRecord at buy time.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub qty: f64,
    pub cost: f64,
    pub stop_value: f64,
    pub stop_key: String,
    pub stop_trailing: f64,
}

#[derive(Debug, Default)]
pub struct Positions {
    assets: HashMap<String, Position>,
    /// Aggregate market value, maintained incrementally by `add`,
    /// `remove`, and `update_price` rather than recomputed each call.
    pub value: f64,
}

impl Positions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.assets.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.assets.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.assets.iter()
    }

    /// §4.F `add`: insert if absent; otherwise update qty/cost, fold
    /// avg_price, and fold stop_* by maximum (ratchet, never down).
    pub fn add(&mut self, new_asset: NewAsset) {
        self.value += new_asset.cost;
        match self.assets.get_mut(&new_asset.symbol) {
            Some(pos) => {
                pos.price = new_asset.price;
                pos.quantity += new_asset.qty;
                pos.market_value = new_asset.price * pos.quantity;
                pos.cost_basis += new_asset.cost;
                pos.avg_price = pos.cost_basis / pos.quantity;
                pos.stop_value = pos.stop_value.max(new_asset.stop_value);
                pos.stop_key = new_asset.stop_key;
                pos.stop_trailing = pos.stop_trailing.max(new_asset.stop_trailing);
            }
            None => {
                let avg_price = new_asset.cost / new_asset.qty;
                self.assets.insert(
                    new_asset.symbol.clone(),
                    Position {
                        symbol: new_asset.symbol,
                        first_acquired: new_asset.time,
                        price: new_asset.price,
                        avg_price,
                        quantity: new_asset.qty,
                        market_value: new_asset.cost,
                        cost_basis: new_asset.cost,
                        stop_value: new_asset.stop_value,
                        stop_key: new_asset.stop_key,
                        stop_trailing: new_asset.stop_trailing,
                    },
                );
            }
        }
    }

    /// §4.F `remove`: delete and decrement the aggregate by the
    /// removed market_value.
    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        if let Some(pos) = self.assets.remove(symbol) {
            self.value -= pos.market_value;
            Some(pos)
        } else {
            None
        }
    }

    /// §4.F `updatePrice`: recompute market_value and adjust the
    /// aggregate by the delta; reset to 0 when no positions remain.
    pub fn update_price(&mut self, symbol: &str, price: f64) {
        if let Some(pos) = self.assets.get_mut(symbol) {
            let prev = pos.market_value;
            pos.price = price;
            pos.market_value = price * pos.quantity;
            self.value = self.value + pos.market_value - prev;
        }
        if self.assets.is_empty() {
            self.value = 0.0;
        }
    }

    /// Ratchets `symbol`'s stop_value/stop_key/stop_trailing to the
    /// given candidates, never lowering either stop per §3's
    /// invariant. No-op if the symbol is not currently held.
    pub fn record_trailing(&mut self, symbol: &str, stop_value: f64, stop_key: &str, stop_trailing: f64) {
        if let Some(pos) = self.assets.get_mut(symbol) {
            if stop_value > pos.stop_value {
                pos.stop_value = stop_value;
                pos.stop_key = stop_key.to_string();
            }
            pos.stop_trailing = pos.stop_trailing.max(stop_trailing);
        }
    }

    /// Live-mode reconciliation: overwrite fields from the broker's
    /// reported position, carrying stop_* forward from `side_info`
    /// (assets_info) keyed by symbol; admit brand-new positions with
    /// trailing = price*(1-trail) and empty stop_key when no side-info
    /// exists; drop anything the broker no longer reports.
    pub fn reconcile_from_broker(
        &mut self,
        reported: &[crate::broker::BrokerPosition],
        side_info: &HashMap<String, (f64, String, f64)>,
        trail: f64,
        now: DateTime<Utc>,
    ) {
        let mut value = 0.0;
        let reported_symbols: Vec<&str> = reported.iter().map(|p| p.symbol.as_str()).collect();

        for rp in reported {
            value += rp.market_value;
            let (stop_value, stop_key, stop_trailing) = match side_info.get(&rp.symbol) {
                Some((sv, sk, st)) => (*sv, sk.clone(), *st),
                None => (0.0, String::new(), rp.current_price * (1.0 - trail)),
            };
            match self.assets.get_mut(&rp.symbol) {
                Some(pos) => {
                    pos.price = rp.current_price;
                    pos.avg_price = rp.avg_entry_price;
                    pos.quantity = rp.qty;
                    pos.market_value = rp.market_value;
                    pos.cost_basis = rp.cost_basis;
                    pos.stop_value = stop_value;
                    pos.stop_key = stop_key;
                    pos.stop_trailing = stop_trailing;
                }
                None => {
                    self.assets.insert(
                        rp.symbol.clone(),
                        Position {
                            symbol: rp.symbol.clone(),
                            first_acquired: now,
                            price: rp.current_price,
                            avg_price: rp.avg_entry_price,
                            quantity: rp.qty,
                            market_value: rp.market_value,
                            cost_basis: rp.cost_basis,
                            stop_value,
                            stop_key,
                            stop_trailing,
                        },
                    );
                }
            }
        }

        self.assets
            .retain(|symbol, _| reported_symbols.contains(&symbol.as_str()));
        self.value = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn asset(symbol: &str, price: f64, qty: f64, cost: f64) -> NewAsset {
        NewAsset {
            symbol: symbol.into(),
            time: Utc::now(),
            price,
            qty,
            cost,
            stop_value: 90.0,
            stop_key: "bb1_lower".into(),
            stop_trailing: price * 0.99,
        }
    }

    #[test]
    fn add_opens_new_position() {
        let mut p = Positions::new();
        p.add(asset("AAA", 100.0, 50.0, 5000.0));
        let pos = p.get("AAA").unwrap();
        assert_eq!(pos.quantity, 50.0);
        assert_eq!(pos.avg_price, 100.0);
        assert_eq!(p.value, 5000.0);
    }

    #[test]
    fn add_to_existing_folds_avg_price_and_ratchets_stops() {
        let mut p = Positions::new();
        p.add(asset("AAA", 100.0, 50.0, 5000.0));
        let mut second = asset("AAA", 110.0, 10.0, 1100.0);
        second.stop_value = 80.0; // lower than existing 90 — must not ratchet down
        second.stop_trailing = 50.0;
        p.add(second);
        let pos = p.get("AAA").unwrap();
        assert_eq!(pos.quantity, 60.0);
        assert!((pos.avg_price - (6100.0 / 60.0)).abs() < 1e-9);
        assert_eq!(pos.stop_value, 90.0);
        assert_eq!(pos.stop_trailing, 99.0);
    }

    #[test]
    fn remove_decrements_aggregate_value() {
        let mut p = Positions::new();
        p.add(asset("AAA", 100.0, 50.0, 5000.0));
        p.remove("AAA");
        assert_eq!(p.value, 0.0);
        assert!(!p.contains("AAA"));
    }

    #[test]
    fn update_price_adjusts_aggregate_by_delta() {
        let mut p = Positions::new();
        p.add(asset("AAA", 100.0, 50.0, 5000.0));
        p.update_price("AAA", 110.0);
        assert_eq!(p.get("AAA").unwrap().market_value, 5500.0);
        assert_eq!(p.value, 5500.0);
    }

    #[test]
    fn record_trailing_never_ratchets_down() {
        let mut p = Positions::new();
        p.add(asset("AAA", 100.0, 50.0, 5000.0)); // stop_value=90, stop_trailing=99
        p.record_trailing("AAA", 85.0, "bb2_lower", 97.0);
        let pos = p.get("AAA").unwrap();
        assert_eq!(pos.stop_value, 90.0, "lower candidate must not overwrite existing stop");
        assert_eq!(pos.stop_trailing, 99.0, "lower candidate must not overwrite existing trailing");

        p.record_trailing("AAA", 95.0, "sma_below_close", 108.9);
        let pos = p.get("AAA").unwrap();
        assert_eq!(pos.stop_value, 95.0);
        assert_eq!(pos.stop_key, "sma_below_close");
        assert_eq!(pos.stop_trailing, 108.9);
    }
}
