/// broker.rs — the external brokerage boundary (§6 Broker) and its
/// simulated/live implementations.
///
/// Grounded in the `ExecutionEngine` async-trait shape used by the
/// `barter-strategy` crate's execution layer, adapted to the handful
/// of operations this engine actually needs: position/account
/// snapshots, market-order submission, and client-order-id lookups
/// for fill confirmation.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub cost_basis: f64,
    pub market_value: f64,
}

#[derive(Debug, Clone)]
pub struct BrokerAccount {
    pub cash: f64,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub symbol: String,
    pub filled_at: Option<DateTime<Utc>>,
}

/// The brokerage capability boundary. `Local` (simulated) and `Live`
/// implementations share this trait so OrderManager never branches on
/// mode directly.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_all_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn get_account(&self) -> Result<BrokerAccount>;
    async fn submit_market_order(&self, symbol: &str, qty: f64, side: OrderSide) -> Result<OrderAck>;
    async fn get_order_by_client_id(&self, id: &str) -> Result<OrderStatus>;
    async fn get_open_orders(&self, limit: usize) -> Result<Vec<OrderStatus>>;
    async fn cancel_orders(&self) -> Result<()>;
}

/// A no-op broker used in Local mode: the engine never calls out over
/// the network, and OrderManager settles fills immediately against
/// `Account`/`Positions` instead of going through this trait at all.
/// It exists so `Engine` can hold a `Box<dyn Broker>` uniformly, and
/// so tests can exercise the reconciliation path without real
/// network access.
pub struct SimBroker;

#[async_trait]
impl Broker for SimBroker {
    async fn get_all_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(Vec::new())
    }
    async fn get_account(&self) -> Result<BrokerAccount> {
        Ok(BrokerAccount { cash: 0.0 })
    }
    async fn submit_market_order(&self, _symbol: &str, _qty: f64, _side: OrderSide) -> Result<OrderAck> {
        Ok(OrderAck { client_order_id: String::new() })
    }
    async fn get_order_by_client_id(&self, _id: &str) -> Result<OrderStatus> {
        Ok(OrderStatus { symbol: String::new(), filled_at: Some(Utc::now()) })
    }
    async fn get_open_orders(&self, _limit: usize) -> Result<Vec<OrderStatus>> {
        Ok(Vec::new())
    }
    async fn cancel_orders(&self) -> Result<()> {
        Ok(())
    }
}

/// Alpaca REST trading client. Header-based API-key auth (`APCA-API-KEY-ID`
/// / `APCA-API-SECRET-KEY`), not HMAC query signing — Alpaca's trading
/// and market-data APIs use bearer-style headers, unlike the Binance
/// signing scheme in the teacher crate's `live.rs`, which this module
/// replaces rather than ports.
pub struct AlpacaBroker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaPositionResponse {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    current_price: String,
    cost_basis: String,
    market_value: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccountResponse {
    cash: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrderResponse {
    client_order_id: String,
    symbol: String,
    filled_at: Option<DateTime<Utc>>,
}

impl AlpacaBroker {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            api_secret,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }
}

fn parse_f64(s: &str, field: &str) -> Result<f64> {
    s.parse::<f64>()
        .with_context(|| format!("parsing broker field {field}: {s}"))
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn get_all_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/v2/positions", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("GET /v2/positions")?;
        if !resp.status().is_success() {
            anyhow::bail!("get_all_positions failed: {}", resp.status());
        }
        let raw: Vec<AlpacaPositionResponse> = resp.json().await.context("decoding positions")?;
        raw.into_iter()
            .map(|p| {
                Ok(BrokerPosition {
                    qty: parse_f64(&p.qty, "qty")?,
                    avg_entry_price: parse_f64(&p.avg_entry_price, "avg_entry_price")?,
                    current_price: parse_f64(&p.current_price, "current_price")?,
                    cost_basis: parse_f64(&p.cost_basis, "cost_basis")?,
                    market_value: parse_f64(&p.market_value, "market_value")?,
                    symbol: p.symbol,
                })
            })
            .collect()
    }

    async fn get_account(&self) -> Result<BrokerAccount> {
        let url = format!("{}/v2/account", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("GET /v2/account")?;
        if !resp.status().is_success() {
            anyhow::bail!("get_account failed: {}", resp.status());
        }
        let raw: AlpacaAccountResponse = resp.json().await.context("decoding account")?;
        Ok(BrokerAccount { cash: parse_f64(&raw.cash, "cash")? })
    }

    async fn submit_market_order(&self, symbol: &str, qty: f64, side: OrderSide) -> Result<OrderAck> {
        let url = format!("{}/v2/orders", self.base_url);
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": qty,
            "side": if side == OrderSide::Buy { "buy" } else { "sell" },
            "type": "market",
            "time_in_force": "day",
        });
        let resp = self
            .authed(self.client.post(&url).json(&body))
            .send()
            .await
            .with_context(|| format!("submitting market order for {symbol}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("submit_market_order failed for {symbol}: {}", resp.status());
        }
        let raw: AlpacaOrderResponse = resp.json().await.context("decoding order ack")?;
        debug!(symbol, client_order_id = %raw.client_order_id, "order submitted");
        Ok(OrderAck { client_order_id: raw.client_order_id })
    }

    async fn get_order_by_client_id(&self, id: &str) -> Result<OrderStatus> {
        let url = format!("{}/v2/orders:by_client_order_id?client_order_id={}", self.base_url, id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("fetching order {id}"))?;
        if !resp.status().is_success() {
            warn!(id, status = %resp.status(), "get_order_by_client_id failed");
            anyhow::bail!("get_order_by_client_id failed: {}", resp.status());
        }
        let raw: AlpacaOrderResponse = resp.json().await.context("decoding order status")?;
        Ok(OrderStatus { symbol: raw.symbol, filled_at: raw.filled_at })
    }

    async fn get_open_orders(&self, limit: usize) -> Result<Vec<OrderStatus>> {
        let url = format!("{}/v2/orders?status=open&limit={}", self.base_url, limit);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("GET /v2/orders")?;
        if !resp.status().is_success() {
            anyhow::bail!("get_open_orders failed: {}", resp.status());
        }
        let raw: Vec<AlpacaOrderResponse> = resp.json().await.context("decoding open orders")?;
        Ok(raw
            .into_iter()
            .map(|o| OrderStatus { symbol: o.symbol, filled_at: o.filled_at })
            .collect())
    }

    async fn cancel_orders(&self) -> Result<()> {
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .authed(self.client.delete(&url))
            .send()
            .await
            .context("DELETE /v2/orders")?;
        if !resp.status().is_success() {
            anyhow::bail!("cancel_orders failed: {}", resp.status());
        }
        Ok(())
    }
}

/// Live-mode open-order tracking: symbol -> broker client_order_id,
/// with entries removed once the broker reports a non-null
/// `filled_at` (§3 OpenOrders, grounded in original_source's
/// `OrderList.update`).
#[derive(Debug, Default)]
pub struct OpenOrders {
    orders: std::collections::HashMap<String, String>,
}

impl OpenOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, client_order_id: String) {
        self.orders.insert(symbol.to_string(), client_order_id);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.orders.contains_key(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Polls the broker for every tracked order and drops those whose
    /// `filled_at` is now set.
    pub async fn reconcile(&mut self, broker: &dyn Broker) -> Result<()> {
        let mut filled = Vec::new();
        for (symbol, client_id) in self.orders.iter() {
            match broker.get_order_by_client_id(client_id).await {
                Ok(status) => {
                    debug_assert_eq!(&status.symbol, symbol);
                    if status.filled_at.is_some() {
                        filled.push(symbol.clone());
                    }
                }
                Err(e) => warn!(symbol, error = %e, "order status lookup failed"),
            }
        }
        for symbol in filled {
            self.orders.remove(&symbol);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_orders_tracks_and_removes() {
        let mut oo = OpenOrders::new();
        oo.insert("AAA", "abc-123".into());
        assert!(oo.contains("AAA"));
        oo.orders.remove("AAA");
        assert!(!oo.contains("AAA"));
    }

    #[tokio::test]
    async fn sim_broker_round_trips_no_op() {
        let broker = SimBroker;
        assert!(broker.get_all_positions().await.unwrap().is_empty());
        let ack = broker.submit_market_order("AAA", 1.0, OrderSide::Buy).await.unwrap();
        assert!(ack.client_order_id.is_empty());
    }
}
