//! Simulated venue - a bounded random walk per symbol with crossed-limit fills.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::error::{Error, Result};
use crate::core::traits::VenueAdapter;
use crate::core::types::{Order, OrderStatus, Side, Symbol};

/// Default walk step: ±0.2% per tick.
const DEFAULT_STEP_PCT: f64 = 0.002;

/// Price floor; the walk never reaches zero.
const PRICE_FLOOR: f64 = 0.0001;

/// Paper venue. Each symbol carries an independent price that wiggles on
/// every poll; a resting buy fills once the price is at or below its limit,
/// a resting sell once the price is at or above. Fills execute at the
/// order's own limit price, a simplification no real venue guarantees.
pub struct PaperVenue {
    prices: RwLock<HashMap<Symbol, f64>>,
    orders: RwLock<HashMap<String, Order>>,
    rng: Mutex<StdRng>,
    step_pct: f64,
}

impl PaperVenue {
    pub fn new(seed_prices: HashMap<Symbol, f64>) -> Self {
        Self {
            prices: RwLock::new(seed_prices),
            orders: RwLock::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            step_pct: DEFAULT_STEP_PCT,
        }
    }

    /// Override the walk amplitude. Zero freezes the price so tests can
    /// drive it explicitly through `set_price`.
    pub fn with_step_pct(mut self, step_pct: f64) -> Self {
        self.step_pct = step_pct;
        self
    }

    /// Deterministic walk for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Force the simulated price for a symbol.
    pub fn set_price(&self, symbol: &Symbol, price: f64) {
        self.prices.write().insert(symbol.clone(), price);
    }

    /// Advance the walk one tick and return the new price.
    fn tick(&self, symbol: &Symbol) -> Result<f64> {
        let mut prices = self.prices.write();
        let price = prices
            .get_mut(symbol)
            .ok_or_else(|| Error::Unavailable(format!("no simulated price for {symbol}")))?;
        if self.step_pct > 0.0 {
            let step = *price * self.rng.lock().gen_range(-self.step_pct..=self.step_pct);
            *price = (*price + step).max(PRICE_FLOOR);
        }
        Ok(*price)
    }

    fn place(&self, symbol: &Symbol, side: Side, price: f64, amount: f64) -> Result<Order> {
        if price <= 0.0 || amount <= 0.0 {
            return Err(Error::Rejected(format!(
                "bad params for {symbol}: price {price}, amount {amount}"
            )));
        }
        let order = Order::new_limit(self.name(), symbol.clone(), side, price, amount);
        self.orders.write().insert(order.id.clone(), order.clone());
        Ok(order)
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_price(&self, symbol: &Symbol) -> Result<f64> {
        self.tick(symbol)
    }

    async fn place_limit_buy(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order> {
        self.place(symbol, Side::Buy, price, amount)
    }

    async fn place_limit_sell(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order> {
        self.place(symbol, Side::Sell, price, amount)
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| o.symbol == *symbol && o.status == OrderStatus::Open)
            .cloned()
            .collect())
    }

    async fn poll_and_fill(&self, symbol: &Symbol) -> Result<Vec<Order>> {
        let price = self.tick(symbol)?;
        let mut orders = self.orders.write();
        let mut filled = Vec::new();
        for order in orders.values_mut() {
            if order.symbol != *symbol || order.status != OrderStatus::Open {
                continue;
            }
            let crossed = match order.side {
                Side::Buy => price <= order.price,
                Side::Sell => price >= order.price,
            };
            if crossed {
                order.status = OrderStatus::Closed;
                order.updated_at = Utc::now();
                filled.push(order.clone());
            }
        }
        Ok(filled)
    }
}
