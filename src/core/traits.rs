//! Core traits - the seams between the loop and the outside world.

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::types::{Order, Symbol};

/// Venue capability set. The concrete backend (simulated or live) is chosen
/// once at startup from the configured mode; the loop only ever sees this
/// trait.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Venue name as recorded on orders (e.g., "paper", "robinhood").
    fn name(&self) -> &str;

    /// Current reference price. `Err(Unavailable)` when the venue cannot quote.
    async fn fetch_price(&self, symbol: &Symbol) -> Result<f64>;

    /// Submit a resting limit buy; returns the order in `Open` status with a
    /// freshly assigned id.
    async fn place_limit_buy(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order>;

    /// Submit a resting limit sell; same contract as `place_limit_buy`.
    async fn place_limit_sell(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order>;

    /// Open orders for the pair. The venue is the source of truth.
    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>>;

    /// Reconcile local open orders against venue state and return the subset
    /// that transitioned to filled since the previous call. Each filled order
    /// appears in exactly one result over the adapter's lifetime.
    async fn poll_and_fill(&self, symbol: &Symbol) -> Result<Vec<Order>>;
}

/// Outbound alert channel. Delivery failures are logged by the caller and
/// never crash the loop.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}
