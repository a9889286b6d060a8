//! Core types - orders, fills, positions, events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::Error;

/// Tradeable symbol in internal notation (e.g., "ETH-USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::InvalidState(format!("unknown side: {other}"))),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order status. Orders are never deleted; they only transition status and
/// remain as the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Stale,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Stale => "stale",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "closed" => Ok(OrderStatus::Closed),
            "canceled" => Ok(OrderStatus::Canceled),
            "stale" => Ok(OrderStatus::Stale),
            other => Err(Error::InvalidState(format!("unknown order status: {other}"))),
        }
    }
}

/// Event severity for the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// A resting limit order. Exactly one order per (symbol, side) may be `Open`
/// at a time under correct operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub venue: String,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Fresh open limit order with a locally assigned id.
    pub fn new_limit(venue: impl Into<String>, symbol: Symbol, side: Side, price: f64, amount: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            venue: venue.into(),
            symbol,
            side,
            price,
            amount,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable record of a completed trade. Append-only; recorded exactly once
/// per underlying venue execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub ts: DateTime<Utc>,
}

impl Fill {
    /// Fill derived from a filled order; execution price is the order's own
    /// limit price.
    pub fn from_order(order: &Order, fee: f64) -> Self {
        Self {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: order.price,
            amount: order.amount,
            fee,
            ts: Utc::now(),
        }
    }
}

/// Per-symbol running position. `amount` never goes negative; `avg_cost` is
/// `None` exactly when `amount` is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub amount: f64,
    pub avg_cost: Option<f64>,
}
