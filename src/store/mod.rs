//! SQLite persistence - orders, fills, positions, and the event log.
//!
//! Every operation commits before returning; a fill or status transition
//! acknowledged to the caller survives a crash. The pool is capped at a
//! single connection so concurrent callers serialize at the store boundary.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::core::error::Result;
use crate::core::types::{EventLevel, Fill, Order, OrderStatus, Position, Side, Symbol};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders(
        id TEXT PRIMARY KEY,
        venue TEXT,
        venue_symbol TEXT,
        side TEXT,
        price REAL,
        amount REAL,
        status TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS fills(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id TEXT,
        venue_symbol TEXT,
        side TEXT,
        price REAL,
        amount REAL,
        fee REAL,
        ts TEXT
    )",
    "CREATE TABLE IF NOT EXISTS positions(
        venue_symbol TEXT PRIMARY KEY,
        amount REAL NOT NULL DEFAULT 0,
        avg_cost REAL
    )",
    "CREATE TABLE IF NOT EXISTS events(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT,
        level TEXT,
        message TEXT
    )",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the durable store at `path`, WAL mode.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store. Used by tests; state dies with the pool.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Upsert an order by id.
    pub async fn record_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO orders
                (id, venue, venue_symbol, side, price, amount, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.id)
        .bind(&order.venue)
        .bind(order.symbol.as_str())
        .bind(order.side.as_str())
        .bind(order.price)
        .bind(order.amount)
        .bind(order.status.as_str())
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Orders still resting according to the store. Same SELECT shape the
    /// reconciliation path uses; handy for operator inspection.
    pub async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT id, venue, venue_symbol, side, price, amount, status, created_at, updated_at
             FROM orders WHERE venue_symbol = ? AND status = 'open'",
        )
        .bind(symbol.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Append one fill row. The caller guards against double-recording with
    /// `has_fill_for_order`.
    pub async fn record_fill(&self, fill: &Fill) -> Result<()> {
        sqlx::query(
            "INSERT INTO fills (order_id, venue_symbol, side, price, amount, fee, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&fill.order_id)
        .bind(fill.symbol.as_str())
        .bind(fill.side.as_str())
        .bind(fill.price)
        .bind(fill.amount)
        .bind(fill.fee)
        .bind(fill.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// True when a fill has already been recorded against this order id.
    pub async fn has_fill_for_order(&self, order_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM fills WHERE order_id = ? LIMIT 1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Apply a buy fill: amount grows and the cost basis becomes the weighted
    /// average of the old basis and the new lot.
    pub async fn apply_buy_fill(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT amount, avg_cost FROM positions WHERE venue_symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let (prev_amt, prev_cost) = match &row {
            Some(r) => (r.try_get::<f64, _>(0)?, r.try_get::<Option<f64>, _>(1)?),
            None => (0.0, None),
        };
        let new_amt = prev_amt + amount;
        let new_cost = match prev_cost {
            Some(cost) if prev_amt > 0.0 => (prev_amt * cost + amount * price) / new_amt,
            _ => price,
        };
        sqlx::query("INSERT OR REPLACE INTO positions (venue_symbol, amount, avg_cost) VALUES (?, ?, ?)")
            .bind(symbol.as_str())
            .bind(new_amt)
            .bind(new_cost)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply a sell fill: amount shrinks, never below zero, and the cost
    /// basis clears once the position is flat. Returns the amount clamped
    /// away, which is zero unless the venue reported a sell larger than the
    /// tracked position.
    pub async fn apply_sell_fill(&self, symbol: &Symbol, _price: f64, amount: f64) -> Result<f64> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT amount, avg_cost FROM positions WHERE venue_symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let (prev_amt, prev_cost) = match &row {
            Some(r) => (r.try_get::<f64, _>(0)?, r.try_get::<Option<f64>, _>(1)?),
            None => (0.0, None),
        };
        let excess = (amount - prev_amt).max(0.0);
        let new_amt = (prev_amt - amount).max(0.0);
        let new_cost = if new_amt > 0.0 { prev_cost } else { None };
        sqlx::query("INSERT OR REPLACE INTO positions (venue_symbol, amount, avg_cost) VALUES (?, ?, ?)")
            .bind(symbol.as_str())
            .bind(new_amt)
            .bind(new_cost)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(excess)
    }

    pub async fn position(&self, symbol: &Symbol) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT amount, avg_cost FROM positions WHERE venue_symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(Position {
                symbol: symbol.clone(),
                amount: r.try_get(0)?,
                avg_cost: r.try_get(1)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn append_event(&self, level: EventLevel, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO events (ts, level, message) VALUES (?, ?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(level.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT level, message FROM events WHERE ts >= ? ORDER BY id")
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get(0)?, r.try_get(1)?)))
            .collect()
    }

    /// Cash-flow PnL over the trailing window: sell proceeds minus buy
    /// outlays across all fills with ts inside the window. Not matched-lot
    /// accounting and not inventory-aware; a watchdog and status signal only.
    pub async fn realized_pnl_since(&self, hours: i64) -> Result<f64> {
        let since = Utc::now() - Duration::hours(hours);
        let pnl: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(CASE WHEN side = 'sell' THEN price * amount ELSE -price * amount END)
             FROM fills WHERE ts >= ?",
        )
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(pnl.unwrap_or(0.0))
    }
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Order {
        id: row.try_get("id")?,
        venue: row.try_get("venue")?,
        symbol: Symbol::new(row.try_get::<String, _>("venue_symbol")?),
        side: Side::from_str(&side)?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
        status: OrderStatus::from_str(&status)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::core::error::Error::InvalidState(format!("bad timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> Symbol {
        Symbol::new("ETH-USD")
    }

    fn fill(order_id: &str, side: Side, price: f64, amount: f64, ts: DateTime<Utc>) -> Fill {
        Fill {
            order_id: order_id.to_string(),
            symbol: sym(),
            side,
            price,
            amount,
            fee: 0.0,
            ts,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn buy_fill_computes_weighted_average_cost() {
        let store = Store::open_in_memory().await.unwrap();

        store.apply_buy_fill(&sym(), 100.0, 2.0).await.unwrap();
        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 2.0));
        assert!(close(pos.avg_cost.unwrap(), 100.0));

        // (2*100 + 2*110) / 4 = 105
        store.apply_buy_fill(&sym(), 110.0, 2.0).await.unwrap();
        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 4.0));
        assert!(close(pos.avg_cost.unwrap(), 105.0));
    }

    #[tokio::test]
    async fn selling_flat_clears_cost_basis() {
        let store = Store::open_in_memory().await.unwrap();
        store.apply_buy_fill(&sym(), 1990.0, 1.0).await.unwrap();

        let excess = store.apply_sell_fill(&sym(), 2010.0, 1.0).await.unwrap();
        assert!(close(excess, 0.0));

        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 0.0));
        assert!(pos.avg_cost.is_none());
    }

    #[tokio::test]
    async fn partial_sell_keeps_cost_basis() {
        let store = Store::open_in_memory().await.unwrap();
        store.apply_buy_fill(&sym(), 100.0, 4.0).await.unwrap();

        store.apply_sell_fill(&sym(), 120.0, 1.0).await.unwrap();
        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 3.0));
        assert!(close(pos.avg_cost.unwrap(), 100.0));
    }

    #[tokio::test]
    async fn oversell_clamps_to_zero_and_reports_excess() {
        let store = Store::open_in_memory().await.unwrap();
        store.apply_buy_fill(&sym(), 100.0, 1.0).await.unwrap();

        let excess = store.apply_sell_fill(&sym(), 100.0, 2.5).await.unwrap();
        assert!(close(excess, 1.5));

        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 0.0));
        assert!(pos.avg_cost.is_none());

        // Selling against a symbol with no position row at all.
        let other = Symbol::new("BTC-USD");
        let excess = store.apply_sell_fill(&other, 100.0, 1.0).await.unwrap();
        assert!(close(excess, 1.0));
        let pos = store.position(&other).await.unwrap().unwrap();
        assert!(close(pos.amount, 0.0));
    }

    #[tokio::test]
    async fn pnl_window_is_sells_minus_buys() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();

        store.record_fill(&fill("a", Side::Buy, 1990.0, 1.0, now)).await.unwrap();
        store.record_fill(&fill("b", Side::Sell, 2010.0, 1.0, now)).await.unwrap();
        // Outside the 24h window; must not count.
        store
            .record_fill(&fill("c", Side::Sell, 5000.0, 1.0, now - Duration::hours(48)))
            .await
            .unwrap();

        let pnl = store.realized_pnl_since(24).await.unwrap();
        assert!(close(pnl, 20.0));
    }

    #[tokio::test]
    async fn pnl_is_zero_with_no_fills() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(close(store.realized_pnl_since(24).await.unwrap(), 0.0));
    }

    #[tokio::test]
    async fn order_upsert_and_status_transition() {
        let store = Store::open_in_memory().await.unwrap();
        let order = Order::new_limit("paper", sym(), Side::Buy, 1990.0, 1.0);

        store.record_order(&order).await.unwrap();
        let open = store.open_orders(&sym()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, order.id);
        assert_eq!(open[0].side, Side::Buy);

        store.update_order_status(&order.id, OrderStatus::Closed).await.unwrap();
        assert!(store.open_orders(&sym()).await.unwrap().is_empty());

        // Upsert by id never duplicates.
        store.record_order(&order).await.unwrap();
        assert_eq!(store.open_orders(&sym()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fill_dedup_probe() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .record_fill(&fill("abc", Side::Buy, 1990.0, 1.0, Utc::now()))
            .await
            .unwrap();
        assert!(store.has_fill_for_order("abc").await.unwrap());
        assert!(!store.has_fill_for_order("xyz").await.unwrap());
    }

    #[tokio::test]
    async fn events_are_appended_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let since = Utc::now() - Duration::hours(1);
        store.append_event(EventLevel::Info, "first").await.unwrap();
        store.append_event(EventLevel::Error, "second").await.unwrap();

        let events = store.events_since(since).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ("INFO".to_string(), "first".to_string()));
        assert_eq!(events[1], ("ERROR".to_string(), "second".to_string()));
    }
}
