//! Orchestration loop - the per-cycle state machine for every pair.
//!
//! Per leg: no-order -> open -> closed(filled) -> re-arm opposite side.
//! Canceled and stale orders are terminal and require operator intervention.
//! The loop restores the core invariant every cycle: at most one open order
//! per (symbol, side), and in steady state exactly one of buy/sell resting.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use tracing::{error, info, warn};

use crate::core::config::{Config, StrategyConfig};
use crate::core::error::Result;
use crate::core::traits::{AlertChannel, VenueAdapter};
use crate::core::types::{EventLevel, Fill, Order, OrderStatus, Side, Symbol};
use crate::risk::{self, Signals};
use crate::store::Store;

/// The orchestration context: one venue, one store, one alert channel, built
/// once at startup and threaded through every cycle. No ambient handles.
pub struct Engine {
    config: Config,
    store: Store,
    venue: Arc<dyn VenueAdapter>,
    alerts: Arc<dyn AlertChannel>,
    last_status_day: Option<NaiveDate>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Store,
        venue: Arc<dyn VenueAdapter>,
        alerts: Arc<dyn AlertChannel>,
    ) -> Self {
        Self {
            config,
            store,
            venue,
            alerts,
            last_status_day: None,
        }
    }

    /// Poll until process termination. There is no in-band pause or resume.
    pub async fn run(mut self) {
        let interval = std::time::Duration::from_secs(self.config.poll_seconds);
        loop {
            self.run_cycle(Local::now()).await;
            tokio::time::sleep(interval).await;
        }
    }

    /// One full pass: the daily status report, then every configured pair.
    /// A failing pair never aborts the others.
    pub async fn run_cycle(&mut self, now: DateTime<Local>) {
        self.maybe_daily_status(now).await;

        let pairs = self.config.strategies.clone();
        for pair in &pairs {
            if let Err(e) = self.process_pair(pair, now).await {
                self.log_event(
                    EventLevel::Error,
                    format!("{}: cycle failed: {e}", pair.venue_symbol),
                )
                .await;
            }
        }
    }

    async fn process_pair(&mut self, pair: &StrategyConfig, now: DateTime<Local>) -> Result<()> {
        let symbol = Symbol::new(&pair.venue_symbol);

        // Expired pairs are skipped wholesale; resting orders are left
        // standing, not canceled.
        if let Some(good_til) = pair.good_til {
            if now.with_timezone(&Utc) > good_til {
                return Ok(());
            }
        }

        // 1) Fill detection and accounting, then re-arming the opposite leg.
        let filled = self.venue.poll_and_fill(&symbol).await?;
        for order in &filled {
            if self.settle_fill(&symbol, order).await {
                self.rearm(pair, &symbol, order.side).await;
            }
        }

        // 2) Gap fill: cold start, or a re-arm that failed in an earlier
        // cycle. The starting leg is always a buy.
        let open = self.venue.fetch_open_orders(&symbol).await?;
        if open.is_empty() {
            match self.venue.place_limit_buy(&symbol, pair.buy_price, pair.amount).await {
                Ok(order) => {
                    self.store.record_order(&order).await?;
                    self.log_event(
                        EventLevel::Info,
                        format!("Init BUY {symbol} @ {}", pair.buy_price),
                    )
                    .await;
                }
                Err(e) => {
                    self.log_event(EventLevel::Error, format!("Init BUY failed {symbol}: {e}"))
                        .await;
                }
            }
        }

        // 3) Watchdog.
        self.watchdog_check(pair, &symbol).await;

        Ok(())
    }

    /// Record one detected fill: dedup guard, fill row, position accounting,
    /// order closed, one INFO event. Returns false when the fill was already
    /// on file and must not be applied again.
    async fn settle_fill(&mut self, symbol: &Symbol, order: &Order) -> bool {
        match self.store.has_fill_for_order(&order.id).await {
            Ok(true) => {
                // Already recorded; a crash between recording and closing the
                // order can make a restarted adapter re-report it.
                self.log_event(
                    EventLevel::Warn,
                    format!("Duplicate fill report for order {} ignored", order.id),
                )
                .await;
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                self.log_event(
                    EventLevel::Error,
                    format!("Fill dedup probe failed for order {}: {e}", order.id),
                )
                .await;
                return false;
            }
        }

        let fill = Fill::from_order(order, 0.0);
        if let Err(e) = self.store.record_fill(&fill).await {
            self.log_event(
                EventLevel::Error,
                format!("Recording fill for order {} failed: {e}", order.id),
            )
            .await;
            return false;
        }

        let accounting = match order.side {
            Side::Buy => self
                .store
                .apply_buy_fill(symbol, order.price, order.amount)
                .await
                .map(|_| 0.0),
            Side::Sell => self.store.apply_sell_fill(symbol, order.price, order.amount).await,
        };
        match accounting {
            Ok(excess) if excess > 0.0 => {
                self.log_event(
                    EventLevel::Warn,
                    format!("Sell fill on {symbol} exceeded tracked position by {excess}; clamped to zero"),
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => {
                self.log_event(
                    EventLevel::Error,
                    format!("Position accounting failed for {symbol}: {e}"),
                )
                .await;
            }
        }

        if let Err(e) = self.store.update_order_status(&order.id, OrderStatus::Closed).await {
            self.log_event(
                EventLevel::Error,
                format!("Closing order {} failed: {e}", order.id),
            )
            .await;
        }

        self.log_event(
            EventLevel::Info,
            format!(
                "Filled {} {symbol} @ {} x {}",
                order.side.as_str(),
                order.price,
                order.amount
            ),
        )
        .await;
        true
    }

    /// Place the opposite leg after a fill. Failure leaves the pair unarmed
    /// until the next cycle's gap fill retries with a buy.
    async fn rearm(&mut self, pair: &StrategyConfig, symbol: &Symbol, filled_side: Side) {
        let placed = match filled_side {
            Side::Buy => {
                self.venue
                    .place_limit_sell(symbol, pair.sell_price, pair.amount)
                    .await
            }
            Side::Sell => {
                self.venue
                    .place_limit_buy(symbol, pair.buy_price, pair.amount)
                    .await
            }
        };
        match placed {
            Ok(order) => {
                if let Err(e) = self.store.record_order(&order).await {
                    self.log_event(
                        EventLevel::Error,
                        format!("Recording re-arm order for {symbol} failed: {e}"),
                    )
                    .await;
                    return;
                }
                self.log_event(
                    EventLevel::Info,
                    format!("Placed {} {symbol} @ {}", order.side, order.price),
                )
                .await;
            }
            Err(e) => {
                self.log_event(EventLevel::Error, format!("Re-arm failed for {symbol}: {e}"))
                    .await;
            }
        }
    }

    /// Drawdown ratio over the configured window, normalized against this
    /// pair's notional, fed to the watchdog. Spread and volatility signals
    /// are not observed by this loop and stay absent.
    async fn watchdog_check(&mut self, pair: &StrategyConfig, symbol: &Symbol) {
        if !self.config.watchdog.enabled {
            return;
        }
        let window = self.config.watchdog.pnl_drawdown_window_hours;
        let pnl = match self.store.realized_pnl_since(window).await {
            Ok(pnl) => pnl,
            Err(e) => {
                self.log_event(EventLevel::Warn, format!("Watchdog PnL query failed: {e}"))
                    .await;
                return;
            }
        };
        let notional = pair.sell_price * pair.amount;
        let drawdown = if pnl < 0.0 && notional > 0.0 {
            -pnl / notional
        } else {
            0.0
        };
        let signals = Signals {
            spread_pct: None,
            vol_pct: None,
            drawdown: Some(drawdown),
        };
        let advisories = risk::analyze(&signals, &self.config.watchdog);
        if !advisories.is_empty() {
            let msg = format!("[WATCHDOG] {symbol}: {}", advisories.join(" | "));
            self.log_event(EventLevel::Warn, msg.clone()).await;
            self.notify(&msg).await;
        }
    }

    /// Once per calendar day, at the configured local hour, report trailing
    /// 24h realized PnL regardless of per-pair processing.
    async fn maybe_daily_status(&mut self, now: DateTime<Local>) {
        let Some(hour) = self.config.reporting.daily_status_hour_local else {
            return;
        };
        if now.hour() != hour || self.last_status_day == Some(now.date_naive()) {
            return;
        }
        let pnl = match self.store.realized_pnl_since(24).await {
            Ok(pnl) => pnl,
            Err(e) => {
                self.log_event(EventLevel::Warn, format!("Status PnL query failed: {e}"))
                    .await;
                return;
            }
        };
        let msg = format!(
            "[STATUS] Bot alive. 24h realized PnL approx: {pnl:.2} {}",
            self.config.base_currency
        );
        self.log_event(EventLevel::Info, msg.clone()).await;
        self.notify(&msg).await;
        self.last_status_day = Some(now.date_naive());
    }

    /// Alert delivery failures are logged and swallowed; they never crash
    /// the loop.
    async fn notify(&self, message: &str) {
        if let Err(e) = self.alerts.send(message).await {
            warn!(error = %e, "alert delivery failed");
        }
    }

    /// One log line and one event row per notable occurrence.
    async fn log_event(&self, level: EventLevel, message: String) {
        match level {
            EventLevel::Info => info!("{message}"),
            EventLevel::Warn => warn!("{message}"),
            EventLevel::Error => error!("{message}"),
        }
        if let Err(e) = self.store.append_event(level, &message).await {
            error!(error = %e, "failed to append event row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Mode, ReportingConfig, WatchdogConfig};
    use crate::core::error::Error;
    use crate::exchanges::PaperVenue;
    use async_trait::async_trait;
    use chrono::Duration;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SYMBOL: &str = "ETH-USD";

    fn sym() -> Symbol {
        Symbol::new(SYMBOL)
    }

    fn test_config() -> Config {
        Config {
            mode: Mode::Paper,
            base_currency: "USD".into(),
            poll_seconds: 30,
            db_path: ":memory:".into(),
            strategies: vec![StrategyConfig {
                venue_symbol: SYMBOL.into(),
                amount: 1.0,
                buy_price: 1990.0,
                sell_price: 2010.0,
                good_til: None,
            }],
            watchdog: WatchdogConfig::default(),
            reporting: ReportingConfig::default(),
        }
    }

    fn paper_at(price: f64) -> Arc<PaperVenue> {
        let mut seed = HashMap::new();
        seed.insert(sym(), price);
        Arc::new(PaperVenue::new(seed).with_step_pct(0.0))
    }

    #[derive(Default)]
    struct RecordingAlerter {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingAlerter {
        async fn send(&self, message: &str) -> crate::core::error::Result<()> {
            self.messages.lock().push(message.to_string());
            Ok(())
        }
    }

    /// Paper venue wrapper whose order placement can be switched off, for
    /// exercising the unarmed-pair path.
    struct FlakyVenue {
        inner: Arc<PaperVenue>,
        fail_placement: AtomicBool,
    }

    #[async_trait]
    impl VenueAdapter for FlakyVenue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn fetch_price(&self, symbol: &Symbol) -> crate::core::error::Result<f64> {
            self.inner.fetch_price(symbol).await
        }

        async fn place_limit_buy(
            &self,
            symbol: &Symbol,
            price: f64,
            amount: f64,
        ) -> crate::core::error::Result<Order> {
            if self.fail_placement.load(Ordering::SeqCst) {
                return Err(Error::Transient("placement disabled".into()));
            }
            self.inner.place_limit_buy(symbol, price, amount).await
        }

        async fn place_limit_sell(
            &self,
            symbol: &Symbol,
            price: f64,
            amount: f64,
        ) -> crate::core::error::Result<Order> {
            if self.fail_placement.load(Ordering::SeqCst) {
                return Err(Error::Transient("placement disabled".into()));
            }
            self.inner.place_limit_sell(symbol, price, amount).await
        }

        async fn fetch_open_orders(&self, symbol: &Symbol) -> crate::core::error::Result<Vec<Order>> {
            self.inner.fetch_open_orders(symbol).await
        }

        async fn poll_and_fill(&self, symbol: &Symbol) -> crate::core::error::Result<Vec<Order>> {
            self.inner.poll_and_fill(symbol).await
        }
    }

    async fn engine_with(
        config: Config,
        venue: Arc<dyn VenueAdapter>,
    ) -> (Engine, Store, Arc<RecordingAlerter>) {
        let store = Store::open_in_memory().await.unwrap();
        let alerts = Arc::new(RecordingAlerter::default());
        let engine = Engine::new(config, store.clone(), venue, alerts.clone());
        (engine, store, alerts)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn cold_start_arms_exactly_one_buy() {
        let venue = paper_at(2000.0);
        let (mut engine, store, _) = engine_with(test_config(), venue.clone()).await;

        engine.run_cycle(Local::now()).await;
        let open = venue.fetch_open_orders(&sym()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Buy);
        assert_eq!(open[0].price, 1990.0);
        assert_eq!(store.open_orders(&sym()).await.unwrap().len(), 1);

        // A second quiet cycle must not stack another leg.
        engine.run_cycle(Local::now()).await;
        assert_eq!(venue.fetch_open_orders(&sym()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let venue = paper_at(2000.0);
        let (mut engine, store, _) = engine_with(test_config(), venue.clone()).await;
        let now = Local::now();

        // Arm the first buy.
        engine.run_cycle(now).await;

        // Walk below the buy limit: buy fills, position opens at the limit
        // price, and the sell leg is re-armed.
        venue.set_price(&sym(), 1985.0);
        engine.run_cycle(now).await;

        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 1.0));
        assert!(close(pos.avg_cost.unwrap(), 1990.0));

        let open = venue.fetch_open_orders(&sym()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Sell);
        assert_eq!(open[0].price, 2010.0);

        // Walk above the sell limit: sell fills, position flattens, a fresh
        // buy is re-armed.
        venue.set_price(&sym(), 2015.0);
        engine.run_cycle(now).await;

        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 0.0));
        assert!(pos.avg_cost.is_none());

        let open = venue.fetch_open_orders(&sym()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Buy);
        assert_eq!(open[0].price, 1990.0);

        // Round trip banked the band width.
        let pnl = store.realized_pnl_since(24).await.unwrap();
        assert!(close(pnl, 20.0));
    }

    #[tokio::test]
    async fn expired_pair_places_nothing() {
        let mut config = test_config();
        config.strategies[0].good_til = Some(Utc::now() - Duration::hours(1));
        let venue = paper_at(2000.0);
        let (mut engine, store, _) = engine_with(config, venue.clone()).await;

        for _ in 0..5 {
            engine.run_cycle(Local::now()).await;
        }
        assert!(venue.fetch_open_orders(&sym()).await.unwrap().is_empty());
        assert!(store.open_orders(&sym()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rearm_failure_leaves_pair_unarmed_until_gap_fill() {
        let inner = paper_at(2000.0);
        let venue = Arc::new(FlakyVenue {
            inner: inner.clone(),
            fail_placement: AtomicBool::new(false),
        });
        let (mut engine, store, _) = engine_with(test_config(), venue.clone()).await;
        let now = Local::now();

        engine.run_cycle(now).await;

        // Buy fills but the sell placement errors out: the pair must end the
        // cycle with zero open orders.
        venue.fail_placement.store(true, Ordering::SeqCst);
        inner.set_price(&sym(), 1985.0);
        engine.run_cycle(now).await;

        assert!(inner.fetch_open_orders(&sym()).await.unwrap().is_empty());
        let pos = store.position(&sym()).await.unwrap().unwrap();
        assert!(close(pos.amount, 1.0));

        // Next cycle's gap fill re-arms with a buy.
        venue.fail_placement.store(false, Ordering::SeqCst);
        engine.run_cycle(now).await;
        let open = inner.fetch_open_orders(&sym()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Buy);
    }

    #[tokio::test]
    async fn daily_status_fires_once_per_day() {
        let mut config = test_config();
        let now = Local::now();
        config.reporting.daily_status_hour_local = Some(now.hour());
        let venue = paper_at(2000.0);
        let (mut engine, _, alerts) = engine_with(config, venue).await;

        engine.run_cycle(now).await;
        engine.run_cycle(now).await;

        let messages = alerts.messages.lock();
        let statuses: Vec<_> = messages.iter().filter(|m| m.contains("[STATUS]")).collect();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].contains("USD"));
    }

    #[tokio::test]
    async fn drawdown_breach_raises_watchdog_alert() {
        let mut config = test_config();
        config.watchdog = WatchdogConfig {
            enabled: true,
            pnl_drawdown_pct: 5.0,
            ..WatchdogConfig::default()
        };
        let venue = paper_at(2000.0);
        let (mut engine, store, alerts) = engine_with(config, venue).await;

        // A lone buy outflow drives window PnL deep negative.
        store
            .record_fill(&Fill {
                order_id: "seed".into(),
                symbol: sym(),
                side: Side::Buy,
                price: 2000.0,
                amount: 1.0,
                fee: 0.0,
                ts: Utc::now(),
            })
            .await
            .unwrap();

        engine.run_cycle(Local::now()).await;
        let messages = alerts.messages.lock();
        assert!(messages.iter().any(|m| m.contains("[WATCHDOG]")));
    }

    #[tokio::test]
    async fn watchdog_disabled_stays_silent_on_losses() {
        let venue = paper_at(2000.0);
        let (mut engine, store, alerts) = engine_with(test_config(), venue).await;
        store
            .record_fill(&Fill {
                order_id: "seed".into(),
                symbol: sym(),
                side: Side::Buy,
                price: 2000.0,
                amount: 1.0,
                fee: 0.0,
                ts: Utc::now(),
            })
            .await
            .unwrap();

        engine.run_cycle(Local::now()).await;
        assert!(alerts.messages.lock().is_empty());
    }
}
