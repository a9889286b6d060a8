//! Configuration - loaded once at startup from a TOML file.
//!
//! Invalid configuration is fatal before the loop starts; nothing in here is
//! mutated by the core afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::{Error, Result};

/// Run mode: simulated venue or live venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

/// One ping-pong pair: a fixed amount bounced between a buy price below and a
/// sell price above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub venue_symbol: String,
    pub amount: f64,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Quoted RFC 3339 timestamp. Past this instant the pair is skipped
    /// entirely (existing orders are left standing).
    #[serde(default)]
    pub good_til: Option<DateTime<Utc>>,
}

/// Watchdog thresholds. Percentages are whole percent (5.0 = 5%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub enabled: bool,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_vol_threshold_pct")]
    pub vol_threshold_pct: f64,
    #[serde(default = "default_drawdown_window_hours")]
    pub pnl_drawdown_window_hours: i64,
    #[serde(default = "default_drawdown_pct")]
    pub pnl_drawdown_pct: f64,
}

fn default_max_spread_pct() -> f64 {
    1.0
}
fn default_vol_threshold_pct() -> f64 {
    3.0
}
fn default_drawdown_window_hours() -> i64 {
    24
}
fn default_drawdown_pct() -> f64 {
    5.0
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_spread_pct: default_max_spread_pct(),
            vol_threshold_pct: default_vol_threshold_pct(),
            pnl_drawdown_window_hours: default_drawdown_window_hours(),
            pnl_drawdown_pct: default_drawdown_pct(),
        }
    }
}

/// Telegram alert channel settings. The bot token comes from the
/// `TELEGRAM_BOT_TOKEN` env var, never from this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    #[serde(default)]
    pub chat_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Local hour-of-day (0-23) for the once-per-day status alert.
    #[serde(default)]
    pub daily_status_hour_local: Option<u32>,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub base_currency: String,
    pub poll_seconds: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

fn default_db_path() -> String {
    "state.db".to_string()
}

impl Config {
    /// Load and validate from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_seconds == 0 {
            return Err(Error::Config("poll_seconds must be at least 1".into()));
        }
        if self.strategies.is_empty() {
            return Err(Error::Config("at least one [[strategies]] entry is required".into()));
        }
        for st in &self.strategies {
            if st.venue_symbol.trim().is_empty() {
                return Err(Error::Config("strategy venue_symbol is empty".into()));
            }
            if st.amount <= 0.0 {
                return Err(Error::Config(format!("{}: amount must be positive", st.venue_symbol)));
            }
            if st.buy_price <= 0.0 {
                return Err(Error::Config(format!("{}: buy_price must be positive", st.venue_symbol)));
            }
            if st.buy_price >= st.sell_price {
                return Err(Error::Config(format!(
                    "{}: buy_price {} must sit below sell_price {}",
                    st.venue_symbol, st.buy_price, st.sell_price
                )));
            }
        }
        if self.watchdog.pnl_drawdown_window_hours < 1 {
            return Err(Error::Config("watchdog.pnl_drawdown_window_hours must be at least 1".into()));
        }
        if let Some(hour) = self.reporting.daily_status_hour_local {
            if hour > 23 {
                return Err(Error::Config("reporting.daily_status_hour_local must be 0-23".into()));
            }
        }
        Ok(())
    }
}
