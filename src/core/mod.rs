//! Core module - common types, traits, config, and error handling

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{Config, Mode, ReportingConfig, StrategyConfig, TelegramConfig, WatchdogConfig};
pub use error::{Error, Result};
pub use traits::{AlertChannel, VenueAdapter};
pub use types::{EventLevel, Fill, Order, OrderStatus, Position, Side, Symbol};
