//! Watchdog - stateless threshold checks over market and PnL signals.

use crate::core::config::WatchdogConfig;

/// Signals observed this cycle. Absent signals are skipped, not treated as
/// zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Signals {
    /// Bid/ask spread in whole percent.
    pub spread_pct: Option<f64>,
    /// Recent volatility in whole percent.
    pub vol_pct: Option<f64>,
    /// Trailing-window realized loss as a fraction of at-risk notional.
    pub drawdown: Option<f64>,
}

/// Evaluate the configured thresholds and return one advisory per breached
/// signal, in spread, volatility, drawdown order. Pure function of its
/// inputs; disabled monitoring yields nothing regardless of the signals.
pub fn analyze(signals: &Signals, cfg: &WatchdogConfig) -> Vec<String> {
    let mut advisories = Vec::new();
    if !cfg.enabled {
        return advisories;
    }
    if let Some(spread) = signals.spread_pct {
        if spread > cfg.max_spread_pct {
            advisories.push(format!(
                "Market spread {spread:.2}% above {}%: avoid the thin book.",
                cfg.max_spread_pct
            ));
        }
    }
    if let Some(vol) = signals.vol_pct {
        if vol > cfg.vol_threshold_pct {
            advisories.push(format!(
                "Volatility {vol:.2}% above {}%: consider widening the band.",
                cfg.vol_threshold_pct
            ));
        }
    }
    if let Some(drawdown) = signals.drawdown {
        if drawdown >= cfg.pnl_drawdown_pct / 100.0 {
            advisories.push(format!(
                "Realized drawdown {:.1}% of notional over {}h: consider pausing this pair.",
                drawdown * 100.0,
                cfg.pnl_drawdown_window_hours
            ));
        }
    }
    advisories
}
