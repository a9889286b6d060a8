//! Venue implementations - pluggable backends behind `VenueAdapter`

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::{Config, Mode};
use crate::core::error::Result;
use crate::core::traits::VenueAdapter;
use crate::core::types::Symbol;

pub mod paper;
pub mod robinhood;

pub use paper::PaperVenue;
pub use robinhood::RobinhoodVenue;

/// Build the concrete venue for the configured mode. Decided exactly once at
/// startup; the loop never branches on mode again.
pub fn make_venue(config: &Config) -> Result<Arc<dyn VenueAdapter>> {
    match config.mode {
        Mode::Paper => {
            // Seed each simulated price at the band midpoint so the walk
            // crosses both legs naturally.
            let seed: HashMap<Symbol, f64> = config
                .strategies
                .iter()
                .map(|st| {
                    (
                        Symbol::new(&st.venue_symbol),
                        (st.buy_price + st.sell_price) / 2.0,
                    )
                })
                .collect();
            Ok(Arc::new(PaperVenue::new(seed)))
        }
        Mode::Live => Ok(Arc::new(RobinhoodVenue::from_env()?)),
    }
}
