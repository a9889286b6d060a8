use std::path::Path;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt};

use pingpong::alert::make_alerter;
use pingpong::exchanges::make_venue;
use pingpong::{Config, Engine, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pingpong=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    // Anything wrong here is fatal; the loop never starts on a broken setup.
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening state db {}", config.db_path))?;
    let venue = make_venue(&config).context("building venue adapter")?;
    let alerts = make_alerter(&config.reporting).context("building alert channel")?;

    tracing::info!(
        mode = ?config.mode,
        venue = venue.name(),
        pairs = config.strategies.len(),
        poll_seconds = config.poll_seconds,
        "pingpong starting"
    );

    Engine::new(config, store, venue, alerts).run().await;
    Ok(())
}
