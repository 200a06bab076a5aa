use std::time::Duration;

use executor_execution::ExchangeGateway;

use crate::{engine::Engine, hub::HubClient};

/// Market data is refreshed on a 24h cadence regardless of
/// `BACKGROUND_INTERVAL` (`spec.md` §5 "Background loop").
const MARKET_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Drive the periodic background loop until `shutdown` resolves: every
/// `BACKGROUND_INTERVAL` tick runs the auto-close sweep, and once per
/// `MARKET_REFRESH_INTERVAL` the market map is reloaded (`spec.md` §5).
pub async fn run<G, H>(engine: Engine<G, H>, mut shutdown: tokio::sync::oneshot::Receiver<()>)
where
    G: ExchangeGateway + 'static,
    H: HubClient + 'static,
{
    let tick_interval = engine.config().background_interval;
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut elapsed_since_market_refresh = Duration::ZERO;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.background_auto_close_sweep().await;

                elapsed_since_market_refresh += tick_interval;
                if elapsed_since_market_refresh >= MARKET_REFRESH_INTERVAL {
                    elapsed_since_market_refresh = Duration::ZERO;
                    if let Err(error) = engine.background_refresh_markets().await {
                        tracing::error!(%error, "background market refresh failed");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("background loop stopping");
                return;
            }
        }
    }
}
