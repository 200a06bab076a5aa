use std::sync::Arc;

use executor::{
    config::Config,
    engine::Engine,
    logging, meta::MetaData,
    shutdown::{terminate_signal, GracefulShutdown},
    store::{InMemoryStore, StateStore},
};
use executor_execution::MockGateway;
use executor_integration::IntegrationError;
use executor_risk::notifier::{Level, NotifierHub};
use indexmap::IndexMap;

/// Placeholder [`executor::hub::HubClient`]: the socket/HTTP transport that
/// actually talks to the hub is an external collaborator (see
/// `executor::hub`'s module doc) and is wired in at deployment time, not
/// here.
struct NoConnectionHub;

#[async_trait::async_trait]
impl executor::hub::HubClient for NoConnectionHub {
    async fn fetch_open_trades(&self) -> Result<Vec<executor::hub::HubTrade>, IntegrationError> {
        Ok(Vec::new())
    }

    async fn fetch_strategy_open_trades(
        &self,
        _strategy_id: &str,
    ) -> Result<Vec<executor::hub::HubTrade>, IntegrationError> {
        Ok(Vec::new())
    }

    async fn ack_traded(&self, _ack: executor::hub::TradedAck) -> Result<(), IntegrationError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        logging::init_json_logging();
    } else {
        logging::init_logging();
    }

    let gateway = Arc::new(MockGateway::new(IndexMap::new()));
    let hub = Arc::new(NoConnectionHub);
    let backend = Arc::new(InMemoryStore::new());
    let store = Arc::new(StateStore::new(backend, std::time::Duration::from_millis(100)));
    let notifier = Arc::new(NotifierHub::new(Level::Warn));

    let mut meta = MetaData::new(config.max_database_rows);
    match store.load().await {
        Ok(Some(snapshot)) => {
            meta.strategies = snapshot.strategies.into_iter().map(|s| (s.id.clone(), s)).collect();
            meta.trades_open = snapshot.trades_open;
            meta.virtual_balances = snapshot.virtual_balances;
            meta.balance_history = snapshot.balance_history;
            meta.public_strategies = snapshot.public_strategies;
            tracing::info!("loaded persisted snapshot");
        }
        Ok(None) => tracing::info!("no persisted snapshot found, starting cold"),
        Err(error) => tracing::error!(%error, "failed to load persisted snapshot, starting cold"),
    }

    let (engine, queue_worker) = Engine::new(config, gateway, hub, store.clone(), notifier, meta);

    let (background_shutdown_tx, background_shutdown_rx) = tokio::sync::oneshot::channel();
    let background_handle = tokio::spawn(executor::background::run(engine.clone(), background_shutdown_rx));

    GracefulShutdown::new(engine, store).run(terminate_signal(), queue_worker).await;
    let _ = background_shutdown_tx.send(());
    let _ = background_handle.await;
}
