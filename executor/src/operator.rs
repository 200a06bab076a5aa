use chrono::Utc;
use executor_execution::ExchangeGateway;
use executor_instrument::{Asset, Wallet};
use executor_risk::BalanceHistoryEntry;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::{
    engine::{Engine, EngineHealth},
    error::{EngineError, RejectionKind},
    hub::HubClient,
    meta::{PublicStrategy, SnapshotKey, Transaction},
    strategy::Strategy,
    trade::{TradeId, TradeOpen},
};

/// Read-only and write operations available to an operator, standing in for
/// the rendered HTTP surface, which is out of scope (`spec.md` §1, §6
/// "Operator surface"): every view and command here is the programmatic
/// equivalent of one of the hub's dashboard pages.
pub struct OperatorView<G, H> {
    engine: Engine<G, H>,
}

impl<G, H> OperatorView<G, H>
where
    G: ExchangeGateway + 'static,
    H: HubClient + 'static,
{
    pub fn new(engine: Engine<G, H>) -> Self {
        Self { engine }
    }

    // -----------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------

    pub async fn health(&self) -> EngineHealth {
        self.engine.health().await
    }

    pub async fn strategies(&self) -> Vec<Strategy> {
        self.engine.meta_handle().lock().await.strategies.values().cloned().collect()
    }

    pub async fn public_strategies(&self) -> HashMap<smol_str::SmolStr, PublicStrategy> {
        self.engine.meta_handle().lock().await.public_strategies.clone()
    }

    pub async fn trades_open(&self) -> Vec<TradeOpen> {
        self.engine.meta_handle().lock().await.trades_open.clone()
    }

    pub async fn virtual_balances(&self) -> HashMap<Wallet, HashMap<Asset, Decimal>> {
        self.engine.meta_handle().lock().await.virtual_balances.clone()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.engine.meta_handle().lock().await.transactions.iter().cloned().collect()
    }

    pub async fn pnl(&self, mode: executor_instrument::TradingMode, asset: &Asset) -> Vec<BalanceHistoryEntry> {
        self.engine.meta_handle().lock().await.balance_history.entries(mode, asset).to_vec()
    }

    // -----------------------------------------------------------------
    // Write operations
    // -----------------------------------------------------------------

    /// Stop a strategy: no further enter signals are accepted for it until
    /// `start_strategy` (`spec.md` §6 "stop/start").
    pub async fn stop_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.mutate_strategy(strategy_id, |s| s.stopped = true).await
    }

    pub async fn start_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.mutate_strategy(strategy_id, |s| {
            s.stopped = false;
            s.loss_trade_run = 0;
        })
        .await
    }

    async fn mutate_strategy(&self, strategy_id: &str, f: impl FnOnce(&mut Strategy)) -> Result<(), EngineError> {
        let mut meta = self.engine.meta_handle().lock().await;
        let strategy = meta
            .strategies
            .get_mut(strategy_id)
            .ok_or_else(|| RejectionKind::UnknownStrategy { strategy_id: strategy_id.to_string() })?;
        f(strategy);
        meta.mark_dirty(SnapshotKey::Strategies);
        Ok(())
    }

    /// Mark a trade hodl — it is exempted from auto-close/rebalance sweeps
    /// until profitable, or until `release_hodl` clears the flag
    /// (`spec.md` §6 "hodl/release").
    pub async fn hodl_trade(&self, trade_id: &TradeId) -> Result<(), EngineError> {
        self.mutate_trade(trade_id, |t| t.is_hodl = true).await
    }

    pub async fn release_hodl(&self, trade_id: &TradeId) -> Result<(), EngineError> {
        self.mutate_trade(trade_id, |t| t.is_hodl = false).await
    }

    /// Stop a single trade directly by id, bypassing the strategy/symbol
    /// lookup `on_stop_signal` uses (`spec.md` §6 "stop a trade").
    pub async fn stop_trade(&self, trade_id: &TradeId) -> Result<(), EngineError> {
        self.mutate_trade(trade_id, |t| t.is_stopped = true).await
    }

    async fn mutate_trade(&self, trade_id: &TradeId, f: impl FnOnce(&mut TradeOpen)) -> Result<(), EngineError> {
        let mut meta = self.engine.meta_handle().lock().await;
        let trade = meta
            .find_trade_by_id_mut(trade_id)
            .ok_or_else(|| EngineError::OperatorConflict(format!("unknown trade {trade_id}")))?;
        f(trade);
        trade.time_updated = Utc::now();
        meta.mark_dirty(SnapshotKey::TradesOpen);
        Ok(())
    }

    /// Forget a trade without touching the exchange — for reconciling a
    /// position the operator has already closed by hand (`spec.md` §6
    /// "delete a trade").
    pub async fn delete_trade(&self, trade_id: &TradeId) -> Result<TradeOpen, EngineError> {
        let mut meta = self.engine.meta_handle().lock().await;
        meta.remove_trade(trade_id)
            .ok_or_else(|| EngineError::OperatorConflict(format!("unknown trade {trade_id}")))
    }

    /// Reset a strategy's consecutive-loss counter without otherwise
    /// touching it (`spec.md` §6 "reset loss run").
    pub async fn reset_loss_run(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.mutate_strategy(strategy_id, |s| s.loss_trade_run = 0).await
    }

    /// Top up a virtual wallet's ledger balance for `asset` (`spec.md` §6
    /// "top up a virtual wallet").
    pub async fn topup_virtual_balance(&self, wallet: Wallet, asset: &Asset, amount: Decimal) {
        let mut meta = self.engine.meta_handle().lock().await;
        *meta.virtual_balances.entry(wallet).or_default().entry(asset.clone()).or_insert(Decimal::ZERO) += amount;
        meta.mark_dirty(SnapshotKey::VirtualBalances);
    }

    /// `spec.md` §6 "stop the engine / resume": flip `operational` directly,
    /// independent of the startup-reconciliation gate in `onStrategyList`.
    pub async fn set_operational(&self, operational: bool) {
        let mut meta = self.engine.meta_handle().lock().await;
        meta.operational = operational;
    }

    /// Force-close whichever open trade matches `strategy_id`/`symbol`, as
    /// the hub's own "close" event would (`spec.md` §6 "force close").
    pub async fn force_close(&self, strategy_id: &str, symbol: &executor_instrument::Symbol, price: Decimal) -> Result<(), EngineError> {
        let strategy_name = {
            let meta = self.engine.meta_handle().lock().await;
            meta.strategies
                .get(strategy_id)
                .map(|s| s.name.clone())
                .ok_or_else(|| RejectionKind::UnknownStrategy { strategy_id: strategy_id.to_string() })?
        };
        self.engine
            .on_close_signal(crate::signal::HubSignalPayload {
                strategy_id: strategy_id.into(),
                strategy_name,
                symbol: symbol.clone(),
                entry_type: crate::signal::EntryType::Exit,
                price,
                score: None,
                timestamp: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::{HubTrade, TradedAck},
        signal::PositionType,
        store::{InMemoryStore, StateStore},
    };
    use executor_execution::MockGateway;
    use executor_instrument::{Symbol, TradingMode};
    use indexmap::IndexMap;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct NoopHub;

    #[async_trait::async_trait]
    impl HubClient for NoopHub {
        async fn fetch_open_trades(&self) -> Result<Vec<HubTrade>, executor_integration::IntegrationError> {
            Ok(Vec::new())
        }
        async fn fetch_strategy_open_trades(&self, _: &str) -> Result<Vec<HubTrade>, executor_integration::IntegrationError> {
            Ok(Vec::new())
        }
        async fn ack_traded(&self, _: TradedAck) -> Result<(), executor_integration::IntegrationError> {
            Ok(())
        }
    }

    fn config() -> crate::config::Config {
        crate::config::Config {
            exchange_api_key: String::new(),
            exchange_api_secret: String::new(),
            hub_api_key: String::new(),
            primary_wallet: Wallet::Spot,
            trade_long_funds: executor_risk::FundingPolicy::None,
            is_funds_no_loss: false,
            is_trade_margin_enabled: true,
            is_trade_short_enabled: false,
            is_buy_qty_fraction: false,
            is_pay_interest_enabled: true,
            is_auto_close_enabled: false,
            wallet_buffer: Decimal::ZERO,
            max_long_trades: 0,
            max_short_trades: 0,
            strategy_loss_limit: 0,
            strategy_limit_threshold: Decimal::ZERO,
            exclude_coins: Default::default(),
            taker_fee_percent: dec!(0.1),
            min_cost_buffer: dec!(0.01),
            virtual_wallet_funds: dec!(1),
            bnb_free_threshold: dec!(0.5),
            bnb_free_float: dec!(0.1),
            bnb_auto_top_up: None,
            balance_sync_delay: Duration::from_millis(0),
            background_interval: Duration::from_millis(20),
            reference_symbol: "BTC".to_string(),
            max_database_rows: 100,
            trade_queue_min_gap: Duration::from_millis(0),
            operator_password: None,
        }
    }

    fn harness() -> OperatorView<MockGateway, NoopHub> {
        let gateway = std::sync::Arc::new(MockGateway::new(IndexMap::new()));
        let hub = std::sync::Arc::new(NoopHub);
        let store = std::sync::Arc::new(StateStore::new(std::sync::Arc::new(InMemoryStore::new()), Duration::from_millis(10)));
        let notifier = std::sync::Arc::new(executor_risk::NotifierHub::new(executor_risk::notifier::Level::Info));
        let (engine, _queue_handle) = Engine::new(config(), gateway, hub, store, notifier, crate::meta::MetaData::new(10));
        OperatorView::new(engine)
    }

    fn trade(id: &str) -> TradeOpen {
        TradeOpen::new_entry(
            TradeId(id.into()),
            "strat-1".into(),
            "Strategy One".into(),
            Symbol::new("BTCUSDT"),
            PositionType::Long,
            TradingMode::Virtual,
            Wallet::Spot,
            dec!(0.01),
            dec!(100),
            Decimal::ZERO,
            dec!(10000),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn hodl_then_release_round_trips_the_flag() {
        let view = harness();
        let id = TradeId("abc123".into());
        view.engine.meta_handle().lock().await.push_trade(trade("abc123"));

        view.hodl_trade(&id).await.unwrap();
        assert!(view.trades_open().await[0].is_hodl);

        view.release_hodl(&id).await.unwrap();
        assert!(!view.trades_open().await[0].is_hodl);
    }

    #[tokio::test]
    async fn mutating_an_unknown_trade_is_an_operator_conflict() {
        let view = harness();
        let result = view.stop_trade(&TradeId("missing".into())).await;
        assert!(matches!(result, Err(EngineError::OperatorConflict(_))));
    }

    #[tokio::test]
    async fn delete_trade_removes_it_from_the_open_list() {
        let view = harness();
        view.engine.meta_handle().lock().await.push_trade(trade("xyz789"));

        let removed = view.delete_trade(&TradeId("xyz789".into())).await.unwrap();
        assert_eq!(removed.id, TradeId("xyz789".into()));
        assert!(view.trades_open().await.is_empty());
    }

    #[tokio::test]
    async fn stop_then_start_strategy_clears_the_loss_run() {
        let view = harness();
        {
            let mut meta = view.engine.meta_handle().lock().await;
            let mut strategy = crate::strategy::Strategy::from_payload(crate::strategy::StrategyListEntry {
                id: "strat-1".into(),
                name: "Strategy One".into(),
                trade_amount: dec!(100),
                trading_mode: TradingMode::Virtual,
                active: true,
            });
            strategy.loss_trade_run = 3;
            meta.strategies.insert(strategy.id.clone(), strategy);
        }

        view.stop_strategy("strat-1").await.unwrap();
        assert!(view.strategies().await[0].stopped);

        view.start_strategy("strat-1").await.unwrap();
        let strategies = view.strategies().await;
        assert!(!strategies[0].stopped);
        assert_eq!(strategies[0].loss_trade_run, 0);
    }

    #[tokio::test]
    async fn topup_virtual_balance_credits_the_wallet() {
        let view = harness();
        let asset = executor_instrument::Asset::new("USDT");
        view.topup_virtual_balance(Wallet::Spot, &asset, dec!(50)).await;
        let balances = view.virtual_balances().await;
        assert_eq!(balances[&Wallet::Spot][&asset], dec!(50));
    }
}
