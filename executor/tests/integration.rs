use std::{sync::Arc, time::Duration};

use executor::{
    config::Config,
    engine::Engine,
    hub::{HubClient, HubTrade, TradedAck},
    meta::MetaData,
    signal::{Action, EntryType, HubSignalPayload},
    store::{InMemoryStore, StateStore},
    strategy::StrategyListEntry,
};
use executor_execution::{Balance, MockGateway, Ticker};
use executor_instrument::{Asset, Limits, Market, Precision, Symbol, TradingMode, Wallet};
use executor_integration::IntegrationError;
use executor_risk::{notifier::Level, FundingPolicy, NotifierHub};
use indexmap::IndexMap;
use rust_decimal_macros::dec;

struct NoopHub;

#[async_trait::async_trait]
impl HubClient for NoopHub {
    async fn fetch_open_trades(&self) -> Result<Vec<HubTrade>, IntegrationError> {
        Ok(Vec::new())
    }
    async fn fetch_strategy_open_trades(&self, _: &str) -> Result<Vec<HubTrade>, IntegrationError> {
        Ok(Vec::new())
    }
    async fn ack_traded(&self, _: TradedAck) -> Result<(), IntegrationError> {
        Ok(())
    }
}

fn btcusdt() -> Market {
    Market {
        symbol: Symbol::new("BTCUSDT"),
        base: Asset::new("BTC"),
        quote: Asset::new("USDT"),
        active: true,
        spot: true,
        margin: true,
        margin_allowed: true,
        precision: Precision::new(dec!(0.0001), dec!(0.01)),
        limits: Limits {
            amount_min: dec!(0.0001),
            amount_max: dec!(1000),
            cost_min: dec!(10),
            cost_max: dec!(1000000),
            market_max: dec!(100),
        },
    }
}

fn ethbtc() -> Market {
    Market {
        symbol: Symbol::new("ETHBTC"),
        base: Asset::new("ETH"),
        quote: Asset::new("BTC"),
        active: true,
        spot: true,
        margin: true,
        margin_allowed: true,
        precision: Precision::new(dec!(0.0001), dec!(0.0001)),
        limits: Limits {
            amount_min: dec!(0.0001),
            amount_max: dec!(1000),
            cost_min: dec!(0.001),
            cost_max: dec!(1000),
            market_max: dec!(100),
        },
    }
}

fn config() -> Config {
    Config {
        exchange_api_key: String::new(),
        exchange_api_secret: String::new(),
        hub_api_key: String::new(),
        primary_wallet: Wallet::Spot,
        trade_long_funds: FundingPolicy::None,
        is_funds_no_loss: false,
        is_trade_margin_enabled: true,
        is_trade_short_enabled: false,
        is_buy_qty_fraction: false,
        is_pay_interest_enabled: true,
        is_auto_close_enabled: false,
        wallet_buffer: rust_decimal::Decimal::ZERO,
        max_long_trades: 0,
        max_short_trades: 0,
        strategy_loss_limit: 0,
        strategy_limit_threshold: rust_decimal::Decimal::ZERO,
        exclude_coins: Default::default(),
        taker_fee_percent: dec!(0.1),
        min_cost_buffer: dec!(0.01),
        virtual_wallet_funds: dec!(1000),
        bnb_free_threshold: dec!(0.5),
        bnb_free_float: dec!(0.1),
        bnb_auto_top_up: None,
        balance_sync_delay: Duration::from_millis(0),
        background_interval: Duration::from_millis(20),
        reference_symbol: "USDT".to_string(),
        max_database_rows: 100,
        trade_queue_min_gap: Duration::from_millis(0),
        operator_password: None,
    }
}

/// Drains the Trade Queue's single worker by letting the paused clock run
/// forward until whatever was enqueued has had a chance to finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn a_virtual_long_entry_runs_through_to_a_filled_exit() {
    let mut markets = IndexMap::new();
    markets.insert(Symbol::new("BTCUSDT"), btcusdt());
    let gateway = Arc::new(MockGateway::new(markets));
    gateway.set_ticker(Symbol::new("BTCUSDT"), Ticker::new(dec!(9990), dec!(10000)));

    let hub = Arc::new(NoopHub);
    let store = Arc::new(StateStore::new(Arc::new(InMemoryStore::new()), Duration::from_millis(10)));
    let notifier = Arc::new(NotifierHub::new(Level::Info));
    let (engine, _queue_handle) = Engine::new(config(), gateway, hub, store, notifier, MetaData::new(100));

    engine
        .on_strategy_list(vec![StrategyListEntry {
            id: "strat-1".into(),
            name: "Strategy One".into(),
            trade_amount: dec!(100),
            trading_mode: TradingMode::Virtual,
            active: true,
        }])
        .await
        .unwrap();
    assert!(engine.health().await.operational);

    engine
        .on_trade_signal(
            Action::Buy,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("BTCUSDT"),
                entry_type: EntryType::Enter,
                price: dec!(10000),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    let open = engine.health().await;
    assert_eq!(open.open_trades, 1);

    engine
        .on_trade_signal(
            Action::Sell,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("BTCUSDT"),
                entry_type: EntryType::Exit,
                price: dec!(10100),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    let closed = engine.health().await;
    assert_eq!(closed.open_trades, 0);
}

#[tokio::test(start_paused = true)]
async fn a_full_entry_exit_cycle_durably_logs_every_transaction_leg() {
    let mut markets = IndexMap::new();
    markets.insert(Symbol::new("BTCUSDT"), btcusdt());
    let gateway = Arc::new(MockGateway::new(markets));
    gateway.set_ticker(Symbol::new("BTCUSDT"), Ticker::new(dec!(9990), dec!(10000)));

    let hub = Arc::new(NoopHub);
    let backend = Arc::new(InMemoryStore::new());
    let store = Arc::new(StateStore::new(backend.clone(), Duration::from_millis(10)));
    let notifier = Arc::new(NotifierHub::new(Level::Info));
    let (engine, _queue_handle) = Engine::new(config(), gateway, hub, store, notifier, MetaData::new(100));

    engine
        .on_strategy_list(vec![StrategyListEntry {
            id: "strat-1".into(),
            name: "Strategy One".into(),
            trade_amount: dec!(100),
            trading_mode: TradingMode::Virtual,
            active: true,
        }])
        .await
        .unwrap();

    engine
        .on_trade_signal(
            Action::Buy,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("BTCUSDT"),
                entry_type: EntryType::Enter,
                price: dec!(10000),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    // One leg so far: the entry's market buy.
    assert_eq!(backend.transaction_count(), 1);

    engine
        .on_trade_signal(
            Action::Sell,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("BTCUSDT"),
                entry_type: EntryType::Exit,
                price: dec!(10100),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    // A second leg for the exit's market sell; a long trade never borrows,
    // so there is no repay leg to expect alongside it.
    assert_eq!(backend.transaction_count(), 2);
    assert_eq!(engine.health().await.open_trades, 0);
}

#[tokio::test(start_paused = true)]
async fn a_borrow_min_long_entry_borrows_and_repays_the_quote_asset() {
    // spec.md §8 S2: margin free=0.004 BTC, tradeAmount=0.01 => borrow=0.006 BTC.
    let mut markets = IndexMap::new();
    markets.insert(Symbol::new("ETHBTC"), ethbtc());
    let gateway = Arc::new(MockGateway::new(markets));
    gateway.set_ticker(Symbol::new("ETHBTC"), Ticker::new(dec!(100), dec!(100)));
    gateway.set_balance(Wallet::Margin, Asset::new("BTC"), Balance::new(dec!(0.004), dec!(0.004)));

    let hub = Arc::new(NoopHub);
    let backend = Arc::new(InMemoryStore::new());
    let store = Arc::new(StateStore::new(backend.clone(), Duration::from_millis(10)));
    let notifier = Arc::new(NotifierHub::new(Level::Info));
    let mut cfg = config();
    cfg.primary_wallet = Wallet::Margin;
    cfg.trade_long_funds = FundingPolicy::BorrowMin;
    let (engine, _queue_handle) = Engine::new(cfg, gateway.clone(), hub, store, notifier, MetaData::new(100));

    engine
        .on_strategy_list(vec![StrategyListEntry {
            id: "strat-1".into(),
            name: "Strategy One".into(),
            trade_amount: dec!(0.01),
            trading_mode: TradingMode::Real,
            active: true,
        }])
        .await
        .unwrap();

    engine
        .on_trade_signal(
            Action::Buy,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("ETHBTC"),
                entry_type: EntryType::Enter,
                price: dec!(100),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(gateway.margin_loan(&Asset::new("BTC")), dec!(0.006));
    // Borrow then buy: two legs, both denominated in the borrowed asset (BTC).
    assert_eq!(backend.transaction_count(), 2);
    assert_eq!(engine.health().await.open_trades, 1);

    engine
        .on_trade_signal(
            Action::Sell,
            HubSignalPayload {
                strategy_id: "strat-1".into(),
                strategy_name: "Strategy One".into(),
                symbol: Symbol::new("ETHBTC"),
                entry_type: EntryType::Exit,
                price: dec!(100),
                score: None,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    settle().await;

    // Repay mirrors the borrow exactly, netting the loan back to zero.
    assert_eq!(gateway.margin_loan(&Asset::new("BTC")), dec!(0));
    assert_eq!(backend.transaction_count(), 4);
    assert_eq!(engine.health().await.open_trades, 0);
}

#[tokio::test(start_paused = true)]
async fn a_duplicate_entry_for_the_same_strategy_symbol_and_side_is_rejected() {
    let mut markets = IndexMap::new();
    markets.insert(Symbol::new("BTCUSDT"), btcusdt());
    let gateway = Arc::new(MockGateway::new(markets));
    gateway.set_ticker(Symbol::new("BTCUSDT"), Ticker::new(dec!(9990), dec!(10000)));

    let hub = Arc::new(NoopHub);
    let store = Arc::new(StateStore::new(Arc::new(InMemoryStore::new()), Duration::from_millis(10)));
    let notifier = Arc::new(NotifierHub::new(Level::Info));
    let (engine, _queue_handle) = Engine::new(config(), gateway, hub, store, notifier, MetaData::new(100));

    engine
        .on_strategy_list(vec![StrategyListEntry {
            id: "strat-1".into(),
            name: "Strategy One".into(),
            trade_amount: dec!(100),
            trading_mode: TradingMode::Virtual,
            active: true,
        }])
        .await
        .unwrap();

    let payload = HubSignalPayload {
        strategy_id: "strat-1".into(),
        strategy_name: "Strategy One".into(),
        symbol: Symbol::new("BTCUSDT"),
        entry_type: EntryType::Enter,
        price: dec!(10000),
        score: None,
        timestamp: chrono::Utc::now(),
    };
    engine.on_trade_signal(Action::Buy, payload.clone()).await.unwrap();
    settle().await;

    let result = engine.on_trade_signal(Action::Buy, payload).await;
    assert!(result.is_err());
    assert_eq!(engine.health().await.open_trades, 1);
}
