use chrono::{DateTime, Utc};
use executor_execution::{ExchangeGateway, Side};
use executor_instrument::{Asset, Symbol, TradingMode, Wallet};
use executor_risk::{calculate_pnl, FundingPolicy, NotifierHub, Notification, RebalanceCandidate, WalletSnapshot};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::Config,
    error::{EngineError, RejectionKind},
    hub::{AckPolicy, HubAction, HubClient, TradedAck},
    meta::{MetaData, SnapshotKey, Transaction, TransactionKind},
    queue::TradeQueue,
    reconcile,
    signal::{classify_position, Action, EntryType, PositionType, Signal},
    store::StateStore,
    strategy::{Strategy, StrategyListEntry},
    trade::{TradeId, TradeOpen},
    virtual_ledger,
    wallet::{self, plan_rebalance_split, WalletData},
};

/// The hub strategy-list cross-check's throttle window (`spec.md` §4.1
/// `onStrategyList`: "triggers a throttled (≥120s)" cross-check).
const CROSS_CHECK_THROTTLE: Duration = Duration::from_secs(120);

/// Cache TTL for prices refreshed under `IS_FUNDS_NO_LOSS` (`spec.md` §4.1
/// step 4, §4.7 `loadPrices`: "cache TTL 60s").
const PRICE_CACHE_TTL: chrono::Duration = chrono::Duration::seconds(60);

/// The fee-token free-balance hysteresis state machine (`spec.md` §4.1
/// post-trade accounting: "{ok, high, low, empty}").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum BnbLevel {
    #[default]
    Ok,
    High,
    Low,
    Empty,
}

/// Advance the BNB hysteresis state from `free` against `threshold`,
/// returning the notification level to raise, if any edge was crossed.
fn bnb_transition(current: BnbLevel, free: Decimal, threshold: Decimal) -> (BnbLevel, Option<Notification>) {
    let half = threshold / Decimal::TWO;
    if free <= Decimal::ZERO {
        return match current {
            BnbLevel::Empty => (current, None),
            _ => (
                BnbLevel::Empty,
                Some(Notification::error(
                    "bnb_empty",
                    "fee token balance depleted",
                    "BNB free balance reached zero; fees will fall back to the trade's own asset.",
                )),
            ),
        };
    }
    if free >= threshold {
        return match current {
            BnbLevel::Ok => (current, None),
            _ => (BnbLevel::Ok, None),
        };
    }
    if free < half {
        return match current {
            BnbLevel::Low | BnbLevel::Empty => (BnbLevel::Low, None),
            _ => (
                BnbLevel::Low,
                Some(Notification::warn(
                    "bnb_low",
                    "fee token balance critically low",
                    "BNB free balance fell below half of BNB_FREE_THRESHOLD.",
                )),
            ),
        };
    }
    match current {
        BnbLevel::High => (current, None),
        _ => (
            BnbLevel::High,
            Some(Notification::warn(
                "bnb_high",
                "fee token balance running low",
                "BNB free balance fell below BNB_FREE_THRESHOLD.",
            )),
        ),
    }
}

/// Snapshot returned by [`Engine::health`]: whether startup reconciliation
/// has completed, how many positions are currently open, and when
/// reconciliation last ran.
#[derive(Debug, Clone, Copy)]
pub struct EngineHealth {
    pub operational: bool,
    pub open_trades: usize,
    pub reconciled_at: Option<DateTime<Utc>>,
}

struct EngineInner<G, H> {
    config: Config,
    gateway: Arc<G>,
    hub: Arc<H>,
    meta: Arc<AsyncMutex<MetaData>>,
    store: Arc<StateStore>,
    notifier: Arc<NotifierHub>,
    queue: TradeQueue,
    bnb_state: parking_lot::Mutex<BnbLevel>,
    last_cross_check: parking_lot::Mutex<HashMap<SmolStr, Instant>>,
}

/// The Signal Engine (`spec.md` §4.1), the core orchestrator threading every
/// other component together. Cheaply `Clone`, so a handle can be moved into
/// spawned execute tasks without the caller holding a lock across an await.
pub struct Engine<G, H>(Arc<EngineInner<G, H>>);

impl<G, H> Clone for Engine<G, H> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<G, H> Engine<G, H>
where
    G: ExchangeGateway + 'static,
    H: HubClient + 'static,
{
    pub fn new(
        config: Config,
        gateway: Arc<G>,
        hub: Arc<H>,
        store: Arc<StateStore>,
        notifier: Arc<NotifierHub>,
        meta: MetaData,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (queue, join_handle) = TradeQueue::spawn(config.trade_queue_min_gap);
        let inner = EngineInner {
            config,
            gateway,
            hub,
            meta: Arc::new(AsyncMutex::new(meta)),
            store,
            notifier,
            queue,
            bnb_state: parking_lot::Mutex::new(BnbLevel::Ok),
            last_cross_check: parking_lot::Mutex::new(HashMap::new()),
        };
        (Self(Arc::new(inner)), join_handle)
    }

    pub fn meta_handle(&self) -> Arc<AsyncMutex<MetaData>> {
        self.0.meta.clone()
    }

    /// A liveness snapshot for the operator surface and any external health
    /// check (`spec.md` §6 "Operator surface").
    pub async fn health(&self) -> EngineHealth {
        let meta = self.0.meta.lock().await;
        EngineHealth {
            operational: meta.operational,
            open_trades: meta.trades_open.len(),
            reconciled_at: meta.reconciled_at,
        }
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    fn schedule_flush(&self) {
        self.0.store.schedule_flush(self.0.meta.clone());
    }

    // ---------------------------------------------------------------
    // Inbound hub operations (spec.md §4.1)
    // ---------------------------------------------------------------

    /// `onStrategyList`. First successful call performs startup reconciliation
    /// and flips the engine operational; later calls refresh strategies and
    /// throttle a per-strategy hub cross-check.
    pub async fn on_strategy_list(&self, list: Vec<StrategyListEntry>) -> Result<(), EngineError> {
        let mut meta = self.0.meta.lock().await;
        let first_call = !meta.operational;

        for entry in list {
            match meta.strategies.get_mut(&entry.id) {
                Some(existing) => {
                    let mode_switched = existing.refresh_from_payload(entry.clone());
                    if mode_switched {
                        tracing::info!(strategy_id = %entry.id, mode = %existing.trading_mode, "strategy trading mode switched");
                    }
                }
                None => {
                    tracing::info!(strategy_id = %entry.id, "new strategy registered");
                    meta.strategies.insert(entry.id.clone(), Strategy::from_payload(entry));
                }
            }
        }
        meta.mark_dirty(SnapshotKey::Strategies);

        if first_call {
            self.reconcile_startup(&mut meta).await;
            meta.operational = true;
            meta.reconciled_at = Some(Utc::now());
            tracing::info!("signal engine is now operational");
        } else {
            let strategy_ids: Vec<SmolStr> = meta
                .strategies
                .values()
                .filter(|s| s.active)
                .map(|s| s.id.clone())
                .collect();
            drop(meta);
            self.throttled_cross_check(strategy_ids).await;
        }

        self.schedule_flush();
        Ok(())
    }

    /// Startup reconciliation (`spec.md` §4.6), run once on the first
    /// `onStrategyList` call: load markets, drop persisted trades the hub no
    /// longer reports, and for real-mode strategies the store held nothing
    /// for, reconstruct what we can confirm against live exchange balances.
    async fn reconcile_startup(&self, meta: &mut MetaData) {
        match self.0.gateway.load_markets(false).await {
            Ok(markets) => meta.markets = markets,
            Err(error) => tracing::error!(%error, "failed to load markets during startup reconciliation"),
        }

        let hub_trades = match self.0.hub.fetch_open_trades().await {
            Ok(trades) => trades,
            Err(error) => {
                tracing::error!(%error, "failed to fetch the hub's open trades during startup reconciliation");
                Vec::new()
            }
        };

        let had_no_persisted_trades = meta.trades_open.is_empty();
        let persisted = std::mem::take(&mut meta.trades_open);
        let (kept, discarded) = reconcile::match_against_hub(persisted, &hub_trades);
        meta.trades_open = kept;
        for trade in &discarded {
            tracing::warn!(strategy_id = %trade.strategy_id, symbol = %trade.symbol, position_type = %trade.position_type, reason = trade.reason, "discarding persisted trade during startup reconciliation");
        }

        if had_no_persisted_trades && !hub_trades.is_empty() {
            let mut balances = HashMap::new();
            for wallet in [Wallet::Spot, Wallet::Margin] {
                if let Ok(balance) = self.0.gateway.fetch_balance(wallet).await {
                    balances.insert(wallet, balance);
                }
            }
            let (reconstructed, discarded) = reconcile::reconstruct_from_balances(
                &hub_trades,
                &meta.trades_open,
                &meta.strategies,
                &meta.markets,
                &balances,
                self.0.config.primary_wallet,
                Utc::now(),
            );
            for trade in &discarded {
                tracing::warn!(strategy_id = %trade.strategy_id, symbol = %trade.symbol, position_type = %trade.position_type, reason = trade.reason, "could not reconstruct a hub-reported open trade from live balances");
            }
            if !discarded.is_empty() {
                self.notify(Notification::warn(
                    "reconciliation_gap",
                    "startup reconciliation could not fully reconstruct open trades",
                    format!("{} hub-reported trade(s) had no confirming persisted state or live balance", discarded.len()),
                ))
                .await;
            }
            meta.trades_open.extend(reconstructed);
        }

        if !discarded.is_empty() || had_no_persisted_trades {
            meta.mark_dirty(SnapshotKey::TradesOpen);
        }

        if let Some(top_up_asset) = self.0.config.bnb_auto_top_up.as_deref() {
            let asset = Asset::new(top_up_asset);
            if meta.markets.values().any(|m| m.quote == asset) {
                tracing::warn!(asset = %asset, "BNB_AUTO_TOP_UP asset is also used as a market quote asset; its balance will move with ordinary trading as well as fee top-ups");
            }
        }
    }

    /// `onBuySignal` / `onSellSignal`. Classifies `action` + the payload's
    /// entry type into a [`PositionType`] and routes to the entry or exit
    /// pipeline.
    pub async fn on_trade_signal(
        &self,
        action: Action,
        payload: crate::signal::HubSignalPayload,
    ) -> Result<(), EngineError> {
        let position_type = classify_position(action, payload.entry_type);
        let signal = Signal {
            strategy_id: payload.strategy_id,
            strategy_name: payload.strategy_name,
            symbol: payload.symbol,
            entry_type: payload.entry_type,
            position_type: Some(position_type),
            price: payload.price,
            timestamp: payload.timestamp,
        };
        match signal.entry_type {
            EntryType::Enter => self.handle_enter(signal, action).await,
            EntryType::Exit => self.handle_exit(signal, true).await,
        }
    }

    /// `onCloseSignal`: force entryType=exit regardless of payload content.
    pub async fn on_close_signal(&self, payload: crate::signal::HubSignalPayload) -> Result<(), EngineError> {
        let signal = Signal::exit(
            payload.strategy_id,
            payload.strategy_name,
            payload.symbol,
            None,
            payload.price,
            payload.timestamp,
        );
        self.handle_exit(signal, false).await
    }

    /// `onStopSignal`: sets `isStopped` on the matching open trade; no
    /// exchange activity (`spec.md` §4.1).
    pub async fn on_stop_signal(
        &self,
        strategy_id: &str,
        symbol: &Symbol,
        position_type: Option<PositionType>,
    ) -> Result<(), EngineError> {
        let mut meta = self.0.meta.lock().await;
        let trade = match position_type {
            Some(pt) => meta.find_open_trade_mut(strategy_id, symbol, pt),
            None => meta
                .trades_open
                .iter_mut()
                .find(|t| t.strategy_id == strategy_id && &t.symbol == symbol),
        }
        .ok_or_else(|| RejectionKind::NoMatchingOpenTrade {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.clone(),
            position_type,
        })?;
        trade.is_stopped = true;
        trade.time_updated = Utc::now();
        meta.mark_dirty(SnapshotKey::TradesOpen);
        drop(meta);
        self.schedule_flush();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    fn validate_enter(
        meta: &MetaData,
        config: &Config,
        strategy_id: &str,
        symbol: &Symbol,
        position_type: PositionType,
    ) -> Result<(), RejectionKind> {
        if !meta.operational {
            return Err(RejectionKind::NotOperational);
        }
        let strategy = meta
            .strategies
            .get(strategy_id)
            .ok_or_else(|| RejectionKind::UnknownStrategy {
                strategy_id: strategy_id.to_string(),
            })?;
        if !strategy.active {
            return Err(RejectionKind::StrategyInactive {
                strategy_id: strategy_id.to_string(),
            });
        }
        if strategy.stopped {
            return Err(RejectionKind::StrategyStopped {
                strategy_id: strategy_id.to_string(),
            });
        }
        if meta.find_open_trade(strategy_id, symbol, position_type).is_some() {
            return Err(RejectionKind::DuplicateOpenTrade {
                strategy_id: strategy_id.to_string(),
                symbol: symbol.clone(),
                position_type,
            });
        }
        if config.strategy_loss_limit > 0 {
            let open_trades = meta.strategy_open_trade_count(strategy_id);
            if strategy.at_loss_limit_threshold(open_trades, config.strategy_loss_limit, config.strategy_limit_threshold) {
                return Err(RejectionKind::StrategyLossLimit {
                    strategy_id: strategy_id.to_string(),
                    open_trades,
                    threshold: config.strategy_loss_limit.saturating_sub(strategy.loss_trade_run),
                });
            }
        }
        if position_type == PositionType::Short && !config.is_trade_short_enabled {
            return Err(RejectionKind::PositionTypeDisabled(position_type));
        }
        if position_type == PositionType::Short && !config.is_trade_margin_enabled {
            return Err(RejectionKind::MarginDisabled);
        }
        if config.exclude_coins.contains(symbol.as_str()) {
            return Err(RejectionKind::SymbolExcluded(symbol.clone()));
        }
        let market = meta
            .markets
            .get(symbol)
            .ok_or_else(|| RejectionKind::SymbolExcluded(symbol.clone()))?;
        market.require_active()?;
        let needed_wallet = if position_type == PositionType::Short {
            Wallet::Margin
        } else {
            config.primary_wallet
        };
        if !market.supports(needed_wallet) && !market.supports(needed_wallet.other()) {
            market.require_wallet(needed_wallet)?;
        }
        let max = if position_type == PositionType::Long {
            config.max_long_trades
        } else {
            config.max_short_trades
        };
        if max > 0 && meta.total_open_trade_count(position_type) >= max {
            return Err(RejectionKind::MaxTradesReached { position_type, max });
        }
        Ok(())
    }

    fn validate_exit<'m>(
        meta: &'m MetaData,
        config: &Config,
        strategy_id: &str,
        symbol: &Symbol,
        position_type: Option<PositionType>,
        is_auto: bool,
        exit_price: Decimal,
    ) -> Result<&'m TradeOpen, RejectionKind> {
        let trade = match position_type {
            Some(pt) => meta.find_open_trade(strategy_id, symbol, pt),
            None => meta
                .trades_open
                .iter()
                .find(|t| t.strategy_id == strategy_id && &t.symbol == symbol),
        }
        .ok_or_else(|| RejectionKind::NoMatchingOpenTrade {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.clone(),
            position_type,
        })?;
        if meta.trades_closing.contains(&trade.id) {
            return Err(RejectionKind::AlreadyClosing {
                trade_id: trade.id.to_string(),
            });
        }
        if is_auto {
            if trade.is_stopped {
                return Err(RejectionKind::TradeStopped {
                    trade_id: trade.id.to_string(),
                });
            }
            if trade.is_hodl {
                let (buy, sell) = match trade.position_type {
                    PositionType::Long => (trade.price_buy.unwrap_or(exit_price), exit_price),
                    PositionType::Short => (exit_price, trade.price_sell.unwrap_or(exit_price)),
                };
                let pnl = calculate_pnl(buy, sell, config.taker_fee_percent);
                if pnl < Decimal::ZERO {
                    return Err(RejectionKind::HodlAtLoss {
                        trade_id: trade.id.to_string(),
                    });
                }
            }
        }
        Ok(trade)
    }

    // ---------------------------------------------------------------
    // Entry pipeline (spec.md §4.1 "createTradeOpen")
    // ---------------------------------------------------------------

    async fn handle_enter(&self, signal: Signal, action: Action) -> Result<(), EngineError> {
        let position_type = signal.position_type.expect("enter signal always classifies a position");
        let mut meta = self.0.meta.lock().await;
        Self::validate_enter(&meta, &self.0.config, &signal.strategy_id, &signal.symbol, position_type)?;

        let strategy = meta.strategies.get(signal.strategy_id.as_str()).expect("validated above").clone();
        let trade = self.create_trade_open(&mut meta, &strategy, &signal, position_type).await?;
        let trade_id = trade.id.clone();
        let quote = meta.markets.get(&trade.symbol).map(|m| m.quote.clone()).unwrap_or_else(|| Asset::new(trade.symbol.as_str()));
        meta.push_trade(trade);
        let open_trades = meta.total_open_trade_count(position_type);
        meta.balance_history.record_open(strategy.trading_mode, &quote, Utc::now(), open_trades);
        meta.mark_dirty(SnapshotKey::TradesOpen);
        meta.mark_dirty(SnapshotKey::BalanceHistory);
        drop(meta);
        self.schedule_flush();

        let hub_action = match action {
            Action::Buy => HubAction::Buy,
            Action::Sell => HubAction::Sell,
        };
        self.enqueue_execute(trade_id, AckPolicy::Notify(hub_action));
        Ok(())
    }

    /// Builds the funding/sizing decision and the `TradeOpen` record, but
    /// does not push it to `meta.trades_open` or enqueue it — the caller
    /// does that while still holding the lock, per §3 Lifecycle step 1:
    /// "pushed to open-trade list before queue execution".
    async fn create_trade_open(
        &self,
        meta: &mut MetaData,
        strategy: &Strategy,
        signal: &Signal,
        position_type: PositionType,
    ) -> Result<TradeOpen, EngineError> {
        let market = meta
            .markets
            .get(&signal.symbol)
            .cloned()
            .ok_or_else(|| RejectionKind::SymbolExcluded(signal.symbol.clone()))?;

        if position_type == PositionType::Short {
            let free = self.exchange_free(meta, strategy.trading_mode, Wallet::Margin, &market.quote).await;
            let wallet_data = wallet::compute_wallet_data(meta, Wallet::Margin, &market.quote, free);
            let buffered = wallet_data.buffered(self.0.config.wallet_buffer);
            let (quantity, cost) = self.initial_size(strategy, &market, signal.price, buffered.total);
            market
                .validate_trade_size(quantity, cost, self.0.config.min_cost_buffer)
                .map_err(RejectionKind::from)?;
            let trade = TradeOpen::new_entry(
                TradeId::derive(&signal.strategy_id, &signal.symbol, position_type, signal.timestamp.timestamp_nanos_opt().unwrap_or_default()),
                signal.strategy_id.clone(),
                signal.strategy_name.clone(),
                signal.symbol.clone(),
                position_type,
                strategy.trading_mode,
                Wallet::Margin,
                quantity,
                cost,
                quantity,
                signal.price,
                signal.timestamp,
            );
            return Ok(trade);
        }

        // Long: build the ordered wallet candidate list (spec.md §4.1 step 1).
        let primary = self.0.config.primary_wallet;
        let mut wallet_candidates = vec![primary];
        let other = primary.other();
        if market.supports(other) && (other != Wallet::Margin || self.0.config.is_trade_margin_enabled) {
            wallet_candidates.push(other);
        }
        wallet_candidates.retain(|w| market.supports(*w) && (*w != Wallet::Margin || self.0.config.is_trade_margin_enabled));
        if wallet_candidates.is_empty() {
            return Err(RejectionKind::SymbolExcluded(signal.symbol.clone()).into());
        }

        if self.0.config.is_funds_no_loss {
            self.refresh_prices_if_stale(meta).await?;
        }

        let mut wallet_data_by_wallet: HashMap<Wallet, WalletData> = HashMap::new();
        for w in &wallet_candidates {
            let free = self.exchange_free(meta, strategy.trading_mode, *w, &market.quote).await;
            let data = wallet::compute_wallet_data(meta, *w, &market.quote, free);
            wallet_data_by_wallet.insert(*w, data);
        }

        let (desired_qty, desired_cost) = self.initial_size(
            strategy,
            &market,
            signal.price,
            wallet_data_by_wallet.get(&primary).map(|d| d.total).unwrap_or(Decimal::ZERO),
        );
        let _ = desired_qty;

        let snapshots: Vec<WalletSnapshot<TradeId>> = wallet_candidates
            .iter()
            .map(|w| {
                let data = &wallet_data_by_wallet[w];
                let buffered = data.buffered(self.0.config.wallet_buffer);
                let candidates = self.rebalance_candidates(meta, &market, &buffered, signal.timestamp);
                WalletSnapshot::new(*w, buffered.free, candidates)
            })
            .collect();

        let min_cost = market.min_cost_with_buffer(self.0.config.min_cost_buffer);
        let outcome = executor_risk::funding::plan_long_funding(
            self.0.config.trade_long_funds,
            desired_cost,
            min_cost,
            primary,
            &snapshots,
            self.0.config.taker_fee_percent,
        )
        .map_err(|rejected| RejectionKind::FundingRejected {
            available: rejected.available,
            required: rejected.required,
        })?;

        for instruction in &outcome.rebalance {
            self.apply_rebalance(meta, &market, instruction.id.clone(), instruction.target_cost, signal.timestamp)
                .await?;
        }

        let (quantity, cost) = market.legal_qty_for_cost(outcome.cost / signal.price, signal.price, self.0.config.min_cost_buffer);
        if cost <= Decimal::ZERO {
            return Err(RejectionKind::InvalidCost { entry_type: EntryType::Enter }.into());
        }
        market.validate_trade_size(quantity, cost, self.0.config.min_cost_buffer).map_err(RejectionKind::from)?;

        Ok(TradeOpen::new_entry(
            TradeId::derive(&signal.strategy_id, &signal.symbol, position_type, signal.timestamp.timestamp_nanos_opt().unwrap_or_default()),
            signal.strategy_id.clone(),
            signal.strategy_name.clone(),
            signal.symbol.clone(),
            position_type,
            strategy.trading_mode,
            outcome.wallet,
            quantity,
            cost,
            outcome.borrow,
            signal.price,
            signal.timestamp,
        ))
    }

    /// `spec.md` §4.1 step 3: tradeAmount interpreted as a fraction of the
    /// primary wallet's total when `IS_BUY_QTY_FRACTION`, else as an absolute
    /// quote-asset cost; snapped to legal quantity/min-cost.
    fn initial_size(&self, strategy: &Strategy, market: &executor_instrument::Market, price: Decimal, wallet_total: Decimal) -> (Decimal, Decimal) {
        let raw_cost = if self.0.config.is_buy_qty_fraction {
            wallet_total * strategy.trade_amount
        } else {
            strategy.trade_amount
        };
        let raw_qty = if price > Decimal::ZERO { raw_cost / price } else { Decimal::ZERO };
        market.legal_qty_for_cost(raw_qty, price, self.0.config.min_cost_buffer)
    }

    /// The exchange- or virtual-ledger-reported free balance the Wallet
    /// Model composes with the open-trade ledger (`spec.md` §4.3). Virtual
    /// wallets are seeded on first touch and read from `meta.virtual_balances`
    /// (`spec.md` §4.5); real wallets are fetched live from the gateway's
    /// balance cache, which is free to serve a stale cached value per its own
    /// TTL (`spec.md` §5 "Shared-resource policy").
    async fn exchange_free(&self, meta: &mut MetaData, trading_mode: TradingMode, wallet: Wallet, quote: &Asset) -> Decimal {
        match trading_mode {
            TradingMode::Virtual => {
                virtual_ledger::seed_virtual_wallet(meta, &self.0.config, wallet, quote);
                meta.virtual_balances
                    .get(&wallet)
                    .and_then(|by_asset| by_asset.get(quote))
                    .copied()
                    .unwrap_or(Decimal::ZERO)
            }
            TradingMode::Real => match self.0.gateway.fetch_balance(wallet).await {
                Ok(balances) => balances.get(quote).map(|b| b.free).unwrap_or(Decimal::ZERO),
                Err(error) => {
                    tracing::warn!(%error, ?wallet, quote = %quote, "fetch_balance failed while sizing a trade, treating free balance as zero");
                    Decimal::ZERO
                }
            },
        }
    }

    fn rebalance_candidates(
        &self,
        meta: &MetaData,
        market: &executor_instrument::Market,
        wallet_data: &WalletData,
        now: chrono::DateTime<Utc>,
    ) -> Vec<RebalanceCandidate<TradeId>> {
        wallet_data
            .candidates
            .iter()
            .filter_map(|id| {
                let trade = meta.find_trade_by_id(id)?;
                if trade.is_stopped {
                    return None;
                }
                if trade.is_hodl && !self.0.config.is_funds_no_loss {
                    return None;
                }
                if trade.quantity < Decimal::TWO * market.limits.amount_min
                    || trade.cost < Decimal::TWO * market.limits.cost_min
                {
                    return None;
                }
                let sell_price = meta.prices.get(&trade.symbol).copied().unwrap_or_else(|| trade.price_buy.unwrap_or(Decimal::ZERO));
                let price_buy = trade.price_buy.unwrap_or(sell_price);
                if trade.is_hodl && self.0.config.is_funds_no_loss {
                    let pnl = calculate_pnl(price_buy, sell_price, self.0.config.taker_fee_percent);
                    if pnl < Decimal::ZERO {
                        return None;
                    }
                }
                let _ = now;
                Some(RebalanceCandidate::new(trade.id.clone(), trade.cost, price_buy, sell_price))
            })
            .collect()
    }

    async fn refresh_prices_if_stale(&self, meta: &mut MetaData) -> Result<(), EngineError> {
        let stale = meta
            .prices_fetched_at
            .is_none_or(|fetched| Utc::now() - fetched > PRICE_CACHE_TTL);
        if !stale {
            return Ok(());
        }
        let prices = self.0.gateway.load_prices().await?;
        meta.prices = prices;
        meta.prices_fetched_at = Some(Utc::now());
        Ok(())
    }

    /// Apply one rebalance instruction (`spec.md` §4.1 step 4, §4.3
    /// "Rebalance sub-trade"): if the target is already executed, plan and
    /// enqueue a child sell; if not yet executed, shrink it in place.
    async fn apply_rebalance(
        &self,
        meta: &mut MetaData,
        market: &executor_instrument::Market,
        target_id: TradeId,
        target_cost: Decimal,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(trade) = meta.find_trade_by_id(&target_id) else {
            return Ok(());
        };
        if !trade.is_executed {
            let mut trade = trade.clone();
            let sell_price = meta.prices.get(&trade.symbol).copied().unwrap_or_else(|| trade.price_buy.unwrap_or(Decimal::ZERO));
            if let Ok(split) = plan_rebalance_split(market, trade.quantity, trade.cost, target_cost, sell_price) {
                trade.quantity -= split.diff_quantity;
                trade.cost -= split.diff_cost;
                trade.time_updated = now;
                if let Some(slot) = meta.find_trade_by_id_mut(&target_id) {
                    *slot = trade;
                    meta.mark_dirty(SnapshotKey::TradesOpen);
                }
            }
            return Ok(());
        }

        meta.trades_closing.insert(target_id.clone());
        self.enqueue_rebalance_child(target_id, target_cost);
        Ok(())
    }

    fn enqueue_rebalance_child(&self, parent_id: TradeId, target_cost: Decimal) {
        let engine = self.clone();
        let _ = self.0.queue.enqueue(move || async move {
            engine.run_rebalance_child(parent_id, target_cost).await;
        });
    }

    async fn run_rebalance_child(&self, parent_id: TradeId, target_cost: Decimal) {
        let mut meta = self.0.meta.lock().await;
        let Some(trade) = meta.find_trade_by_id(&parent_id).cloned() else {
            meta.trades_closing.remove(&parent_id);
            return;
        };
        let Some(market) = meta.markets.get(&trade.symbol).cloned() else {
            meta.trades_closing.remove(&parent_id);
            return;
        };
        let sell_price = meta.prices.get(&trade.symbol).copied().unwrap_or_else(|| trade.price_buy.unwrap_or(Decimal::ZERO));
        let split = match plan_rebalance_split(&market, trade.quantity, trade.cost, target_cost, sell_price) {
            Ok(split) => split,
            Err(_) => {
                meta.trades_closing.remove(&parent_id);
                return;
            }
        };
        drop(meta);

        let result = self
            .0
            .gateway
            .create_market_order(&trade.symbol, Side::Sell, split.diff_quantity, trade.wallet)
            .await;

        let mut meta = self.0.meta.lock().await;
        meta.trades_closing.remove(&parent_id);
        let mut transaction = None;
        match result {
            Ok(order) if order.is_filled() => {
                if let Some(slot) = meta.find_trade_by_id_mut(&parent_id) {
                    slot.quantity -= split.diff_quantity;
                    slot.cost = slot.quantity * order.price;
                    slot.price_sell = Some(order.price);
                    slot.time_updated = Utc::now();
                }
                transaction = Some(Transaction::new(parent_id.clone(), TransactionKind::Sell, market.quote.clone(), order.cost, Utc::now()));
                meta.mark_dirty(SnapshotKey::TradesOpen);
            }
            _ => {
                tracing::warn!(trade_id = %parent_id, "rebalance child sell failed, parent left unchanged");
            }
        }
        drop(meta);
        if let Some(transaction) = transaction {
            self.record_transaction(transaction).await;
        }
        self.schedule_flush();
    }

    // ---------------------------------------------------------------
    // Exit pipeline (spec.md §4.1 "Exit pipeline")
    // ---------------------------------------------------------------

    async fn handle_exit(&self, signal: Signal, is_auto: bool) -> Result<(), EngineError> {
        let mut meta = self.0.meta.lock().await;
        let trade = Self::validate_exit(
            &meta,
            &self.0.config,
            &signal.strategy_id,
            &signal.symbol,
            signal.position_type,
            is_auto,
            signal.price,
        )?
        .clone();

        meta.trades_closing.insert(trade.id.clone());
        if let Some(slot) = meta.find_trade_by_id_mut(&trade.id) {
            match slot.position_type {
                PositionType::Long => slot.price_sell = Some(signal.price),
                PositionType::Short => slot.price_buy = Some(signal.price),
            }
            slot.time_updated = Utc::now();
        }
        meta.mark_dirty(SnapshotKey::TradesOpen);
        drop(meta);
        self.schedule_flush();

        let hub_action = match trade.position_type {
            PositionType::Long => HubAction::Sell,
            PositionType::Short => HubAction::Buy,
        };
        self.enqueue_execute(trade.id, AckPolicy::Notify(hub_action));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Execute task (spec.md §4.1 "Execute task")
    // ---------------------------------------------------------------

    fn enqueue_execute(&self, trade_id: TradeId, ack: AckPolicy) {
        let engine = self.clone();
        let _ = self.0.queue.enqueue(move || async move {
            engine.run_execute_sequence(trade_id, ack).await;
        });
    }

    /// before (borrow) -> main (order) -> after (repay), with compensation
    /// on partial failure (`spec.md` §4.1 "Execute task", §9 "Promise
    /// chains → linear task bodies").
    async fn run_execute_sequence(&self, trade_id: TradeId, ack: AckPolicy) {
        let span = tracing::info_span!("execute_task", trade_id = %trade_id);
        let _entered = span.enter();

        let mut meta = self.0.meta.lock().await;
        let Some(trade) = meta.find_trade_by_id(&trade_id).cloned() else {
            return;
        };
        let is_new_entry = !meta.trades_closing.contains(&trade_id);
        let is_exit = meta.trades_closing.contains(&trade_id);
        drop(meta);

        let side = match (trade.position_type, is_exit) {
            (PositionType::Long, false) => Side::Buy,
            (PositionType::Long, true) => Side::Sell,
            (PositionType::Short, false) => Side::Sell,
            (PositionType::Short, true) => Side::Buy,
        };
        let needs_borrow = !is_exit && trade.borrow > Decimal::ZERO;
        let needs_repay = is_exit && trade.requires_repay_on_exit();

        // before: borrow whatever funds the entry (base for a short, quote
        // for a margin-funded long) ahead of the order (`spec.md` §3 "at
        // entry a borrow step precedes the order").
        if needs_borrow {
            let asset = self.borrow_asset(&trade).await;
            if trade.trading_type == TradingMode::Real {
                if let Err(error) = self.0.gateway.margin_borrow(&asset, trade.borrow).await {
                    tracing::warn!(%error, "borrow step failed, aborting before the order");
                    self.drop_or_restore(&trade, is_new_entry).await;
                    return;
                }
            }
            let mut meta = self.0.meta.lock().await;
            if trade.trading_type == TradingMode::Virtual {
                virtual_ledger::apply_borrow(&mut meta, trade.wallet, &asset, trade.borrow);
                meta.mark_dirty(SnapshotKey::VirtualBalances);
            }
            drop(meta);
            self.record_transaction(Transaction::new(trade_id.clone(), TransactionKind::Borrow, asset, trade.borrow, Utc::now())).await;
        }

        // main: the market order itself.
        let order = if trade.trading_type == TradingMode::Virtual {
            self.virtual_order(&trade, side).await
        } else {
            self.0
                .gateway
                .create_market_order(&trade.symbol, side, trade.quantity, trade.wallet)
                .await
        };

        let order = match order {
            Ok(order) if order.is_filled() => order,
            Ok(_) | Err(_) => {
                if let Err(error) = &order {
                    if !error.is_nothing_done() {
                        self.force_stop(&trade_id, "main order returned a partial effect").await;
                        return;
                    }
                }
                tracing::warn!(trade_id = %trade_id, "main order step did nothing, unwinding");
                self.drop_or_restore(&trade, is_new_entry).await;
                return;
            }
        };

        self.reconcile_fill(&trade_id, &trade, &order, is_exit).await;

        let quote = self.quote_asset(&trade).await;
        self.record_transaction(Transaction::new(
            trade_id.clone(),
            match side {
                Side::Buy => TransactionKind::Buy,
                Side::Sell => TransactionKind::Sell,
            },
            quote.clone(),
            order.cost,
            Utc::now(),
        ))
        .await;

        if trade.trading_type == TradingMode::Virtual {
            let base = self.base_asset(&trade).await;
            let mut meta = self.0.meta.lock().await;
            virtual_ledger::apply_fill(&mut meta, trade.wallet, &base, &quote, side, order.quantity, order.cost);
            meta.mark_dirty(SnapshotKey::VirtualBalances);
            drop(meta);
        }

        // after: repay on exit of a borrowed trade, mirroring whichever
        // asset the entry borrowed (`spec.md` §8 P2 "matching borrow and
        // repay ... with equal asset").
        if needs_repay {
            let asset = self.borrow_asset(&trade).await;
            let repay_amount = trade.borrow;
            if trade.trading_type == TradingMode::Real {
                match self.0.gateway.margin_repay(&asset, repay_amount).await {
                    Ok(_) => {
                        self.record_transaction(Transaction::new(trade_id.clone(), TransactionKind::Repay, asset, repay_amount, Utc::now())).await;
                    }
                    Err(error) => {
                        tracing::error!(%error, trade_id = %trade_id, "repay failed after main order succeeded");
                        self.force_stop(&trade_id, "repay failed after a successful close").await;
                        self.notify(Notification::error(
                            "partial_sequence",
                            "trade stopped: repay failed",
                            format!("trade {trade_id} closed on the exchange but repay failed; operator must reconcile."),
                        ))
                        .await;
                        self.schedule_flush();
                        return;
                    }
                }
            } else {
                let mut meta = self.0.meta.lock().await;
                virtual_ledger::apply_repay(&mut meta, trade.wallet, &asset, repay_amount);
                meta.mark_dirty(SnapshotKey::VirtualBalances);
                drop(meta);
                self.record_transaction(Transaction::new(trade_id.clone(), TransactionKind::Repay, asset, repay_amount, Utc::now())).await;
            }
        }

        if is_exit {
            self.post_trade_accounting(&trade_id).await;
            let mut meta = self.0.meta.lock().await;
            meta.remove_trade(&trade_id);
            meta.trades_closing.remove(&trade_id);
            drop(meta);
        } else {
            let mut meta = self.0.meta.lock().await;
            if let Some(slot) = meta.find_trade_by_id_mut(&trade_id) {
                slot.is_executed = true;
            }
            meta.mark_dirty(SnapshotKey::TradesOpen);
            drop(meta);
        }

        if let AckPolicy::Notify(action) = ack {
            let _ = self
                .0
                .hub
                .ack_traded(TradedAck {
                    action,
                    symbol: trade.symbol.clone(),
                    strategy_id: trade.strategy_id.clone(),
                    strategy_name: trade.strategy_name.clone(),
                    quantity: trade.quantity,
                    trading_type: trade.trading_type,
                })
                .await;
        }

        if trade.trading_type == TradingMode::Real {
            self.check_bnb_threshold().await;
        }
        self.schedule_flush();
    }

    async fn base_asset(&self, trade: &TradeOpen) -> Asset {
        let meta = self.0.meta.lock().await;
        meta.markets.get(&trade.symbol).map(|m| m.base.clone()).unwrap_or_else(|| Asset::new(trade.symbol.as_str()))
    }

    /// The asset a margin-funded trade borrows: base for a short (sold to
    /// open), quote for a long funded by `borrow-min`/`borrow-all`
    /// (`spec.md` §4.3 funding policies, `funding.rs::plan_borrow`).
    async fn borrow_asset(&self, trade: &TradeOpen) -> Asset {
        match trade.position_type {
            PositionType::Short => self.base_asset(trade).await,
            PositionType::Long => self.quote_asset(trade).await,
        }
    }

    async fn quote_asset(&self, trade: &TradeOpen) -> Asset {
        let meta = self.0.meta.lock().await;
        meta.markets.get(&trade.symbol).map(|m| m.quote.clone()).unwrap_or_else(|| Asset::new("USDT"))
    }

    async fn virtual_order(&self, trade: &TradeOpen, side: Side) -> Result<executor_execution::OrderResult, executor_execution::ExecutionError> {
        let meta = self.0.meta.lock().await;
        let ticker = self.0.gateway.fetch_ticker(&trade.symbol).await?;
        let price = match side {
            Side::Buy => ticker.ask,
            Side::Sell => ticker.bid,
        };
        let price = if price > Decimal::ZERO {
            price
        } else {
            match side {
                Side::Buy => trade.price_buy.unwrap_or_default(),
                Side::Sell => trade.price_sell.unwrap_or_default(),
            }
        };
        drop(meta);
        Ok(executor_execution::OrderResult::new(executor_execution::OrderStatus::Closed, price, trade.quantity * price, trade.quantity))
    }

    /// Copy the realised fill price/cost back onto the trade (and, for a
    /// rebalance parent, onward) per `spec.md` §4.1 "On the main order
    /// result the engine reconciles slippage".
    async fn reconcile_fill(&self, trade_id: &TradeId, _trade: &TradeOpen, order: &executor_execution::OrderResult, is_exit: bool) {
        let mut meta = self.0.meta.lock().await;
        if let Some(slot) = meta.find_trade_by_id_mut(trade_id) {
            match (slot.position_type, is_exit) {
                (PositionType::Long, false) => slot.price_buy = Some(order.price),
                (PositionType::Long, true) => slot.price_sell = Some(order.price),
                (PositionType::Short, false) => slot.price_sell = Some(order.price),
                (PositionType::Short, true) => slot.price_buy = Some(order.price),
            }
            slot.cost = order.cost;
            slot.time_updated = Utc::now();
        }
        meta.mark_dirty(SnapshotKey::TradesOpen);
    }

    /// `spec.md` §4.1 "if the main fails with nothing done": drop a
    /// never-acknowledged new entry, or restore a rebalance parent's moved
    /// quantity/cost.
    async fn drop_or_restore(&self, trade: &TradeOpen, is_new_entry: bool) {
        let mut meta = self.0.meta.lock().await;
        if is_new_entry && !trade.is_executed {
            meta.remove_trade(&trade.id);
        }
        meta.trades_closing.remove(&trade.id);
        drop(meta);
        self.schedule_flush();
    }

    async fn force_stop(&self, trade_id: &TradeId, reason: &str) {
        let mut meta = self.0.meta.lock().await;
        if let Some(slot) = meta.find_trade_by_id_mut(trade_id) {
            slot.is_stopped = true;
            slot.time_updated = Utc::now();
        }
        meta.trades_closing.remove(trade_id);
        meta.mark_dirty(SnapshotKey::TradesOpen);
        drop(meta);
        self.notify(Notification::error("partial_sequence", "trade has been stopped", reason.to_string())).await;
        self.schedule_flush();
    }

    async fn notify(&self, notification: Notification) {
        self.0.notifier.notify(notification).await;
    }

    /// Append `transaction` to both the in-memory capped ring (`meta.transactions`,
    /// used by the diagnostics surface) and the durable append-only log
    /// (`spec.md` §2 "State Store", §8 P2), without holding the meta lock
    /// across the store call.
    async fn record_transaction(&self, transaction: Transaction) {
        let mut meta = self.0.meta.lock().await;
        meta.push_transaction(transaction.clone());
        drop(meta);
        if let Err(error) = self.0.store.append_transaction(transaction).await {
            tracing::error!(%error, "failed to durably append transaction log entry");
        }
    }

    // ---------------------------------------------------------------
    // Post-trade accounting (spec.md §4.1)
    // ---------------------------------------------------------------

    async fn post_trade_accounting(&self, trade_id: &TradeId) {
        let mut meta = self.0.meta.lock().await;
        let Some(trade) = meta.find_trade_by_id(trade_id).cloned() else {
            return;
        };
        if !trade.is_round_trip_complete() {
            return;
        }
        let Some(change) = trade.realized_change() else { return };
        let fee = -(trade.cost * self.0.config.taker_fee_percent / Decimal::ONE_HUNDRED);
        let is_loss = change < Decimal::ZERO;

        if let Some(strategy) = meta.strategies.get_mut(trade.strategy_id.as_str()) {
            strategy.record_trade_result(is_loss, self.0.config.strategy_loss_limit);
        }
        meta.mark_dirty(SnapshotKey::Strategies);

        let quote = meta.markets.get(&trade.symbol).map(|m| m.quote.clone()).unwrap_or_else(|| Asset::new("USDT"));
        let open_trades = meta.total_open_trade_count(trade.position_type);
        meta.balance_history.record_close(trade.trading_type, &quote, Utc::now(), open_trades, fee, change);
        meta.balance_history.apply_retention(Utc::now());
        meta.mark_dirty(SnapshotKey::BalanceHistory);
    }

    async fn check_bnb_threshold(&self) {
        let Some(bnb) = self.0.config.bnb_auto_top_up.as_deref() else {
            return;
        };
        let asset = Asset::new(bnb);
        let balances = match self.0.gateway.fetch_balance(Wallet::Spot).await {
            Ok(balances) => balances,
            Err(_) => return,
        };
        let free = balances.get(&asset).map(|b| b.free).unwrap_or(Decimal::ZERO);
        let mut state = self.0.bnb_state.lock();
        let (next, notification) = bnb_transition(*state, free, self.0.config.bnb_free_threshold);
        *state = next;
        drop(state);
        if let Some(notification) = notification {
            self.notify(notification).await;
        }
    }

    // ---------------------------------------------------------------
    // Background loop hooks (spec.md §5 "Background loop")
    // ---------------------------------------------------------------

    /// Reload the market map and stop any open trade whose market has since
    /// gone inactive (`spec.md` §5: "24h market refresh, triggering a
    /// validity sweep").
    pub async fn background_refresh_markets(&self) -> Result<(), EngineError> {
        let markets = self.0.gateway.load_markets(true).await?;
        let mut meta = self.0.meta.lock().await;
        meta.markets = markets;
        let stale_ids: Vec<TradeId> = meta
            .trades_open
            .iter()
            .filter(|t| meta.markets.get(&t.symbol).map(|m| !m.active).unwrap_or(true))
            .map(|t| t.id.clone())
            .collect();
        drop(meta);
        for id in stale_ids {
            self.force_stop(&id, "symbol no longer active after a market refresh").await;
        }
        Ok(())
    }

    /// If `IS_AUTO_CLOSE_ENABLED`, refresh prices and synthesize an exit
    /// signal for every hodl'd or stopped-strategy trade that would now
    /// close at a non-negative PnL (`spec.md` §5, §9).
    pub async fn background_auto_close_sweep(&self) {
        if !self.0.config.is_auto_close_enabled {
            return;
        }
        let prices = match self.0.gateway.load_prices().await {
            Ok(prices) => prices,
            Err(error) => {
                tracing::warn!(%error, "auto-close price refresh failed");
                return;
            }
        };

        let mut meta = self.0.meta.lock().await;
        meta.prices = prices.clone();
        meta.prices_fetched_at = Some(Utc::now());
        let candidates: Vec<Signal> = meta
            .trades_open
            .iter()
            .filter(|t| {
                !meta.trades_closing.contains(&t.id)
                    && (t.is_hodl || meta.strategies.get(t.strategy_id.as_str()).is_some_and(|s| s.stopped))
            })
            .filter_map(|t| {
                let price = *prices.get(&t.symbol)?;
                let (buy, sell) = match t.position_type {
                    PositionType::Long => (t.price_buy.unwrap_or(price), price),
                    PositionType::Short => (price, t.price_sell.unwrap_or(price)),
                };
                let pnl = calculate_pnl(buy, sell, self.0.config.taker_fee_percent);
                (pnl >= Decimal::ZERO).then(|| {
                    Signal::exit(t.strategy_id.clone(), t.strategy_name.clone(), t.symbol.clone(), Some(t.position_type), price, Utc::now())
                })
            })
            .collect();
        drop(meta);

        for signal in candidates {
            if let Err(error) = self.handle_exit(signal, true).await {
                tracing::debug!(%error, "auto-close sweep signal rejected");
            }
        }
    }

    // ---------------------------------------------------------------
    // Strategy cross-check throttle (spec.md §4.1 onStrategyList)
    // ---------------------------------------------------------------

    async fn throttled_cross_check(&self, strategy_ids: Vec<SmolStr>) {
        let due: Vec<SmolStr> = {
            let mut last = self.0.last_cross_check.lock();
            let now = Instant::now();
            strategy_ids
                .into_iter()
                .filter(|id| {
                    let due = last.get(id).is_none_or(|t| now.duration_since(*t) >= CROSS_CHECK_THROTTLE);
                    if due {
                        last.insert(id.clone(), now);
                    }
                    due
                })
                .collect()
        };
        for strategy_id in due {
            let Ok(hub_trades) = self.0.hub.fetch_strategy_open_trades(&strategy_id).await else {
                continue;
            };
            let mut meta = self.0.meta.lock().await;
            for hub_trade in hub_trades {
                if let Some(slot) = meta.find_open_trade_mut(&hub_trade.strategy_id, &hub_trade.symbol, hub_trade.position_type) {
                    if hub_trade.is_stopped && !slot.is_stopped {
                        slot.is_stopped = true;
                        slot.time_updated = Utc::now();
                    }
                }
            }
            meta.mark_dirty(SnapshotKey::TradesOpen);
        }
    }
}
