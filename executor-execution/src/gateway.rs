use crate::error::ExecutionError;
use async_trait::async_trait;
use derive_more::{Constructor, Display};
use executor_instrument::{Asset, Market, Symbol, Wallet};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Market order side.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// Best bid/ask snapshot (`spec.md` §4.7 `fetchTicker`).
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Outcome of a `marginBorrow`/`marginRepay` call; absence of an id is a failure
/// per §4.7.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct TransactionId(pub String);

/// Exchange-reported status of a placed order. Only `Closed` counts as filled.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Closed,
    Open,
    Canceled,
    Rejected,
}

/// Result of `createMarketOrder` (§4.7): the realised fill price and cost,
/// used to reconcile slippage back onto the `TradeOpen` (§4.1 "Execute task").
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub price: Decimal,
    pub cost: Decimal,
    pub quantity: Decimal,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Closed)
    }
}

/// Typed façade over the exchange (`spec.md` §4.7).
///
/// Implementations own the balance cache described in §5: every mutating
/// call (`create_market_order`, `margin_borrow`, `margin_repay`) must
/// invalidate the cache for the affected wallet both before and after the
/// call, and honour `BALANCE_SYNC_DELAY` before the next `fetch_balance`
/// returns fresh data.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Load (or, if `force`, reload) the full market map, enriched with the
    /// cross-margin-allowed flag.
    async fn load_markets(&self, force: bool) -> Result<IndexMap<Symbol, Market>, ExecutionError>;

    /// Load the latest mid/last price per symbol (cache TTL 60s is the
    /// caller's responsibility per §4.1 step 4's `IS_FUNDS_NO_LOSS` refresh).
    async fn load_prices(&self) -> Result<HashMap<Symbol, Decimal>, ExecutionError>;

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExecutionError>;

    /// Balance for a wallet, keyed by asset. Margin balances additionally
    /// report what is borrowed/accruing interest.
    async fn fetch_balance(
        &self,
        wallet: Wallet,
    ) -> Result<HashMap<Asset, crate::balance::Balance>, ExecutionError>;

    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: Decimal,
        wallet: Wallet,
    ) -> Result<OrderResult, ExecutionError>;

    async fn margin_borrow(
        &self,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<TransactionId, ExecutionError>;

    async fn margin_repay(
        &self,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<TransactionId, ExecutionError>;

    /// Apply step size and precision to `qty` for `symbol` (§4.7).
    async fn amount_to_precision(
        &self,
        symbol: &Symbol,
        qty: Decimal,
    ) -> Result<Decimal, ExecutionError>;
}
