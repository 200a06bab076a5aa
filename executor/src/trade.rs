use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use executor_instrument::{Symbol, TradingMode, Wallet};
use md5::{Digest, Md5};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::signal::PositionType;

/// Engine-generated short trade identifier: a 12 hex-character md5 digest
/// prefix (`spec.md` §3 `TradeOpen` "Identity").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct TradeId(pub SmolStr);

impl TradeId {
    /// Derive a `TradeId` from the trade's own coordinates plus a
    /// caller-supplied nonce (typically the signal timestamp in
    /// nanoseconds), so two signals for the same `(strategy, symbol,
    /// position)` landing at different instants never collide.
    pub fn derive(
        strategy_id: &str,
        symbol: &Symbol,
        position_type: PositionType,
        nonce: i64,
    ) -> Self {
        let mut hasher = Md5::new();
        hasher.update(strategy_id.as_bytes());
        hasher.update(symbol.as_str().as_bytes());
        hasher.update(position_type.to_string().as_bytes());
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let hex = hex::encode(digest);
        Self(SmolStr::new(&hex[..12]))
    }
}

/// The engine's record of a live position (`spec.md` §3 `TradeOpen`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct TradeOpen {
    pub id: TradeId,
    pub strategy_id: SmolStr,
    pub strategy_name: SmolStr,
    pub symbol: Symbol,
    pub position_type: PositionType,
    pub trading_type: TradingMode,
    pub wallet: Wallet,
    pub quantity: Decimal,
    pub cost: Decimal,
    /// Base (short) or quote (long) amount borrowed; zero means unfunded by
    /// margin (`spec.md` §3 Invariants).
    pub borrow: Decimal,
    pub price_buy: Option<Decimal>,
    pub price_sell: Option<Decimal>,
    pub time_buy: Option<DateTime<Utc>>,
    pub time_sell: Option<DateTime<Utc>>,
    pub time_updated: DateTime<Utc>,
    pub is_stopped: bool,
    pub is_hodl: bool,
    pub is_executed: bool,
}

impl TradeOpen {
    /// A brand-new, not-yet-executed long or short entry (`spec.md` §3
    /// Lifecycle step 1: "Created on validated enter signal").
    pub fn new_entry(
        id: TradeId,
        strategy_id: SmolStr,
        strategy_name: SmolStr,
        symbol: Symbol,
        position_type: PositionType,
        trading_type: TradingMode,
        wallet: Wallet,
        quantity: Decimal,
        cost: Decimal,
        borrow: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let (price_buy, price_sell) = match position_type {
            PositionType::Long => (Some(price), None),
            PositionType::Short => (None, Some(price)),
        };
        Self {
            id,
            strategy_id,
            strategy_name,
            symbol,
            position_type,
            trading_type,
            wallet,
            quantity,
            cost,
            borrow,
            price_buy,
            price_sell,
            time_buy: matches!(position_type, PositionType::Long).then_some(now),
            time_sell: matches!(position_type, PositionType::Short).then_some(now),
            time_updated: now,
            is_stopped: false,
            is_hodl: false,
            is_executed: false,
        }
    }

    pub fn key(&self) -> (SmolStr, Symbol, PositionType) {
        (self.strategy_id.clone(), self.symbol.clone(), self.position_type)
    }

    pub fn requires_repay_on_exit(&self) -> bool {
        self.borrow > Decimal::ZERO
    }

    /// `true` once both entry and exit prices are known, i.e. the trade has
    /// both been filled and is being closed (`spec.md` §4.1 "Post-trade
    /// accounting": "this was an exit (not a mid-trade enter)").
    pub fn is_round_trip_complete(&self) -> bool {
        self.price_buy.is_some() && self.price_sell.is_some()
    }

    /// Signed quantity-weighted change in quote terms, if both legs are
    /// known (`spec.md` §4.1 post-trade accounting:
    /// `quantity * (priceSell - priceBuy)`).
    pub fn realized_change(&self) -> Option<Decimal> {
        let (buy, sell) = (self.price_buy?, self.price_sell?);
        Some(self.quantity * (sell - buy))
    }
}
