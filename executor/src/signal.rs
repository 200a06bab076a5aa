use chrono::{DateTime, Utc};
use derive_more::Display;
use executor_instrument::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Whether a signal is opening or closing a position (`spec.md` §3 `Signal`).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Enter,
    Exit,
}

/// Long or short (`spec.md` §3 `TradeOpen`).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    Long,
    Short,
}

/// The raw action a hub event names (`buy` or `sell`); combined with the
/// event's own `entryType` to classify the resulting [`PositionType`]
/// (`spec.md` §4.1 `onBuySignal`/`onSellSignal`: "buy+enter=long,
/// buy+exit=short, sell+enter=short, sell+exit=long").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum Action {
    Buy,
    Sell,
}

/// Classify a hub buy/sell event into a [`PositionType`] per `spec.md` §4.1.
pub fn classify_position(action: Action, entry_type: EntryType) -> PositionType {
    match (action, entry_type) {
        (Action::Buy, EntryType::Enter) | (Action::Sell, EntryType::Exit) => PositionType::Long,
        (Action::Buy, EntryType::Exit) | (Action::Sell, EntryType::Enter) => PositionType::Short,
    }
}

/// A validated signal, ready to be matched against a strategy/trade and
/// enqueued (`spec.md` §3 `Signal`).
///
/// `position_type` is `None` only transiently for signals derived from a
/// "close"/"stop" hub call before they are resolved against the matching
/// open trade (`spec.md` §3: "must be resolvable from the matching open
/// trade").
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub strategy_id: SmolStr,
    pub strategy_name: SmolStr,
    pub symbol: Symbol,
    pub entry_type: EntryType,
    pub position_type: Option<PositionType>,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn enter(
        strategy_id: impl Into<SmolStr>,
        strategy_name: impl Into<SmolStr>,
        symbol: Symbol,
        position_type: PositionType,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            strategy_name: strategy_name.into(),
            symbol,
            entry_type: EntryType::Enter,
            position_type: Some(position_type),
            price,
            timestamp,
        }
    }

    pub fn exit(
        strategy_id: impl Into<SmolStr>,
        strategy_name: impl Into<SmolStr>,
        symbol: Symbol,
        position_type: Option<PositionType>,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            strategy_name: strategy_name.into(),
            symbol,
            entry_type: EntryType::Exit,
            position_type,
            price,
            timestamp,
        }
    }
}

/// Raw hub payload shape before classification (`spec.md` §6 inbound
/// events): strategyId, strategyName, symbol, price, score, timestamp.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HubSignalPayload {
    pub strategy_id: SmolStr,
    pub strategy_name: SmolStr,
    pub symbol: Symbol,
    pub entry_type: EntryType,
    pub price: Decimal,
    #[serde(default)]
    pub score: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_spec_truth_table() {
        assert_eq!(
            classify_position(Action::Buy, EntryType::Enter),
            PositionType::Long
        );
        assert_eq!(
            classify_position(Action::Buy, EntryType::Exit),
            PositionType::Short
        );
        assert_eq!(
            classify_position(Action::Sell, EntryType::Enter),
            PositionType::Short
        );
        assert_eq!(
            classify_position(Action::Sell, EntryType::Exit),
            PositionType::Long
        );
    }
}
