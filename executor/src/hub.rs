use async_trait::async_trait;
use executor_instrument::TradingMode;
use executor_integration::IntegrationError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{signal::HubSignalPayload, strategy::StrategyListEntry};

/// One row of the hub's user-open-trades / strategy-open-trades HTTP
/// responses (`spec.md` §4.6 step 3 "fetch current hub trade list", §6
/// "Two HTTP calls").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HubTrade {
    pub strategy_id: SmolStr,
    pub symbol: executor_instrument::Symbol,
    pub position_type: crate::signal::PositionType,
    pub quantity: rust_decimal::Decimal,
    pub price: Option<rust_decimal::Decimal>,
    pub is_stopped: bool,
}

/// The outbound acknowledgement the engine emits once an order has filled
/// (`spec.md` §4.1 "Execute task", §6 "Outbound events").
///
/// Rebalance child tasks never produce one of these — they ack on an empty
/// channel per `spec.md` §4.1, modelled here by the caller simply not
/// calling [`HubClient::ack_traded`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradedAck {
    pub action: HubAction,
    pub symbol: executor_instrument::Symbol,
    pub strategy_id: SmolStr,
    pub strategy_name: SmolStr,
    pub quantity: rust_decimal::Decimal,
    pub trading_type: TradingMode,
}

/// Which outbound channel an ack is sent on (`traded_buy_signal` vs
/// `traded_sell_signal`), keyed off the main order's side rather than the
/// trade's position type (`spec.md` §4.1 "channel naming").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubAction {
    Buy,
    Sell,
}

/// The long-lived, bidirectional connection to the signal hub (`spec.md`
/// §2 "Hub Client", §6). Transport specifics (the socket itself) are out
/// of scope (`spec.md` §1) — this trait is the contract the engine holds.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// The hub's full list of currently-open trades across all strategies
    /// (`spec.md` §4.6 step 3, §6 "list user open trades").
    async fn fetch_open_trades(&self) -> Result<Vec<HubTrade>, IntegrationError>;

    /// A single strategy's open trades (`spec.md` §6 "list a strategy's
    /// open trades"), used by the throttled cross-check in `onStrategyList`.
    async fn fetch_strategy_open_trades(
        &self,
        strategy_id: &str,
    ) -> Result<Vec<HubTrade>, IntegrationError>;

    /// Acknowledge a filled order back to the hub (`spec.md` §6 outbound
    /// events). Never called for rebalance children.
    async fn ack_traded(&self, ack: TradedAck) -> Result<(), IntegrationError>;
}

/// The four inbound event kinds the hub delivers, pre-classified by
/// transport (`spec.md` §4.1: "signal type implicit in event name").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum HubEvent {
    StrategyList(Vec<StrategyListEntry>),
    Buy(HubSignalPayload),
    Sell(HubSignalPayload),
    Close(HubSignalPayload),
    Stop { strategy_id: SmolStr, symbol: executor_instrument::Symbol, position_type: Option<crate::signal::PositionType> },
}

/// Whether an execute task should ack the hub at all, and on which channel
/// (`spec.md` §4.1, §8 "Hub-silent rebalance children never emit `traded_*`").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckPolicy {
    Notify(HubAction),
    Silent,
}
