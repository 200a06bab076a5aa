use executor_execution::ExecutionError;
use executor_instrument::{InstrumentError, Symbol};
use executor_integration::IntegrationError;
use thiserror::Error;

use crate::signal::{EntryType, PositionType};

/// Whether a [`RejectionKind`] should only be logged, or also surfaced to the
/// operator notifier (`spec.md` §7: "operator notified only for `error`
/// class rejections").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RejectionSeverity {
    Warn,
    Error,
}

/// Every reason a signal can fail validation before it is ever enqueued
/// (`spec.md` §4.1 "Validation", §9 "Exceptions-as-flow → tagged results").
///
/// The same value feeds the hub ack path (nothing is acked for a rejected
/// enter), the notifier path (`severity()` decides if it is worth paging
/// an operator) and the tracing path (`Display` is the log message).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RejectionKind {
    #[error("engine is not operational yet")]
    NotOperational,

    #[error("unknown strategy {strategy_id}")]
    UnknownStrategy { strategy_id: String },

    #[error("strategy {strategy_id} is inactive")]
    StrategyInactive { strategy_id: String },

    #[error("strategy {strategy_id} is stopped")]
    StrategyStopped { strategy_id: String },

    #[error(
        "strategy {strategy_id} hit its loss limit: {open_trades} open >= {threshold} threshold"
    )]
    StrategyLossLimit {
        strategy_id: String,
        open_trades: u32,
        threshold: u32,
    },

    #[error("duplicate open trade for {strategy_id}/{symbol}/{position_type:?}")]
    DuplicateOpenTrade {
        strategy_id: String,
        symbol: Symbol,
        position_type: PositionType,
    },

    #[error("position type {0:?} disabled by configuration")]
    PositionTypeDisabled(PositionType),

    #[error("short entry requested but margin trading is disabled")]
    MarginDisabled,

    #[error("symbol {0} excluded by configuration")]
    SymbolExcluded(Symbol),

    #[error("max {position_type:?} trade count reached ({max})")]
    MaxTradesReached { position_type: PositionType, max: u32 },

    #[error("no matching open trade for {strategy_id}/{symbol}/{position_type:?}")]
    NoMatchingOpenTrade {
        strategy_id: String,
        symbol: Symbol,
        position_type: Option<PositionType>,
    },

    #[error("trade {trade_id} is already scheduled for close")]
    AlreadyClosing { trade_id: String },

    #[error("auto exit signal ignored: trade {trade_id} is stopped")]
    TradeStopped { trade_id: String },

    #[error("auto exit signal ignored: trade {trade_id} is HODL and would close at a loss")]
    HodlAtLoss { trade_id: String },

    #[error("{entry_type:?} signal rejected: cost is invalid after buffering")]
    InvalidCost { entry_type: EntryType },

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error("funding could not cover the trade: available {available} < required {required}")]
    FundingRejected {
        available: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },
}

impl RejectionKind {
    /// `spec.md` §7: only `error`-class rejections are notified to the
    /// operator; everything else is logged at warn/debug and dropped.
    pub fn severity(&self) -> RejectionSeverity {
        match self {
            Self::NotOperational | Self::FundingRejected { .. } | Self::Instrument(_) => {
                RejectionSeverity::Error
            }
            _ => RejectionSeverity::Warn,
        }
    }
}

/// Failures arising from the partial-failure semantics of the execute task
/// (`spec.md` §7 `ExchangePartialSequence`, `StartupUnrecoverable`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signal rejected: {0}")]
    Rejected(#[from] RejectionKind),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(
        "partial sequence failure: main step succeeded but {step} failed for trade {trade_id}"
    )]
    PartialSequence { trade_id: String, step: &'static str },

    #[error("startup is unrecoverable: {0}")]
    StartupUnrecoverable(String),

    #[error("operator conflict: {0}")]
    OperatorConflict(String),
}
