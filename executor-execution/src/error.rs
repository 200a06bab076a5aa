use executor_instrument::Symbol;
use thiserror::Error;

/// Failures surfaced by the Exchange Gateway (`spec.md` §7 `ExchangeTransient`).
///
/// None of these are automatically retried by the gateway itself; the caller
/// (Signal Engine) decides whether the surrounding sequence can proceed,
/// compensate, or must force-stop the trade.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("network error calling exchange: {0}")]
    Network(String),

    #[error("rate limited by exchange, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("market order for {symbol} was not filled (status={status:?})")]
    OrderNotFilled { symbol: Symbol, status: String },

    #[error("margin {action} for {asset} did not return a transaction id")]
    MissingTransactionId { action: &'static str, asset: String },

    #[error("unknown market: {0}")]
    UnknownMarket(Symbol),

    #[error("exchange returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl ExecutionError {
    /// Whether this failure means "nothing happened on the exchange" (§4.1
    /// "if the main fails with nothing done") as opposed to a partial effect.
    pub fn is_nothing_done(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::OrderNotFilled { .. }
        )
    }
}
