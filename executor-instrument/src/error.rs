use crate::asset::Symbol;
use thiserror::Error;

/// Errors arising from market lookups and precision/limit snapping.
#[derive(Debug, Clone, Error)]
pub enum InstrumentError {
    #[error("unknown market: {0}")]
    UnknownMarket(Symbol),

    #[error("market {symbol} is not active")]
    MarketInactive { symbol: Symbol },

    #[error("market {symbol} does not support wallet {wallet:?}")]
    WalletUnsupported {
        symbol: Symbol,
        wallet: crate::wallet::Wallet,
    },

    #[error("quantity {quantity} for {symbol} is below the exchange minimum amount {min}")]
    BelowMinAmount {
        symbol: Symbol,
        quantity: rust_decimal::Decimal,
        min: rust_decimal::Decimal,
    },

    #[error("cost {cost} for {symbol} is below the exchange minimum cost {min}")]
    BelowMinCost {
        symbol: Symbol,
        cost: rust_decimal::Decimal,
        min: rust_decimal::Decimal,
    },
}
