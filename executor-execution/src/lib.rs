//! Exchange gateway contract (`spec.md` §4.7) and a deterministic mock
//! implementation used by tests and by virtual-mode trading's synthetic fills
//! (§4.5).
//!
//! This crate models the exchange as a typed façade: load markets/prices,
//! fetch a ticker or balance, place a market order, borrow/repay on margin.
//! It owns the single mutable balance cache (§5 "Shared-resource policy").

/// Per-wallet [`balance::BalanceCache`] with the mutation-invalidate/settle-delay
/// rules from §4.7 and §5.
pub mod balance;

/// [`ExecutionError`] — the crate's single fallible-operation currency.
pub mod error;

/// The [`gateway::ExchangeGateway`] trait and its request/response types.
pub mod gateway;

/// A deterministic in-memory [`mock::MockGateway`] for tests and virtual trading.
pub mod mock;

pub use balance::{Balance, BalanceCache, MarginBalance};
pub use error::ExecutionError;
pub use gateway::{ExchangeGateway, OrderResult, OrderStatus, Side, Ticker, TransactionId};
pub use mock::MockGateway;
