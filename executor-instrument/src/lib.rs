//! Market, instrument and wallet primitives for the signal-driven trade executor.
//!
//! This crate has no knowledge of signals, strategies or exchanges: it only models
//! the static shape of a tradable market (precision, limits, which wallets support
//! it) and the two wallets a cross-margin spot exchange exposes.

/// [`Asset`] and [`Symbol`] identifiers.
pub mod asset;

/// [`Error`] returned by precision snapping and market lookups.
pub mod error;

/// [`Market`], its [`Precision`] and [`Limits`], and the legal-quantity snapping
/// math described by `spec.md` §4.7 `amountToPrecision`.
pub mod market;

/// The [`TradingMode`] enum (real vs virtual).
pub mod mode;

/// The [`Wallet`] enum (spot vs cross-margin).
pub mod wallet;

pub use asset::{Asset, Symbol};
pub use error::InstrumentError;
pub use market::{Limits, Market, Precision};
pub use mode::TradingMode;
pub use wallet::Wallet;
