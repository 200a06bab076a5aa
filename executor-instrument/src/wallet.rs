use derive_more::Display;
use serde::{Deserialize, Serialize};

/// One of the two wallets a cross-margin spot exchange exposes.
///
/// `Margin` is cross-margin: it supports `borrow`/`repay` against a shared loan
/// balance, unlike `Spot` which only ever holds what was deposited or bought.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Wallet {
    Spot,
    Margin,
}

impl Wallet {
    pub fn is_margin(self) -> bool {
        matches!(self, Self::Margin)
    }

    /// The other wallet, used when building fallback candidate lists (§4.1 step 1).
    pub fn other(self) -> Self {
        match self {
            Self::Spot => Self::Margin,
            Self::Margin => Self::Spot,
        }
    }
}
