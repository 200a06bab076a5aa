use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Whether a trade executes against the real exchange or an internal ledger
/// (`spec.md` glossary "Trading mode").
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Real,
    Virtual,
}
