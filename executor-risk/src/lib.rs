//! Funding policies, notifier hub and PnL/balance-history math for the
//! signal-driven trade executor (`spec.md` §4.4, §4.8, §3 `BalanceHistory`).
//!
//! Nothing here knows about `TradeOpen`, the hub, or the exchange gateway:
//! funding policies are pure functions over a generic wallet snapshot and
//! candidate list, keyed by whatever trade-id type the caller uses.

/// Per-day, per-(mode, quote) [`balance_history::BalanceHistory`] book.
pub mod balance_history;

/// Funding policies (§4.4): `none`, `borrow-min`, `borrow-all`, `sell-all`,
/// `sell-largest`, `sell-largest-pnl`.
pub mod funding;

/// [`NotifierHub`] — level-filtered fan-out to registered sinks (§4.8).
pub mod notifier;

/// `calculate_pnl` (§4.3) and the taker-fee math shared across the crate.
pub mod pnl;

pub use balance_history::{BalanceHistory, BalanceHistoryEntry};
pub use funding::{FundingOutcome, FundingPolicy, FundingRejected, RebalanceCandidate, RebalanceInstruction, WalletSnapshot};
pub use notifier::{Level, Notification, NotifierHub, Sink};
pub use pnl::calculate_pnl;
