use derive_more::{Constructor, Display};
use executor_instrument::{Asset, Market, Wallet};
use rust_decimal::Decimal;

use crate::{meta::MetaData, signal::PositionType, trade::TradeId};

/// A wallet's available/locked/total funds for a given quote asset, plus the
/// open-trade candidates eligible for rebalancing (`spec.md` §3 `WalletData`,
/// §4.3).
#[derive(Debug, Clone, Constructor)]
pub struct WalletData {
    pub wallet: Wallet,
    pub quote: Asset,
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
    pub candidates: Vec<TradeId>,
}

impl WalletData {
    /// Apply `WALLET_BUFFER` to `free`/`total`, per §4.3: "both are reduced
    /// by `WALLET_BUFFER * total` when computing funds available for *new*
    /// trades". Only call this on the copy handed to a funding policy — the
    /// unbuffered snapshot is what `locked`/rebalance maths use.
    pub fn buffered(&self, wallet_buffer: Decimal) -> Self {
        let reduction = self.total * wallet_buffer;
        Self {
            wallet: self.wallet,
            quote: self.quote.clone(),
            free: (self.free - reduction).max(Decimal::ZERO),
            locked: self.locked,
            total: (self.total - reduction).max(Decimal::ZERO),
            candidates: self.candidates.clone(),
        }
    }
}

/// Compute the `(free, locked, total)` wallet snapshot for `wallet`/`quote`
/// from live balances plus the open-trade ledger (`spec.md` §4.3).
///
/// `exchange_free` is the exchange- (or virtual-ledger-) reported free
/// balance for `quote` in `wallet`, already fetched by the caller.
pub fn compute_wallet_data(
    meta: &MetaData,
    wallet: Wallet,
    quote: &Asset,
    exchange_free: Decimal,
) -> WalletData {
    let mut free = exchange_free;
    let mut locked = Decimal::ZERO;
    let mut candidates = Vec::new();

    for trade in &meta.trades_open {
        let Some(market) = meta.markets.get(&trade.symbol) else {
            continue;
        };
        let is_closing = meta.trades_closing.contains(&trade.id);

        // (i) executed shorts borrow the quote; it isn't really available.
        if trade.wallet == wallet
            && trade.position_type == PositionType::Short
            && trade.is_executed
            && &market.quote == quote
        {
            free -= trade.cost;
        }

        // (ii) executed longs whose base is this quote may soon be sold.
        if trade.wallet == wallet
            && trade.position_type == PositionType::Long
            && trade.is_executed
            && &market.base == quote
        {
            free -= trade.quantity;
        }

        if trade.wallet != wallet || trade.position_type != PositionType::Long || &market.quote != quote {
            continue;
        }

        if !trade.is_executed {
            // (iii) not-yet-executed longs reserve their cost.
            free -= trade.cost;
        } else if is_closing {
            // Closing-set longs: their locked funds are treated as released.
            free += trade.cost;
        } else {
            locked += trade.cost;
            candidates.push(trade.id.clone());
        }
    }

    let total = free + locked;
    WalletData::new(wallet, quote.clone(), free, locked, total, candidates)
}

/// Why a rebalance sub-trade split was refused, leaving the parent trade
/// intact (`spec.md` §4.3 "Rebalance sub-trade", §8 "Rebalance fence").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum RebalanceRejected {
    #[display("rebalance target cost is not below the parent's current cost")]
    NothingToRebalance,
    #[display("legal quantity snapping inflated the sell beyond a 2x deviation")]
    SnapTooCoarse,
    #[display("rebalance would close the parent trade entirely")]
    WouldCloseParent,
    #[display("parent remainder would fall below the legal minimum quantity")]
    BelowRemainingMinimum,
}

/// The quantity/cost to carve off a parent long trade to bring its remaining
/// cost down to `target_remaining_cost` (`spec.md` §4.3).
#[derive(Debug, Copy, Clone, PartialEq, Constructor)]
pub struct RebalanceSplit {
    pub diff_quantity: Decimal,
    pub diff_cost: Decimal,
}

/// Plan a rebalance split of a parent long trade at the current `sell_price`
/// (`spec.md` §4.3 "Rebalance sub-trade").
pub fn plan_rebalance_split(
    market: &Market,
    parent_quantity: Decimal,
    parent_cost: Decimal,
    target_remaining_cost: Decimal,
    sell_price: Decimal,
) -> Result<RebalanceSplit, RebalanceRejected> {
    let desired_diff_cost = parent_cost - target_remaining_cost;
    if desired_diff_cost <= Decimal::ZERO || sell_price <= Decimal::ZERO {
        return Err(RebalanceRejected::NothingToRebalance);
    }

    let diff_quantity = market.legal_qty(desired_diff_cost / sell_price);
    if diff_quantity <= Decimal::ZERO {
        return Err(RebalanceRejected::NothingToRebalance);
    }

    let achieved_diff_cost = diff_quantity * sell_price;
    if achieved_diff_cost <= Decimal::ZERO
        || desired_diff_cost / achieved_diff_cost > Decimal::TWO
    {
        return Err(RebalanceRejected::SnapTooCoarse);
    }

    if diff_quantity >= parent_quantity {
        return Err(RebalanceRejected::WouldCloseParent);
    }

    let remaining_quantity = parent_quantity - diff_quantity;
    if remaining_quantity < market.limits.amount_min {
        return Err(RebalanceRejected::BelowRemainingMinimum);
    }

    Ok(RebalanceSplit::new(diff_quantity, achieved_diff_cost))
}
