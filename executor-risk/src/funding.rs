use crate::pnl::calculate_pnl;
use derive_more::{Constructor, Display};
use executor_instrument::Wallet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A long-entry funding strategy (`spec.md` §4.1 step 4, §4.4).
///
/// Short entries always borrow the full quantity on margin and never consult
/// a [`FundingPolicy`]; these six variants only size *long* entries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum FundingPolicy {
    /// Use whatever is free; shrink the trade if that isn't enough.
    None,
    /// Force margin, borrow only the shortfall past free balance.
    BorrowMin,
    /// Force margin, borrow the full cost regardless of free balance.
    BorrowAll,
    /// Sell down every above-average open long until the wallet covers cost.
    SellAll,
    /// Sell down only the single largest open long.
    SellLargest,
    /// Like `SellLargest`, but pick the best-PnL trade among the above-average ones.
    SellLargestPnl,
}

/// A candidate open long trade a [`FundingPolicy`] may partially close to free
/// quote balance (`spec.md` §4.1 step 4 "rebalance set").
#[derive(Debug, Clone, Copy, PartialEq, Constructor)]
pub struct RebalanceCandidate<Id> {
    pub id: Id,
    pub cost: Decimal,
    pub price_buy: Decimal,
    /// Current (possibly refreshed, `IS_FUNDS_NO_LOSS`) sell price.
    pub sell_price: Decimal,
}

impl<Id> RebalanceCandidate<Id> {
    pub fn pnl_percent(&self, taker_fee_percent: Decimal) -> Decimal {
        calculate_pnl(self.price_buy, self.sell_price, taker_fee_percent)
    }
}

/// One candidate wallet's funds snapshot, as prepared by the Wallet Model
/// (`spec.md` §4.3), already reduced by `WALLET_BUFFER`.
#[derive(Debug, Clone)]
pub struct WalletSnapshot<Id> {
    pub wallet: Wallet,
    pub free: Decimal,
    pub candidates: Vec<RebalanceCandidate<Id>>,
}

impl<Id> WalletSnapshot<Id> {
    pub fn new(wallet: Wallet, free: Decimal, candidates: Vec<RebalanceCandidate<Id>>) -> Self {
        Self {
            wallet,
            free,
            candidates,
        }
    }

    fn largest(&self) -> Option<&RebalanceCandidate<Id>> {
        self.candidates
            .iter()
            .max_by(|a, b| a.cost.cmp(&b.cost))
    }
}

/// An instruction to partially close `id` down to `target_cost`, produced by a
/// sell-funded policy (`spec.md` §4.3 "Rebalance sub-trade").
#[derive(Debug, Clone, Copy, PartialEq, Constructor)]
pub struct RebalanceInstruction<Id> {
    pub id: Id,
    pub target_cost: Decimal,
}

/// The funding plan for one long entry: which wallet, the (possibly shrunk)
/// final cost, how much to borrow, and which trades to rebalance first.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingOutcome<Id> {
    pub wallet: Wallet,
    pub cost: Decimal,
    pub borrow: Decimal,
    pub rebalance: Vec<RebalanceInstruction<Id>>,
}

/// A funding policy could not produce a legal trade.
#[derive(Debug, Clone, Copy, PartialEq, Display)]
#[display("funding rejected: available {available} < required minimum {required}")]
pub struct FundingRejected {
    pub available: Decimal,
    pub required: Decimal,
}

/// Plan funding for a long entry of `desired_cost` across `wallets`, honouring
/// `policy` (`spec.md` §4.1 step 4). `preferred` is the primary wallet
/// (`PRIMARY_WALLET`); `wallets` lists it first when available, falling back
/// to the other wallet per the candidate-ordering rule in step 1.
///
/// Returns the funding plan, or [`FundingRejected`] if even after rebalancing
/// the wallet cannot cover at least `min_cost`.
pub fn plan_long_funding<Id>(
    policy: FundingPolicy,
    desired_cost: Decimal,
    min_cost: Decimal,
    preferred: Wallet,
    wallets: &[WalletSnapshot<Id>],
    taker_fee_percent: Decimal,
) -> Result<FundingOutcome<Id>, FundingRejected>
where
    Id: Clone,
{
    match policy {
        FundingPolicy::None => plan_none(desired_cost, min_cost, preferred, wallets),
        FundingPolicy::BorrowMin => plan_borrow(desired_cost, min_cost, wallets, false),
        FundingPolicy::BorrowAll => plan_borrow(desired_cost, min_cost, wallets, true),
        FundingPolicy::SellAll => plan_sell(
            SellMode::All,
            desired_cost,
            min_cost,
            preferred,
            wallets,
            taker_fee_percent,
        ),
        FundingPolicy::SellLargest => plan_sell(
            SellMode::Largest,
            desired_cost,
            min_cost,
            preferred,
            wallets,
            taker_fee_percent,
        ),
        FundingPolicy::SellLargestPnl => plan_sell(
            SellMode::LargestPnl,
            desired_cost,
            min_cost,
            preferred,
            wallets,
            taker_fee_percent,
        ),
    }
}

fn plan_none<Id>(
    desired_cost: Decimal,
    min_cost: Decimal,
    preferred: Wallet,
    wallets: &[WalletSnapshot<Id>],
) -> Result<FundingOutcome<Id>, FundingRejected>
where
    Id: Clone,
{
    let best = best_potential_wallet(wallets, preferred, desired_cost)
        .ok_or(FundingRejected {
            available: Decimal::ZERO,
            required: min_cost,
        })?;
    let cost = desired_cost.min(best.free);
    if cost < min_cost {
        return Err(FundingRejected {
            available: best.free,
            required: min_cost,
        });
    }
    Ok(FundingOutcome {
        wallet: best.wallet,
        cost,
        borrow: Decimal::ZERO,
        rebalance: Vec::new(),
    })
}

fn plan_borrow<Id>(
    desired_cost: Decimal,
    min_cost: Decimal,
    wallets: &[WalletSnapshot<Id>],
    borrow_all: bool,
) -> Result<FundingOutcome<Id>, FundingRejected>
where
    Id: Clone,
{
    if desired_cost < min_cost {
        return Err(FundingRejected {
            available: Decimal::ZERO,
            required: min_cost,
        });
    }
    let margin = wallets
        .iter()
        .find(|w| w.wallet == Wallet::Margin)
        .ok_or(FundingRejected {
            available: Decimal::ZERO,
            required: min_cost,
        })?;
    let borrow = if borrow_all {
        desired_cost
    } else {
        (desired_cost - margin.free).max(Decimal::ZERO)
    };
    Ok(FundingOutcome {
        wallet: Wallet::Margin,
        cost: desired_cost,
        borrow,
        rebalance: Vec::new(),
    })
}

#[derive(Copy, Clone)]
enum SellMode {
    All,
    Largest,
    LargestPnl,
}

fn plan_sell<Id>(
    mode: SellMode,
    desired_cost: Decimal,
    min_cost: Decimal,
    preferred: Wallet,
    wallets: &[WalletSnapshot<Id>],
    taker_fee_percent: Decimal,
) -> Result<FundingOutcome<Id>, FundingRejected>
where
    Id: Clone,
{
    // §4.1 step 4: "If free >= largest.cost, no rebalance."
    if let Some(best) = best_potential_wallet(wallets, preferred, desired_cost) {
        return Ok(FundingOutcome {
            wallet: best.wallet,
            cost: desired_cost,
            borrow: Decimal::ZERO,
            rebalance: Vec::new(),
        });
    }

    let mut best: Option<(FundingOutcome<Id>, Decimal)> = None;
    for snapshot in wallets {
        let Some(largest) = snapshot.largest() else {
            continue;
        };
        if snapshot.free >= largest.cost {
            // covered above by best_potential_wallet, but kept for per-wallet symmetry
            continue;
        }
        let (potential, rebalance) = match mode {
            SellMode::All => sell_all_plan(snapshot),
            SellMode::Largest => sell_largest_plan(snapshot, largest),
            SellMode::LargestPnl => {
                let avg = average_cost(&snapshot.candidates);
                let chosen = snapshot
                    .candidates
                    .iter()
                    .filter(|c| c.cost > avg)
                    .max_by(|a, b| {
                        a.pnl_percent(taker_fee_percent)
                            .cmp(&b.pnl_percent(taker_fee_percent))
                    })
                    .unwrap_or(largest);
                sell_largest_plan(snapshot, chosen)
            }
        };
        let cost = desired_cost.min(potential.max(snapshot.free));
        if cost < min_cost {
            continue;
        }
        let outcome = FundingOutcome {
            wallet: snapshot.wallet,
            cost,
            borrow: Decimal::ZERO,
            rebalance,
        };
        match &best {
            Some((_, best_potential)) if *best_potential >= potential => {}
            _ => best = Some((outcome, potential)),
        }
    }

    best.map(|(outcome, _)| outcome).ok_or(FundingRejected {
        available: wallets.iter().map(|w| w.free).max().unwrap_or(Decimal::ZERO),
        required: min_cost,
    })
}

/// Preferred wallet if its free already covers `desired_cost`, else whichever
/// wallet has the greatest free balance (still short of covering it) — used
/// to short-circuit all policies when no funding action is needed at all.
fn best_potential_wallet<'a, Id>(
    wallets: &'a [WalletSnapshot<Id>],
    preferred: Wallet,
    desired_cost: Decimal,
) -> Option<&'a WalletSnapshot<Id>> {
    if let Some(w) = wallets
        .iter()
        .find(|w| w.wallet == preferred && w.free >= desired_cost)
    {
        return Some(w);
    }
    wallets.iter().find(|w| w.free >= desired_cost)
}

fn average_cost<Id>(candidates: &[RebalanceCandidate<Id>]) -> Decimal {
    if candidates.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = candidates.iter().map(|c| c.cost).sum();
    sum / Decimal::from(candidates.len() as u64)
}

/// `sell-largest` / `sell-largest-pnl`: rebalance only `target` down to the
/// midpoint between the wallet's free balance and `target`'s cost.
fn sell_largest_plan<Id>(
    snapshot: &WalletSnapshot<Id>,
    target: &RebalanceCandidate<Id>,
) -> (Decimal, Vec<RebalanceInstruction<Id>>)
where
    Id: Clone,
{
    let potential = (snapshot.free + target.cost) / Decimal::TWO;
    (
        potential,
        vec![RebalanceInstruction::new(target.id.clone(), potential)],
    )
}

/// `sell-all`: repeatedly drop below-average candidates until the remaining
/// set's mean no longer exceeds any member, then rebalance everything left
/// down to that mean (`spec.md` §4.1 step 4).
fn sell_all_plan<Id>(snapshot: &WalletSnapshot<Id>) -> (Decimal, Vec<RebalanceInstruction<Id>>)
where
    Id: Clone,
{
    let mut kept: Vec<&RebalanceCandidate<Id>> = snapshot.candidates.iter().collect();
    let mut avg = average_cost(&snapshot.candidates);
    loop {
        if kept.is_empty() {
            avg = Decimal::ZERO;
            break;
        }
        let sum: Decimal = kept.iter().map(|c| c.cost).sum();
        avg = sum / Decimal::from(kept.len() as u64);
        let above: Vec<&RebalanceCandidate<Id>> =
            kept.iter().copied().filter(|c| c.cost >= avg).collect();
        if above.len() == kept.len() {
            break;
        }
        kept = above;
    }
    let potential = snapshot.free.max(avg);
    let rebalance = kept
        .into_iter()
        .map(|c| RebalanceInstruction::new(c.id.clone(), avg.min(c.cost)))
        .collect();
    (potential, rebalance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(id: u32, cost: Decimal) -> RebalanceCandidate<u32> {
        RebalanceCandidate::new(id, cost, dec!(100), dec!(100))
    }

    #[test]
    fn none_policy_shrinks_cost_to_free_when_insufficient() {
        let wallets = vec![WalletSnapshot::new(Wallet::Spot, dec!(0.004), vec![])];
        let outcome = plan_long_funding(
            FundingPolicy::None,
            dec!(0.01),
            dec!(0.001),
            Wallet::Spot,
            &wallets,
            dec!(0.1),
        )
        .unwrap();
        assert_eq!(outcome.cost, dec!(0.004));
        assert_eq!(outcome.borrow, Decimal::ZERO);
    }

    #[test]
    fn borrow_min_only_covers_the_shortfall() {
        let wallets = vec![WalletSnapshot::new(Wallet::Margin, dec!(0.004), vec![])];
        let outcome = plan_long_funding(
            FundingPolicy::BorrowMin,
            dec!(0.01),
            dec!(0.001),
            Wallet::Margin,
            &wallets,
            dec!(0.1),
        )
        .unwrap();
        assert_eq!(outcome.wallet, Wallet::Margin);
        assert_eq!(outcome.borrow, dec!(0.006));
    }

    #[test]
    fn borrow_all_ignores_free_balance() {
        let wallets = vec![WalletSnapshot::new(Wallet::Margin, dec!(0.004), vec![])];
        let outcome = plan_long_funding(
            FundingPolicy::BorrowAll,
            dec!(0.01),
            dec!(0.001),
            Wallet::Margin,
            &wallets,
            dec!(0.1),
        )
        .unwrap();
        assert_eq!(outcome.borrow, dec!(0.01));
    }

    #[test]
    fn sell_largest_rebalances_only_the_largest_trade() {
        // S3 from spec.md §8: costs {0.02, 0.01}, free=0.005, desired=0.03.
        let wallets = vec![WalletSnapshot::new(
            Wallet::Spot,
            dec!(0.005),
            vec![candidate(1, dec!(0.02)), candidate(2, dec!(0.01))],
        )];
        let outcome = plan_long_funding(
            FundingPolicy::SellLargest,
            dec!(0.03),
            dec!(0.001),
            Wallet::Spot,
            &wallets,
            dec!(0),
        )
        .unwrap();
        assert_eq!(outcome.cost, dec!(0.0125));
        assert_eq!(outcome.rebalance.len(), 1);
        assert_eq!(outcome.rebalance[0].id, 1);
        assert_eq!(outcome.rebalance[0].target_cost, dec!(0.0125));
    }

    #[test]
    fn sufficient_free_balance_needs_no_rebalance() {
        let wallets = vec![WalletSnapshot::new(
            Wallet::Spot,
            dec!(1),
            vec![candidate(1, dec!(0.02))],
        )];
        let outcome = plan_long_funding(
            FundingPolicy::SellLargest,
            dec!(0.03),
            dec!(0.001),
            Wallet::Spot,
            &wallets,
            dec!(0),
        )
        .unwrap();
        assert!(outcome.rebalance.is_empty());
        assert_eq!(outcome.cost, dec!(0.03));
    }
}
