use crate::{asset::Asset, error::InstrumentError, wallet::Wallet, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Step size and decimal precision a market enforces on quantities and prices.
///
/// Mirrors the `precision`/`limits` shape the Exchange Gateway's `loadMarkets`
/// returns per `spec.md` §4.7; `amount_step` and `price_step` are the smallest
/// legal increment (ccxt calls this `precision.amount`/`precision.price` when a
/// venue expresses precision as a step size rather than a decimal-place count).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Precision {
    pub amount_step: Decimal,
    pub price_step: Decimal,
}

impl Precision {
    pub fn new(amount_step: Decimal, price_step: Decimal) -> Self {
        Self {
            amount_step,
            price_step,
        }
    }
}

/// Exchange-enforced minimums/maximums for a market.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Limits {
    pub amount_min: Decimal,
    pub amount_max: Decimal,
    pub cost_min: Decimal,
    pub cost_max: Decimal,
    /// Maximum amount accepted in a single market order (may be stricter than
    /// `amount_max`, which bounds total position size).
    pub market_max: Decimal,
}

/// A tradable market (`spec.md` §4.7 `loadMarkets`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Market {
    pub symbol: Symbol,
    pub base: Asset,
    pub quote: Asset,
    pub active: bool,
    pub spot: bool,
    pub margin: bool,
    /// Cross-margin-allowed flag, enriched from a separate endpoint per §4.7.
    pub margin_allowed: bool,
    pub precision: Precision,
    pub limits: Limits,
}

impl Market {
    /// Does this market support trading on `wallet`, counting the cross-margin
    /// allow-list on top of the plain `margin` listing flag.
    pub fn supports(&self, wallet: Wallet) -> bool {
        match wallet {
            Wallet::Spot => self.spot,
            Wallet::Margin => self.margin && self.margin_allowed,
        }
    }

    pub fn require_active(&self) -> Result<(), InstrumentError> {
        if self.active {
            Ok(())
        } else {
            Err(InstrumentError::MarketInactive {
                symbol: self.symbol.clone(),
            })
        }
    }

    pub fn require_wallet(&self, wallet: Wallet) -> Result<(), InstrumentError> {
        if self.supports(wallet) {
            Ok(())
        } else {
            Err(InstrumentError::WalletUnsupported {
                symbol: self.symbol.clone(),
                wallet,
            })
        }
    }

    /// Snap `qty` down to a legal amount: floored to the step size, never negative.
    ///
    /// `spec.md` §8 P6: idempotent, i.e. `legal_qty(legal_qty(x)) == legal_qty(x)`.
    pub fn legal_qty(&self, qty: Decimal) -> Decimal {
        snap_down(qty, self.precision.amount_step)
    }

    /// Snap `price` down to a legal price increment.
    pub fn legal_price(&self, price: Decimal) -> Decimal {
        snap_down(price, self.precision.price_step)
    }

    /// Minimum cost including the engine-wide safety buffer (§4.1 step 3,
    /// `MIN_COST_BUFFER`).
    pub fn min_cost_with_buffer(&self, min_cost_buffer: Decimal) -> Decimal {
        self.limits.cost_min * (Decimal::ONE + min_cost_buffer)
    }

    /// Raise `qty` (at `price`) until both the minimum amount and the buffered
    /// minimum cost are satisfied, snapping to legal precision at every step.
    /// Returns the legal `(quantity, cost)` pair.
    pub fn legal_qty_for_cost(
        &self,
        qty: Decimal,
        price: Decimal,
        min_cost_buffer: Decimal,
    ) -> (Decimal, Decimal) {
        let mut qty = self.legal_qty(qty.max(self.limits.amount_min));
        let min_cost = self.min_cost_with_buffer(min_cost_buffer);
        if price > Decimal::ZERO {
            let min_qty_for_cost = self.legal_qty(min_cost / price);
            if min_qty_for_cost > qty {
                qty = bump_to_at_least(min_qty_for_cost, self.precision.amount_step);
            }
        }
        let cost = qty * price;
        (qty, cost)
    }

    /// Validate that `(qty, cost)` satisfies §3 `TradeOpen` invariants.
    pub fn validate_trade_size(
        &self,
        qty: Decimal,
        cost: Decimal,
        min_cost_buffer: Decimal,
    ) -> Result<(), InstrumentError> {
        if qty < self.limits.amount_min {
            return Err(InstrumentError::BelowMinAmount {
                symbol: self.symbol.clone(),
                quantity: qty,
                min: self.limits.amount_min,
            });
        }
        let min_cost = self.min_cost_with_buffer(min_cost_buffer);
        if cost < min_cost {
            return Err(InstrumentError::BelowMinCost {
                symbol: self.symbol.clone(),
                cost,
                min: min_cost,
            });
        }
        Ok(())
    }
}

/// Floor `value` to the nearest multiple of `step` (step = 0 means no snapping).
fn snap_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || value <= Decimal::ZERO {
        return value.max(Decimal::ZERO);
    }
    (value / step).floor() * step
}

/// Smallest legal value at or above `value`, stepping up by `step`.
fn bump_to_at_least(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btcusdt() -> Market {
        Market {
            symbol: Symbol::new("BTCUSDT"),
            base: Asset::new("BTC"),
            quote: Asset::new("USDT"),
            active: true,
            spot: true,
            margin: true,
            margin_allowed: true,
            precision: Precision::new(dec!(0.0001), dec!(0.01)),
            limits: Limits {
                amount_min: dec!(0.0001),
                amount_max: dec!(1000),
                cost_min: dec!(10),
                cost_max: dec!(1000000),
                market_max: dec!(100),
            },
        }
    }

    #[test]
    fn legal_qty_floors_to_step_size() {
        let market = btcusdt();
        assert_eq!(market.legal_qty(dec!(1.00006)), dec!(1.0000));
        assert_eq!(market.legal_qty(dec!(0.00005)), dec!(0.0000));
    }

    #[test]
    fn legal_qty_is_idempotent() {
        let market = btcusdt();
        let once = market.legal_qty(dec!(0.123456));
        let twice = market.legal_qty(once);
        assert_eq!(once, twice);
    }

    #[test]
    fn legal_qty_for_cost_raises_to_min_cost_with_buffer() {
        let market = btcusdt();
        // 10 USDT min cost, 1% buffer => 10.1 USDT required at price 100.
        let (qty, cost) = market.legal_qty_for_cost(dec!(0.05), dec!(100), dec!(0.01));
        assert!(cost >= dec!(10.1));
        assert_eq!(market.legal_qty(qty), qty);
    }

    #[test]
    fn supports_respects_margin_allow_list() {
        let mut market = btcusdt();
        market.margin_allowed = false;
        assert!(market.supports(Wallet::Spot));
        assert!(!market.supports(Wallet::Margin));
    }
}
