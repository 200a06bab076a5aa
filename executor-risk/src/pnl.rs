use rust_decimal::Decimal;

/// Round-trip percentage PnL of buying at `price_buy` and selling at
/// `price_sell`, each leg paying `taker_fee_percent` (`spec.md` §4.3):
///
/// ```text
/// ((price_sell * (1 - f)) - (price_buy * (1 + f))) / (price_buy * (1 + f)) * 100
/// ```
///
/// where `f = taker_fee_percent / 100`. `spec.md` §8 P5: at a flat price this
/// is exactly the round-trip fee, `calculate_pnl(p, p) == -2f / (1+f) * 100`.
pub fn calculate_pnl(price_buy: Decimal, price_sell: Decimal, taker_fee_percent: Decimal) -> Decimal {
    let f = taker_fee_percent / Decimal::ONE_HUNDRED;
    let cost_buy = price_buy * (Decimal::ONE + f);
    let proceeds_sell = price_sell * (Decimal::ONE - f);
    (proceeds_sell - cost_buy) / cost_buy * Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn flat_price_round_trip_is_exactly_the_fee() {
        let fee = dec!(0.1);
        let pnl = calculate_pnl(dec!(100), dec!(100), fee);
        let f = fee / Decimal::ONE_HUNDRED;
        let expected = -(dec!(2) * f) / (Decimal::ONE + f) * Decimal::ONE_HUNDRED;
        assert_eq!(pnl.round_dp(10), expected.round_dp(10));
    }

    #[test]
    fn profitable_round_trip_is_positive() {
        let pnl = calculate_pnl(dec!(100), dec!(110), dec!(0.1));
        assert!(pnl > dec!(9));
        assert!(pnl < dec!(10));
    }
}
