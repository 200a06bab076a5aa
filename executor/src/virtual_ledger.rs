use executor_execution::Side;
use executor_instrument::{Asset, Wallet};
use rust_decimal::Decimal;

use crate::{config::Config, meta::MetaData};

/// Seed `wallet`'s virtual balance for `quote` the first time it is touched
/// (`spec.md` §4.5 "Virtual trading"): `VIRTUAL_WALLET_FUNDS` directly if
/// `quote` is the reference asset, otherwise scaled by the ratio of the two
/// markets' minimum cost.
pub fn seed_virtual_wallet(meta: &mut MetaData, config: &Config, wallet: Wallet, quote: &Asset) {
    if meta
        .virtual_balances
        .get(&wallet)
        .is_some_and(|book| book.contains_key(quote))
    {
        return;
    }

    let reference = Asset::new(config.reference_symbol.as_str());
    let seed = if quote == &reference {
        config.virtual_wallet_funds
    } else {
        let quote_min_cost = meta.markets.values().find(|m| &m.quote == quote).map(|m| m.limits.cost_min);
        let reference_min_cost = meta.markets.values().find(|m| &m.quote == &reference).map(|m| m.limits.cost_min);
        match (quote_min_cost, reference_min_cost) {
            (Some(q), Some(r)) if r > Decimal::ZERO => config.virtual_wallet_funds * (q / r),
            _ => config.virtual_wallet_funds,
        }
    };

    meta.virtual_balances.entry(wallet).or_default().insert(quote.clone(), seed);
}

/// Apply a synthetic fill to the virtual ledger (`spec.md` §4.5): a buy
/// debits `quote` and credits `base`; a sell is the reverse.
pub fn apply_fill(meta: &mut MetaData, wallet: Wallet, base: &Asset, quote: &Asset, side: Side, quantity: Decimal, cost: Decimal) {
    let book = meta.virtual_balances.entry(wallet).or_default();
    match side {
        Side::Buy => {
            *book.entry(quote.clone()).or_insert(Decimal::ZERO) -= cost;
            *book.entry(base.clone()).or_insert(Decimal::ZERO) += quantity;
        }
        Side::Sell => {
            *book.entry(base.clone()).or_insert(Decimal::ZERO) -= quantity;
            *book.entry(quote.clone()).or_insert(Decimal::ZERO) += cost;
        }
    }
}

/// A virtual margin borrow credits `asset` in `wallet` (`spec.md` §4.5).
pub fn apply_borrow(meta: &mut MetaData, wallet: Wallet, asset: &Asset, amount: Decimal) {
    *meta
        .virtual_balances
        .entry(wallet)
        .or_default()
        .entry(asset.clone())
        .or_insert(Decimal::ZERO) += amount;
}

/// A virtual margin repay debits `asset` in `wallet` (`spec.md` §4.5).
pub fn apply_repay(meta: &mut MetaData, wallet: Wallet, asset: &Asset, amount: Decimal) {
    *meta
        .virtual_balances
        .entry(wallet)
        .or_default()
        .entry(asset.clone())
        .or_insert(Decimal::ZERO) -= amount;
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_instrument::{market::{Limits, Precision}, Market, Symbol};
    use rust_decimal_macros::dec;

    fn market(quote: &str, min_cost: Decimal) -> Market {
        Market {
            symbol: Symbol::new(format!("BTC{quote}")),
            base: Asset::new("BTC"),
            quote: Asset::new(quote),
            active: true,
            spot: true,
            margin: true,
            margin_allowed: true,
            precision: Precision::new(dec!(0.0001), dec!(0.01)),
            limits: Limits {
                amount_min: dec!(0.0001),
                amount_max: dec!(1000),
                cost_min: min_cost,
                cost_max: dec!(1000000),
                market_max: dec!(100),
            },
        }
    }

    fn config() -> Config {
        Config {
            exchange_api_key: String::new(),
            exchange_api_secret: String::new(),
            hub_api_key: String::new(),
            primary_wallet: Wallet::Spot,
            trade_long_funds: executor_risk::FundingPolicy::None,
            is_funds_no_loss: false,
            is_trade_margin_enabled: true,
            is_trade_short_enabled: false,
            is_buy_qty_fraction: false,
            is_pay_interest_enabled: true,
            is_auto_close_enabled: false,
            wallet_buffer: Decimal::ZERO,
            max_long_trades: 0,
            max_short_trades: 0,
            strategy_loss_limit: 0,
            strategy_limit_threshold: Decimal::ZERO,
            exclude_coins: Default::default(),
            taker_fee_percent: dec!(0.1),
            min_cost_buffer: dec!(0.01),
            virtual_wallet_funds: dec!(1),
            bnb_free_threshold: dec!(0.5),
            bnb_free_float: dec!(0.1),
            bnb_auto_top_up: None,
            balance_sync_delay: std::time::Duration::from_millis(0),
            background_interval: std::time::Duration::from_secs(1),
            reference_symbol: "BTC".to_string(),
            max_database_rows: 100,
            trade_queue_min_gap: std::time::Duration::from_millis(0),
            operator_password: None,
        }
    }

    #[test]
    fn reference_quote_seeds_flat_virtual_wallet_funds() {
        let mut meta = MetaData::new(10);
        let config = config();
        seed_virtual_wallet(&mut meta, &config, Wallet::Spot, &Asset::new("BTC"));
        assert_eq!(meta.virtual_balances[&Wallet::Spot][&Asset::new("BTC")], dec!(1));
    }

    #[test]
    fn non_reference_quote_is_scaled_by_min_cost_ratio() {
        let mut meta = MetaData::new(10);
        meta.markets.insert(Symbol::new("BTCUSDT"), market("USDT", dec!(10)));
        meta.markets.insert(Symbol::new("BTCBTC"), market("BTC", dec!(0.0001)));
        let config = config();
        seed_virtual_wallet(&mut meta, &config, Wallet::Spot, &Asset::new("USDT"));
        let seeded = meta.virtual_balances[&Wallet::Spot][&Asset::new("USDT")];
        assert_eq!(seeded, dec!(1) * (dec!(10) / dec!(0.0001)));
    }

    #[test]
    fn seeding_is_idempotent_once_a_balance_exists() {
        let mut meta = MetaData::new(10);
        let config = config();
        let quote = Asset::new("BTC");
        seed_virtual_wallet(&mut meta, &config, Wallet::Spot, &quote);
        meta.virtual_balances.get_mut(&Wallet::Spot).unwrap().insert(quote.clone(), dec!(0.5));
        seed_virtual_wallet(&mut meta, &config, Wallet::Spot, &quote);
        assert_eq!(meta.virtual_balances[&Wallet::Spot][&quote], dec!(0.5));
    }

    #[test]
    fn buy_fill_debits_quote_and_credits_base() {
        let mut meta = MetaData::new(10);
        apply_fill(&mut meta, Wallet::Spot, &Asset::new("BTC"), &Asset::new("USDT"), Side::Buy, dec!(1), dec!(100));
        assert_eq!(meta.virtual_balances[&Wallet::Spot][&Asset::new("USDT")], dec!(-100));
        assert_eq!(meta.virtual_balances[&Wallet::Spot][&Asset::new("BTC")], dec!(1));
    }

    #[test]
    fn borrow_then_repay_nets_to_zero() {
        let mut meta = MetaData::new(10);
        apply_borrow(&mut meta, Wallet::Margin, &Asset::new("BTC"), dec!(2));
        apply_repay(&mut meta, Wallet::Margin, &Asset::new("BTC"), dec!(2));
        assert_eq!(meta.virtual_balances[&Wallet::Margin][&Asset::new("BTC")], Decimal::ZERO);
    }
}
