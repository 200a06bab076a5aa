use chrono::{DateTime, Utc};
use executor_execution::balance::Balance;
use executor_instrument::{Asset, Market, Symbol, TradingMode, Wallet};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::collections::HashMap;

use crate::{
    hub::HubTrade,
    signal::PositionType,
    strategy::Strategy,
    trade::{TradeId, TradeOpen},
};

/// A trade dropped during startup reconciliation, with the reason logged
/// alongside the warning notification (`spec.md` §4.6).
pub struct Discarded {
    pub strategy_id: SmolStr,
    pub symbol: Symbol,
    pub position_type: PositionType,
    pub reason: &'static str,
}

/// Match persisted open trades against the hub's own open-trade list
/// (`spec.md` §4.6 step 4): a persisted trade the hub still reports open is
/// kept, with the hub's `isStopped` copied over whenever the engine had it
/// unstopped (the operator may have stopped it while the engine was
/// offline). A persisted trade the hub no longer reports is discarded if it
/// was never executed (it never became real, nothing to reconcile); if it
/// was executed it is kept anyway, with a warning, since it still holds a
/// live position that will only unwind on its next exit signal.
pub fn match_against_hub(trades: Vec<TradeOpen>, hub_trades: &[HubTrade]) -> (Vec<TradeOpen>, Vec<Discarded>) {
    let mut kept = Vec::with_capacity(trades.len());
    let mut discarded = Vec::new();
    for mut trade in trades {
        let hub_match = hub_trades.iter().find(|h| {
            h.strategy_id == trade.strategy_id && h.symbol == trade.symbol && h.position_type == trade.position_type
        });
        match hub_match {
            Some(hub_trade) => {
                if hub_trade.is_stopped && !trade.is_stopped {
                    trade.is_stopped = true;
                }
                kept.push(trade);
            }
            None if !trade.is_executed => {
                discarded.push(Discarded {
                    strategy_id: trade.strategy_id,
                    symbol: trade.symbol,
                    position_type: trade.position_type,
                    reason: "hub no longer reports this never-executed trade open",
                });
            }
            None => {
                tracing::warn!(
                    strategy_id = %trade.strategy_id,
                    symbol = %trade.symbol,
                    position_type = %trade.position_type,
                    "persisted trade is executed but the hub no longer reports it open; keeping until its next exit signal"
                );
                kept.push(trade);
            }
        }
    }
    (kept, discarded)
}

/// When the store held nothing for a real-mode strategy the hub still
/// reports as open (first run, or persistence wiped between runs),
/// reconstruct a `TradeOpen` from the hub's own record, gated on the live
/// exchange balance actually backing it — shorts first, since a short's
/// backing asset (the borrowed quote) is scarcer and more likely to already
/// be claimed by another reconstruction (`spec.md` §4.6 step 4).
#[allow(clippy::too_many_arguments)]
pub fn reconstruct_from_balances(
    hub_trades: &[HubTrade],
    already_kept: &[TradeOpen],
    strategies: &IndexMap<SmolStr, Strategy>,
    markets: &IndexMap<Symbol, Market>,
    balances: &HashMap<Wallet, HashMap<Asset, Balance>>,
    primary_wallet: Wallet,
    now: DateTime<Utc>,
) -> (Vec<TradeOpen>, Vec<Discarded>) {
    let mut claimed: HashMap<(Wallet, Asset), Decimal> = HashMap::new();
    let mut ordered: Vec<&HubTrade> = hub_trades.iter().collect();
    ordered.sort_by_key(|h| if h.position_type == PositionType::Short { 0 } else { 1 });

    let mut reconstructed = Vec::new();
    let mut discarded = Vec::new();
    for hub_trade in ordered {
        if already_kept.iter().any(|t| {
            t.strategy_id == hub_trade.strategy_id && t.symbol == hub_trade.symbol && t.position_type == hub_trade.position_type
        }) {
            continue;
        }
        let Some(strategy) = strategies.get(&hub_trade.strategy_id) else {
            discarded.push(discard(hub_trade, "strategy not in the current hub list"));
            continue;
        };
        if strategy.trading_mode != TradingMode::Real {
            discarded.push(discard(hub_trade, "virtual strategy has no live balance to reconstruct from"));
            continue;
        }
        let Some(market) = markets.get(&hub_trade.symbol) else {
            discarded.push(discard(hub_trade, "symbol not in the loaded market map"));
            continue;
        };
        let wallet = if hub_trade.position_type == PositionType::Short { Wallet::Margin } else { primary_wallet };
        let asset = if hub_trade.position_type == PositionType::Short { market.quote.clone() } else { market.base.clone() };
        let live_total = balances.get(&wallet).and_then(|b| b.get(&asset)).map(|b| b.total).unwrap_or(Decimal::ZERO);
        let already_claimed = claimed.get(&(wallet, asset.clone())).copied().unwrap_or(Decimal::ZERO);
        let remaining = live_total - already_claimed;
        if remaining < hub_trade.quantity {
            discarded.push(discard(hub_trade, "live balance cannot back the hub-reported quantity"));
            continue;
        }
        claimed.insert((wallet, asset), already_claimed + hub_trade.quantity);

        let price = hub_trade.price.unwrap_or(Decimal::ZERO);
        let cost = hub_trade.quantity * price;
        let mut trade = TradeOpen::new_entry(
            TradeId::derive(&hub_trade.strategy_id, &hub_trade.symbol, hub_trade.position_type, now.timestamp_nanos_opt().unwrap_or_default()),
            hub_trade.strategy_id.clone(),
            strategy.name.clone(),
            hub_trade.symbol.clone(),
            hub_trade.position_type,
            strategy.trading_mode,
            wallet,
            hub_trade.quantity,
            cost,
            Decimal::ZERO,
            price,
            now,
        );
        trade.is_executed = true;
        trade.is_stopped = hub_trade.is_stopped;
        reconstructed.push(trade);
    }
    (reconstructed, discarded)
}

fn discard(hub_trade: &HubTrade, reason: &'static str) -> Discarded {
    Discarded {
        strategy_id: hub_trade.strategy_id.clone(),
        symbol: hub_trade.symbol.clone(),
        position_type: hub_trade.position_type,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_instrument::TradingMode;
    use rust_decimal_macros::dec;

    fn trade(strategy_id: &str, symbol: &str, position_type: PositionType) -> TradeOpen {
        TradeOpen::new_entry(
            TradeId::derive(strategy_id, &Symbol::new(symbol), position_type, 1),
            strategy_id.into(),
            strategy_id.into(),
            Symbol::new(symbol),
            position_type,
            TradingMode::Real,
            Wallet::Spot,
            dec!(1),
            dec!(100),
            Decimal::ZERO,
            dec!(100),
            Utc::now(),
        )
    }

    fn hub_trade(strategy_id: &str, symbol: &str, position_type: PositionType, quantity: Decimal) -> HubTrade {
        HubTrade {
            strategy_id: strategy_id.into(),
            symbol: Symbol::new(symbol),
            position_type,
            quantity,
            price: Some(dec!(100)),
            is_stopped: false,
        }
    }

    #[test]
    fn trade_absent_from_hub_list_is_discarded() {
        let trades = vec![trade("s1", "BTCUSDT", PositionType::Long)];
        let (kept, discarded) = match_against_hub(trades, &[]);
        assert!(kept.is_empty());
        assert_eq!(discarded.len(), 1);
    }

    #[test]
    fn trade_still_reported_by_hub_is_kept() {
        let trades = vec![trade("s1", "BTCUSDT", PositionType::Long)];
        let hub = vec![hub_trade("s1", "BTCUSDT", PositionType::Long, dec!(1))];
        let (kept, discarded) = match_against_hub(trades, &hub);
        assert_eq!(kept.len(), 1);
        assert!(discarded.is_empty());
    }

    #[test]
    fn hub_is_stopped_is_copied_onto_an_unstopped_kept_trade() {
        let trades = vec![trade("s1", "BTCUSDT", PositionType::Long)];
        let mut hub = hub_trade("s1", "BTCUSDT", PositionType::Long, dec!(1));
        hub.is_stopped = true;
        let (kept, _) = match_against_hub(trades, &[hub]);
        assert!(kept[0].is_stopped);
    }

    #[test]
    fn executed_trade_absent_from_hub_is_kept_with_a_warning() {
        let mut executed = trade("s1", "BTCUSDT", PositionType::Long);
        executed.is_executed = true;
        let (kept, discarded) = match_against_hub(vec![executed], &[]);
        assert_eq!(kept.len(), 1);
        assert!(discarded.is_empty());
    }

    #[test]
    fn reconstruction_discards_when_live_balance_is_insufficient() {
        let mut strategies = IndexMap::new();
        strategies.insert(
            SmolStr::new("s1"),
            Strategy {
                id: "s1".into(),
                name: "s1".into(),
                trade_amount: dec!(0.01),
                trading_mode: TradingMode::Real,
                active: true,
                stopped: false,
                loss_trade_run: 0,
            },
        );
        let hub = vec![hub_trade("s1", "BTCUSDT", PositionType::Long, dec!(1))];
        let (reconstructed, discarded) = reconstruct_from_balances(
            &hub,
            &[],
            &strategies,
            &IndexMap::new(),
            &HashMap::new(),
            Wallet::Spot,
            Utc::now(),
        );
        assert!(reconstructed.is_empty());
        assert_eq!(discarded.len(), 1);
    }
}
