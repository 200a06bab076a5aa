use executor_instrument::TradingMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A named policy owning a trade amount and a stream of signals (`spec.md`
/// §3 `Strategy`).
///
/// `stopped` and `loss_trade_run` are engine-owned: they survive every hub
/// strategy-list refresh unless the strategy's `active` flag toggles, which
/// resets both (`spec.md` §4.1 `onStrategyList`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Strategy {
    pub id: SmolStr,
    pub name: SmolStr,
    pub trade_amount: Decimal,
    pub trading_mode: TradingMode,
    pub active: bool,
    pub stopped: bool,
    pub loss_trade_run: u32,
}

/// The hub's strategy-list payload shape for one strategy (`spec.md` §4.1).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyListEntry {
    pub id: SmolStr,
    pub name: SmolStr,
    pub trade_amount: Decimal,
    pub trading_mode: TradingMode,
    pub active: bool,
}

impl Strategy {
    pub fn from_payload(entry: StrategyListEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            trade_amount: entry.trade_amount,
            trading_mode: entry.trading_mode,
            active: entry.active,
            stopped: false,
            loss_trade_run: 0,
        }
    }

    /// Refresh this strategy from a later hub payload, preserving
    /// engine-owned fields unless `active` toggled (`spec.md` §4.1
    /// `onStrategyList`: "preserves engine-owned fields (stopped,
    /// lossTradeRun, name), triggers ... logs mode switches ... when the
    /// active flag toggles ... resets stopped + loss count").
    ///
    /// Returns `true` if the trading mode changed, so the caller can log it.
    pub fn refresh_from_payload(&mut self, entry: StrategyListEntry) -> bool {
        let mode_switched = self.trading_mode != entry.trading_mode;
        let active_toggled = self.active != entry.active;

        self.trade_amount = entry.trade_amount;
        self.trading_mode = entry.trading_mode;
        self.active = entry.active;

        if active_toggled {
            self.stopped = false;
            self.loss_trade_run = 0;
        }

        mode_switched
    }

    /// `spec.md` §4.1 validation: "strategy at loss-limit threshold and
    /// `openTrades(strategy) >= LOSS_LIMIT - lossTradeRun`".
    pub fn at_loss_limit_threshold(
        &self,
        open_trades: u32,
        loss_limit: u32,
        limit_threshold: Decimal,
    ) -> bool {
        if loss_limit == 0 || limit_threshold <= Decimal::ZERO {
            return false;
        }
        let threshold_losses = (Decimal::from(loss_limit) * limit_threshold)
            .floor()
            .to_string()
            .parse::<u32>()
            .unwrap_or(0);
        if self.loss_trade_run < threshold_losses {
            return false;
        }
        let remaining = loss_limit.saturating_sub(self.loss_trade_run);
        open_trades >= remaining
    }

    /// Record a closed trade's win/loss against `loss_trade_run`, stopping
    /// the strategy outright once `STRATEGY_LOSS_LIMIT` is reached
    /// (`spec.md` §4.1 post-trade accounting, §8 S6).
    pub fn record_trade_result(&mut self, is_loss: bool, loss_limit: u32) {
        if is_loss {
            self.loss_trade_run += 1;
            if loss_limit > 0 && self.loss_trade_run >= loss_limit {
                self.stopped = true;
            }
        } else {
            self.loss_trade_run = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn strategy() -> Strategy {
        Strategy {
            id: "s1".into(),
            name: "s1".into(),
            trade_amount: dec!(0.01),
            trading_mode: TradingMode::Real,
            active: true,
            stopped: false,
            loss_trade_run: 0,
        }
    }

    #[test]
    fn active_toggle_resets_stopped_and_loss_run() {
        let mut strategy = strategy();
        strategy.stopped = true;
        strategy.loss_trade_run = 2;

        strategy.refresh_from_payload(StrategyListEntry {
            id: "s1".into(),
            name: "s1".into(),
            trade_amount: dec!(0.02),
            trading_mode: TradingMode::Real,
            active: false,
        });

        strategy.refresh_from_payload(StrategyListEntry {
            id: "s1".into(),
            name: "s1".into(),
            trade_amount: dec!(0.02),
            trading_mode: TradingMode::Real,
            active: true,
        });

        assert!(!strategy.stopped);
        assert_eq!(strategy.loss_trade_run, 0);
    }

    #[test]
    fn unchanged_active_preserves_stopped_flag_and_name() {
        let mut strategy = strategy();
        strategy.stopped = true;

        strategy.refresh_from_payload(StrategyListEntry {
            id: "s1".into(),
            name: "renamed".into(),
            trade_amount: dec!(0.05),
            trading_mode: TradingMode::Real,
            active: true,
        });

        assert!(strategy.stopped);
        assert_eq!(strategy.trade_amount, dec!(0.05));
        assert_eq!(strategy.name.as_str(), "s1");
    }

    #[test]
    fn s6_loss_limit_tripwire() {
        // spec.md §8 S6: LOSS_LIMIT=3, THRESHOLD=0.5; 2 losses + 2 open trades rejects.
        let mut strategy = strategy();
        strategy.loss_trade_run = 2;
        assert!(strategy.at_loss_limit_threshold(2, 3, dec!(0.5)));
        assert!(!strategy.at_loss_limit_threshold(0, 3, dec!(0.5)));

        strategy.record_trade_result(true, 3);
        assert!(strategy.stopped);
    }
}
