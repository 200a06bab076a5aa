use chrono::{DateTime, Utc};
use derive_more::Constructor;
use executor_instrument::{Asset, Market, Symbol, Wallet};
use executor_risk::BalanceHistory;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    signal::PositionType,
    strategy::Strategy,
    trade::{TradeId, TradeOpen},
};

/// A lightweight counter for a strategy we observe on the hub but don't
/// follow (`spec.md` §3 `PublicStrategy`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PublicStrategy {
    pub short_opened: u32,
    pub long_opened: u32,
    pub closed: u32,
}

/// One row of the append-only transaction log (`spec.md` §6 "Persisted
/// state layout"): a borrow, repay, or filled order, kept so `spec.md` §8
/// P2 ("matching borrow and repay both appear in the transaction log")
/// can be checked.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Transaction {
    pub trade_id: TradeId,
    pub kind: TransactionKind,
    pub asset: Asset,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Borrow,
    Repay,
    Buy,
    Sell,
}

/// Which of the six persisted snapshot keys a mutation touched (`spec.md`
/// §6 "Persisted state layout", §5 "Shared-resource policy": the State
/// Store observes mutations through this dirty-set rather than scanning
/// everything on every flush).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum SnapshotKey {
    Strategies,
    TradesOpen,
    VirtualBalances,
    BalanceHistory,
    PublicStrategies,
}

/// The full in-memory trading meta-data (`spec.md` §3 "MetaData
/// container"), threaded as a single context value through every engine
/// operation (`spec.md` §9 "Ambient global state → explicit context").
///
/// `markets`, `prices`, `trades_closing` and `transactions` are derived or
/// transient and are never part of `dirty` / the persisted snapshot keys
/// (`spec.md` §4.6 step 1: "Skip markets/prices/tradesClosing/transactions").
pub struct MetaData {
    pub strategies: IndexMap<SmolStr, Strategy>,
    pub trades_open: Vec<TradeOpen>,
    pub trades_closing: HashSet<TradeId>,
    pub markets: IndexMap<Symbol, Market>,
    pub prices: HashMap<Symbol, Decimal>,
    pub prices_fetched_at: Option<DateTime<Utc>>,
    pub virtual_balances: HashMap<Wallet, HashMap<Asset, Decimal>>,
    pub balance_history: BalanceHistory,
    pub public_strategies: HashMap<SmolStr, PublicStrategy>,
    pub transactions: VecDeque<Transaction>,
    max_transactions: usize,
    pub operational: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
    dirty: HashSet<SnapshotKey>,
}

impl MetaData {
    pub fn new(max_transactions: usize) -> Self {
        Self {
            strategies: IndexMap::new(),
            trades_open: Vec::new(),
            trades_closing: HashSet::new(),
            markets: IndexMap::new(),
            prices: HashMap::new(),
            prices_fetched_at: None,
            virtual_balances: HashMap::new(),
            balance_history: BalanceHistory::new(),
            public_strategies: HashMap::new(),
            transactions: VecDeque::new(),
            max_transactions,
            operational: false,
            reconciled_at: None,
            dirty: HashSet::new(),
        }
    }

    pub fn mark_dirty(&mut self, key: SnapshotKey) {
        self.dirty.insert(key);
    }

    /// Drain the dirty-set for the State Store's coalesced flush (`spec.md`
    /// §5: "coalesces a 100ms-delayed flush of the dirty-keys set").
    pub fn take_dirty(&mut self) -> HashSet<SnapshotKey> {
        std::mem::take(&mut self.dirty)
    }

    pub fn push_transaction(&mut self, transaction: Transaction) {
        self.transactions.push_back(transaction);
        while self.transactions.len() > self.max_transactions {
            self.transactions.pop_front();
        }
    }

    pub fn find_open_trade(
        &self,
        strategy_id: &str,
        symbol: &Symbol,
        position_type: PositionType,
    ) -> Option<&TradeOpen> {
        self.trades_open.iter().find(|t| {
            t.strategy_id == strategy_id && &t.symbol == symbol && t.position_type == position_type
        })
    }

    pub fn find_open_trade_mut(
        &mut self,
        strategy_id: &str,
        symbol: &Symbol,
        position_type: PositionType,
    ) -> Option<&mut TradeOpen> {
        self.trades_open.iter_mut().find(|t| {
            t.strategy_id == strategy_id && &t.symbol == symbol && t.position_type == position_type
        })
    }

    pub fn find_trade_by_id(&self, id: &TradeId) -> Option<&TradeOpen> {
        self.trades_open.iter().find(|t| &t.id == id)
    }

    pub fn find_trade_by_id_mut(&mut self, id: &TradeId) -> Option<&mut TradeOpen> {
        self.trades_open.iter_mut().find(|t| &t.id == id)
    }

    pub fn remove_trade(&mut self, id: &TradeId) -> Option<TradeOpen> {
        let idx = self.trades_open.iter().position(|t| &t.id == id)?;
        self.trades_closing.remove(id);
        self.mark_dirty(SnapshotKey::TradesOpen);
        Some(self.trades_open.remove(idx))
    }

    pub fn push_trade(&mut self, trade: TradeOpen) {
        self.trades_open.push(trade);
        self.mark_dirty(SnapshotKey::TradesOpen);
    }

    pub fn strategy_open_trade_count(&self, strategy_id: &str) -> u32 {
        self.trades_open
            .iter()
            .filter(|t| t.strategy_id == strategy_id)
            .count() as u32
    }

    pub fn open_trade_count(&self, strategy_id: &str, position_type: PositionType) -> u32 {
        self.trades_open
            .iter()
            .filter(|t| t.strategy_id == strategy_id && t.position_type == position_type)
            .count() as u32
    }

    pub fn total_open_trade_count(&self, position_type: PositionType) -> u32 {
        self.trades_open
            .iter()
            .filter(|t| t.position_type == position_type)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_log_is_capped() {
        let mut meta = MetaData::new(2);
        for i in 0..5u8 {
            meta.push_transaction(Transaction::new(
                TradeId::derive("s", &Symbol::new("BTCUSDT"), PositionType::Long, i as i64),
                TransactionKind::Borrow,
                Asset::new("BTC"),
                Decimal::ONE,
                Utc::now(),
            ));
        }
        assert_eq!(meta.transactions.len(), 2);
    }

    #[test]
    fn dirty_set_drains_on_take() {
        let mut meta = MetaData::new(10);
        meta.mark_dirty(SnapshotKey::Strategies);
        meta.mark_dirty(SnapshotKey::TradesOpen);
        let drained = meta.take_dirty();
        assert_eq!(drained.len(), 2);
        assert!(meta.take_dirty().is_empty());
    }
}
