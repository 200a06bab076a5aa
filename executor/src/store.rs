use async_trait::async_trait;
use executor_instrument::{Asset, Wallet};
use executor_risk::BalanceHistory;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::{
    meta::{MetaData, PublicStrategy, SnapshotKey, Transaction},
    strategy::Strategy,
    trade::TradeOpen,
};

/// Failures surfaced by the persistence backend (`spec.md` §7
/// `StartupUnrecoverable` when this happens during startup load).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("snapshot backend error: {0}")]
    Backend(String),

    #[error("transaction log append failed: {0}")]
    TransactionAppend(String),
}

/// Monotonic schema version persisted alongside the snapshot, used to gate
/// migrations (`spec.md` §4.6 step 2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SchemaVersion(pub u32);

pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion(1);

/// The six named snapshot keys, bundled into one value for a single
/// round-trip to the backend (`spec.md` §6 "Persisted state layout").
///
/// `markets`, `prices`, `trades_closing` and `transactions` never appear
/// here: `spec.md` §4.6 step 1 explicitly skips them on load, and they are
/// never part of `MetaData`'s dirty-set either.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistedSnapshot {
    pub version: Option<SchemaVersion>,
    pub strategies: Vec<Strategy>,
    pub trades_open: Vec<TradeOpen>,
    pub virtual_balances: HashMap<Wallet, HashMap<Asset, rust_decimal::Decimal>>,
    pub balance_history: BalanceHistory,
    pub public_strategies: HashMap<SmolStr, PublicStrategy>,
}

/// Durable snapshot of named typed objects plus an append-only transaction
/// log (`spec.md` §2 "State Store", §6). Persistence backend specifics are
/// an external collaborator (`spec.md` §1) — this trait is the only
/// contract the engine depends on.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, StoreError>;

    /// Persist `snapshot`, touching only the named keys in `dirty` (a
    /// from-scratch backend may simply overwrite everything; a real one
    /// should only write the keys that changed).
    async fn save(
        &self,
        dirty: &std::collections::HashSet<SnapshotKey>,
        snapshot: &PersistedSnapshot,
    ) -> Result<(), StoreError>;

    /// Append one row to the capped transaction log (`MAX_DATABASE_ROWS`;
    /// the cap itself is enforced in-memory by [`MetaData::push_transaction`],
    /// this only needs to durably append).
    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;
}

fn build_snapshot(meta: &MetaData) -> PersistedSnapshot {
    PersistedSnapshot {
        version: Some(CURRENT_SCHEMA_VERSION),
        strategies: meta.strategies.values().cloned().collect(),
        trades_open: meta.trades_open.clone(),
        virtual_balances: meta.virtual_balances.clone(),
        balance_history: meta.balance_history.clone(),
        public_strategies: meta.public_strategies.clone(),
    }
}

/// Coalesced writer in front of a [`SnapshotStore`] backend (`spec.md` §5
/// "Shared-resource policy": "coalesces a 100ms-delayed flush of the
/// dirty-keys set").
///
/// A call to [`StateStore::schedule_flush`] while a flush is already
/// pending is a no-op: the pending flush will observe whatever the
/// dirty-set looks like when it actually runs, which includes the new
/// mutation.
pub struct StateStore {
    backend: Arc<dyn SnapshotStore>,
    flush_delay: Duration,
    pending: SyncMutex<Option<JoinHandle<()>>>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn SnapshotStore>, flush_delay: Duration) -> Self {
        Self {
            backend,
            flush_delay,
            pending: SyncMutex::new(None),
        }
    }

    pub async fn load(&self) -> Result<Option<PersistedSnapshot>, StoreError> {
        self.backend.load().await
    }

    pub async fn append_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        self.backend.append_transaction(&transaction).await
    }

    /// Schedule a debounced flush of whatever is dirty in `meta` once
    /// `flush_delay` has elapsed with no further scheduling calls.
    pub fn schedule_flush(self: &Arc<Self>, meta: Arc<AsyncMutex<MetaData>>) {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return;
        }
        let this = self.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(this.flush_delay).await;
            let (dirty, snapshot) = {
                let mut meta = meta.lock().await;
                let dirty = meta.take_dirty();
                (dirty, build_snapshot(&meta))
            };
            *this.pending.lock() = None;
            if dirty.is_empty() {
                return;
            }
            if let Err(error) = this.backend.save(&dirty, &snapshot).await {
                tracing::error!(%error, "coalesced state store flush failed");
            }
        }));
    }

    /// Best-effort synchronous-equivalent flush used by shutdown (`spec.md`
    /// §5 "Shutdown is forced": "attempts a best-effort flush of the dirty
    /// set"). Bypasses the debounce delay.
    pub async fn flush_now(&self, meta: &mut MetaData) -> Result<(), StoreError> {
        let dirty = meta.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        let snapshot = build_snapshot(meta);
        self.backend.save(&dirty, &snapshot).await
    }
}

/// In-memory [`SnapshotStore`] used by tests and as the reference
/// implementation of the external persistence contract.
pub struct InMemoryStore {
    snapshot: SyncMutex<Option<PersistedSnapshot>>,
    transactions: SyncMutex<Vec<Transaction>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            snapshot: SyncMutex::new(None),
            transactions: SyncMutex::new(Vec::new()),
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(
        &self,
        _dirty: &std::collections::HashSet<SnapshotKey>,
        snapshot: &PersistedSnapshot,
    ) -> Result<(), StoreError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        self.transactions.lock().push(transaction.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{signal::PositionType, trade::TradeId};
    use executor_instrument::Symbol;

    #[tokio::test]
    async fn scheduled_flush_persists_dirty_state_after_the_delay() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Arc::new(StateStore::new(backend.clone(), Duration::from_millis(20)));
        let meta = Arc::new(AsyncMutex::new(MetaData::new(100)));

        {
            let mut guard = meta.lock().await;
            guard.strategies.insert(
                "s1".into(),
                Strategy {
                    id: "s1".into(),
                    name: "s1".into(),
                    trade_amount: rust_decimal_macros::dec!(0.01),
                    trading_mode: executor_instrument::TradingMode::Real,
                    active: true,
                    stopped: false,
                    loss_trade_run: 0,
                },
            );
            guard.mark_dirty(SnapshotKey::Strategies);
        }

        store.schedule_flush(meta.clone());
        assert!(backend.load().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let persisted = backend.load().await.unwrap().expect("flushed");
        assert_eq!(persisted.strategies.len(), 1);
    }

    #[tokio::test]
    async fn append_transaction_is_durable_independent_of_snapshot_flush() {
        let backend = Arc::new(InMemoryStore::new());
        let store = StateStore::new(backend.clone(), Duration::from_millis(100));
        store
            .append_transaction(Transaction::new(
                TradeId::derive("s1", &Symbol::new("BTCUSDT"), PositionType::Long, 1),
                crate::meta::TransactionKind::Borrow,
                Asset::new("BTC"),
                rust_decimal_macros::dec!(1),
                chrono::Utc::now(),
            ))
            .await
            .unwrap();
        assert_eq!(backend.transaction_count(), 1);
    }
}
