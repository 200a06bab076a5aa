use chrono::{DateTime, Duration, Utc};
use derive_more::Constructor;
use executor_instrument::{Asset, Wallet};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free/total balance for a single asset in a single wallet.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize, Constructor,
)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
}

impl Balance {
    pub fn used(&self) -> Decimal {
        self.total - self.free
    }
}

/// A margin-wallet balance, additionally reporting the cross-margin loan
/// (`userAssets.borrowed`) and its accrued interest, per §4.7.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize, Constructor,
)]
pub struct MarginBalance {
    pub balance: Balance,
    pub borrowed: Decimal,
    pub interest: Decimal,
}

struct CacheEntry {
    balances: HashMap<Asset, Balance>,
    fetched_at: DateTime<Utc>,
}

/// The single mutable balance cache an [`ExchangeGateway`](crate::ExchangeGateway)
/// implementation owns (`spec.md` §5 "Shared-resource policy").
///
/// Cached per wallet for up to 24h; any mutating call invalidates the
/// relevant wallet both before and after it runs, and the next fetch must
/// wait `sync_delay` past the most recent mutation before it is allowed to
/// hit the exchange again (`BALANCE_SYNC_DELAY`).
pub struct BalanceCache {
    ttl: Duration,
    sync_delay: std::time::Duration,
    entries: parking_lot::Mutex<HashMap<Wallet, CacheEntry>>,
    last_mutation: parking_lot::Mutex<HashMap<Wallet, DateTime<Utc>>>,
}

impl BalanceCache {
    pub fn new(ttl: Duration, sync_delay: std::time::Duration) -> Self {
        Self {
            ttl,
            sync_delay,
            entries: parking_lot::Mutex::new(HashMap::new()),
            last_mutation: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached balances for `wallet` if present and not yet stale.
    pub fn get(&self, wallet: Wallet) -> Option<HashMap<Asset, Balance>> {
        let entries = self.entries.lock();
        let entry = entries.get(&wallet)?;
        if Utc::now() - entry.fetched_at > self.ttl {
            return None;
        }
        Some(entry.balances.clone())
    }

    pub fn store(&self, wallet: Wallet, balances: HashMap<Asset, Balance>) {
        self.entries.lock().insert(
            wallet,
            CacheEntry {
                balances,
                fetched_at: Utc::now(),
            },
        );
    }

    pub fn invalidate(&self, wallet: Wallet) {
        self.entries.lock().remove(&wallet);
    }

    /// Record that a mutating call against `wallet` just ran; invalidates the
    /// cache and resets the settle-delay clock.
    pub fn record_mutation(&self, wallet: Wallet) {
        self.invalidate(wallet);
        self.last_mutation.lock().insert(wallet, Utc::now());
    }

    /// How long the caller must still wait before re-fetching `wallet`,
    /// honouring `BALANCE_SYNC_DELAY` after the most recent mutation.
    pub fn settle_wait(&self, wallet: Wallet) -> std::time::Duration {
        let Some(last) = self.last_mutation.lock().get(&wallet).copied() else {
            return std::time::Duration::ZERO;
        };
        let elapsed = Utc::now() - last;
        let elapsed_std = elapsed.to_std().unwrap_or(std::time::Duration::ZERO);
        self.sync_delay.saturating_sub(elapsed_std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_get_round_trips_until_invalidated() {
        let cache = BalanceCache::new(Duration::hours(24), std::time::Duration::from_millis(0));
        let mut balances = HashMap::new();
        balances.insert(Asset::new("BTC"), Balance::new(rust_decimal::Decimal::ONE, rust_decimal::Decimal::ONE));
        cache.store(Wallet::Spot, balances.clone());
        assert_eq!(cache.get(Wallet::Spot), Some(balances));

        cache.invalidate(Wallet::Spot);
        assert_eq!(cache.get(Wallet::Spot), None);
    }

    #[test]
    fn record_mutation_invalidates_and_starts_settle_wait() {
        let cache = BalanceCache::new(Duration::hours(24), std::time::Duration::from_secs(5));
        cache.store(Wallet::Margin, HashMap::new());
        cache.record_mutation(Wallet::Margin);
        assert_eq!(cache.get(Wallet::Margin), None);
        assert!(cache.settle_wait(Wallet::Margin) > std::time::Duration::ZERO);
    }
}
