use chrono::{DateTime, Duration, NaiveDate, Utc};
use executor_instrument::{Asset, TradingMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One UTC day's running book for a single `(TradingMode, Asset)` pair
/// (`spec.md` §3 `BalanceHistory`).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BalanceHistoryEntry {
    pub date: NaiveDate,
    pub open_balance: Decimal,
    pub close_balance: Decimal,
    /// Signed: negative, since fees are a cost (`spec.md` §4.1 post-trade accounting).
    ///
    /// `serde(default)` is the migration: rows persisted before this field
    /// existed deserialize with zero fees instead of failing to load
    /// (`spec.md` §4.6 step 2, version-dependent migration).
    #[serde(default)]
    pub estimated_fees: Decimal,
    pub profit_loss: Decimal,
    pub min_open_trades: u32,
    pub max_open_trades: u32,
    pub total_opened_trades: u32,
    pub total_closed_trades: u32,
}

impl BalanceHistoryEntry {
    fn opening(date: NaiveDate, open_balance: Decimal, open_trades: u32) -> Self {
        Self {
            date,
            open_balance,
            close_balance: open_balance,
            estimated_fees: Decimal::ZERO,
            profit_loss: Decimal::ZERO,
            min_open_trades: open_trades,
            max_open_trades: open_trades,
            total_opened_trades: 0,
            total_closed_trades: 0,
        }
    }
}

/// Per-day, per-`(TradingMode, Asset)` rolling record of open/close balance,
/// fees, and trade counts (`spec.md` §3 `BalanceHistory`).
///
/// Day 0 (the oldest retained entry) is kept forever and fees from entries
/// older than a year are rolled forward into it; every other entry older
/// than a year is dropped (`spec.md` §8 P4: exactly one entry survives past
/// the one-year mark).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BalanceHistory {
    books: HashMap<(TradingMode, Asset), Vec<BalanceHistoryEntry>>,
}

impl BalanceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, mode: TradingMode, asset: &Asset) -> &[BalanceHistoryEntry] {
        self.books
            .get(&(mode, asset.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Today's entry for `(mode, asset)`, creating it (seeded from the
    /// previous day's close) if this is the first touch of the day.
    pub fn today_mut(
        &mut self,
        mode: TradingMode,
        asset: &Asset,
        now: DateTime<Utc>,
        open_trades: u32,
    ) -> &mut BalanceHistoryEntry {
        let today = now.date_naive();
        let book = self.books.entry((mode, asset.clone())).or_default();
        let needs_new_day = book.last().is_none_or(|e| e.date != today);
        if needs_new_day {
            let open_balance = book.last().map(|e| e.close_balance).unwrap_or(Decimal::ZERO);
            book.push(BalanceHistoryEntry::opening(today, open_balance, open_trades));
        }
        book.last_mut().expect("just pushed or already present")
    }

    /// Record a fee and PnL delta against today's close balance, bumping the
    /// closed-trade counter.
    pub fn record_close(
        &mut self,
        mode: TradingMode,
        asset: &Asset,
        now: DateTime<Utc>,
        open_trades: u32,
        fee: Decimal,
        profit_loss: Decimal,
    ) {
        let entry = self.today_mut(mode, asset, now, open_trades);
        entry.estimated_fees += fee;
        entry.profit_loss += profit_loss;
        entry.close_balance += profit_loss + fee;
        entry.total_closed_trades += 1;
        entry.min_open_trades = entry.min_open_trades.min(open_trades);
        entry.max_open_trades = entry.max_open_trades.max(open_trades);
    }

    pub fn record_open(
        &mut self,
        mode: TradingMode,
        asset: &Asset,
        now: DateTime<Utc>,
        open_trades: u32,
    ) {
        let entry = self.today_mut(mode, asset, now, open_trades);
        entry.total_opened_trades += 1;
        entry.min_open_trades = entry.min_open_trades.min(open_trades);
        entry.max_open_trades = entry.max_open_trades.max(open_trades);
    }

    /// Drop entries older than a year, rolling their fees forward into day 0
    /// (`spec.md` §3 Retention, §8 P4).
    pub fn apply_retention(&mut self, now: DateTime<Utc>) {
        let cutoff = (now - Duration::days(365)).date_naive();
        for book in self.books.values_mut() {
            if book.len() <= 1 {
                continue;
            }
            let mut rolled_fees = Decimal::ZERO;
            let mut retained = Vec::with_capacity(book.len());
            for (i, entry) in book.iter().enumerate() {
                if i == 0 {
                    continue;
                }
                if entry.date < cutoff {
                    rolled_fees += entry.estimated_fees;
                } else {
                    retained.push(*entry);
                }
            }
            let mut day_zero = book[0];
            day_zero.estimated_fees += rolled_fees;
            let mut new_book = Vec::with_capacity(retained.len() + 1);
            new_book.push(day_zero);
            new_book.extend(retained);
            *book = new_book;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn record_close_accumulates_fees_and_pnl_same_day() {
        let mut history = BalanceHistory::new();
        let asset = Asset::new("BTC");
        history.record_close(TradingMode::Real, &asset, day(2026, 1, 1), 1, dec!(-0.0001), dec!(0.001));
        history.record_close(TradingMode::Real, &asset, day(2026, 1, 1), 0, dec!(-0.0001), dec!(0.0005));

        let entries = history.entries(TradingMode::Real, &asset);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].estimated_fees, dec!(-0.0002));
        assert_eq!(entries[0].total_closed_trades, 2);
    }

    #[test]
    fn new_day_seeds_open_balance_from_previous_close() {
        let mut history = BalanceHistory::new();
        let asset = Asset::new("BTC");
        history.record_close(TradingMode::Real, &asset, day(2026, 1, 1), 1, dec!(0), dec!(0.01));
        history.record_open(TradingMode::Real, &asset, day(2026, 1, 2), 1);

        let entries = history.entries(TradingMode::Real, &asset);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].open_balance, entries[0].close_balance);
    }

    #[test]
    fn retention_keeps_day_zero_and_rolls_old_fees_into_it() {
        let mut history = BalanceHistory::new();
        let asset = Asset::new("BTC");
        history.record_close(TradingMode::Real, &asset, day(2024, 1, 1), 1, dec!(-0.001), dec!(0));
        history.record_close(TradingMode::Real, &asset, day(2026, 1, 1), 1, dec!(-0.0005), dec!(0));

        history.apply_retention(day(2026, 7, 28));

        let entries = history.entries(TradingMode::Real, &asset);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(entries[0].estimated_fees, dec!(-0.0015));
    }
}
