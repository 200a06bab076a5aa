use crate::{
    balance::{Balance, BalanceCache},
    error::ExecutionError,
    gateway::{ExchangeGateway, OrderResult, OrderStatus, Side, Ticker, TransactionId},
};
use async_trait::async_trait;
use chrono::Duration;
use executor_instrument::{Asset, Market, Symbol, Wallet};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Deterministic in-memory [`ExchangeGateway`], used by engine tests and as
/// the price source for virtual-mode's synthetic fills (`spec.md` §4.5).
///
/// Market orders fill instantly at the current ticker's ask (buy) or bid
/// (sell); margin borrow/repay mutate an in-memory loan ledger. No call ever
/// fails unless explicitly configured to via [`MockGateway::fail_next_order`].
pub struct MockGateway {
    markets: IndexMap<Symbol, Market>,
    prices: Mutex<HashMap<Symbol, Decimal>>,
    tickers: Mutex<HashMap<Symbol, Ticker>>,
    balances: Mutex<HashMap<Wallet, HashMap<Asset, Balance>>>,
    margin_loans: Mutex<FnvHashMap<Asset, Decimal>>,
    cache: BalanceCache,
    tx_seq: AtomicU64,
    fail_next_order: Mutex<bool>,
}

impl MockGateway {
    pub fn new(markets: IndexMap<Symbol, Market>) -> Self {
        Self {
            markets,
            prices: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            margin_loans: Mutex::new(FnvHashMap::default()),
            cache: BalanceCache::new(Duration::hours(24), std::time::Duration::from_millis(0)),
            tx_seq: AtomicU64::new(0),
            fail_next_order: Mutex::new(false),
        }
    }

    pub fn set_ticker(&self, symbol: Symbol, ticker: Ticker) {
        self.prices.lock().insert(symbol.clone(), ticker.bid);
        self.tickers.lock().insert(symbol, ticker);
    }

    pub fn set_balance(&self, wallet: Wallet, asset: Asset, balance: Balance) {
        self.balances
            .lock()
            .entry(wallet)
            .or_default()
            .insert(asset, balance);
        self.cache.invalidate(wallet);
    }

    pub fn margin_loan(&self, asset: &Asset) -> Decimal {
        self.margin_loans
            .lock()
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn fail_next_order(&self) {
        *self.fail_next_order.lock() = true;
    }

    fn next_tx_id(&self) -> TransactionId {
        let id = self.tx_seq.fetch_add(1, Ordering::Relaxed);
        TransactionId(format!("mock-tx-{id}"))
    }

    fn market(&self, symbol: &Symbol) -> Result<&Market, ExecutionError> {
        self.markets
            .get(symbol)
            .ok_or_else(|| ExecutionError::UnknownMarket(symbol.clone()))
    }

    fn adjust(&self, wallet: Wallet, asset: &Asset, total_delta: Decimal, free_delta: Decimal) {
        let mut balances = self.balances.lock();
        let entry = balances.entry(wallet).or_default().entry(asset.clone()).or_default();
        entry.total += total_delta;
        entry.free += free_delta;
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn load_markets(&self, _force: bool) -> Result<IndexMap<Symbol, Market>, ExecutionError> {
        Ok(self.markets.clone())
    }

    async fn load_prices(&self) -> Result<HashMap<Symbol, Decimal>, ExecutionError> {
        Ok(self.prices.lock().clone())
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExecutionError> {
        self.tickers
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownMarket(symbol.clone()))
    }

    async fn fetch_balance(
        &self,
        wallet: Wallet,
    ) -> Result<HashMap<Asset, Balance>, ExecutionError> {
        if let Some(cached) = self.cache.get(wallet) {
            return Ok(cached);
        }
        let balances = self.balances.lock().get(&wallet).cloned().unwrap_or_default();
        self.cache.store(wallet, balances.clone());
        Ok(balances)
    }

    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: Decimal,
        wallet: Wallet,
    ) -> Result<OrderResult, ExecutionError> {
        if std::mem::take(&mut *self.fail_next_order.lock()) {
            return Err(ExecutionError::Network("mock order failure injected".into()));
        }
        let market = self.market(symbol)?;
        let quantity = market.legal_qty(amount);
        let ticker = self.fetch_ticker(symbol).await?;
        let price = match side {
            Side::Buy => ticker.ask,
            Side::Sell => ticker.bid,
        };
        let cost = quantity * price;

        self.cache.record_mutation(wallet);
        match side {
            Side::Buy => {
                self.adjust(wallet, &market.quote.clone(), -cost, -cost);
                self.adjust(wallet, &market.base.clone(), quantity, quantity);
            }
            Side::Sell => {
                self.adjust(wallet, &market.base.clone(), -quantity, -quantity);
                self.adjust(wallet, &market.quote.clone(), cost, cost);
            }
        }
        self.cache.record_mutation(wallet);

        Ok(OrderResult::new(OrderStatus::Closed, price, cost, quantity))
    }

    async fn margin_borrow(
        &self,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<TransactionId, ExecutionError> {
        self.cache.record_mutation(Wallet::Margin);
        *self.margin_loans.lock().entry(asset.clone()).or_insert(Decimal::ZERO) += amount;
        self.adjust(Wallet::Margin, asset, amount, amount);
        self.cache.record_mutation(Wallet::Margin);
        Ok(self.next_tx_id())
    }

    async fn margin_repay(
        &self,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<TransactionId, ExecutionError> {
        self.cache.record_mutation(Wallet::Margin);
        *self.margin_loans.lock().entry(asset.clone()).or_insert(Decimal::ZERO) -= amount;
        self.adjust(Wallet::Margin, asset, -amount, -amount);
        self.cache.record_mutation(Wallet::Margin);
        Ok(self.next_tx_id())
    }

    async fn amount_to_precision(
        &self,
        symbol: &Symbol,
        qty: Decimal,
    ) -> Result<Decimal, ExecutionError> {
        Ok(self.market(symbol)?.legal_qty(qty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_instrument::market::{Limits, Precision};
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

    #[tokio::test]
    async fn buy_order_debits_quote_and_credits_base() {
        let mut markets = IndexMap::new();
        markets.insert(Symbol::new("BTCUSDT"), btcusdt());
        let gateway = MockGateway::new(markets);
        gateway.set_ticker(Symbol::new("BTCUSDT"), Ticker::new(dec!(100), dec!(101)));
        gateway.set_balance(Wallet::Spot, Asset::new("USDT"), Balance::new(dec!(1000), dec!(1000)));

        let result = gateway
            .create_market_order(&Symbol::new("BTCUSDT"), Side::Buy, dec!(1), Wallet::Spot)
            .await
            .unwrap();
        assert!(result.is_filled());
        assert_eq!(result.price, dec!(101));

        let balances = gateway.fetch_balance(Wallet::Spot).await.unwrap();
        assert_eq!(balances[&Asset::new("USDT")].free, dec!(1000) - dec!(101));
        assert_eq!(balances[&Asset::new("BTC")].free, dec!(1));
    }

    #[tokio::test]
    async fn margin_borrow_then_repay_nets_to_zero_loan() {
        let gateway = MockGateway::new(IndexMap::new());
        gateway.margin_borrow(&Asset::new("BTC"), dec!(0.5)).await.unwrap();
        assert_eq!(gateway.margin_loan(&Asset::new("BTC")), dec!(0.5));
        gateway.margin_repay(&Asset::new("BTC"), dec!(0.5)).await.unwrap();
        assert_eq!(gateway.margin_loan(&Asset::new("BTC")), dec!(0));
    }
}
