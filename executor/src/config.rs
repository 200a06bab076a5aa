use executor_instrument::Wallet;
use executor_risk::FundingPolicy;
use rust_decimal::Decimal;
use std::{collections::HashSet, env, time::Duration};
use thiserror::Error;

/// A configuration value was missing, malformed, or outside its legal range
/// (`spec.md` §9 "An invalid configuration is a `ConfigError` raised before
/// the engine is constructed — never a silent clamp").
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Every configuration key enumerated by `spec.md` §6, loaded from the
/// process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub hub_api_key: String,

    pub primary_wallet: Wallet,
    pub trade_long_funds: FundingPolicy,

    pub is_funds_no_loss: bool,
    pub is_trade_margin_enabled: bool,
    pub is_trade_short_enabled: bool,
    pub is_buy_qty_fraction: bool,
    pub is_pay_interest_enabled: bool,
    pub is_auto_close_enabled: bool,

    pub wallet_buffer: Decimal,
    pub max_long_trades: u32,
    pub max_short_trades: u32,
    pub strategy_loss_limit: u32,
    pub strategy_limit_threshold: Decimal,
    pub exclude_coins: HashSet<String>,

    pub taker_fee_percent: Decimal,
    pub min_cost_buffer: Decimal,
    pub virtual_wallet_funds: Decimal,

    pub bnb_free_threshold: Decimal,
    pub bnb_free_float: Decimal,
    pub bnb_auto_top_up: Option<String>,

    pub balance_sync_delay: Duration,
    pub background_interval: Duration,
    pub reference_symbol: String,

    pub max_database_rows: usize,
    pub trade_queue_min_gap: Duration,
    pub operator_password: Option<String>,
}

impl Config {
    /// Load and validate configuration from the process environment
    /// (`spec.md` §6 "Configuration").
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            exchange_api_key: require("EXCHANGE_API_KEY")?,
            exchange_api_secret: require("EXCHANGE_API_SECRET")?,
            hub_api_key: require("HUB_API_KEY")?,

            primary_wallet: parse_enum("PRIMARY_WALLET", Wallet::Spot, |s| match s {
                "margin" => Some(Wallet::Margin),
                "spot" => Some(Wallet::Spot),
                _ => None,
            })?,
            trade_long_funds: parse_enum("TRADE_LONG_FUNDS", FundingPolicy::None, |s| match s {
                "none" => Some(FundingPolicy::None),
                "borrow-min" => Some(FundingPolicy::BorrowMin),
                "borrow-all" => Some(FundingPolicy::BorrowAll),
                "sell-all" => Some(FundingPolicy::SellAll),
                "sell-largest" => Some(FundingPolicy::SellLargest),
                "sell-largest-pnl" => Some(FundingPolicy::SellLargestPnl),
                _ => None,
            })?,

            is_funds_no_loss: parse_bool("IS_FUNDS_NO_LOSS", false)?,
            is_trade_margin_enabled: parse_bool("IS_TRADE_MARGIN_ENABLED", true)?,
            is_trade_short_enabled: parse_bool("IS_TRADE_SHORT_ENABLED", false)?,
            is_buy_qty_fraction: parse_bool("IS_BUY_QTY_FRACTION", false)?,
            is_pay_interest_enabled: parse_bool("IS_PAY_INTEREST_ENABLED", true)?,
            is_auto_close_enabled: parse_bool("IS_AUTO_CLOSE_ENABLED", false)?,

            wallet_buffer: parse_decimal_range("WALLET_BUFFER", Decimal::ZERO, Decimal::ZERO, Decimal::ONE, false)?,
            max_long_trades: parse_u32("MAX_LONG_TRADES", 0)?,
            max_short_trades: parse_u32("MAX_SHORT_TRADES", 0)?,
            strategy_loss_limit: parse_u32("STRATEGY_LOSS_LIMIT", 0)?,
            strategy_limit_threshold: parse_decimal_range(
                "STRATEGY_LIMIT_THRESHOLD",
                Decimal::ZERO,
                Decimal::ZERO,
                Decimal::ONE,
                true,
            )?,
            exclude_coins: env::var("EXCLUDE_COINS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .collect(),

            taker_fee_percent: parse_decimal("TAKER_FEE_PERCENT", Decimal::new(1, 1))?,
            min_cost_buffer: parse_decimal("MIN_COST_BUFFER", Decimal::new(1, 2))?,
            virtual_wallet_funds: parse_decimal("VIRTUAL_WALLET_FUNDS", Decimal::ONE)?,

            bnb_free_threshold: parse_decimal("BNB_FREE_THRESHOLD", Decimal::new(5, 1))?,
            bnb_free_float: parse_decimal("BNB_FREE_FLOAT", Decimal::new(1, 1))?,
            bnb_auto_top_up: env::var("BNB_AUTO_TOP_UP").ok().filter(|s| !s.is_empty()),

            balance_sync_delay: parse_millis("BALANCE_SYNC_DELAY", 1_000)?,
            background_interval: parse_millis("BACKGROUND_INTERVAL", 300_000)?,
            reference_symbol: env::var("REFERENCE_SYMBOL").unwrap_or_else(|_| "BTC".to_string()),

            max_database_rows: parse_u32("MAX_DATABASE_ROWS", 10_000)? as usize,
            trade_queue_min_gap: parse_millis("TRADE_QUEUE_MIN_GAP", 250)?,
            operator_password: env::var("OPERATOR_PASSWORD").ok().filter(|s| !s.is_empty()),
        };

        if !config.is_trade_margin_enabled && config.primary_wallet == Wallet::Margin {
            return Err(ConfigError::Invalid {
                key: "PRIMARY_WALLET",
                value: "margin".to_string(),
                reason: "margin trading is disabled but margin is the primary wallet",
            });
        }

        Ok(config)
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean (true/false/1/0)",
            }),
        },
    }
}

fn parse_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.parse::<u32>().map_err(|_| ConfigError::Invalid {
            key,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_u32(key, default as u32).map(|ms| Duration::from_millis(ms as u64))
}

fn parse_decimal(key: &'static str, default: Decimal) -> Result<Decimal, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.parse::<Decimal>().map_err(|_| ConfigError::Invalid {
            key,
            value,
            reason: "expected a decimal number",
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_decimal_range(
    key: &'static str,
    default: Decimal,
    min: Decimal,
    max: Decimal,
    max_inclusive: bool,
) -> Result<Decimal, ConfigError> {
    let value = parse_decimal(key, default)?;
    let in_range = value >= min && if max_inclusive { value <= max } else { value < max };
    if !in_range {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "out of the configured legal range",
        });
    }
    Ok(value)
}

fn parse_enum<T>(
    key: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => parse(value.to_lowercase().as_str()).ok_or(ConfigError::Invalid {
            key,
            value,
            reason: "unrecognised enum value",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_buffer_rejects_one_and_above() {
        let result = parse_decimal_range("WALLET_BUFFER", Decimal::ONE, Decimal::ZERO, Decimal::ONE, false);
        assert!(result.is_err());
    }

    #[test]
    fn strategy_limit_threshold_accepts_one_inclusive() {
        let result = parse_decimal_range(
            "STRATEGY_LIMIT_THRESHOLD",
            Decimal::ONE,
            Decimal::ZERO,
            Decimal::ONE,
            true,
        );
        assert!(result.is_ok());
    }
}
