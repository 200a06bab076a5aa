use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A single tradable coin, e.g. `BTC`, `USDT`, `BNB`.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct Asset(pub SmolStr);

impl Asset {
    pub fn new<S>(asset: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(asset.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<S> From<S> for Asset
where
    S: Into<SmolStr>,
{
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// An exchange trading pair, e.g. `BTCUSDT`, `ETHBTC`.
///
/// Symbols are opaque identifiers on the wire; [`Market::base`]/[`Market::quote`]
/// carry the decomposed [`Asset`]s.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct Symbol(pub SmolStr);

impl Symbol {
    pub fn new<S>(symbol: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<S> From<S> for Symbol
where
    S: Into<SmolStr>,
{
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_and_symbol_compare_by_inner_str() {
        assert_eq!(Asset::new("BTC"), Asset::new("BTC"));
        assert_ne!(Asset::new("BTC"), Asset::new("ETH"));
        assert_eq!(Symbol::new("BTCUSDT").as_str(), "BTCUSDT");
    }
}
