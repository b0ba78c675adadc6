use crate::{error::ConfigError, instrument::OptionContract};
use chrono::NaiveDate;
use itertools::Itertools;
use std::path::Path;
use tracing::info;

/// Source of listed option contracts per (symbol, expiry).
///
/// Stands in for the broker's option chain REST endpoint.
pub trait InstrumentCatalog: Send + Sync {
    fn contracts(&self, symbol: &str, expiry: NaiveDate) -> Vec<OptionContract>;
}

/// In-memory [`InstrumentCatalog`], optionally loaded from a JSON array of contracts:
///
/// ```json
/// [{"instrument_key":"NSE_FO|45450","symbol":"NIFTY","expiry":"2025-01-02","strike":"25000","side":"CE"}]
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    contracts: Vec<OptionContract>,
}

impl StaticCatalog {
    pub fn new(contracts: Vec<OptionContract>) -> Self {
        Self { contracts }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let contracts = serde_json::from_str::<Vec<OptionContract>>(&contents).map_err(|source| {
            ConfigError::Parse {
                path: path.display().to_string(),
                source,
            }
        })?;

        info!(path = %path.display(), contracts = contracts.len(), "loaded instrument catalog");
        Ok(Self::new(contracts))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Listed expiries for `symbol`, ascending.
    pub fn expiries(&self, symbol: &str) -> Vec<NaiveDate> {
        self.contracts
            .iter()
            .filter(|contract| contract.symbol == symbol)
            .map(|contract| contract.expiry)
            .sorted()
            .dedup()
            .collect()
    }
}

impl InstrumentCatalog for StaticCatalog {
    fn contracts(&self, symbol: &str, expiry: NaiveDate) -> Vec<OptionContract> {
        self.contracts
            .iter()
            .filter(|contract| contract.symbol == symbol && contract.expiry == expiry)
            .cloned()
            .collect()
    }
}
