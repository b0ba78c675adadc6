use crate::error::RouteError;
use chrono::{Datelike, Month, NaiveDate};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::BTreeSet, str::FromStr};

/// Broker instrument key, eg/ `NSE_INDEX|Nifty 50` or `NSE_FO|45450`.
pub type InstrumentKey = SmolStr;

/// Underlying symbol that market state is keyed by, eg/ `NIFTY`.
pub type Symbol = SmolStr;

/// Option side, using exchange CE/PE notation.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize,
)]
pub enum OptionSide {
    #[display("CE")]
    #[serde(rename = "CE", alias = "call", alias = "CALL")]
    Call,
    #[display("PE")]
    #[serde(rename = "PE", alias = "put", alias = "PUT")]
    Put,
}

impl OptionSide {
    /// Parse a trailing `CE` / `PE` suffix.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "CE" => Some(Self::Call),
            "PE" => Some(Self::Put),
            _ => None,
        }
    }
}

/// Where a [`Tick`](crate::Tick) lands in market state.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Route {
    Spot {
        symbol: Symbol,
    },
    Option {
        symbol: Symbol,
        expiry: NaiveDate,
        strike: Decimal,
        side: OptionSide,
    },
}

impl Route {
    pub fn symbol(&self) -> &Symbol {
        match self {
            Route::Spot { symbol } | Route::Option { symbol, .. } => symbol,
        }
    }
}

/// Listed option contract, as provided by an instrument catalog.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct OptionContract {
    pub instrument_key: InstrumentKey,
    pub symbol: Symbol,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub side: OptionSide,
}

impl OptionContract {
    pub fn route(&self) -> Route {
        Route::Option {
            symbol: self.symbol.clone(),
            expiry: self.expiry,
            strike: self.strike,
            side: self.side,
        }
    }
}

/// Lookup table from instrument key to [`Route`].
///
/// Index aliases come from configuration, option contracts and chain expiries are registered
/// by the chain registry as chains are opened. Keys that are in neither table fall back to the
/// self-describing trading symbol grammar (see [`parse_trading_symbol`]), resolved against the
/// registered expiries of the symbol.
#[derive(Debug, Default)]
pub struct InstrumentDirectory {
    index_aliases: RwLock<FnvHashMap<InstrumentKey, Symbol>>,
    contracts: RwLock<FnvHashMap<InstrumentKey, OptionContract>>,
    expiries: RwLock<FnvHashMap<Symbol, BTreeSet<NaiveDate>>>,
}

impl InstrumentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an [`InstrumentDirectory`] pre-seeded with index key aliases.
    pub fn with_index_aliases<Iter>(aliases: Iter) -> Self
    where
        Iter: IntoIterator<Item = (InstrumentKey, Symbol)>,
    {
        let directory = Self::new();
        for (key, symbol) in aliases {
            directory.register_index(key, symbol);
        }
        directory
    }

    pub fn register_index(&self, key: impl Into<InstrumentKey>, symbol: impl Into<Symbol>) {
        self.index_aliases.write().insert(key.into(), symbol.into());
    }

    pub fn register_expiry(&self, symbol: impl Into<Symbol>, expiry: NaiveDate) {
        self.expiries
            .write()
            .entry(symbol.into())
            .or_default()
            .insert(expiry);
    }

    pub fn register_contracts(&self, contracts: &[OptionContract]) {
        let mut guard = self.contracts.write();
        let mut expiries = self.expiries.write();
        for contract in contracts {
            guard.insert(contract.instrument_key.clone(), contract.clone());
            expiries
                .entry(contract.symbol.clone())
                .or_default()
                .insert(contract.expiry);
        }
    }

    /// Index instrument keys whose spot ticks feed a symbol.
    pub fn index_keys_for(&self, symbol: &str) -> Vec<InstrumentKey> {
        let mut keys = self
            .index_aliases
            .read()
            .iter()
            .filter(|(_, alias)| alias.as_str() == symbol)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Every configured index instrument key.
    pub fn index_keys(&self) -> Vec<InstrumentKey> {
        let mut keys = self.index_aliases.read().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Latest registered expiry of `symbol` within the contract month, ie/ the monthly expiry.
    pub fn monthly_expiry(&self, symbol: &str, year: i32, month: u32) -> Option<NaiveDate> {
        self.expiries
            .read()
            .get(symbol)?
            .iter()
            .rev()
            .find(|expiry| expiry.year() == year && expiry.month() == month)
            .copied()
    }

    /// Resolve an instrument key to a [`Route`].
    pub fn resolve(&self, key: &str) -> Result<Route, RouteError> {
        let (segment, token) = key.split_once('|').unwrap_or(("", key));

        if segment.ends_with("_INDEX") {
            let symbol = self
                .index_aliases
                .read()
                .get(key)
                .cloned()
                .unwrap_or_else(|| normalise_index_name(token));
            return Ok(Route::Spot { symbol });
        }

        if let Some(contract) = self.contracts.read().get(key) {
            return Ok(contract.route());
        }

        parse_trading_symbol(token)
            .and_then(|parsed| {
                let expiry = self.monthly_expiry(&parsed.symbol, parsed.year, parsed.month)?;
                Some(Route::Option {
                    symbol: parsed.symbol,
                    expiry,
                    strike: parsed.strike,
                    side: parsed.side,
                })
            })
            .ok_or_else(|| RouteError::Unresolved(InstrumentKey::from(key)))
    }
}

/// `Nifty 50` -> `NIFTY50`.
fn normalise_index_name(name: &str) -> Symbol {
    let normalised = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect::<String>();
    Symbol::from(normalised)
}

/// Fields of a monthly-format trading symbol. The contract month does not name the expiry day.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TradingSymbol {
    pub symbol: Symbol,
    pub year: i32,
    pub month: u32,
    pub strike: Decimal,
    pub side: OptionSide,
}

/// Parse a monthly-format trading symbol `<SYMBOL><YY><MON><STRIKE><CE|PE>`,
/// eg/ `NIFTY25JAN25000CE` or `BANKNIFTY25JAN51500.5PE`.
pub fn parse_trading_symbol(token: &str) -> Option<TradingSymbol> {
    if token.len() < 3 || !token.is_ascii() {
        return None;
    }
    let (body, suffix) = token.split_at(token.len() - 2);
    let side = OptionSide::from_suffix(suffix)?;

    let strike_start = body
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|index| index + 1)?;
    let (head, strike) = body.split_at(strike_start);
    let strike = Decimal::from_str(strike).ok().filter(|strike| *strike > Decimal::ZERO)?;

    // head = <SYMBOL><YY><MON>
    if head.len() < 6 {
        return None;
    }
    let (head, month) = head.split_at(head.len() - 3);
    let (symbol, year) = head.split_at(head.len() - 2);
    if !month.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let month = Month::from_str(month).ok()?.number_from_month();
    let year = year
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| year.parse::<i32>().ok())
        .flatten()?;
    let valid_symbol = !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '&' || c == '-');
    if !valid_symbol {
        return None;
    }

    Some(TradingSymbol {
        symbol: Symbol::from(symbol),
        year: 2000 + year,
        month,
        strike,
        side,
    })
}
