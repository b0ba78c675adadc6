use crate::{Greeks, Tick, instrument::{OptionSide, Symbol}};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest quote for one side of a strike.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OptionQuote {
    pub last_price: f64,
    pub open_interest: u64,
    pub volume: u64,
    pub greeks: Option<Greeks>,
    pub iv: Option<f64>,
}

impl OptionQuote {
    pub fn gamma(&self) -> Option<f64> {
        self.greeks.map(|greeks| greeks.gamma)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrikeState {
    pub strike: Decimal,
    pub call: Option<OptionQuote>,
    pub put: Option<OptionQuote>,
    pub last_update: DateTime<Utc>,
}

impl StrikeState {
    pub fn new(strike: Decimal, time: DateTime<Utc>) -> Self {
        Self {
            strike,
            call: None,
            put: None,
            last_update: time,
        }
    }

    pub fn side(&self, side: OptionSide) -> Option<&OptionQuote> {
        match side {
            OptionSide::Call => self.call.as_ref(),
            OptionSide::Put => self.put.as_ref(),
        }
    }

    pub fn call_oi(&self) -> u64 {
        self.call.as_ref().map_or(0, |quote| quote.open_interest)
    }

    pub fn put_oi(&self) -> u64 {
        self.put.as_ref().map_or(0, |quote| quote.open_interest)
    }

    pub fn total_oi(&self) -> u64 {
        self.call_oi().saturating_add(self.put_oi())
    }

    pub fn strike_f64(&self) -> f64 {
        self.strike.to_f64().unwrap_or(f64::NAN)
    }
}

/// Strikes of one expiry.
///
/// `total_call_oi` and `total_put_oi` equal the sum of the per-strike open interest, saturating
/// at `u64::MAX`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpiryState {
    pub strikes: BTreeMap<Decimal, StrikeState>,
    pub total_call_oi: u64,
    pub total_put_oi: u64,
}

impl ExpiryState {
    /// Update only the touched side of `strike`, creating the [`StrikeState`] on first sight.
    pub fn apply_option(&mut self, strike: Decimal, side: OptionSide, tick: &Tick) {
        let state = self
            .strikes
            .entry(strike)
            .or_insert_with(|| StrikeState::new(strike, tick.timestamp));
        state.last_update = state.last_update.max(tick.timestamp);

        let slot = match side {
            OptionSide::Call => &mut state.call,
            OptionSide::Put => &mut state.put,
        };
        let previous_oi = slot.as_ref().map_or(0, |quote| quote.open_interest);
        let quote = slot.get_or_insert_with(OptionQuote::default);

        quote.last_price = tick.last_price;
        if let Some(open_interest) = tick.open_interest {
            // float -> int casts saturate
            quote.open_interest = open_interest.round() as u64;
        }
        if let Some(volume) = tick.volume {
            quote.volume = volume;
        }
        if tick.greeks.is_some() {
            quote.greeks = tick.greeks;
        }
        if tick.iv.is_some() {
            quote.iv = tick.iv;
        }
        let current_oi = quote.open_interest;

        let total = match side {
            OptionSide::Call => &mut self.total_call_oi,
            OptionSide::Put => &mut self.total_put_oi,
        };
        *total = total.saturating_sub(previous_oi).saturating_add(current_oi);
    }

    /// Remove strikes last updated before `cutoff`, keeping OI aggregates consistent.
    pub fn prune_strikes(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.strikes.len();
        let (total_call_oi, total_put_oi) = (&mut self.total_call_oi, &mut self.total_put_oi);
        self.strikes.retain(|_, state| {
            let keep = state.last_update >= cutoff;
            if !keep {
                *total_call_oi = total_call_oi.saturating_sub(state.call_oi());
                *total_put_oi = total_put_oi.saturating_sub(state.put_oi());
            }
            keep
        });
        before - self.strikes.len()
    }
}

/// Mutable market state of one underlying symbol: spot, plus the strikes of every expiry
/// that ticks have arrived for.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMarketState {
    pub symbol: Symbol,
    pub spot: Option<f64>,
    pub spot_change: f64,
    pub spot_change_pct: f64,
    pub expiries: BTreeMap<NaiveDate, ExpiryState>,
    pub last_update: DateTime<Utc>,
}

impl SymbolMarketState {
    pub fn new(symbol: Symbol, time: DateTime<Utc>) -> Self {
        Self {
            symbol,
            spot: None,
            spot_change: 0.0,
            spot_change_pct: 0.0,
            expiries: BTreeMap::new(),
            last_update: time,
        }
    }

    pub fn apply_spot(&mut self, tick: &Tick) {
        let price = tick.last_price;
        (self.spot_change, self.spot_change_pct) = match self.spot {
            Some(previous) if previous > 0.0 => {
                let change = price - previous;
                (change, change / previous * 100.0)
            }
            _ => (0.0, 0.0),
        };
        self.spot = Some(price);
        self.touch(tick.timestamp);
    }

    pub fn apply_option(
        &mut self,
        expiry: NaiveDate,
        strike: Decimal,
        side: OptionSide,
        tick: &Tick,
    ) {
        self.expiries
            .entry(expiry)
            .or_default()
            .apply_option(strike, side, tick);
        self.touch(tick.timestamp);
    }

    /// Remove strikes last updated before `cutoff`, dropping expiries left without strikes.
    pub fn prune_strikes(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        self.expiries.retain(|_, expiry| {
            pruned += expiry.prune_strikes(cutoff);
            !expiry.strikes.is_empty()
        });
        pruned
    }

    pub fn has_strikes(&self) -> bool {
        self.expiries.values().any(|expiry| !expiry.strikes.is_empty())
    }

    /// Owned snapshot of spot and the strikes of `expiry`. Strikes are empty if no tick for the
    /// expiry has arrived.
    pub fn snapshot(&self, expiry: NaiveDate) -> SymbolSnapshot {
        let (strikes, total_call_oi, total_put_oi) = match self.expiries.get(&expiry) {
            Some(state) => (
                state.strikes.values().cloned().collect(),
                state.total_call_oi,
                state.total_put_oi,
            ),
            None => (Vec::new(), 0, 0),
        };

        SymbolSnapshot {
            symbol: self.symbol.clone(),
            expiry,
            spot: self.spot,
            spot_change: self.spot_change,
            spot_change_pct: self.spot_change_pct,
            strikes,
            total_call_oi,
            total_put_oi,
            last_update: self.last_update,
        }
    }

    fn touch(&mut self, time: DateTime<Utc>) {
        self.last_update = self.last_update.max(time);
    }
}

/// Immutable copy of a [`SymbolMarketState`] for one expiry, with strikes in ascending order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: Symbol,
    pub expiry: NaiveDate,
    pub spot: Option<f64>,
    pub spot_change: f64,
    pub spot_change_pct: f64,
    pub strikes: Vec<StrikeState>,
    pub total_call_oi: u64,
    pub total_put_oi: u64,
    pub last_update: DateTime<Utc>,
}

impl SymbolSnapshot {
    /// Index of the strike nearest spot, ties resolving to the lower strike.
    pub fn atm_index(&self) -> Option<usize> {
        let spot = self.spot?;
        nearest_strike_index(self.strikes.iter().map(|state| state.strike), spot)
    }

    pub fn atm_strike(&self) -> Option<Decimal> {
        self.atm_index().map(|index| self.strikes[index].strike)
    }

    /// Up to `k` strikes either side of `atm`, inclusive.
    pub fn strike_window(&self, atm: Decimal, k: usize) -> &[StrikeState] {
        match self.strikes.binary_search_by(|state| state.strike.cmp(&atm)) {
            Ok(index) => {
                let start = index.saturating_sub(k);
                let end = (index + k + 1).min(self.strikes.len());
                &self.strikes[start..end]
            }
            Err(_) => &[],
        }
    }

    pub fn strike(&self, strike: Decimal) -> Option<&StrikeState> {
        self.strikes
            .binary_search_by(|state| state.strike.cmp(&strike))
            .ok()
            .map(|index| &self.strikes[index])
    }

    /// Put-call ratio of aggregate open interest, `None` without call OI.
    pub fn pcr(&self) -> Option<f64> {
        (self.total_call_oi > 0).then(|| self.total_put_oi as f64 / self.total_call_oi as f64)
    }
}

/// Index of the strike nearest `spot` in an ascending sequence, ties resolving to the lower
/// strike.
pub fn nearest_strike_index<Iter>(strikes: Iter, spot: f64) -> Option<usize>
where
    Iter: IntoIterator<Item = Decimal>,
{
    if !spot.is_finite() {
        return None;
    }

    let mut nearest: Option<(usize, f64)> = None;
    for (index, strike) in strikes.into_iter().enumerate() {
        let Some(strike) = strike.to_f64() else {
            continue;
        };
        let distance = (strike - spot).abs();
        match nearest {
            Some((_, best)) if distance >= best => {}
            _ => nearest = Some((index, distance)),
        }
    }
    nearest.map(|(index, _)| index)
}
