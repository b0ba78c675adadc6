use crate::{
    config::ChainConfig,
    instrument::{InstrumentKey, OptionContract, OptionSide, Symbol},
    store::{
        MarketStateStore,
        state::{OptionQuote, StrikeState, SymbolSnapshot, nearest_strike_index},
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info};

/// Subscribe / unsubscribe control consumed by the feed.
pub trait SubscriptionControl: Send + Sync {
    fn subscribe(&self, keys: &[InstrumentKey]);

    fn unsubscribe(&self, keys: &[InstrumentKey]);
}

/// Unique identity of an option chain.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize,
)]
#[display("{symbol}@{expiry}")]
pub struct ChainKey {
    pub symbol: Symbol,
    pub expiry: NaiveDate,
}

impl ChainKey {
    pub fn new(symbol: impl Into<Symbol>, expiry: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            expiry,
        }
    }
}

/// Instrument keys listed for one strike.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ListedStrike {
    strike: Decimal,
    call: Option<InstrumentKey>,
    put: Option<InstrumentKey>,
}

impl ListedStrike {
    fn keys(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.call.iter().chain(self.put.iter())
    }
}

/// Mutable window state of an [`OptionChainBuilder`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub atm_strike: Option<Decimal>,
    /// Active strike window, ascending.
    pub window: Vec<Decimal>,
    /// Instrument key -> (strike, side) for every key in the window.
    pub lookup: FnvHashMap<InstrumentKey, (Decimal, OptionSide)>,
    pub subscribed: BTreeSet<InstrumentKey>,
    pub initialized: bool,
    centre_index: usize,
}

/// Subscription delta produced by a window rebuild.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WindowChange {
    pub atm_strike: Decimal,
    pub added: Vec<InstrumentKey>,
    pub removed: Vec<InstrumentKey>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainLeg {
    pub strike: Decimal,
    pub instrument_key: Option<InstrumentKey>,
    pub quote: Option<OptionQuote>,
}

/// Option chain snapshot for the active window.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainPayload {
    pub symbol: Symbol,
    pub expiry: NaiveDate,
    pub spot: f64,
    pub spot_change: f64,
    pub spot_change_pct: f64,
    pub atm_strike: Decimal,
    pub calls: Vec<ChainLeg>,
    pub puts: Vec<ChainLeg>,
    /// Call OI summed over the window.
    pub total_call_oi: u64,
    /// Put OI summed over the window.
    pub total_put_oi: u64,
    pub pcr: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Maintains the ATM-centred strike window of one (symbol, expiry) chain.
///
/// Only ever constructed through [`ChainRegistry`](super::ChainRegistry), which guarantees a
/// single instance per [`ChainKey`].
pub struct OptionChainBuilder {
    key: ChainKey,
    config: ChainConfig,
    listed: Vec<ListedStrike>,
    store: Arc<MarketStateStore>,
    control: Arc<dyn SubscriptionControl>,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for OptionChainBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionChainBuilder")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("listed", &self.listed.len())
            .field("state", &self.state)
            .finish()
    }
}

impl OptionChainBuilder {
    pub(crate) fn new(
        key: ChainKey,
        contracts: &[OptionContract],
        config: ChainConfig,
        store: Arc<MarketStateStore>,
        control: Arc<dyn SubscriptionControl>,
    ) -> Self {
        let mut listed = FnvHashMap::<Decimal, ListedStrike>::default();
        for contract in contracts
            .iter()
            .filter(|contract| contract.symbol == key.symbol && contract.expiry == key.expiry)
        {
            let strike = listed
                .entry(contract.strike)
                .or_insert_with(|| ListedStrike {
                    strike: contract.strike,
                    call: None,
                    put: None,
                });
            let slot = match contract.side {
                OptionSide::Call => &mut strike.call,
                OptionSide::Put => &mut strike.put,
            };
            *slot = Some(contract.instrument_key.clone());
        }
        let mut listed = listed.into_values().collect::<Vec<_>>();
        listed.sort_by(|a, b| a.strike.cmp(&b.strike));

        Self {
            key,
            config,
            listed,
            store,
            control,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Listed strikes, ascending.
    pub fn strikes(&self) -> Vec<Decimal> {
        self.listed.iter().map(|listed| listed.strike).collect()
    }

    pub fn state(&self) -> ChainState {
        self.state.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<InstrumentKey> {
        self.state.lock().subscribed.iter().cloned().collect()
    }

    fn window_bounds(&self, atm_index: usize) -> (usize, usize) {
        let k = self.config.window_strikes;
        let start = atm_index.saturating_sub(k);
        let end = (atm_index + k + 1).min(self.listed.len());
        (start, end)
    }

    /// React to a spot update.
    ///
    /// Rebuilds the window when uninitialized, or when the ATM strike has drifted more than
    /// `drift_margin` strikes from the window centre, requesting the resulting subscription
    /// delta from the feed.
    pub fn on_spot(&self, spot: f64) -> Option<WindowChange> {
        let atm_index = nearest_strike_index(self.listed.iter().map(|listed| listed.strike), spot)?;
        let atm_strike = self.listed[atm_index].strike;

        let change = {
            let mut state = self.state.lock();
            state.atm_strike = Some(atm_strike);

            let drift = atm_index.abs_diff(state.centre_index);
            if state.initialized && drift <= self.config.drift_margin {
                return None;
            }

            let (start, end) = self.window_bounds(atm_index);
            let window = &self.listed[start..end];

            let mut lookup = FnvHashMap::default();
            for listed in window {
                if let Some(key) = &listed.call {
                    lookup.insert(key.clone(), (listed.strike, OptionSide::Call));
                }
                if let Some(key) = &listed.put {
                    lookup.insert(key.clone(), (listed.strike, OptionSide::Put));
                }
            }
            let subscribed = window
                .iter()
                .flat_map(ListedStrike::keys)
                .cloned()
                .collect::<BTreeSet<_>>();

            let added = subscribed
                .difference(&state.subscribed)
                .cloned()
                .collect::<Vec<_>>();
            let removed = state
                .subscribed
                .difference(&subscribed)
                .cloned()
                .collect::<Vec<_>>();

            state.window = window.iter().map(|listed| listed.strike).collect();
            state.lookup = lookup;
            state.subscribed = subscribed;
            state.centre_index = atm_index;
            state.initialized = true;

            WindowChange {
                atm_strike,
                added,
                removed,
            }
        };

        info!(
            chain = %self.key,
            atm = %atm_strike,
            added = change.added.len(),
            removed = change.removed.len(),
            "option chain window rebuilt"
        );
        self.control.subscribe(&change.added);
        self.control.unsubscribe(&change.removed);
        Some(change)
    }

    /// Assemble the chain payload for the active window from a fresh store snapshot.
    ///
    /// Returns `None` while spot is unknown.
    pub fn build_payload(&self) -> Option<ChainPayload> {
        let snapshot = self.store.snapshot(&self.key.symbol, self.key.expiry)?;
        let spot = snapshot.spot?;

        let (atm_strike, legs) = if self.listed.is_empty() {
            self.unlisted_legs(&snapshot)?
        } else {
            self.listed_legs(&snapshot, spot)?
        };

        let mut calls = Vec::with_capacity(legs.len());
        let mut puts = Vec::with_capacity(legs.len());
        for (strike, call_key, put_key, state) in legs {
            calls.push(ChainLeg {
                strike,
                instrument_key: call_key,
                quote: state.and_then(|state| state.call.clone()),
            });
            puts.push(ChainLeg {
                strike,
                instrument_key: put_key,
                quote: state.and_then(|state| state.put.clone()),
            });
        }

        let sum_oi = |legs: &[ChainLeg]| {
            legs.iter()
                .filter_map(|leg| leg.quote.as_ref())
                .map(|quote| quote.open_interest)
                .sum::<u64>()
        };
        let total_call_oi = sum_oi(&calls);
        let total_put_oi = sum_oi(&puts);

        debug!(chain = %self.key, strikes = calls.len(), "built chain payload");
        Some(ChainPayload {
            symbol: self.key.symbol.clone(),
            expiry: self.key.expiry,
            spot,
            spot_change: snapshot.spot_change,
            spot_change_pct: snapshot.spot_change_pct,
            atm_strike,
            calls,
            puts,
            total_call_oi,
            total_put_oi,
            pcr: (total_call_oi > 0).then(|| total_put_oi as f64 / total_call_oi as f64),
            timestamp: snapshot.last_update,
        })
    }

    fn listed_legs<'a>(
        &'a self,
        snapshot: &'a SymbolSnapshot,
        spot: f64,
    ) -> Option<(Decimal, Vec<PayloadLeg<'a>>)> {
        let atm_index = nearest_strike_index(self.listed.iter().map(|listed| listed.strike), spot)?;
        let state = self.state.lock();
        let window = if state.initialized {
            state.window.clone()
        } else {
            let (start, end) = self.window_bounds(atm_index);
            self.listed[start..end]
                .iter()
                .map(|listed| listed.strike)
                .collect()
        };
        drop(state);

        let legs = self
            .listed
            .iter()
            .filter(|listed| window.binary_search(&listed.strike).is_ok())
            .map(|listed| {
                (
                    listed.strike,
                    listed.call.clone(),
                    listed.put.clone(),
                    snapshot.strike(listed.strike),
                )
            })
            .collect();

        Some((self.listed[atm_index].strike, legs))
    }

    /// Window over the strikes present in market state, for chains without listed contracts.
    fn unlisted_legs<'a>(
        &self,
        snapshot: &'a SymbolSnapshot,
    ) -> Option<(Decimal, Vec<PayloadLeg<'a>>)> {
        let atm_strike = snapshot.atm_strike()?;
        let legs = snapshot
            .strike_window(atm_strike, self.config.window_strikes)
            .iter()
            .map(|state| (state.strike, None, None, Some(state)))
            .collect();
        Some((atm_strike, legs))
    }

    /// Unsubscribe every key in the window, returning the keys released.
    pub fn close(&self) -> Vec<InstrumentKey> {
        let released = {
            let mut state = self.state.lock();
            let released = std::mem::take(&mut state.subscribed)
                .into_iter()
                .collect::<Vec<_>>();
            *state = ChainState::default();
            released
        };
        self.control.unsubscribe(&released);
        info!(chain = %self.key, released = released.len(), "option chain closed");
        released
    }
}

type PayloadLeg<'a> = (
    Decimal,
    Option<InstrumentKey>,
    Option<InstrumentKey>,
    Option<&'a StrikeState>,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Tick,
        instrument::Route,
        test_utils::{RecordingControl, contracts, expiry},
    };
    use rust_decimal_macros::dec;

    fn builder(window_strikes: usize, drift_margin: usize) -> (OptionChainBuilder, Arc<RecordingControl>, Arc<MarketStateStore>) {
        let control = Arc::new(RecordingControl::default());
        let store = Arc::new(MarketStateStore::new());
        let strikes = (0..21)
            .map(|step| dec!(24500) + Decimal::from(step * 50))
            .collect::<Vec<_>>();
        let builder = OptionChainBuilder::new(
            ChainKey::new("NIFTY", expiry()),
            &contracts("NIFTY", &strikes),
            ChainConfig {
                window_strikes,
                drift_margin,
            },
            Arc::clone(&store),
            control.clone(),
        );
        (builder, control, store)
    }

    #[test]
    fn test_on_spot_initialises_window() {
        let (builder, control, _) = builder(2, 1);

        let change = builder.on_spot(25010.0).unwrap();
        assert_eq!(change.atm_strike, dec!(25000));
        // 5 strikes x 2 sides
        assert_eq!(change.added.len(), 10);
        assert!(change.removed.is_empty());

        let state = builder.state();
        assert!(state.initialized);
        assert_eq!(
            state.window,
            vec![dec!(24900), dec!(24950), dec!(25000), dec!(25050), dec!(25100)]
        );
        assert_eq!(state.lookup.len(), 10);
        assert_eq!(control.subscribed().len(), 10);
    }

    #[test]
    fn test_on_spot_rebuilds_only_beyond_drift_margin() {
        let (builder, control, _) = builder(2, 1);
        builder.on_spot(25000.0).unwrap();

        // 1 strike drift is within the margin
        assert_eq!(builder.on_spot(25050.0), None);
        assert_eq!(builder.state().atm_strike, Some(dec!(25050)));

        // 2 strike drift rebuilds around 25100
        let change = builder.on_spot(25100.0).unwrap();
        assert_eq!(change.atm_strike, dec!(25100));
        assert_eq!(change.added.len(), 4);
        assert_eq!(change.removed.len(), 4);
        assert_eq!(builder.state().window.first(), Some(&dec!(25000)));

        assert_eq!(control.subscribed().len(), 10);
        assert_eq!(control.unsubscribed().len(), 4);
    }

    #[test]
    fn test_build_payload() {
        let (builder, _, store) = builder(1, 1);
        assert_eq!(builder.build_payload(), None);

        let nifty = Symbol::from("NIFTY");
        store.apply_tick(
            &Route::Spot { symbol: nifty.clone() },
            &Tick::price("NSE_INDEX|Nifty 50", 25000.0, Utc::now()),
        );
        for (strike, side, open_interest) in [
            (dec!(25000), OptionSide::Call, 1_000.0),
            (dec!(25000), OptionSide::Put, 800.0),
            (dec!(25050), OptionSide::Put, 200.0),
            // outside the window
            (dec!(25500), OptionSide::Call, 9_000.0),
        ] {
            let mut tick = Tick::price("NSE_FO|x", 100.0, Utc::now());
            tick.open_interest = Some(open_interest);
            store.apply_tick(
                &Route::Option {
                    symbol: nifty.clone(),
                    expiry: expiry(),
                    strike,
                    side,
                },
                &tick,
            );
        }
        builder.on_spot(25000.0);

        let payload = builder.build_payload().unwrap();
        assert_eq!(payload.atm_strike, dec!(25000));
        assert_eq!(payload.calls.len(), 3);
        assert_eq!(payload.puts.len(), 3);
        assert_eq!(payload.total_call_oi, 1_000);
        assert_eq!(payload.total_put_oi, 1_000);
        assert_eq!(payload.pcr, Some(1.0));
        assert_eq!(payload.calls[0].quote, None);
        assert!(payload.calls[1].instrument_key.is_some());
    }

    #[test]
    fn test_close_releases_subscriptions() {
        let (builder, control, _) = builder(1, 1);
        builder.on_spot(25000.0).unwrap();

        let released = builder.close();
        assert_eq!(released.len(), 6);
        assert_eq!(control.unsubscribed().len(), 6);
        assert!(!builder.state().initialized);
    }
}
