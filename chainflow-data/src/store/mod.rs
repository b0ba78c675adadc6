use crate::{
    Tick,
    instrument::{Route, Symbol},
};
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use state::{SymbolMarketState, SymbolSnapshot};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Per-symbol market state types and snapshots.
pub mod state;

/// Single owner of mutable market state.
///
/// The symbol map is guarded by a [`RwLock`] that is only held to look up or insert an entry,
/// each [`SymbolMarketState`] is guarded by its own [`Mutex`], so a write to one symbol never
/// blocks readers or writers of another. Readers take owned [`SymbolSnapshot`]s under the same
/// per-symbol lock that guards writes.
#[derive(Debug, Default)]
pub struct MarketStateStore {
    symbols: RwLock<FnvHashMap<Symbol, Arc<Mutex<SymbolMarketState>>>>,
}

impl MarketStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, symbol: &Symbol, time: DateTime<Utc>) -> Arc<Mutex<SymbolMarketState>> {
        if let Some(state) = self.symbols.read().get(symbol) {
            return Arc::clone(state);
        }

        let mut symbols = self.symbols.write();
        let state = symbols.entry(symbol.clone()).or_insert_with(|| {
            debug!(%symbol, "creating symbol market state");
            Arc::new(Mutex::new(SymbolMarketState::new(symbol.clone(), time)))
        });
        Arc::clone(state)
    }

    fn get(&self, symbol: &str) -> Option<Arc<Mutex<SymbolMarketState>>> {
        self.symbols.read().get(symbol).cloned()
    }

    /// Apply a routed [`Tick`] under the symbol lock.
    pub fn apply_tick(&self, route: &Route, tick: &Tick) {
        let state = self.entry(route.symbol(), tick.timestamp);
        let mut state = state.lock();
        match route {
            Route::Spot { .. } => state.apply_spot(tick),
            Route::Option {
                expiry,
                strike,
                side,
                ..
            } => state.apply_option(*expiry, *strike, *side, tick),
        }
    }

    /// Snapshot of `symbol` spot and the strikes of `expiry`, `None` for an unknown symbol.
    pub fn snapshot(&self, symbol: &str, expiry: NaiveDate) -> Option<SymbolSnapshot> {
        self.get(symbol).map(|state| state.lock().snapshot(expiry))
    }

    /// Expiries of `symbol` with strike state, ascending.
    pub fn expiries(&self, symbol: &str) -> Vec<NaiveDate> {
        self.get(symbol)
            .map(|state| state.lock().expiries.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn spot(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).and_then(|state| state.lock().spot)
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols = self.symbols.read().keys().cloned().collect::<Vec<_>>();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }

    /// Sweep stale market state.
    ///
    /// Symbols with no update within `max_age` that are not retained (ie/ own no open chain
    /// subscribers) have their stale strikes pruned, and are purged once no strikes remain.
    /// Returns the purged symbols.
    pub fn sweep<F>(&self, max_age: Duration, now: DateTime<Utc>, retain: F) -> Vec<Symbol>
    where
        F: Fn(&str) -> bool,
    {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = now - max_age;

        let mut purged = Vec::new();
        self.symbols.write().retain(|symbol, state| {
            if retain(symbol.as_str()) {
                return true;
            }
            let mut state = state.lock();
            if state.last_update >= cutoff {
                return true;
            }

            let pruned = state.prune_strikes(cutoff);
            if pruned > 0 {
                debug!(%symbol, pruned, "pruned stale strikes");
            }
            if !state.has_strikes() {
                purged.push(symbol.clone());
                false
            } else {
                true
            }
        });

        if !purged.is_empty() {
            info!(symbols = ?purged, "purged stale symbols");
        }
        purged.sort();
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::OptionSide;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_800_000 + secs, 0).unwrap()
    }

    fn spot(symbol: &str) -> Route {
        Route::Spot {
            symbol: Symbol::from(symbol),
        }
    }

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
    }

    fn option(strike: Decimal, side: OptionSide) -> Route {
        Route::Option {
            symbol: Symbol::from("NIFTY"),
            expiry: expiry(),
            strike,
            side,
        }
    }

    fn oi_tick(open_interest: f64, secs: i64) -> Tick {
        let mut tick = Tick::price("NSE_FO|1", 100.0, time(secs));
        tick.open_interest = Some(open_interest);
        tick
    }

    #[test]
    fn test_snapshot_is_owned_copy() {
        let store = MarketStateStore::new();
        store.apply_tick(&spot("NIFTY"), &Tick::price("NSE_INDEX|Nifty 50", 25000.0, time(0)));
        store.apply_tick(&option(dec!(25000), OptionSide::Call), &oi_tick(10.0, 0));

        let snapshot = store.snapshot("NIFTY", expiry()).unwrap();
        store.apply_tick(&option(dec!(25000), OptionSide::Call), &oi_tick(20.0, 1));

        assert_eq!(snapshot.total_call_oi, 10);
        assert_eq!(store.snapshot("NIFTY", expiry()).unwrap().total_call_oi, 20);
        assert_eq!(store.spot("NIFTY"), Some(25000.0));
        assert_eq!(store.expiries("NIFTY"), vec![expiry()]);
        assert_eq!(store.snapshot("BANKNIFTY", expiry()), None);
    }

    #[test]
    fn test_sweep() {
        let store = MarketStateStore::new();
        store.apply_tick(&spot("NIFTY"), &Tick::price("NSE_INDEX|Nifty 50", 25000.0, time(0)));
        store.apply_tick(&spot("BANKNIFTY"), &Tick::price("NSE_INDEX|Nifty Bank", 51000.0, time(0)));
        store.apply_tick(&spot("SENSEX"), &Tick::price("BSE_INDEX|SENSEX", 81000.0, time(590)));

        let max_age = Duration::from_secs(300);
        let purged = store.sweep(max_age, time(600), |symbol| symbol == "BANKNIFTY");

        // stale & unretained purged, retained & fresh symbols kept
        assert_eq!(purged, vec![Symbol::from("NIFTY")]);
        assert_eq!(
            store.symbols(),
            vec![Symbol::from("BANKNIFTY"), Symbol::from("SENSEX")]
        );
    }

    proptest! {
        #[test]
        fn test_aggregate_oi_equals_per_strike_sum(
            ticks in prop::collection::vec((0usize..8, any::<bool>(), prop::option::of(0u32..2_000_000)), 1..200)
        ) {
            let store = MarketStateStore::new();
            for (index, (strike, is_call, open_interest)) in ticks.into_iter().enumerate() {
                let side = if is_call { OptionSide::Call } else { OptionSide::Put };
                let strike = dec!(24800) + Decimal::from(strike * 50);
                let mut tick = Tick::price("NSE_FO|1", 100.0, time(index as i64));
                tick.open_interest = open_interest.map(f64::from);
                store.apply_tick(&option(strike, side), &tick);

                let snapshot = store.snapshot("NIFTY", expiry()).unwrap();
                let call_sum = snapshot.strikes.iter().map(|state| state.call_oi()).sum::<u64>();
                let put_sum = snapshot.strikes.iter().map(|state| state.put_oi()).sum::<u64>();
                prop_assert_eq!(snapshot.total_call_oi, call_sum);
                prop_assert_eq!(snapshot.total_put_oi, put_sum);
            }
        }
    }
}
