use crate::{
    Tick,
    error::RouteError,
    instrument::{InstrumentDirectory, Route},
    store::MarketStateStore,
};
use std::sync::Arc;
use tracing::debug;

/// Routes [`Tick`]s by instrument key into the [`MarketStateStore`].
///
/// The router is the only writer of market state for ticks, applied from a single processing
/// task so ticks for an instrument land in arrival order.
#[derive(Debug, Clone)]
pub struct TickRouter {
    directory: Arc<InstrumentDirectory>,
    store: Arc<MarketStateStore>,
}

impl TickRouter {
    pub fn new(directory: Arc<InstrumentDirectory>, store: Arc<MarketStateStore>) -> Self {
        Self { directory, store }
    }

    pub fn route(&self, tick: &Tick) -> Result<Route, RouteError> {
        self.directory.resolve(&tick.instrument_key)
    }

    /// Route and apply a [`Tick`], dropping it if the instrument key is unresolvable.
    pub fn apply(&self, tick: &Tick) -> Option<Route> {
        match self.route(tick) {
            Ok(route) => {
                self.store.apply_tick(&route, tick);
                Some(route)
            }
            Err(error) => {
                debug!(
                    instrument_key = %tick.instrument_key,
                    stage = "route",
                    %error,
                    "dropping tick"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentKey, OptionSide, Symbol};
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_routes_spot_and_option_and_drops_unresolved() {
        let expiry = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();
        let directory = Arc::new(InstrumentDirectory::with_index_aliases([(
            InstrumentKey::from("NSE_INDEX|Nifty 50"),
            Symbol::from("NIFTY"),
        )]));
        directory.register_expiry("NIFTY", expiry);
        let store = Arc::new(MarketStateStore::new());
        let router = TickRouter::new(directory, Arc::clone(&store));

        let spot = Tick::price("NSE_INDEX|Nifty 50", 25000.0, Utc::now());
        let put = Tick::price("NSE_FO|NIFTY25JAN25000PE", 80.0, Utc::now());
        let unresolved = Tick::price("NSE_FO|12345", 1.0, Utc::now());

        assert_eq!(
            router.apply(&spot),
            Some(Route::Spot {
                symbol: Symbol::from("NIFTY"),
            })
        );
        assert_eq!(
            router.apply(&put),
            Some(Route::Option {
                symbol: Symbol::from("NIFTY"),
                expiry,
                strike: dec!(25000),
                side: OptionSide::Put,
            })
        );
        assert_eq!(router.apply(&unresolved), None);
        assert!(router.route(&unresolved).is_err());

        let snapshot = store.snapshot("NIFTY", expiry).unwrap();
        assert_eq!(snapshot.spot, Some(25000.0));
        assert_eq!(snapshot.strikes.len(), 1);
        assert_eq!(snapshot.strikes[0].put.as_ref().map(|quote| quote.last_price), Some(80.0));
        assert_eq!(store.symbols(), vec![Symbol::from("NIFTY")]);
    }
}
