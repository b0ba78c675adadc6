use crate::{
    chain::{
        builder::{ChainKey, OptionChainBuilder, SubscriptionControl, WindowChange},
        catalog::InstrumentCatalog,
    },
    config::ChainConfig,
    instrument::{InstrumentDirectory, Symbol},
    store::MarketStateStore,
};
use chrono::NaiveDate;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns every [`OptionChainBuilder`], guaranteeing one instance per [`ChainKey`].
///
/// Lookup and creation happen under a single lock, so two concurrent requests for the same key
/// always observe the same builder and market data is never ingested twice for one chain.
pub struct ChainRegistry {
    builders: Mutex<FnvHashMap<ChainKey, Arc<OptionChainBuilder>>>,
    config: ChainConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    directory: Arc<InstrumentDirectory>,
    store: Arc<MarketStateStore>,
    control: Arc<dyn SubscriptionControl>,
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("chains", &self.keys())
            .field("config", &self.config)
            .finish()
    }
}

impl ChainRegistry {
    pub fn new(
        config: ChainConfig,
        catalog: Arc<dyn InstrumentCatalog>,
        directory: Arc<InstrumentDirectory>,
        store: Arc<MarketStateStore>,
        control: Arc<dyn SubscriptionControl>,
    ) -> Self {
        Self {
            builders: Mutex::new(FnvHashMap::default()),
            config,
            catalog,
            directory,
            store,
            control,
        }
    }

    /// Get the [`OptionChainBuilder`] for `key`, creating it on first request.
    ///
    /// Creation registers the chain's expiry and listed contracts with the
    /// [`InstrumentDirectory`] so their ticks route to the right (expiry, strike, side).
    pub fn get_or_create(&self, key: ChainKey) -> Arc<OptionChainBuilder> {
        let mut builders = self.builders.lock();
        if let Some(builder) = builders.get(&key) {
            return Arc::clone(builder);
        }

        let contracts = self.catalog.contracts(&key.symbol, key.expiry);
        if contracts.is_empty() {
            warn!(chain = %key, "no listed contracts, chain window will follow market state");
        }
        self.directory.register_expiry(key.symbol.clone(), key.expiry);
        self.directory.register_contracts(&contracts);

        let builder = Arc::new(OptionChainBuilder::new(
            key.clone(),
            &contracts,
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.control),
        ));
        info!(chain = %key, contracts = contracts.len(), "option chain opened");

        // Seed the window if spot is already known
        if let Some(spot) = self.store.spot(&key.symbol) {
            builder.on_spot(spot);
        }

        builders.insert(key, Arc::clone(&builder));
        builder
    }

    pub fn get(&self, key: &ChainKey) -> Option<Arc<OptionChainBuilder>> {
        self.builders.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ChainKey> {
        let mut keys = self.builders.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Every open builder, ordered by [`ChainKey`].
    pub fn builders(&self) -> Vec<Arc<OptionChainBuilder>> {
        let mut builders = self.builders.lock().values().cloned().collect::<Vec<_>>();
        builders.sort_by(|a, b| a.key().cmp(b.key()));
        builders
    }

    pub fn builders_for(&self, symbol: &str) -> Vec<Arc<OptionChainBuilder>> {
        self.builders()
            .into_iter()
            .filter(|builder| builder.key().symbol == symbol)
            .collect()
    }

    /// Symbols with at least one open chain, ascending.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols = self
            .builders
            .lock()
            .keys()
            .map(|key| key.symbol.clone())
            .collect::<Vec<_>>();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Nearest open expiry for `symbol`.
    pub fn nearest_expiry(&self, symbol: &str) -> Option<NaiveDate> {
        self.builders
            .lock()
            .keys()
            .filter(|key| key.symbol == symbol)
            .map(|key| key.expiry)
            .min()
    }

    /// Determine if `symbol` has any open chain subscriber.
    pub fn has_subscribers(&self, symbol: &str) -> bool {
        self.builders
            .lock()
            .keys()
            .any(|key| key.symbol == symbol)
    }

    /// Forward a spot update to every builder of `symbol`.
    pub fn on_spot(&self, symbol: &str, spot: f64) -> Vec<(ChainKey, WindowChange)> {
        self.builders_for(symbol)
            .into_iter()
            .filter_map(|builder| {
                builder
                    .on_spot(spot)
                    .map(|change| (builder.key().clone(), change))
            })
            .collect()
    }

    /// Close and drop the builder for `key`, releasing its subscriptions.
    pub fn close(&self, key: &ChainKey) -> bool {
        let removed = self.builders.lock().remove(key);
        match removed {
            Some(builder) => {
                builder.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.builders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.lock().is_empty()
    }
}
