use crate::{
    alert::{Alert, AlertEngine},
    analytics::{StructuralAnalyticsEngine, StructuralSnapshot},
    chain::{
        ChainKey, ChainPayload, ChainRegistry, InstrumentCatalog, OptionChainBuilder,
        SubscriptionControl,
    },
    config::Config,
    decoder::decode_frame_at,
    feed::{FeedEvent, FrameQueue},
    instrument::{InstrumentDirectory, InstrumentKey, Route, Symbol},
    router::TickRouter,
    shutdown::Shutdown,
    store::MarketStateStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

/// Capacity of the [`AnalyticsUpdate`] broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 1_024;

/// Output of one analytics cycle for one symbol, pushed to every
/// [`MarketService::subscribe_updates`] receiver.
#[derive(Debug, Clone)]
pub struct AnalyticsUpdate {
    pub metrics: Arc<StructuralSnapshot>,
    pub alerts: Vec<Alert>,
}

/// Application root: owns the market state store, instrument directory, chain registry and the
/// analytics and alert engines, and wires them into the processing pipeline.
///
/// Outbound interface for publishers: [`chain_payload`](Self::chain_payload),
/// [`latest_metrics`](Self::latest_metrics), [`recent_alerts`](Self::recent_alerts) and
/// [`subscribe_updates`](Self::subscribe_updates).
pub struct MarketService {
    config: Config,
    directory: Arc<InstrumentDirectory>,
    store: Arc<MarketStateStore>,
    router: TickRouter,
    registry: ChainRegistry,
    analytics: StructuralAnalyticsEngine,
    alerts: AlertEngine,
    control: Arc<dyn SubscriptionControl>,
    updates: broadcast::Sender<AnalyticsUpdate>,
}

impl std::fmt::Debug for MarketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketService")
            .field("symbols", &self.store.symbols())
            .field("registry", &self.registry)
            .finish()
    }
}

impl MarketService {
    pub fn new(
        config: Config,
        catalog: Arc<dyn InstrumentCatalog>,
        control: Arc<dyn SubscriptionControl>,
    ) -> Self {
        let directory = Arc::new(InstrumentDirectory::with_index_aliases(
            config.index_aliases.clone(),
        ));
        let store = Arc::new(MarketStateStore::new());
        let router = TickRouter::new(Arc::clone(&directory), Arc::clone(&store));
        let registry = ChainRegistry::new(
            config.chain.clone(),
            catalog,
            Arc::clone(&directory),
            Arc::clone(&store),
            Arc::clone(&control),
        );
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            analytics: StructuralAnalyticsEngine::new(config.analytics.clone()),
            alerts: AlertEngine::new(config.alerts.clone()),
            config,
            directory,
            store,
            router,
            registry,
            control,
            updates,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MarketStateStore {
        &self.store
    }

    pub fn directory(&self) -> &InstrumentDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Open (or get) the option chain for `symbol` and `expiry`, subscribing the symbol's index
    /// keys so spot ticks drive the chain window.
    pub fn open_chain(&self, symbol: impl Into<Symbol>, expiry: NaiveDate) -> Arc<OptionChainBuilder> {
        let key = ChainKey::new(symbol, expiry);
        let index_keys = self.directory.index_keys_for(&key.symbol);
        if index_keys.is_empty() {
            warn!(symbol = %key.symbol, "no index key configured, chain will not see spot ticks");
        }
        self.control.subscribe(&index_keys);
        self.registry.get_or_create(key)
    }

    pub fn close_chain(&self, symbol: &str, expiry: NaiveDate) -> bool {
        self.registry.close(&ChainKey::new(symbol, expiry))
    }

    /// Every configured index instrument key.
    pub fn index_keys(&self) -> Vec<InstrumentKey> {
        self.directory.index_keys()
    }

    pub fn chain_payload(&self, symbol: &str, expiry: NaiveDate) -> Option<ChainPayload> {
        self.registry
            .get(&ChainKey::new(symbol, expiry))?
            .build_payload()
    }

    pub fn latest_metrics(&self, symbol: &str) -> Option<Arc<StructuralSnapshot>> {
        self.analytics.latest(symbol)
    }

    /// Up to `limit` most recent alerts of `symbol`, newest first.
    pub fn recent_alerts(&self, symbol: &str, limit: usize) -> Vec<Alert> {
        self.alerts.recent(symbol, limit)
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<AnalyticsUpdate> {
        self.updates.subscribe()
    }

    /// Decode, route and apply one [`FeedEvent`], returning the number of ticks applied.
    ///
    /// Malformed frames are logged and skipped.
    pub fn process_event(&self, event: &FeedEvent) -> usize {
        match event {
            FeedEvent::Frame { payload, received } => {
                let ticks = match decode_frame_at(payload, *received) {
                    Ok(ticks) => ticks,
                    Err(error) => {
                        warn!(%error, bytes = payload.len(), stage = "decode", "skipping feed frame");
                        return 0;
                    }
                };

                let mut applied = 0;
                for tick in &ticks {
                    match self.router.apply(tick) {
                        Some(Route::Spot { symbol }) => {
                            applied += 1;
                            for (key, change) in self.registry.on_spot(&symbol, tick.last_price) {
                                debug!(
                                    chain = %key,
                                    atm_strike = %change.atm_strike,
                                    added = change.added.len(),
                                    removed = change.removed.len(),
                                    "chain window moved"
                                );
                            }
                        }
                        Some(Route::Option { .. }) => applied += 1,
                        None => {}
                    }
                }
                applied
            }
            FeedEvent::Heartbeat { time, state } => {
                debug!(%time, %state, symbols = self.store.len(), "feed heartbeat");
                0
            }
        }
    }

    /// Compute structural analytics and alerts for every symbol with an open chain, over the
    /// nearest open expiry of the symbol, and publish the results.
    pub fn run_analytics_cycle(&self, now: DateTime<Utc>) -> Vec<AnalyticsUpdate> {
        let updates = self
            .registry
            .symbols()
            .into_iter()
            .filter_map(|symbol| {
                let expiry = self.registry.nearest_expiry(&symbol)?;
                let snapshot = self.store.snapshot(&symbol, expiry)?;
                let metrics = self.analytics.compute(&snapshot, now);
                let alerts = self.alerts.evaluate(&metrics);
                Some(AnalyticsUpdate { metrics, alerts })
            })
            .collect::<Vec<_>>();

        for update in &updates {
            // No receivers is not an error
            let _ = self.updates.send(update.clone());
        }
        updates
    }

    /// Drop stale market state of symbols without an open chain, along with their analytics.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Symbol> {
        let purged = self.store.sweep(self.config.store.max_age(), now, |symbol| {
            self.registry.has_subscribers(symbol)
        });
        for symbol in &purged {
            self.analytics.remove(symbol);
            self.alerts.remove(symbol);
            debug!(%symbol, "dropped analytics and alert state");
        }
        purged
    }

    /// Spawn the frame processing, analytics and sweep stages. Every stage stops on `shutdown`.
    pub fn spawn(
        self: &Arc<Self>,
        queue: Arc<FrameQueue>,
        shutdown: Shutdown,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_processor(queue, shutdown.clone()),
            self.spawn_periodic(
                "analytics",
                self.config.analytics.cadence(),
                shutdown.clone(),
                |service| {
                    service.run_analytics_cycle(Utc::now());
                },
            ),
            self.spawn_periodic(
                "sweep",
                self.config.store.sweep_interval(),
                shutdown,
                |service| {
                    service.sweep(Utc::now());
                },
            ),
        ]
    }

    fn spawn_processor(
        self: &Arc<Self>,
        queue: Arc<FrameQueue>,
        mut shutdown: Shutdown,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    event = queue.pop() => match event {
                        Some(event) => {
                            service.process_event(&event);
                        }
                        None => break,
                    },
                }
            }
            debug!(stage = "process", dropped = queue.dropped(), "frame processor stopped");
        })
    }

    fn spawn_periodic<F>(
        self: &Arc<Self>,
        stage: &'static str,
        period: Duration,
        mut shutdown: Shutdown,
        mut task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(&MarketService) + Send + 'static,
    {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => task(service.as_ref()),
                }
            }
            debug!(stage, "periodic stage stopped");
        })
    }
}
