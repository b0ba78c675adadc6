use crate::{
    error::ConfigError,
    feed::subscription::FeedMode,
    instrument::{InstrumentKey, Symbol},
};
use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf, str::FromStr, time::Duration};
use tracing::{debug, info};
use url::Url;

/// Default feed authorization endpoint (market data feed v3).
pub const DEFAULT_AUTHORIZE_URL: &str = "https://api.upstox.com/v3/feed/market-data-feed/authorize";

/// Top-level configuration.
///
/// Loaded from an optional JSON file, then overridden by `CHAINFLOW_*` environment variables.
/// Every field has a default, so an empty file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub chain: ChainConfig,
    pub store: StoreConfig,
    pub analytics: AnalyticsConfig,
    pub alerts: AlertConfig,
    /// Index instrument key -> symbol, eg/ `NSE_INDEX|Nifty 50` -> `NIFTY`.
    pub index_aliases: BTreeMap<InstrumentKey, Symbol>,
    /// Option chains to open at startup.
    pub chains: Vec<ChainTarget>,
    /// JSON file of listed option contracts.
    pub catalog_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            chain: ChainConfig::default(),
            store: StoreConfig::default(),
            analytics: AnalyticsConfig::default(),
            alerts: AlertConfig::default(),
            index_aliases: BTreeMap::from([
                (
                    InstrumentKey::from("NSE_INDEX|Nifty 50"),
                    Symbol::from("NIFTY"),
                ),
                (
                    InstrumentKey::from("NSE_INDEX|Nifty Bank"),
                    Symbol::from("BANKNIFTY"),
                ),
                (
                    InstrumentKey::from("BSE_INDEX|SENSEX"),
                    Symbol::from("SENSEX"),
                ),
            ]),
            chains: Vec::new(),
            catalog_path: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct ChainTarget {
    pub symbol: Symbol,
    pub expiry: NaiveDate,
}

impl Config {
    /// Load configuration from an optional JSON file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            chains = config.chains.len(),
            queue_capacity = config.feed.queue_capacity,
            window_strikes = config.chain.window_strikes,
            cadence_ms = config.analytics.cadence_ms,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `CHAINFLOW_*` overrides provided by `lookup`.
    ///
    /// Unparseable values are ignored and the existing value kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Option<String> {
            let value = lookup(key)?;
            debug!(key, %value, "configuration override");
            Some(value)
        };

        fn set<T: FromStr>(target: &mut T, value: Option<String>) {
            if let Some(parsed) = value.and_then(|value| value.trim().parse().ok()) {
                *target = parsed;
            }
        }

        set(&mut self.feed.authorize_url, parse("CHAINFLOW_AUTHORIZE_URL"));
        set(&mut self.feed.token_env, parse("CHAINFLOW_TOKEN_ENV"));
        set(&mut self.feed.queue_capacity, parse("CHAINFLOW_QUEUE_CAPACITY"));
        set(&mut self.feed.reconnect_delay_ms, parse("CHAINFLOW_RECONNECT_DELAY_MS"));
        set(
            &mut self.feed.max_reconnect_delay_ms,
            parse("CHAINFLOW_MAX_RECONNECT_DELAY_MS"),
        );
        set(&mut self.feed.heartbeat_interval_ms, parse("CHAINFLOW_HEARTBEAT_INTERVAL_MS"));
        set(&mut self.feed.read_timeout_ms, parse("CHAINFLOW_READ_TIMEOUT_MS"));
        set(&mut self.chain.window_strikes, parse("CHAINFLOW_WINDOW_STRIKES"));
        set(&mut self.chain.drift_margin, parse("CHAINFLOW_DRIFT_MARGIN"));
        set(&mut self.store.sweep_interval_secs, parse("CHAINFLOW_SWEEP_INTERVAL_SECS"));
        set(&mut self.store.max_age_secs, parse("CHAINFLOW_MAX_AGE_SECS"));
        set(&mut self.analytics.cadence_ms, parse("CHAINFLOW_ANALYTICS_CADENCE_MS"));
        set(
            &mut self.analytics.neutral_gamma_threshold,
            parse("CHAINFLOW_NEUTRAL_GAMMA_THRESHOLD"),
        );
        set(&mut self.analytics.flow.min_velocity, parse("CHAINFLOW_FLOW_MIN_VELOCITY"));
        set(&mut self.analytics.flow.imbalance, parse("CHAINFLOW_FLOW_IMBALANCE"));
        set(&mut self.alerts.cooldown_secs, parse("CHAINFLOW_ALERT_COOLDOWN_SECS"));

        if let Some(path) = parse("CHAINFLOW_CATALOG_PATH") {
            self.catalog_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_owned()));

        if self.feed.queue_capacity == 0 {
            return invalid("feed.queue_capacity must be > 0");
        }
        if self.feed.reconnect_delay_ms == 0 {
            return invalid("feed.reconnect_delay_ms must be > 0");
        }
        if self.feed.max_reconnect_delay_ms < self.feed.reconnect_delay_ms {
            return invalid("feed.max_reconnect_delay_ms must be >= feed.reconnect_delay_ms");
        }
        self.feed.authorize_url()?;
        if self.feed.backoff_multiplier.is_nan() || self.feed.backoff_multiplier < 1.0 {
            return invalid("feed.backoff_multiplier must be >= 1.0");
        }
        if self.feed.heartbeat_interval_ms == 0 || self.feed.read_timeout_ms == 0 {
            return invalid("feed heartbeat and read timeout intervals must be > 0");
        }
        if self.chain.window_strikes == 0 {
            return invalid("chain.window_strikes must be > 0");
        }
        if self.analytics.cadence_ms == 0 || self.store.sweep_interval_secs == 0 {
            return invalid("analytics.cadence_ms and store.sweep_interval_secs must be > 0");
        }
        if self.analytics.history_capacity == 0 || self.alerts.history_capacity == 0 {
            return invalid("history capacities must be > 0");
        }
        if !is_non_negative(self.analytics.neutral_gamma_threshold) {
            return invalid("analytics.neutral_gamma_threshold must be >= 0");
        }
        let flow = &self.analytics.flow;
        if !is_non_negative(flow.min_velocity) || !(flow.imbalance > 0.0 && flow.imbalance < 1.0) {
            return invalid("analytics.flow thresholds: min_velocity >= 0, 0 < imbalance < 1");
        }
        let regime = &self.analytics.regime;
        if ![regime.trend_imbalance, regime.breakout_imbalance]
            .iter()
            .all(|imbalance| *imbalance > 0.0 && *imbalance < 1.0)
        {
            return invalid("analytics.regime trend and breakout imbalances must be in (0, 1)");
        }
        let volatility = &self.analytics.volatility;
        if !(volatility.low > 0.0 && volatility.low < volatility.high) {
            return invalid("analytics.volatility thresholds must satisfy 0 < low < high");
        }
        if self.analytics.expiry_close_minutes_utc >= 24 * 60 {
            return invalid("analytics.expiry_close_minutes_utc must be < 1440");
        }
        if self
            .analytics
            .contract_multipliers
            .values()
            .chain(std::iter::once(&self.analytics.default_multiplier))
            .any(|multiplier| multiplier.is_nan() || *multiplier <= 0.0)
        {
            return invalid("contract multipliers must be > 0");
        }
        Ok(())
    }
}

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Feed client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    pub authorize_url: String,
    /// Environment variable holding the bearer access token.
    pub token_env: String,
    pub mode: FeedMode,
    pub queue_capacity: usize,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub heartbeat_interval_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            authorize_url: DEFAULT_AUTHORIZE_URL.to_owned(),
            token_env: "UPSTOX_ACCESS_TOKEN".to_owned(),
            mode: FeedMode::Full,
            queue_capacity: crate::feed::queue::DEFAULT_QUEUE_CAPACITY,
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            heartbeat_interval_ms: 10_000,
            read_timeout_ms: 120_000,
        }
    }
}

impl FeedConfig {
    pub fn authorize_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.authorize_url).map_err(|error| {
            ConfigError::Invalid(format!(
                "feed.authorize_url {} is not a valid url: {error}",
                self.authorize_url
            ))
        })
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set a fixed reconnect delay (no exponential growth).
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self.max_reconnect_delay_ms = self.reconnect_delay_ms;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Option chain window configuration.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Strikes either side of ATM.
    pub window_strikes: usize,
    /// ATM drift (in strikes) from the window centre tolerated before the window is rebuilt.
    pub drift_margin: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            window_strikes: 10,
            drift_margin: 2,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sweep_interval_secs: u64,
    /// Symbols and strikes without an update for this long are eligible for the sweep.
    pub max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            max_age_secs: 30 * 60,
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Structural analytics configuration.
///
/// Threshold defaults are hand-tuned starting points rather than derived values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub cadence_ms: u64,
    pub history_capacity: usize,
    /// Contract multiplier (lot size) used when a symbol has no explicit entry.
    pub default_multiplier: f64,
    pub contract_multipliers: BTreeMap<Symbol, f64>,
    /// |net GEX| at or below this is classified as neutral gamma.
    pub neutral_gamma_threshold: f64,
    /// Expiry day market close, in minutes after midnight UTC.
    pub expiry_close_minutes_utc: u32,
    pub flow: FlowThresholds,
    pub volatility: VolatilityThresholds,
    pub regime: RegimeThresholds,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 2_000,
            history_capacity: 100,
            default_multiplier: 75.0,
            contract_multipliers: BTreeMap::from([
                (Symbol::from("NIFTY"), 75.0),
                (Symbol::from("BANKNIFTY"), 35.0),
                (Symbol::from("FINNIFTY"), 65.0),
                (Symbol::from("MIDCPNIFTY"), 140.0),
                (Symbol::from("SENSEX"), 20.0),
            ]),
            neutral_gamma_threshold: 10_000.0,
            expiry_close_minutes_utc: 10 * 60,
            flow: FlowThresholds::default(),
            volatility: VolatilityThresholds::default(),
            regime: RegimeThresholds::default(),
        }
    }
}

impl AnalyticsConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn multiplier(&self, symbol: &str) -> f64 {
        self.contract_multipliers
            .get(symbol)
            .copied()
            .unwrap_or(self.default_multiplier)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowThresholds {
    /// Minimum |OI velocity| (contracts per minute) for a side to count as active.
    pub min_velocity: f64,
    /// Minimum |imbalance| for a one-sided flow classification.
    pub imbalance: f64,
}

impl Default for FlowThresholds {
    fn default() -> Self {
        Self {
            min_velocity: 5_000.0,
            imbalance: 0.3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VolatilityThresholds {
    /// ATM IV below this is a low volatility regime.
    pub low: f64,
    /// ATM IV above this is a high volatility regime.
    pub high: f64,
    /// Minimum ATM IV change between cycles to count as expanding or contracting.
    pub trend_epsilon: f64,
}

impl Default for VolatilityThresholds {
    fn default() -> Self {
        Self {
            low: 0.12,
            high: 0.20,
            trend_epsilon: 0.005,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegimeThresholds {
    /// Spot within this many 1σ moves of the pin strike counts as pinned.
    pub pin_distance_sigma: f64,
    pub pin_min_score: f64,
    /// Spot within this many 1σ moves of the gamma flip is at risk of breaking through.
    pub flip_distance_sigma: f64,
    pub trend_imbalance: f64,
    pub breakout_imbalance: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            pin_distance_sigma: 0.25,
            pin_min_score: 60.0,
            flip_distance_sigma: 0.5,
            trend_imbalance: 0.3,
            breakout_imbalance: 0.5,
        }
    }
}

/// Alert rule thresholds and suppression windows.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum seconds between two alerts of the same type for the same symbol.
    pub cooldown_secs: u64,
    /// Seconds a new regime must persist before a regime change alert fires.
    pub regime_min_dwell_secs: u64,
    pub history_capacity: usize,
    /// Spot to gamma flip distance, percent of spot.
    pub flip_proximity_pct: f64,
    pub flip_critical_pct: f64,
    pub imbalance_spike: f64,
    pub imbalance_critical: f64,
    pub pin_risk_score: f64,
    pub pin_risk_critical: f64,
    /// Net GEX change versus the previous cycle, percent.
    pub gex_swing_pct: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 120,
            regime_min_dwell_secs: 30,
            history_capacity: 200,
            flip_proximity_pct: 0.3,
            flip_critical_pct: 0.1,
            imbalance_spike: 0.6,
            imbalance_critical: 0.8,
            pin_risk_score: 70.0,
            pin_risk_critical: 85.0,
            gex_swing_pct: 50.0,
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> TimeDelta {
        seconds(self.cooldown_secs)
    }

    pub fn regime_min_dwell(&self) -> TimeDelta {
        seconds(self.regime_min_dwell_secs)
    }
}

/// Saturates at [`TimeDelta::MAX`], alert windows compare against wall clock differences.
fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
