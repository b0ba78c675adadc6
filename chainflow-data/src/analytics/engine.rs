use crate::{
    analytics::{
        NeutralReason,
        dynamics::{RegimeDynamics, RegimeHistory, RegimeHistoryEntry},
        expected_move::{ExpectedMove, compute_expected_move, strike_iv, time_to_expiry_years},
        flow::{FlowDirection, OiSample, compute_flow},
        gamma::{GammaRegime, compute_gex, gamma_flip},
        regime::{
            RegimeClassification, RegimeInputs, RegimeRule, StructuralRegime, VolTrend,
            VolatilityRegime, classify_regime, classify_volatility, pin_risk, vol_trend,
        },
    },
    config::AnalyticsConfig,
    instrument::Symbol,
    store::state::SymbolSnapshot,
};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Minimum |previous net GEX| for a GEX change percent to be meaningful.
const MIN_GEX_CHANGE_BASE: f64 = 1.0;

/// Analytics computation, as recorded in [`StructuralSnapshot::degraded`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum Metric {
    ExpectedMove,
    GammaExposure,
    GammaFlip,
    OiFlow,
    Volatility,
    PinRisk,
    Regime,
    Dynamics,
}

/// A metric that fell back to its neutral default this cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct DegradedMetric {
    pub metric: Metric,
    pub reason: NeutralReason,
}

/// Structural analytics for one symbol at one point in time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructuralSnapshot {
    pub symbol: Symbol,
    pub expiry: NaiveDate,
    pub spot: Option<f64>,
    pub atm_strike: Option<Decimal>,
    pub expected_move: ExpectedMove,
    pub call_gex: f64,
    pub put_gex: f64,
    pub net_gex: f64,
    pub gamma_regime: GammaRegime,
    pub gamma_flip: Option<f64>,
    /// Gamma flip minus spot, index points.
    pub flip_distance: Option<f64>,
    pub flip_distance_pct: Option<f64>,
    pub call_oi_velocity: f64,
    pub put_oi_velocity: f64,
    pub flow_imbalance: f64,
    pub flow_direction: FlowDirection,
    pub atm_iv: Option<f64>,
    pub volatility_regime: VolatilityRegime,
    pub vol_trend: VolTrend,
    pub regime: StructuralRegime,
    pub regime_confidence: f64,
    pub regime_rule: RegimeRule,
    pub dynamics: RegimeDynamics,
    pub pin_strike: Option<Decimal>,
    pub pin_risk_score: f64,
    /// Net GEX change versus the previous snapshot, percent.
    pub gex_change_pct: Option<f64>,
    pub total_call_oi: u64,
    pub total_put_oi: u64,
    pub pcr: Option<f64>,
    pub degraded: Vec<DegradedMetric>,
    pub timestamp: DateTime<Utc>,
}

impl StructuralSnapshot {
    pub fn is_degraded(&self, metric: Metric) -> bool {
        self.degraded.iter().any(|degraded| degraded.metric == metric)
    }
}

#[derive(Debug)]
struct SymbolAnalytics {
    latest: Option<Arc<StructuralSnapshot>>,
    previous: Option<Arc<StructuralSnapshot>>,
    /// OI sample of the previous cycle and the expiry it was taken from.
    oi_sample: Option<(NaiveDate, OiSample)>,
    history: RegimeHistory,
}

impl SymbolAnalytics {
    fn new(history_capacity: usize) -> Self {
        Self {
            latest: None,
            previous: None,
            oi_sample: None,
            history: RegimeHistory::new(history_capacity),
        }
    }
}

/// Computes a [`StructuralSnapshot`] per symbol from [`SymbolSnapshot`]s, keeping the
/// per-symbol state (previous snapshot, OI sample, regime history) that cross-cycle metrics
/// need.
#[derive(Debug)]
pub struct StructuralAnalyticsEngine {
    config: AnalyticsConfig,
    symbols: Mutex<FnvHashMap<Symbol, SymbolAnalytics>>,
}

impl StructuralAnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            symbols: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Run one analytics cycle for the symbol and expiry of `snapshot`.
    ///
    /// Never fails: metrics that cannot be computed fall back to their neutral default and are
    /// listed in [`StructuralSnapshot::degraded`]. OI flow only compares samples of the same
    /// expiry, so an expiry roll restarts it.
    pub fn compute(&self, snapshot: &SymbolSnapshot, now: DateTime<Utc>) -> Arc<StructuralSnapshot> {
        let config = &self.config;
        let mut degraded = Vec::new();
        let mut track = |metric: Metric, reason: Option<NeutralReason>| {
            if let Some(reason) = reason {
                degraded.push(DegradedMetric { metric, reason });
            }
        };

        let mut symbols = self.symbols.lock();
        let state = symbols
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| SymbolAnalytics::new(config.history_capacity));

        let spot = snapshot.spot;
        let atm_strike = snapshot.atm_strike();
        let atm = atm_strike.and_then(|strike| snapshot.strike(strike));

        // Expected move
        let expiry = snapshot.expiry;
        let years = time_to_expiry_years(expiry, config.expiry_close_minutes_utc, now);
        let expected_move = compute_expected_move(spot, atm, Some(years));
        track(Metric::ExpectedMove, expected_move.reason());
        let expected_move = expected_move.into_value();

        // Gamma exposure & flip
        let gex = compute_gex(
            &snapshot.strikes,
            config.multiplier(&snapshot.symbol),
            config.neutral_gamma_threshold,
        );
        track(Metric::GammaExposure, gex.reason());
        let gex_reason = gex.reason();
        let gex = gex.into_value();

        let flip = gamma_flip(&gex.per_strike, spot);
        track(Metric::GammaFlip, flip.reason());
        let gamma_flip = flip.into_value().map(|flip| flip.level);
        let flip_distance = gamma_flip.zip(spot).map(|(level, spot)| level - spot);
        let flip_distance_pct = flip_distance
            .zip(spot)
            .map(|(distance, spot)| distance / spot * 100.0);

        // OI flow
        let sample = OiSample::capture(&snapshot.strikes, now);
        let previous_sample = state
            .oi_sample
            .as_ref()
            .filter(|(sampled, _)| *sampled == expiry)
            .map(|(_, sample)| sample);
        let flow = compute_flow(&sample, previous_sample, &config.flow);
        track(Metric::OiFlow, flow.reason());
        let flow = flow.into_value();
        state.oi_sample = Some((expiry, sample));

        // Volatility
        let atm_iv = atm.and_then(strike_iv);
        let volatility_regime = classify_volatility(atm_iv, &config.volatility);
        if volatility_regime == VolatilityRegime::Unknown {
            track(Metric::Volatility, Some(NeutralReason::MissingVolatility));
        }
        let vol_trend = vol_trend(
            state.latest.as_ref().and_then(|latest| latest.atm_iv),
            atm_iv,
            config.volatility.trend_epsilon,
        );

        // Pin risk
        let pin = pin_risk(&snapshot.strikes, spot, expected_move.one_sigma, gex.regime);
        track(Metric::PinRisk, pin.reason());
        let pin = pin.into_value();

        // Regime
        let pin_distance_sigma = pin.zip(spot).and_then(|(pin, spot)| {
            pin.strike
                .to_f64()
                .and_then(|strike| expected_move.sigmas(spot - strike))
        });
        let classification = classify_regime(
            &RegimeInputs {
                gamma_regime: gex.regime,
                flow_imbalance: flow.imbalance,
                volatility_regime,
                vol_trend,
                pin_distance_sigma,
                pin_risk_score: pin.map_or(0.0, |pin| pin.score),
                flip_distance_sigma: flip_distance.and_then(|distance| expected_move.sigmas(distance)),
            },
            &config.regime,
        );
        if classification.rule == RegimeRule::Unknown {
            track(
                Metric::Regime,
                Some(gex_reason.unwrap_or(NeutralReason::DegenerateInput)),
            );
        }
        let RegimeClassification {
            regime,
            confidence,
            rule,
        } = classification;

        // Dynamics
        state.history.push(RegimeHistoryEntry {
            regime,
            confidence,
            timestamp: now,
            net_gex: gex.net_gex,
            flow_imbalance: flow.imbalance,
            expected_move: expected_move.one_sigma,
            spot,
        });
        let dynamics = state.history.dynamics(now);
        track(Metric::Dynamics, dynamics.reason());

        let gex_change_pct = state
            .latest
            .as_ref()
            .map(|latest| latest.net_gex)
            .filter(|previous| previous.abs() >= MIN_GEX_CHANGE_BASE)
            .map(|previous| (gex.net_gex - previous) / previous.abs() * 100.0);

        let structural = Arc::new(StructuralSnapshot {
            symbol: snapshot.symbol.clone(),
            expiry,
            spot,
            atm_strike,
            expected_move,
            call_gex: gex.call_gex,
            put_gex: gex.put_gex,
            net_gex: gex.net_gex,
            gamma_regime: gex.regime,
            gamma_flip,
            flip_distance,
            flip_distance_pct,
            call_oi_velocity: flow.call_velocity,
            put_oi_velocity: flow.put_velocity,
            flow_imbalance: flow.imbalance,
            flow_direction: flow.direction,
            atm_iv,
            volatility_regime,
            vol_trend,
            regime,
            regime_confidence: confidence,
            regime_rule: rule,
            dynamics: dynamics.into_value(),
            pin_strike: pin.map(|pin| pin.strike),
            pin_risk_score: pin.map_or(0.0, |pin| pin.score),
            gex_change_pct,
            total_call_oi: snapshot.total_call_oi,
            total_put_oi: snapshot.total_put_oi,
            pcr: snapshot.pcr(),
            degraded,
            timestamp: now,
        });

        state.previous = state.latest.replace(Arc::clone(&structural));

        debug!(
            symbol = %structural.symbol,
            expiry = %structural.expiry,
            net_gex = structural.net_gex,
            gamma_regime = %structural.gamma_regime,
            regime = %structural.regime,
            confidence = structural.regime_confidence,
            degraded = structural.degraded.len(),
            stage = "analytics",
            "computed structural snapshot"
        );

        structural
    }

    pub fn latest(&self, symbol: &str) -> Option<Arc<StructuralSnapshot>> {
        self.symbols
            .lock()
            .get(symbol)
            .and_then(|state| state.latest.clone())
    }

    pub fn previous(&self, symbol: &str) -> Option<Arc<StructuralSnapshot>> {
        self.symbols
            .lock()
            .get(symbol)
            .and_then(|state| state.previous.clone())
    }

    /// Regime history of a symbol, oldest first.
    pub fn history(&self, symbol: &str) -> Vec<RegimeHistoryEntry> {
        self.symbols
            .lock()
            .get(symbol)
            .map(|state| state.history.entries().copied().collect())
            .unwrap_or_default()
    }

    /// Drop all analytics state of a symbol.
    pub fn remove(&self, symbol: &str) -> bool {
        self.symbols.lock().remove(symbol).is_some()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols = self.symbols.lock().keys().cloned().collect::<Vec<_>>();
        symbols.sort();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Greeks,
        store::state::{OptionQuote, StrikeState},
        test_utils::expiry,
    };
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        expiry().and_hms_opt(4, 0, 0).unwrap().and_utc()
    }

    fn quote(last_price: f64, open_interest: u64, gamma: f64, iv: f64) -> Option<OptionQuote> {
        Some(OptionQuote {
            last_price,
            open_interest,
            volume: 0,
            greeks: Some(Greeks {
                gamma,
                ..Greeks::default()
            }),
            iv: Some(iv),
        })
    }

    fn snapshot(call_oi: u64, put_oi: u64) -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: Symbol::from("NIFTY"),
            expiry: expiry(),
            spot: Some(25_000.0),
            spot_change: 0.0,
            spot_change_pct: 0.0,
            strikes: vec![StrikeState {
                strike: dec!(25000),
                call: quote(120.0, call_oi, 0.002, 0.14),
                put: quote(110.0, put_oi, -0.0015, 0.15),
                last_update: now(),
            }],
            total_call_oi: call_oi,
            total_put_oi: put_oi,
            last_update: now(),
        }
    }

    #[test]
    fn test_compute_gex_scenario() {
        let engine = StructuralAnalyticsEngine::new(AnalyticsConfig::default());
        let actual = engine.compute(&snapshot(1_000_000, 800_000), now());

        assert!((actual.net_gex - 60_000.0).abs() < 1e-6);
        assert_eq!(actual.gamma_regime, GammaRegime::MeanReversion);
        assert_eq!(actual.pcr, Some(0.8));
        assert_eq!(actual.atm_strike, Some(dec!(25000)));
        assert!(actual.expected_move.one_sigma > 0.0);
        assert_eq!(actual.volatility_regime, VolatilityRegime::Normal);
        assert_eq!(actual.pin_strike, Some(dec!(25000)));

        // first cycle has no flow reference
        assert_eq!(actual.flow_direction, FlowDirection::Neutral);
        assert!(actual.is_degraded(Metric::OiFlow));
        assert_eq!(actual.gex_change_pct, None);
    }

    #[test]
    fn test_compute_tracks_previous_cycle() {
        let engine = StructuralAnalyticsEngine::new(AnalyticsConfig::default());
        engine.compute(&snapshot(1_000_000, 800_000), now());

        let later = now() + TimeDelta::seconds(60);
        let actual = engine.compute(&snapshot(1_030_000, 800_000), later);

        assert!(!actual.is_degraded(Metric::OiFlow));
        assert_eq!(actual.call_oi_velocity, 30_000.0);
        assert_eq!(actual.put_oi_velocity, 0.0);
        assert_eq!(actual.flow_direction, FlowDirection::CallWriting);
        assert!(actual.gex_change_pct.is_some_and(|change| change > 0.0));

        let previous = engine.previous("NIFTY").unwrap();
        assert!((previous.net_gex - 60_000.0).abs() < 1e-6);
        assert_eq!(engine.history("NIFTY").len(), 2);
        assert!(Arc::ptr_eq(&engine.latest("NIFTY").unwrap(), &actual));
    }

    #[test]
    fn test_compute_restarts_flow_on_expiry_roll() {
        let engine = StructuralAnalyticsEngine::new(AnalyticsConfig::default());
        engine.compute(&snapshot(1_000_000, 800_000), now());

        let rolled = SymbolSnapshot {
            expiry: expiry() + TimeDelta::days(7),
            ..snapshot(50_000, 40_000)
        };
        let actual = engine.compute(&rolled, now() + TimeDelta::seconds(60));

        assert_eq!(actual.expiry, rolled.expiry);
        assert!(actual.is_degraded(Metric::OiFlow));
        assert_eq!(actual.call_oi_velocity, 0.0);
        assert_eq!(actual.flow_direction, FlowDirection::Neutral);
    }

    #[test]
    fn test_compute_without_data_is_neutral() {
        let engine = StructuralAnalyticsEngine::new(AnalyticsConfig::default());
        let empty = SymbolSnapshot {
            spot: None,
            strikes: Vec::new(),
            total_call_oi: 0,
            total_put_oi: 0,
            ..snapshot(0, 0)
        };

        let actual = engine.compute(&empty, now());
        assert_eq!(actual.net_gex, 0.0);
        assert_eq!(actual.gamma_regime, GammaRegime::Neutral);
        assert_eq!(actual.regime, StructuralRegime::Unknown);
        assert_eq!(actual.regime_confidence, 50.0);
        assert_eq!(actual.pcr, None);
        for metric in [Metric::ExpectedMove, Metric::GammaExposure, Metric::Regime] {
            assert!(actual.is_degraded(metric), "{metric} not degraded");
        }

        assert!(engine.remove("NIFTY"));
        assert!(engine.latest("NIFTY").is_none());
    }
}
