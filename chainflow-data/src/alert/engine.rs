use crate::{
    alert::{Alert, AlertType, rules},
    analytics::{StructuralSnapshot, regime::StructuralRegime},
    config::AlertConfig,
    instrument::Symbol,
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SymbolAlerts {
    history: VecDeque<Alert>,
    last_fired: FnvHashMap<AlertType, DateTime<Utc>>,
    /// Regime of the last regime change alert, or the silent baseline.
    alerted_regime: Option<StructuralRegime>,
    /// Regime that differs from `alerted_regime`, and when it was first seen.
    candidate: Option<(StructuralRegime, DateTime<Utc>)>,
}

impl SymbolAlerts {
    fn cooled_down(&self, alert_type: AlertType, now: DateTime<Utc>, cooldown: TimeDelta) -> bool {
        self.last_fired
            .get(&alert_type)
            .is_none_or(|fired| now - *fired >= cooldown)
    }

    fn record(&mut self, alert: Alert, capacity: usize) {
        self.last_fired.insert(alert.alert_type, alert.timestamp);
        self.history.push_back(alert);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    fn regime_change(
        &mut self,
        snapshot: &StructuralSnapshot,
        config: &AlertConfig,
    ) -> Option<Alert> {
        let now = snapshot.timestamp;
        let regime = snapshot.regime;

        let Some(alerted) = self.alerted_regime else {
            if regime != StructuralRegime::Unknown {
                self.alerted_regime = Some(regime);
            }
            return None;
        };

        if regime == StructuralRegime::Unknown || regime == alerted {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            Some((candidate, since)) if candidate == regime => since,
            _ => {
                self.candidate = Some((regime, now));
                now
            }
        };

        let dwell = now - since;
        if dwell < config.regime_min_dwell()
            || !self.cooled_down(AlertType::RegimeChange, now, config.cooldown())
        {
            return None;
        }

        self.alerted_regime = Some(regime);
        self.candidate = None;
        Some(rules::regime_change(
            snapshot,
            alerted,
            dwell.num_milliseconds() as f64 / 1_000.0,
            config,
        ))
    }
}

/// Turns [`StructuralSnapshot`]s into de-duplicated [`Alert`]s.
///
/// Each (symbol, alert type) pair fires at most once per cooldown. Regime change alerts also
/// require the new regime to persist for the minimum dwell time and to differ from the last
/// alerted regime. The first known regime of a symbol is a silent baseline.
#[derive(Debug)]
pub struct AlertEngine {
    config: AlertConfig,
    symbols: Mutex<FnvHashMap<Symbol, SymbolAlerts>>,
}

impl AlertEngine {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            symbols: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Evaluate every rule against `snapshot`, returning (and recording) the alerts that fire.
    pub fn evaluate(&self, snapshot: &StructuralSnapshot) -> Vec<Alert> {
        let now = snapshot.timestamp;
        let cooldown = self.config.cooldown();

        let mut symbols = self.symbols.lock();
        let state = symbols.entry(snapshot.symbol.clone()).or_default();

        let candidates = rules::evaluate(snapshot, &self.config)
            .into_iter()
            .chain(state.regime_change(snapshot, &self.config));

        let mut fired = Vec::new();
        for alert in candidates {
            if alert.alert_type != AlertType::RegimeChange
                && !state.cooled_down(alert.alert_type, now, cooldown)
            {
                debug!(
                    symbol = %alert.symbol,
                    alert_type = %alert.alert_type,
                    "alert suppressed by cooldown"
                );
                continue;
            }

            info!(
                symbol = %alert.symbol,
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                current_value = alert.current_value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
            state.record(alert.clone(), self.config.history_capacity);
            fired.push(alert);
        }
        fired
    }

    /// Up to `limit` most recent alerts of a symbol, newest first.
    pub fn recent(&self, symbol: &str, limit: usize) -> Vec<Alert> {
        self.symbols
            .lock()
            .get(symbol)
            .map(|state| state.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, symbol: &str) -> bool {
        self.symbols.lock().remove(symbol).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{structural_snapshot, time};

    fn engine() -> AlertEngine {
        AlertEngine::new(AlertConfig {
            cooldown_secs: 120,
            regime_min_dwell_secs: 30,
            history_capacity: 3,
            ..AlertConfig::default()
        })
    }

    fn regime_alerts(engine: &AlertEngine, regime: StructuralRegime, offset_secs: i64) -> usize {
        engine
            .evaluate(&structural_snapshot(regime, time(offset_secs)))
            .into_iter()
            .filter(|alert| alert.alert_type == AlertType::RegimeChange)
            .count()
    }

    #[test]
    fn test_regime_change_deduplicated() {
        let engine = engine();

        // baseline
        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 0), 0);
        // new regime, dwell not yet elapsed
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 10), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 20), 0);
        // dwell elapsed
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 40), 1);
        // same regime on consecutive cycles
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 42), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 500), 0);

        let recent = engine.recent("NIFTY", 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].metadata["from"], "range");
        assert_eq!(recent[0].metadata["to"], "trend");
    }

    #[test]
    fn test_regime_flapping_resets_dwell() {
        let engine = engine();

        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 0), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 10), 0);
        // back to the alerted regime clears the candidate
        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 20), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 30), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 50), 0);
        // unknown clears the candidate
        assert_eq!(regime_alerts(&engine, StructuralRegime::Unknown, 55), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 60), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 90), 1);
    }

    #[test]
    fn test_regime_change_respects_cooldown() {
        let engine = engine();

        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 0), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 0), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Trend, 30), 1);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 40), 0);
        // dwell elapsed, still inside cooldown of the previous regime change
        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 100), 0);
        assert_eq!(regime_alerts(&engine, StructuralRegime::Range, 150), 1);
    }

    #[test]
    fn test_threshold_alert_cooldown_and_history_cap() {
        let engine = engine();
        let pinned = |offset_secs| StructuralSnapshot {
            pin_risk_score: 90.0,
            ..structural_snapshot(StructuralRegime::Range, time(offset_secs))
        };

        assert_eq!(engine.evaluate(&pinned(0)).len(), 1);
        assert!(engine.evaluate(&pinned(60)).is_empty());
        assert_eq!(engine.evaluate(&pinned(120)).len(), 1);
        assert_eq!(engine.evaluate(&pinned(240)).len(), 1);
        assert_eq!(engine.evaluate(&pinned(360)).len(), 1);

        let recent = engine.recent("NIFTY", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, time(360));
        assert_eq!(engine.recent("NIFTY", 1).len(), 1);
        assert!(engine.recent("BANKNIFTY", 10).is_empty());
    }
}
