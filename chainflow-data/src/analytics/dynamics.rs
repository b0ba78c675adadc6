use crate::analytics::{Computed, NeutralReason, regime::StructuralRegime};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Entries considered for consistency and transition frequency.
const DYNAMICS_LOOKBACK: usize = 20;

/// Seconds in a regime after which the time component of stability saturates.
const STABILITY_SATURATION_SECS: f64 = 300.0;

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegimeHistoryEntry {
    pub regime: StructuralRegime,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub net_gex: f64,
    pub flow_imbalance: f64,
    pub expected_move: f64,
    pub spot: Option<f64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RegimeDynamics {
    /// [0, 100]: time in regime and recent consistency.
    pub stability: f64,
    /// [−100, 100]: positive when the regime is strengthening.
    pub acceleration: f64,
    /// [0, 1]: likelihood the regime changes soon.
    pub transition_probability: f64,
    pub time_in_regime_secs: f64,
}

/// Bounded per-symbol regime history.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeHistory {
    entries: VecDeque<RegimeHistoryEntry>,
    capacity: usize,
    regime_since: Option<DateTime<Utc>>,
}

impl RegimeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            regime_since: None,
        }
    }

    pub fn push(&mut self, entry: RegimeHistoryEntry) {
        if self.latest().map(|latest| latest.regime) != Some(entry.regime) {
            self.regime_since = Some(entry.timestamp);
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&RegimeHistoryEntry> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &RegimeHistoryEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn regime_since(&self) -> Option<DateTime<Utc>> {
        self.regime_since
    }

    /// Regime dynamics as of the latest entry.
    ///
    /// Neutral default: zero acceleration when fewer than two entries exist.
    pub fn dynamics(&self, now: DateTime<Utc>) -> Computed<RegimeDynamics> {
        let Some(latest) = self.latest() else {
            return Computed::neutral(
                RegimeDynamics {
                    transition_probability: 0.5,
                    ..RegimeDynamics::default()
                },
                NeutralReason::NoPreviousCycle,
            );
        };

        let time_in_regime_secs = self
            .regime_since
            .map(|since| (now - since).num_milliseconds().max(0) as f64 / 1_000.0)
            .unwrap_or(0.0);

        let recent = self
            .entries
            .iter()
            .rev()
            .take(DYNAMICS_LOOKBACK)
            .collect::<Vec<_>>();
        let consistency = recent
            .iter()
            .filter(|entry| entry.regime == latest.regime)
            .count() as f64
            / recent.len() as f64;
        let transitions = recent
            .windows(2)
            .filter(|pair| pair[0].regime != pair[1].regime)
            .count();
        let transition_frequency = if recent.len() > 1 {
            transitions as f64 / (recent.len() - 1) as f64
        } else {
            0.0
        };

        let stability = (time_in_regime_secs / STABILITY_SATURATION_SECS).min(1.0) * 50.0
            + consistency * 50.0;

        let acceleration = match recent.get(1) {
            Some(previous) => acceleration(previous, latest),
            None => 0.0,
        };

        let transition_probability = (0.4 * transition_frequency
            + 0.4 * (1.0 - stability / 100.0)
            + 0.2 * acceleration.abs() / 100.0)
            .clamp(0.0, 1.0);

        let dynamics = RegimeDynamics {
            stability: stability.clamp(0.0, 100.0),
            acceleration,
            transition_probability,
            time_in_regime_secs,
        };

        if recent.len() < 2 {
            Computed::neutral(dynamics, NeutralReason::NoPreviousCycle)
        } else {
            Computed::Value(dynamics)
        }
    }
}

/// Weighted change between consecutive entries: confidence 40%, relative net GEX 30%, flow
/// imbalance 20%, relative expected move 10%. Each component is clamped to ±1.
fn acceleration(previous: &RegimeHistoryEntry, current: &RegimeHistoryEntry) -> f64 {
    fn relative(previous: f64, current: f64) -> f64 {
        (current - previous) / previous.abs().max(1.0)
    }
    let bounded = |value: f64| {
        if value.is_finite() {
            value.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    };

    let confidence = bounded((current.confidence - previous.confidence) / 100.0);
    let gamma = bounded(relative(previous.net_gex, current.net_gex));
    let imbalance = bounded(current.flow_imbalance - previous.flow_imbalance);
    let expected_move = bounded(relative(previous.expected_move, current.expected_move));

    (100.0 * (0.4 * confidence + 0.3 * gamma + 0.2 * imbalance + 0.1 * expected_move))
        .clamp(-100.0, 100.0)
}
