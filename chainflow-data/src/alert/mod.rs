use crate::instrument::Symbol;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use engine::AlertEngine;

/// Per-symbol cooldown, regime dwell and capped alert history.
pub mod engine;

/// Stateless threshold rules over a [`StructuralSnapshot`](crate::analytics::StructuralSnapshot).
pub mod rules;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    #[display("gamma_flip_proximity")]
    GammaFlipProximity,
    #[display("flow_imbalance_spike")]
    FlowImbalanceSpike,
    #[display("regime_change")]
    RegimeChange,
    #[display("pin_risk")]
    PinRisk,
    #[display("gex_swing")]
    GexSwing,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    #[display("info")]
    Info,
    #[display("warning")]
    Warning,
    #[display("critical")]
    Critical,
}

/// Threshold crossing raised by the [`AlertEngine`]. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub symbol: Symbol,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        symbol: Symbol,
        message: impl Into<String>,
        current_value: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            alert_type,
            severity,
            symbol,
            message: message.into(),
            current_value,
            threshold,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}
