use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use engine::{DegradedMetric, Metric, StructuralAnalyticsEngine, StructuralSnapshot};

/// Regime history, stability, acceleration and transition probability.
pub mod dynamics;

/// Orchestrates every computation into a [`StructuralSnapshot`] per symbol.
pub mod engine;

/// Expected move bands from ATM implied volatility and straddle premium.
pub mod expected_move;

/// OI velocity, flow imbalance and flow direction classification.
pub mod flow;

/// Gamma exposure and gamma flip level.
pub mod gamma;

/// Volatility regime, pin risk and structural regime decision table.
pub mod regime;

/// Outcome of a single analytics computation.
///
/// A computation that cannot produce a meaningful value (missing spot, missing greeks, no
/// previous cycle) returns its documented neutral default tagged with the reason, instead of
/// failing the whole cycle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Computed<T> {
    Value(T),
    Neutral { value: T, reason: NeutralReason },
}

impl<T> Computed<T> {
    pub fn neutral(value: T, reason: NeutralReason) -> Self {
        Self::Neutral { value, reason }
    }

    pub fn value(&self) -> &T {
        match self {
            Computed::Value(value) | Computed::Neutral { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Computed::Value(value) | Computed::Neutral { value, .. } => value,
        }
    }

    pub fn is_neutral(&self) -> bool {
        matches!(self, Computed::Neutral { .. })
    }

    pub fn reason(&self) -> Option<NeutralReason> {
        match self {
            Computed::Value(_) => None,
            Computed::Neutral { reason, .. } => Some(*reason),
        }
    }
}

/// Why a computation fell back to its neutral default.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum NeutralReason {
    MissingSpot,
    MissingGreeks,
    MissingVolatility,
    InsufficientStrikes,
    NoPreviousCycle,
    DegenerateInput,
}
