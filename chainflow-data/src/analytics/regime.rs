use crate::{
    analytics::{Computed, NeutralReason, gamma::GammaRegime},
    config::{RegimeThresholds, VolatilityThresholds},
    store::state::StrikeState,
};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Volatility regime by ATM implied volatility.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum VolatilityRegime {
    #[display("low")]
    Low,
    #[display("normal")]
    Normal,
    #[display("high")]
    High,
    #[default]
    #[display("unknown")]
    Unknown,
}

/// Volatility trend indicator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
pub enum VolTrend {
    Expanding,
    Contracting,
    #[default]
    Stable,
}

pub fn classify_volatility(atm_iv: Option<f64>, thresholds: &VolatilityThresholds) -> VolatilityRegime {
    match atm_iv {
        Some(iv) if iv.is_finite() && iv < thresholds.low => VolatilityRegime::Low,
        Some(iv) if iv.is_finite() && iv > thresholds.high => VolatilityRegime::High,
        Some(iv) if iv.is_finite() => VolatilityRegime::Normal,
        _ => VolatilityRegime::Unknown,
    }
}

pub fn vol_trend(previous: Option<f64>, current: Option<f64>, epsilon: f64) -> VolTrend {
    match (previous, current) {
        (Some(previous), Some(current)) if current - previous > epsilon => VolTrend::Expanding,
        (Some(previous), Some(current)) if previous - current > epsilon => VolTrend::Contracting,
        _ => VolTrend::Stable,
    }
}

/// Strike holding the largest total OI, and how likely spot is to settle on it.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct PinRisk {
    pub strike: Decimal,
    /// Pin risk score in [0, 100].
    pub score: f64,
    /// Share of total OI held at the pin strike.
    pub concentration: f64,
}

/// Pin strike and pin-risk score.
///
/// `score = 100 × proximity × concentration × gamma factor`, where proximity decays linearly
/// to zero at one 1σ move from the pin (1% of spot when σ is unknown), concentration
/// saturates at a 20% OI share, and non positive gamma damps the score by 40%.
pub fn pin_risk(
    strikes: &[StrikeState],
    spot: Option<f64>,
    one_sigma: f64,
    gamma_regime: GammaRegime,
) -> Computed<Option<PinRisk>> {
    let Some(spot) = spot.filter(|spot| spot.is_finite() && *spot > 0.0) else {
        return Computed::neutral(None, NeutralReason::MissingSpot);
    };

    // summed as f64, a u64 sum can overflow across strikes
    let total_oi = strikes
        .iter()
        .map(|state| state.total_oi() as f64)
        .sum::<f64>();
    let Some(pin) = strikes
        .iter()
        .filter(|state| state.total_oi() > 0)
        .max_by_key(|state| state.total_oi())
    else {
        return Computed::neutral(None, NeutralReason::InsufficientStrikes);
    };

    let scale = if one_sigma > 0.0 { one_sigma } else { spot * 0.01 };
    let proximity = (1.0 - (spot - pin.strike_f64()).abs() / scale).max(0.0);
    let concentration = pin.total_oi() as f64 / total_oi;
    let gamma_factor = match gamma_regime {
        GammaRegime::MeanReversion => 1.0,
        GammaRegime::TrendAcceleration | GammaRegime::Neutral => 0.6,
    };

    Computed::Value(Some(PinRisk {
        strike: pin.strike,
        score: (100.0 * proximity * (concentration * 5.0).min(1.0) * gamma_factor)
            .clamp(0.0, 100.0),
        concentration,
    }))
}

/// Structural market regime.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum StructuralRegime {
    #[display("range")]
    Range,
    #[display("trend")]
    Trend,
    #[display("breakout")]
    Breakout,
    #[display("pin risk")]
    PinRisk,
    #[default]
    #[display("unknown")]
    Unknown,
}

/// Decision table row that produced a [`RegimeClassification`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum RegimeRule {
    PinRisk,
    Breakout,
    FlipBreak,
    Trend,
    Range,
    GammaSign,
    Unknown,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegimeInputs {
    pub gamma_regime: GammaRegime,
    pub flow_imbalance: f64,
    pub volatility_regime: VolatilityRegime,
    pub vol_trend: VolTrend,
    /// Spot to pin strike distance in 1σ units.
    pub pin_distance_sigma: Option<f64>,
    pub pin_risk_score: f64,
    /// Spot to gamma flip distance in 1σ units.
    pub flip_distance_sigma: Option<f64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegimeClassification {
    pub regime: StructuralRegime,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub rule: RegimeRule,
}

impl RegimeClassification {
    pub const UNKNOWN: Self = Self {
        regime: StructuralRegime::Unknown,
        confidence: 50.0,
        rule: RegimeRule::Unknown,
    };

    fn new(regime: StructuralRegime, confidence: f64, rule: RegimeRule) -> Self {
        Self {
            regime,
            confidence: confidence.clamp(0.0, 100.0),
            rule,
        }
    }
}

/// Ordered regime decision table. The first matching row wins, with the sign of net gamma as
/// the fallback.
pub fn classify_regime(inputs: &RegimeInputs, thresholds: &RegimeThresholds) -> RegimeClassification {
    let imbalance = if inputs.flow_imbalance.is_finite() {
        inputs.flow_imbalance.abs().min(1.0)
    } else {
        0.0
    };
    let high_vol = inputs.volatility_regime == VolatilityRegime::High;
    let expanding = inputs.vol_trend == VolTrend::Expanding;
    let within = |distance: Option<f64>, limit: f64| distance.is_some_and(|distance| distance <= limit);
    let scaled = |base: f64, span: f64, threshold: f64| {
        base + span * ((imbalance - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
    };

    match inputs.gamma_regime {
        GammaRegime::MeanReversion
            if within(inputs.pin_distance_sigma, thresholds.pin_distance_sigma)
                && inputs.pin_risk_score >= thresholds.pin_min_score
                && !high_vol =>
        {
            RegimeClassification::new(
                StructuralRegime::PinRisk,
                55.0 + 0.45 * inputs.pin_risk_score,
                RegimeRule::PinRisk,
            )
        }
        GammaRegime::TrendAcceleration
            if imbalance >= thresholds.breakout_imbalance && (high_vol || expanding) =>
        {
            RegimeClassification::new(
                StructuralRegime::Breakout,
                scaled(65.0, 35.0, thresholds.breakout_imbalance),
                RegimeRule::Breakout,
            )
        }
        _ if within(inputs.flip_distance_sigma, thresholds.flip_distance_sigma)
            && expanding
            && imbalance >= thresholds.trend_imbalance =>
        {
            RegimeClassification::new(
                StructuralRegime::Breakout,
                55.0 + 25.0 * imbalance,
                RegimeRule::FlipBreak,
            )
        }
        GammaRegime::TrendAcceleration if imbalance >= thresholds.trend_imbalance => {
            RegimeClassification::new(
                StructuralRegime::Trend,
                scaled(55.0, 35.0, thresholds.trend_imbalance),
                RegimeRule::Trend,
            )
        }
        GammaRegime::MeanReversion if imbalance < thresholds.trend_imbalance && !high_vol => {
            RegimeClassification::new(
                StructuralRegime::Range,
                60.0 + 30.0 * (1.0 - imbalance / thresholds.trend_imbalance),
                RegimeRule::Range,
            )
        }
        GammaRegime::MeanReversion => {
            RegimeClassification::new(StructuralRegime::Range, 45.0, RegimeRule::GammaSign)
        }
        GammaRegime::TrendAcceleration => {
            RegimeClassification::new(StructuralRegime::Trend, 45.0, RegimeRule::GammaSign)
        }
        GammaRegime::Neutral => RegimeClassification::UNKNOWN,
    }
}
