use crate::{
    alert::{Alert, AlertSeverity, AlertType},
    analytics::{StructuralSnapshot, flow::FlowDirection, regime::StructuralRegime},
    config::AlertConfig,
};

/// Evaluate every threshold rule except regime change, which needs per-symbol state.
pub fn evaluate(snapshot: &StructuralSnapshot, config: &AlertConfig) -> Vec<Alert> {
    [
        gamma_flip_proximity(snapshot, config),
        flow_imbalance_spike(snapshot, config),
        pin_risk(snapshot, config),
        gex_swing(snapshot, config),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Spot within `flip_proximity_pct` of the gamma flip level.
pub fn gamma_flip_proximity(snapshot: &StructuralSnapshot, config: &AlertConfig) -> Option<Alert> {
    let level = snapshot.gamma_flip?;
    let distance_pct = snapshot.flip_distance_pct?.abs();
    if distance_pct.is_nan() || distance_pct > config.flip_proximity_pct {
        return None;
    }

    let severity = if distance_pct <= config.flip_critical_pct {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    Some(
        Alert::new(
            AlertType::GammaFlipProximity,
            severity,
            snapshot.symbol.clone(),
            format!(
                "{} spot {:.2}% from gamma flip at {level:.2}",
                snapshot.symbol, distance_pct
            ),
            distance_pct,
            config.flip_proximity_pct,
            snapshot.timestamp,
        )
        .with_metadata("gamma_flip", format!("{level:.2}"))
        .with_metadata("gamma_regime", snapshot.gamma_regime),
    )
}

/// One-sided OI flow with |imbalance| at or above `imbalance_spike`.
pub fn flow_imbalance_spike(snapshot: &StructuralSnapshot, config: &AlertConfig) -> Option<Alert> {
    let imbalance = snapshot.flow_imbalance.abs();
    if matches!(
        snapshot.flow_direction,
        FlowDirection::Neutral | FlowDirection::Balanced
    ) || imbalance.is_nan()
        || imbalance < config.imbalance_spike
    {
        return None;
    }

    let severity = if imbalance >= config.imbalance_critical {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    Some(
        Alert::new(
            AlertType::FlowImbalanceSpike,
            severity,
            snapshot.symbol.clone(),
            format!(
                "{} {} with flow imbalance {:+.2}",
                snapshot.symbol, snapshot.flow_direction, snapshot.flow_imbalance
            ),
            imbalance,
            config.imbalance_spike,
            snapshot.timestamp,
        )
        .with_metadata("flow_direction", snapshot.flow_direction)
        .with_metadata("call_oi_velocity", format!("{:.0}", snapshot.call_oi_velocity))
        .with_metadata("put_oi_velocity", format!("{:.0}", snapshot.put_oi_velocity)),
    )
}

pub fn pin_risk(snapshot: &StructuralSnapshot, config: &AlertConfig) -> Option<Alert> {
    let strike = snapshot.pin_strike?;
    let score = snapshot.pin_risk_score;
    if score.is_nan() || score < config.pin_risk_score {
        return None;
    }

    let severity = if score >= config.pin_risk_critical {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    Some(
        Alert::new(
            AlertType::PinRisk,
            severity,
            snapshot.symbol.clone(),
            format!("{} pin risk {score:.0} at strike {strike}", snapshot.symbol),
            score,
            config.pin_risk_score,
            snapshot.timestamp,
        )
        .with_metadata("pin_strike", strike),
    )
}

/// Net GEX moved by at least `gex_swing_pct` since the previous cycle. Critical when the swing
/// also flipped the sign of net GEX.
pub fn gex_swing(snapshot: &StructuralSnapshot, config: &AlertConfig) -> Option<Alert> {
    let change_pct = snapshot.gex_change_pct?;
    if change_pct.is_nan() || change_pct.abs() < config.gex_swing_pct {
        return None;
    }

    let sign_flipped = change_pct <= -100.0;
    let severity = if sign_flipped {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    Some(
        Alert::new(
            AlertType::GexSwing,
            severity,
            snapshot.symbol.clone(),
            format!(
                "{} net GEX {change_pct:+.1}% to {:.0}",
                snapshot.symbol, snapshot.net_gex
            ),
            change_pct.abs(),
            config.gex_swing_pct,
            snapshot.timestamp,
        )
        .with_metadata("net_gex", format!("{:.0}", snapshot.net_gex)),
    )
}

/// Regime change alert, measured as the dwell of the new regime against `regime_min_dwell_secs`.
pub fn regime_change(
    snapshot: &StructuralSnapshot,
    from: StructuralRegime,
    dwell_secs: f64,
    config: &AlertConfig,
) -> Alert {
    let severity = match snapshot.regime {
        StructuralRegime::Breakout | StructuralRegime::PinRisk => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    };
    Alert::new(
        AlertType::RegimeChange,
        severity,
        snapshot.symbol.clone(),
        format!(
            "{} regime {from} -> {} ({:.0}% confidence)",
            snapshot.symbol, snapshot.regime, snapshot.regime_confidence
        ),
        dwell_secs,
        config.regime_min_dwell_secs as f64,
        snapshot.timestamp,
    )
    .with_metadata("from", from)
    .with_metadata("to", snapshot.regime)
    .with_metadata("rule", snapshot.regime_rule)
    .with_metadata("dwell_secs", format!("{dwell_secs:.1}"))
    .with_metadata("confidence", format!("{:.0}", snapshot.regime_confidence))
}
