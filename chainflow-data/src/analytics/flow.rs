use crate::{
    analytics::{Computed, NeutralReason},
    config::FlowThresholds,
    store::state::StrikeState,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named OI flow direction, from an option writer's perspective.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum FlowDirection {
    #[display("call writing")]
    CallWriting,
    #[display("put writing")]
    PutWriting,
    #[display("call unwinding")]
    CallUnwinding,
    #[display("put unwinding")]
    PutUnwinding,
    /// Both sides building or calls building against put unwinding, call side dominant.
    #[display("bearish build")]
    BearishBuild,
    /// Both sides building or puts building against call unwinding, put side dominant.
    #[display("bullish build")]
    BullishBuild,
    /// OI moving on at least one side without a dominant side.
    #[display("balanced")]
    Balanced,
    #[display("neutral")]
    Neutral,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct OiFlow {
    /// Call OI change, contracts per minute.
    pub call_velocity: f64,
    /// Put OI change, contracts per minute.
    pub put_velocity: f64,
    pub imbalance: f64,
    pub direction: FlowDirection,
}

impl OiFlow {
    fn neutral() -> Self {
        Self {
            call_velocity: 0.0,
            put_velocity: 0.0,
            imbalance: 0.0,
            direction: FlowDirection::Neutral,
        }
    }
}

/// Per-strike (call OI, put OI) captured at the end of an analytics cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OiSample {
    pub time: DateTime<Utc>,
    pub open_interest: BTreeMap<Decimal, (u64, u64)>,
}

impl OiSample {
    pub fn capture(strikes: &[StrikeState], time: DateTime<Utc>) -> Self {
        Self {
            time,
            open_interest: strikes
                .iter()
                .map(|state| (state.strike, (state.call_oi(), state.put_oi())))
                .collect(),
        }
    }
}

/// `(c − p) / (|c| + |p|)`, 0 when both are 0.
pub fn flow_imbalance(call_velocity: f64, put_velocity: f64) -> f64 {
    let total = call_velocity.abs() + put_velocity.abs();
    if total > 0.0 && total.is_finite() {
        (call_velocity - put_velocity) / total
    } else {
        0.0
    }
}

/// Classify OI flow. Pure: identical inputs always yield the same direction.
///
/// A side is active only when its |velocity| strictly exceeds `min_velocity`, and a side only
/// dominates when |imbalance| strictly exceeds the imbalance threshold, so zero velocities and
/// edge magnitudes never classify as writing or unwinding.
pub fn classify_flow(
    call_velocity: f64,
    put_velocity: f64,
    imbalance: f64,
    thresholds: &FlowThresholds,
) -> FlowDirection {
    if !(call_velocity.is_finite() && put_velocity.is_finite() && imbalance.is_finite()) {
        return FlowDirection::Neutral;
    }

    let call_active = call_velocity.abs() > thresholds.min_velocity;
    let put_active = put_velocity.abs() > thresholds.min_velocity;
    let call_dominant = imbalance > thresholds.imbalance;
    let put_dominant = imbalance < -thresholds.imbalance;

    match (call_active, put_active) {
        (false, false) => FlowDirection::Neutral,
        _ if !call_dominant && !put_dominant => FlowDirection::Balanced,
        (true, false) if call_velocity > 0.0 => FlowDirection::CallWriting,
        (true, false) => FlowDirection::CallUnwinding,
        (false, true) if put_velocity > 0.0 => FlowDirection::PutWriting,
        (false, true) => FlowDirection::PutUnwinding,
        (true, true) if call_dominant && call_velocity > 0.0 => FlowDirection::BearishBuild,
        // call dominant with both negative: puts unwinding faster
        (true, true) if call_dominant => FlowDirection::PutUnwinding,
        (true, true) if put_velocity > 0.0 => FlowDirection::BullishBuild,
        (true, true) => FlowDirection::CallUnwinding,
    }
}

/// OI velocity per minute versus the previous cycle's sample, over strikes present in both.
///
/// Neutral default: zero velocities, [`FlowDirection::Neutral`].
pub fn compute_flow(
    current: &OiSample,
    previous: Option<&OiSample>,
    thresholds: &FlowThresholds,
) -> Computed<OiFlow> {
    let Some(previous) = previous else {
        return Computed::neutral(OiFlow::neutral(), NeutralReason::NoPreviousCycle);
    };

    let minutes = (current.time - previous.time).num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return Computed::neutral(OiFlow::neutral(), NeutralReason::DegenerateInput);
    }

    let (call_delta, put_delta) = current
        .open_interest
        .iter()
        .filter_map(|(strike, (call, put))| {
            let (prev_call, prev_put) = previous.open_interest.get(strike)?;
            Some((
                *call as f64 - *prev_call as f64,
                *put as f64 - *prev_put as f64,
            ))
        })
        .fold((0.0, 0.0), |(calls, puts), (call, put)| (calls + call, puts + put));

    let call_velocity = call_delta / minutes;
    let put_velocity = put_delta / minutes;
    let imbalance = flow_imbalance(call_velocity, put_velocity);

    Computed::Value(OiFlow {
        call_velocity,
        put_velocity,
        imbalance,
        direction: classify_flow(call_velocity, put_velocity, imbalance, thresholds),
    })
}
