use crate::{
    analytics::{
        StructuralSnapshot,
        dynamics::RegimeDynamics,
        expected_move::ExpectedMove,
        flow::FlowDirection,
        gamma::GammaRegime,
        regime::{RegimeRule, StructuralRegime, VolTrend, VolatilityRegime},
    },
    chain::SubscriptionControl,
    instrument::{InstrumentKey, OptionContract, OptionSide, Symbol},
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

pub fn expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
}

pub fn contract_key(symbol: &str, strike: Decimal, side: OptionSide) -> InstrumentKey {
    InstrumentKey::from(format!("NSE_FO|{symbol}-{strike}-{side}"))
}

/// Call and put contracts for every strike.
pub fn contracts(symbol: &str, strikes: &[Decimal]) -> Vec<OptionContract> {
    strikes
        .iter()
        .flat_map(|strike| {
            [OptionSide::Call, OptionSide::Put].map(|side| OptionContract {
                instrument_key: contract_key(symbol, *strike, side),
                symbol: Symbol::from(symbol),
                expiry: expiry(),
                strike: *strike,
                side,
            })
        })
        .collect()
}

/// [`SubscriptionControl`] recording the active set and every unsubscribed key.
#[derive(Debug, Default)]
pub struct RecordingControl {
    active: Mutex<BTreeSet<InstrumentKey>>,
    unsubscribed: Mutex<Vec<InstrumentKey>>,
}

impl RecordingControl {
    pub fn subscribed(&self) -> Vec<InstrumentKey> {
        self.active.lock().iter().cloned().collect()
    }

    pub fn unsubscribed(&self) -> Vec<InstrumentKey> {
        self.unsubscribed.lock().clone()
    }
}

impl SubscriptionControl for RecordingControl {
    fn subscribe(&self, keys: &[InstrumentKey]) {
        self.active.lock().extend(keys.iter().cloned());
    }

    fn unsubscribe(&self, keys: &[InstrumentKey]) {
        let mut active = self.active.lock();
        for key in keys {
            active.remove(key);
        }
        self.unsubscribed.lock().extend(keys.iter().cloned());
    }
}

/// Fixed reference time, `offset_secs` after 2025-01-02T04:00:00Z.
pub fn time(offset_secs: i64) -> DateTime<Utc> {
    expiry().and_hms_opt(4, 0, 0).unwrap().and_utc() + TimeDelta::seconds(offset_secs)
}

/// Quiet NIFTY [`StructuralSnapshot`]: positive gamma range, no flip nearby, balanced flow.
pub fn structural_snapshot(regime: StructuralRegime, timestamp: DateTime<Utc>) -> StructuralSnapshot {
    StructuralSnapshot {
        symbol: Symbol::from("NIFTY"),
        expiry: expiry(),
        spot: Some(25_000.0),
        atm_strike: Some(Decimal::from(25_000)),
        expected_move: ExpectedMove::new(25_000.0, 150.0),
        call_gex: 150_000.0,
        put_gex: 90_000.0,
        net_gex: 60_000.0,
        gamma_regime: GammaRegime::MeanReversion,
        gamma_flip: Some(24_000.0),
        flip_distance: Some(-1_000.0),
        flip_distance_pct: Some(-4.0),
        call_oi_velocity: 0.0,
        put_oi_velocity: 0.0,
        flow_imbalance: 0.0,
        flow_direction: FlowDirection::Neutral,
        atm_iv: Some(0.14),
        volatility_regime: VolatilityRegime::Normal,
        vol_trend: VolTrend::Stable,
        regime,
        regime_confidence: 70.0,
        regime_rule: RegimeRule::Range,
        dynamics: RegimeDynamics::default(),
        pin_strike: Some(Decimal::from(25_000)),
        pin_risk_score: 10.0,
        gex_change_pct: Some(2.0),
        total_call_oi: 1_000_000,
        total_put_oi: 800_000,
        pcr: Some(0.8),
        degraded: Vec::new(),
        timestamp,
    }
}
