use crate::{
    analytics::{Computed, NeutralReason},
    store::state::{OptionQuote, StrikeState},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_2_PI;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;
const MIN_TIME_TO_EXPIRY_SECS: i64 = 60 * 60;

/// One and two standard deviation move bands around spot.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ExpectedMove {
    /// 1σ move in index points.
    pub one_sigma: f64,
    pub upper_1sd: f64,
    pub lower_1sd: f64,
    pub upper_2sd: f64,
    pub lower_2sd: f64,
    pub iv_move: Option<f64>,
    pub straddle_move: Option<f64>,
}

impl ExpectedMove {
    pub fn new(spot: f64, one_sigma: f64) -> Self {
        Self {
            one_sigma,
            upper_1sd: spot + one_sigma,
            lower_1sd: spot - one_sigma,
            upper_2sd: spot + 2.0 * one_sigma,
            lower_2sd: spot - 2.0 * one_sigma,
            iv_move: None,
            straddle_move: None,
        }
    }

    /// Express a distance from spot in 1σ units.
    pub fn sigmas(&self, distance: f64) -> Option<f64> {
        (self.one_sigma > 0.0).then(|| distance.abs() / self.one_sigma)
    }
}

/// Years until the expiry day market close, floored at one hour.
pub fn time_to_expiry_years(expiry: NaiveDate, close_minutes_utc: u32, now: DateTime<Utc>) -> f64 {
    let close = NaiveTime::from_num_seconds_from_midnight_opt(close_minutes_utc * 60, 0)
        .unwrap_or(NaiveTime::MIN);
    let remaining = (expiry.and_time(close).and_utc() - now)
        .num_seconds()
        .max(MIN_TIME_TO_EXPIRY_SECS);
    remaining as f64 / SECONDS_PER_YEAR
}

/// Normalise IV to a decimal fraction, treating values above 3 as percentages.
pub fn normalise_iv(iv: f64) -> f64 {
    if iv > 3.0 { iv / 100.0 } else { iv }
}

/// Mean normalised IV of the strike's call and put.
pub fn strike_iv(strike: &StrikeState) -> Option<f64> {
    let ivs = [strike.call.as_ref(), strike.put.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|quote| quote.iv)
        .filter(|iv| iv.is_finite() && *iv > 0.0)
        .map(normalise_iv)
        .collect::<Vec<_>>();

    (!ivs.is_empty()).then(|| ivs.iter().sum::<f64>() / ivs.len() as f64)
}

/// Compute the expected move from the ATM strike.
///
/// IV based: `spot × iv × √T`. Straddle based: `straddle / √(2/π)`, since an ATM straddle
/// prices the expected absolute move `σ√(2/π)`. Both are averaged when available.
///
/// Neutral default: zero width bands at spot.
pub fn compute_expected_move(
    spot: Option<f64>,
    atm: Option<&StrikeState>,
    time_to_expiry_years: Option<f64>,
) -> Computed<ExpectedMove> {
    let Some(spot) = spot.filter(|spot| spot.is_finite() && *spot > 0.0) else {
        return Computed::neutral(ExpectedMove::default(), NeutralReason::MissingSpot);
    };
    let Some(atm) = atm else {
        return Computed::neutral(
            ExpectedMove::new(spot, 0.0),
            NeutralReason::InsufficientStrikes,
        );
    };

    let iv_move = strike_iv(atm)
        .zip(time_to_expiry_years)
        .map(|(iv, years)| spot * iv * years.sqrt());

    let straddle_move = match (&atm.call, &atm.put) {
        (
            Some(OptionQuote {
                last_price: call, ..
            }),
            Some(OptionQuote { last_price: put, .. }),
        ) if call + put > 0.0 => Some((call + put) / FRAC_2_PI.sqrt()),
        _ => None,
    };

    let one_sigma = match (iv_move, straddle_move) {
        (Some(iv_move), Some(straddle_move)) => (iv_move + straddle_move) / 2.0,
        (Some(one_sigma), None) | (None, Some(one_sigma)) => one_sigma,
        (None, None) => {
            return Computed::neutral(
                ExpectedMove::new(spot, 0.0),
                NeutralReason::MissingVolatility,
            );
        }
    };

    Computed::Value(ExpectedMove {
        iv_move,
        straddle_move,
        ..ExpectedMove::new(spot, one_sigma)
    })
}
