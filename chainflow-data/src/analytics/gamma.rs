use crate::{
    analytics::{Computed, NeutralReason},
    store::state::{OptionQuote, StrikeState},
};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Dealer positioning implied by the sign of net gamma exposure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum GammaRegime {
    /// Positive net gamma, dealers hedge against moves.
    #[display("mean-reversion bias")]
    MeanReversion,
    /// Negative net gamma, dealers hedge with moves.
    #[display("trend-acceleration bias")]
    TrendAcceleration,
    #[display("neutral")]
    Neutral,
}

/// Net per-strike gamma exposure.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrikeGex {
    pub strike: f64,
    pub call_gex: f64,
    pub put_gex: f64,
}

impl StrikeGex {
    pub fn net(&self) -> f64 {
        self.call_gex - self.put_gex
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GammaExposure {
    pub call_gex: f64,
    pub put_gex: f64,
    pub net_gex: f64,
    pub regime: GammaRegime,
    pub per_strike: Vec<StrikeGex>,
}

impl GammaExposure {
    fn neutral() -> Self {
        Self {
            call_gex: 0.0,
            put_gex: 0.0,
            net_gex: 0.0,
            regime: GammaRegime::Neutral,
            per_strike: Vec::new(),
        }
    }
}

/// Gamma flip level.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct GammaFlip {
    pub level: f64,
    /// `false` when cumulative GEX never changes sign and the level is the strike with
    /// cumulative GEX closest to zero.
    pub crossing: bool,
}

pub fn classify_gamma(net_gex: f64, neutral_threshold: f64) -> GammaRegime {
    if net_gex > neutral_threshold {
        GammaRegime::MeanReversion
    } else if net_gex < -neutral_threshold {
        GammaRegime::TrendAcceleration
    } else {
        GammaRegime::Neutral
    }
}

fn side_gex(quote: Option<&OptionQuote>, multiplier: f64) -> Option<f64> {
    let quote = quote?;
    let gamma = quote.gamma().filter(|gamma| gamma.is_finite())?;
    Some(gamma.abs() * quote.open_interest as f64 * multiplier)
}

/// Gamma exposure per strike (`|gamma| × OI × multiplier` per side) and in aggregate
/// (`Σcall − Σput`).
///
/// Neutral default: zero exposure, [`GammaRegime::Neutral`].
pub fn compute_gex(
    strikes: &[StrikeState],
    multiplier: f64,
    neutral_threshold: f64,
) -> Computed<GammaExposure> {
    if strikes.is_empty() {
        return Computed::neutral(GammaExposure::neutral(), NeutralReason::InsufficientStrikes);
    }

    let mut with_greeks = 0usize;
    let per_strike = strikes
        .iter()
        .map(|state| {
            let call_gex = side_gex(state.call.as_ref(), multiplier);
            let put_gex = side_gex(state.put.as_ref(), multiplier);
            with_greeks += usize::from(call_gex.is_some()) + usize::from(put_gex.is_some());
            StrikeGex {
                strike: state.strike_f64(),
                call_gex: call_gex.unwrap_or(0.0),
                put_gex: put_gex.unwrap_or(0.0),
            }
        })
        .filter(|gex| gex.strike.is_finite())
        .collect::<Vec<_>>();

    if with_greeks == 0 {
        return Computed::neutral(GammaExposure::neutral(), NeutralReason::MissingGreeks);
    }

    let call_gex = per_strike.iter().map(|gex| gex.call_gex).sum::<f64>();
    let put_gex = per_strike.iter().map(|gex| gex.put_gex).sum::<f64>();
    let net_gex = call_gex - put_gex;

    Computed::Value(GammaExposure {
        call_gex,
        put_gex,
        net_gex,
        regime: classify_gamma(net_gex, neutral_threshold),
        per_strike,
    })
}

/// Linear interpolation of the zero crossing between two bracketing strikes.
pub fn interpolate_flip(prev_strike: f64, prev_sum: f64, cur_strike: f64, cur_sum: f64) -> f64 {
    prev_strike + (0.0 - prev_sum) * (cur_strike - prev_strike) / (cur_sum - prev_sum)
}

/// Locate the gamma flip: walking strikes ascending while accumulating net GEX, the level where
/// the running sum changes sign. With several crossings the one nearest spot wins, without any
/// the strike whose running sum is closest to zero is used.
pub fn gamma_flip(per_strike: &[StrikeGex], spot: Option<f64>) -> Computed<Option<GammaFlip>> {
    let Some(first) = per_strike.first() else {
        return Computed::neutral(None, NeutralReason::InsufficientStrikes);
    };

    let mut crossings = Vec::new();
    let mut running = first.net();
    let mut closest = (first.strike, running.abs());
    if running == 0.0 {
        crossings.push(first.strike);
    }

    for window in per_strike.windows(2) {
        let (prev, cur) = (&window[0], &window[1]);
        let prev_sum = running;
        running += cur.net();

        if running.abs() < closest.1 {
            closest = (cur.strike, running.abs());
        }
        if running == 0.0 {
            crossings.push(cur.strike);
        } else if prev_sum != 0.0 && prev_sum.signum() != running.signum() {
            crossings.push(interpolate_flip(prev.strike, prev_sum, cur.strike, running));
        }
    }

    let nearest = match spot {
        Some(spot) => crossings.into_iter().min_by(|a, b| {
            (a - spot).abs().total_cmp(&(b - spot).abs())
        }),
        None => crossings.into_iter().next(),
    };

    Computed::Value(Some(match nearest {
        Some(level) => GammaFlip {
            level,
            crossing: true,
        },
        None => GammaFlip {
            level: closest.0,
            crossing: false,
        },
    }))
}
