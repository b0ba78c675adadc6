use crate::instrument::InstrumentKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Option price sensitivities reported by the feed.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Normalised market update for a single instrument.
///
/// Optional fields are absent when the feed mode does not carry them (eg/ `ltpc` only) or when
/// the reported value was not finite.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    pub instrument_key: InstrumentKey,
    pub last_price: f64,
    pub open_interest: Option<f64>,
    pub volume: Option<u64>,
    pub greeks: Option<Greeks>,
    pub iv: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Construct a price-only [`Tick`].
    pub fn price(
        instrument_key: impl Into<InstrumentKey>,
        last_price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            last_price,
            open_interest: None,
            volume: None,
            greeks: None,
            iv: None,
            timestamp,
        }
    }
}
