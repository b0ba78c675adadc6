use crate::{
    Greeks, Tick,
    error::DecodeError,
    instrument::InstrumentKey,
};
use chrono::{DateTime, Utc};
use prost::Message;
use proto::{
    Feed, FeedResponse, FeedType, Ltpc, OptionGreeks, feed::FeedUnion, full_feed::FullFeedUnion,
};
use tracing::trace;

/// Open interest must fit a `u64` contract count. `u64::MAX as f64` rounds up to 2^64.
const OPEN_INTEREST_LIMIT: f64 = u64::MAX as f64;

/// Protobuf wire messages of the binary market data feed.
pub mod proto;

/// Decode a binary feed frame into [`Tick`]s ordered by instrument key, using the current time
/// as the receive time.
///
/// See [`decode_frame_at`].
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Tick>, DecodeError> {
    decode_frame_at(frame, Utc::now())
}

/// Decode a binary feed frame into [`Tick`]s ordered by instrument key.
///
/// Market info frames carry no ticks and yield an empty `Vec`. Feed entries with a missing,
/// non-finite or negative last price are skipped, non-finite optional fields are dropped
/// individually.
///
/// Proto3 scalars decode absent as zero, so a zero `oi` or `iv` is treated as not reported.
/// Open interest that does not fit a `u64` is dropped.
///
/// Tick timestamps fall back from last traded time, to the frame `current_ts`, to `received`.
pub fn decode_frame_at(frame: &[u8], received: DateTime<Utc>) -> Result<Vec<Tick>, DecodeError> {
    let response = FeedResponse::decode(frame)?;

    if matches!(FeedType::try_from(response.r#type), Ok(FeedType::MarketInfo)) {
        return Ok(Vec::new());
    }

    let frame_time = timestamp_millis(response.current_ts).unwrap_or(received);

    let mut ticks = response
        .feeds
        .into_iter()
        .filter_map(|(key, feed)| {
            let tick = feed_to_tick(InstrumentKey::from(key.as_str()), feed, frame_time);
            if tick.is_none() {
                trace!(instrument_key = %key, stage = "decode", "skipping feed entry without valid price");
            }
            tick
        })
        .collect::<Vec<_>>();

    ticks.sort_by(|a, b| a.instrument_key.cmp(&b.instrument_key));
    Ok(ticks)
}

fn feed_to_tick(instrument_key: InstrumentKey, feed: Feed, frame_time: DateTime<Utc>) -> Option<Tick> {
    let (ltpc, greeks, volume, open_interest, iv) = match feed.feed_union? {
        FeedUnion::Ltpc(ltpc) => (Some(ltpc), None, None, None, None),
        FeedUnion::FullFeed(full) => match full.full_feed_union? {
            FullFeedUnion::MarketFf(market) => (
                market.ltpc,
                market.option_greeks,
                Some(market.vtt),
                Some(market.oi),
                Some(market.iv),
            ),
            FullFeedUnion::IndexFf(index) => (index.ltpc, None, None, None, None),
        },
        FeedUnion::FirstLevelWithGreeks(first) => (
            first.ltpc,
            first.option_greeks,
            Some(first.vtt),
            Some(first.oi),
            Some(first.iv),
        ),
    };

    let Ltpc { ltp, ltt, .. } = ltpc?;
    if !ltp.is_finite() || ltp < 0.0 {
        return None;
    }

    Some(Tick {
        instrument_key,
        last_price: ltp,
        open_interest: open_interest
            .filter(|oi| oi.is_finite() && *oi > 0.0 && *oi < OPEN_INTEREST_LIMIT),
        volume: volume.and_then(|vtt| u64::try_from(vtt).ok()),
        greeks: greeks.and_then(to_greeks),
        iv: iv.filter(|iv| iv.is_finite() && *iv > 0.0),
        timestamp: timestamp_millis(ltt).unwrap_or(frame_time),
    })
}

fn to_greeks(greeks: OptionGreeks) -> Option<Greeks> {
    let OptionGreeks {
        delta,
        theta,
        gamma,
        vega,
        ..
    } = greeks;

    [delta, theta, gamma, vega]
        .iter()
        .all(|value| value.is_finite())
        .then_some(Greeks {
            delta,
            gamma,
            theta,
            vega,
        })
}

fn timestamp_millis(millis: i64) -> Option<DateTime<Utc>> {
    (millis > 0)
        .then(|| DateTime::from_timestamp_millis(millis))
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::{FirstLevelWithGreeks, FullFeed, IndexFullFeed, MarketFullFeed};
    use std::collections::HashMap;

    fn ltpc(ltp: f64, ltt: i64) -> Option<Ltpc> {
        Some(Ltpc {
            ltp,
            ltt,
            ltq: 0,
            cp: 0.0,
        })
    }

    fn greeks(gamma: f64) -> Option<OptionGreeks> {
        Some(OptionGreeks {
            delta: 0.5,
            theta: -10.0,
            gamma,
            vega: 12.0,
            rho: 0.0,
        })
    }

    fn frame(kind: FeedType, feeds: Vec<(&str, FeedUnion)>, current_ts: i64) -> Vec<u8> {
        FeedResponse {
            r#type: kind as i32,
            feeds: feeds
                .into_iter()
                .map(|(key, union)| {
                    (
                        key.to_string(),
                        Feed {
                            feed_union: Some(union),
                        },
                    )
                })
                .collect::<HashMap<_, _>>(),
            current_ts,
        }
        .encode_to_vec()
    }

    fn received() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_735_800_000_000).unwrap()
    }

    #[test]
    fn test_decode_frame_sorted_by_instrument_key() {
        let frame = frame(
            FeedType::LiveFeed,
            vec![
                (
                    "NSE_INDEX|Nifty 50",
                    FeedUnion::FullFeed(FullFeed {
                        full_feed_union: Some(FullFeedUnion::IndexFf(IndexFullFeed {
                            ltpc: ltpc(25000.0, 1_735_800_001_000),
                        })),
                    }),
                ),
                (
                    "NSE_FO|45450",
                    FeedUnion::FirstLevelWithGreeks(FirstLevelWithGreeks {
                        ltpc: ltpc(120.5, 0),
                        option_greeks: greeks(0.002),
                        vtt: 1500,
                        oi: 1_000_000.0,
                        iv: 0.14,
                    }),
                ),
            ],
            1_735_800_002_000,
        );

        let ticks = decode_frame_at(&frame, received()).unwrap();
        assert_eq!(ticks.len(), 2);

        assert_eq!(ticks[0].instrument_key, "NSE_FO|45450");
        assert_eq!(ticks[0].last_price, 120.5);
        assert_eq!(ticks[0].open_interest, Some(1_000_000.0));
        assert_eq!(ticks[0].volume, Some(1500));
        assert_eq!(ticks[0].greeks.map(|greeks| greeks.gamma), Some(0.002));
        assert_eq!(ticks[0].iv, Some(0.14));
        // no ltt, falls back to frame current_ts
        assert_eq!(ticks[0].timestamp.timestamp_millis(), 1_735_800_002_000);

        assert_eq!(ticks[1].instrument_key, "NSE_INDEX|Nifty 50");
        assert_eq!(ticks[1].last_price, 25000.0);
        assert_eq!(ticks[1].open_interest, None);
        assert_eq!(ticks[1].greeks, None);
        assert_eq!(ticks[1].timestamp.timestamp_millis(), 1_735_800_001_000);
    }

    #[test]
    fn test_decode_frame_drops_invalid_values() {
        struct TestCase {
            input: FeedUnion,
            expected: Option<Tick>,
        }

        let key = "NSE_FO|45450";
        let tests = vec![
            TestCase {
                // TC0: negative price drops the entry
                input: FeedUnion::Ltpc(Ltpc {
                    ltp: -1.0,
                    ltt: 0,
                    ltq: 0,
                    cp: 0.0,
                }),
                expected: None,
            },
            TestCase {
                // TC1: NaN price drops the entry
                input: FeedUnion::Ltpc(Ltpc {
                    ltp: f64::NAN,
                    ltt: 0,
                    ltq: 0,
                    cp: 0.0,
                }),
                expected: None,
            },
            TestCase {
                // TC2: non-finite greeks & iv are dropped field-wise
                input: FeedUnion::FullFeed(FullFeed {
                    full_feed_union: Some(FullFeedUnion::MarketFf(MarketFullFeed {
                        ltpc: ltpc(99.0, 0),
                        option_greeks: greeks(f64::INFINITY),
                        vtt: 10,
                        oi: 500.0,
                        iv: f64::NAN,
                    })),
                }),
                expected: Some(Tick {
                    instrument_key: InstrumentKey::from(key),
                    last_price: 99.0,
                    open_interest: Some(500.0),
                    volume: Some(10),
                    greeks: None,
                    iv: None,
                    timestamp: received(),
                }),
            },
            TestCase {
                // TC3: full feed without ltpc drops the entry
                input: FeedUnion::FullFeed(FullFeed {
                    full_feed_union: Some(FullFeedUnion::MarketFf(MarketFullFeed {
                        ltpc: None,
                        option_greeks: greeks(0.001),
                        vtt: 10,
                        oi: 500.0,
                        iv: 0.1,
                    })),
                }),
                expected: None,
            },
            TestCase {
                // TC4: open interest beyond u64 is dropped, the rest of the entry kept
                input: FeedUnion::FirstLevelWithGreeks(FirstLevelWithGreeks {
                    ltpc: ltpc(50.0, 0),
                    option_greeks: None,
                    vtt: 0,
                    oi: 1.5e20,
                    iv: 0.12,
                }),
                expected: Some(Tick {
                    instrument_key: InstrumentKey::from(key),
                    last_price: 50.0,
                    open_interest: None,
                    volume: Some(0),
                    greeks: None,
                    iv: Some(0.12),
                    timestamp: received(),
                }),
            },
            TestCase {
                // TC5: zero oi & iv are unreported proto3 defaults
                input: FeedUnion::FullFeed(FullFeed {
                    full_feed_union: Some(FullFeedUnion::MarketFf(MarketFullFeed {
                        ltpc: ltpc(75.0, 0),
                        option_greeks: None,
                        vtt: 5,
                        oi: 0.0,
                        iv: 0.0,
                    })),
                }),
                expected: Some(Tick {
                    instrument_key: InstrumentKey::from(key),
                    last_price: 75.0,
                    open_interest: None,
                    volume: Some(5),
                    greeks: None,
                    iv: None,
                    timestamp: received(),
                }),
            },
            TestCase {
                // TC6: open interest near, but below, the u64 limit is kept
                input: FeedUnion::FirstLevelWithGreeks(FirstLevelWithGreeks {
                    ltpc: ltpc(50.0, 0),
                    option_greeks: None,
                    vtt: 0,
                    oi: 1.5e19,
                    iv: 0.0,
                }),
                expected: Some(Tick {
                    instrument_key: InstrumentKey::from(key),
                    last_price: 50.0,
                    open_interest: Some(1.5e19),
                    volume: Some(0),
                    greeks: None,
                    iv: None,
                    timestamp: received(),
                }),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let frame = frame(FeedType::LiveFeed, vec![(key, test.input)], 0);
            let actual = decode_frame_at(&frame, received()).unwrap().pop();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_decode_frame_market_info_is_empty() {
        let frame = frame(
            FeedType::MarketInfo,
            vec![("NSE_INDEX|Nifty 50", FeedUnion::Ltpc(Ltpc::default()))],
            0,
        );
        assert!(decode_frame(&frame).unwrap().is_empty());
        assert!(decode_frame(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_frame_malformed() {
        let actual = decode_frame(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(actual, Err(DecodeError::Malformed(_))));
    }
}
