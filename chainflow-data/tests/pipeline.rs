use bytes::Bytes;
use chainflow_data::{
    alert::AlertType,
    analytics::gamma::GammaRegime,
    chain::{StaticCatalog, SubscriptionControl},
    config::Config,
    decoder::proto::{
        Feed, FeedResponse, FeedType, FullFeed, Ltpc, MarketFullFeed, OptionGreeks,
        feed::FeedUnion, full_feed::FullFeedUnion,
    },
    feed::{FeedEvent, FrameQueue},
    instrument::{InstrumentKey, OptionContract, OptionSide, Symbol},
    service::MarketService,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use prost::Message;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{collections::HashMap, sync::Arc};

const INDEX_KEY: &str = "NSE_INDEX|Nifty 50";
const CALL_KEY: &str = "NSE_FO|NIFTY25000CE";
const PUT_KEY: &str = "NSE_FO|NIFTY25000PE";

#[derive(Debug, Default)]
struct CollectingControl {
    subscribed: Mutex<Vec<InstrumentKey>>,
}

impl SubscriptionControl for CollectingControl {
    fn subscribe(&self, keys: &[InstrumentKey]) {
        self.subscribed.lock().extend(keys.iter().cloned());
    }

    fn unsubscribe(&self, keys: &[InstrumentKey]) {
        self.subscribed.lock().retain(|key| !keys.contains(key));
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
}

fn time(offset_secs: i64) -> DateTime<Utc> {
    expiry().and_hms_opt(4, 0, 0).unwrap().and_utc() + TimeDelta::seconds(offset_secs)
}

fn catalog() -> StaticCatalog {
    let contract = |key: &str, strike: Decimal, side: OptionSide| OptionContract {
        instrument_key: InstrumentKey::from(key),
        symbol: Symbol::from("NIFTY"),
        expiry: expiry(),
        strike,
        side,
    };
    StaticCatalog::new(vec![
        contract("NSE_FO|NIFTY24950CE", dec!(24950), OptionSide::Call),
        contract("NSE_FO|NIFTY24950PE", dec!(24950), OptionSide::Put),
        contract(CALL_KEY, dec!(25000), OptionSide::Call),
        contract(PUT_KEY, dec!(25000), OptionSide::Put),
        contract("NSE_FO|NIFTY25050CE", dec!(25050), OptionSide::Call),
        contract("NSE_FO|NIFTY25050PE", dec!(25050), OptionSide::Put),
    ])
}

fn ltpc(ltp: f64, at: DateTime<Utc>) -> Option<Ltpc> {
    Some(Ltpc {
        ltp,
        ltt: at.timestamp_millis(),
        ltq: 0,
        cp: 0.0,
    })
}

fn option_feed(ltp: f64, gamma: f64, oi: f64, iv: f64, at: DateTime<Utc>) -> Feed {
    Feed {
        feed_union: Some(FeedUnion::FullFeed(FullFeed {
            full_feed_union: Some(FullFeedUnion::MarketFf(MarketFullFeed {
                ltpc: ltpc(ltp, at),
                option_greeks: Some(OptionGreeks {
                    delta: 0.5,
                    theta: -12.0,
                    gamma,
                    vega: 10.0,
                    rho: 0.0,
                }),
                vtt: 1_000,
                oi,
                iv,
            })),
        })),
    }
}

fn frame(feeds: HashMap<String, Feed>, at: DateTime<Utc>) -> FeedEvent {
    let response = FeedResponse {
        r#type: FeedType::LiveFeed as i32,
        feeds,
        current_ts: at.timestamp_millis(),
    };
    FeedEvent::Frame {
        payload: Bytes::from(response.encode_to_vec()),
        received: at,
    }
}

fn market_frame(call_oi: f64, put_oi: f64, at: DateTime<Utc>) -> FeedEvent {
    frame(
        HashMap::from([
            (
                INDEX_KEY.to_string(),
                Feed {
                    feed_union: Some(FeedUnion::Ltpc(ltpc(25_000.0, at).unwrap())),
                },
            ),
            (
                CALL_KEY.to_string(),
                option_feed(120.0, 0.002, call_oi, 14.0, at),
            ),
            (
                PUT_KEY.to_string(),
                option_feed(110.0, -0.0015, put_oi, 15.0, at),
            ),
        ]),
        at,
    )
}

#[test]
fn test_pipeline_gex_and_pcr() {
    init_logging();
    let control = Arc::new(CollectingControl::default());
    let service = MarketService::new(Config::default(), Arc::new(catalog()), control.clone());
    service.open_chain("NIFTY", expiry());

    let applied = service.process_event(&market_frame(1_000_000.0, 800_000.0, time(0)));
    assert_eq!(applied, 3);

    // spot drove the chain window onto the listed contracts
    let subscribed = control.subscribed.lock().clone();
    assert!(subscribed.contains(&InstrumentKey::from(INDEX_KEY)));
    assert!(subscribed.contains(&InstrumentKey::from(CALL_KEY)));
    assert!(subscribed.contains(&InstrumentKey::from(PUT_KEY)));

    let payload = service.chain_payload("NIFTY", expiry()).unwrap();
    assert_eq!(payload.spot, 25_000.0);
    assert_eq!(payload.atm_strike, dec!(25000));
    assert_eq!(payload.total_call_oi, 1_000_000);
    assert_eq!(payload.total_put_oi, 800_000);
    assert_eq!(payload.pcr, Some(0.8));

    let updates = service.run_analytics_cycle(time(1));
    assert_eq!(updates.len(), 1);

    let metrics = service.latest_metrics("NIFTY").unwrap();
    assert!((metrics.net_gex - 60_000.0).abs() < 1e-6);
    assert_eq!(metrics.gamma_regime, GammaRegime::MeanReversion);
    assert_eq!(metrics.total_call_oi, 1_000_000);
    assert_eq!(metrics.total_put_oi, 800_000);
    assert_eq!(metrics.pcr, Some(0.8));
    assert!(metrics.atm_iv.is_some_and(|iv| (iv - 0.145).abs() < 1e-9));
    assert!(metrics.expected_move.one_sigma > 0.0);
}

#[test]
fn test_pipeline_gex_swing_alert() {
    init_logging();
    let service = MarketService::new(
        Config::default(),
        Arc::new(catalog()),
        Arc::new(CollectingControl::default()),
    );
    service.open_chain("NIFTY", expiry());

    service.process_event(&market_frame(1_000_000.0, 800_000.0, time(0)));
    service.run_analytics_cycle(time(1));

    // put OI surge flips net GEX negative
    service.process_event(&market_frame(1_000_000.0, 2_400_000.0, time(30)));
    let updates = service.run_analytics_cycle(time(31));

    let metrics = &updates[0].metrics;
    assert!(metrics.net_gex < 0.0);
    assert!(metrics.gex_change_pct.is_some_and(|change| change <= -100.0));
    assert!(
        updates[0]
            .alerts
            .iter()
            .any(|alert| alert.alert_type == AlertType::GexSwing)
    );
    assert_eq!(
        service.recent_alerts("NIFTY", 10)[0].alert_type,
        updates[0].alerts.last().unwrap().alert_type
    );
}

#[test]
fn test_queue_drops_oldest_frames() {
    let queue = FrameQueue::new(2);
    let first = market_frame(1.0, 1.0, time(0));
    let second = market_frame(2.0, 2.0, time(1));
    let third = market_frame(3.0, 3.0, time(2));

    assert_eq!(queue.push(first.clone()), None);
    assert_eq!(queue.push(second.clone()), None);
    assert_eq!(queue.push(third.clone()), Some(first));
    assert_eq!(queue.dropped(), 1);

    assert_eq!(queue.try_pop(), Some(second));
    assert_eq!(queue.try_pop(), Some(third));
    assert_eq!(queue.try_pop(), None);
}
