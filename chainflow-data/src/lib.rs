//! # Chainflow-Data
//! Real-time option-chain ingestion and structural analytics.
//!
//! Ticks arrive as binary frames over a broker WebSocket feed, are decoded into [`Tick`]s,
//! routed by instrument key into the [`MarketStateStore`](store::MarketStateStore), and
//! consumed by two readers:
//! - [`OptionChainBuilder`](chain::OptionChainBuilder): keeps an ATM-centred strike window per
//!   (symbol, expiry), drives subscription changes as spot drifts, and assembles chain payloads.
//! - [`StructuralAnalyticsEngine`](analytics::StructuralAnalyticsEngine): computes expected move,
//!   gamma exposure, gamma flip, OI flow, regime and regime dynamics on a fixed cadence, feeding
//!   the [`AlertEngine`](alert::AlertEngine).
//!
//! [`MarketService`](service::MarketService) is the application root that owns every registry and
//! exposes the outbound interface to publishers.

/// All [`Error`](std::error::Error)s generated in Chainflow-Data.
pub mod error;

/// Configuration surface, loaded from JSON and `CHAINFLOW_*` environment overrides.
pub mod config;

/// Cooperative shutdown signal shared by every long-lived task.
pub mod shutdown;

/// Instrument keys, option sides and the key → route grammar.
pub mod instrument;

/// Normalised [`Tick`] model produced by the frame decoder.
pub mod event;

/// Binary feed frame decoding.
pub mod decoder;

/// Broker feed connection: authorization, transport, subscriptions, reconnects and the
/// bounded ingestion queue.
pub mod feed;

/// Routes decoded ticks into the market state store.
pub mod router;

/// Per-symbol in-memory market state.
pub mod store;

/// Option chain windows, subscription deltas and chain payloads.
pub mod chain;

/// Structural analytics computed over market state snapshots.
pub mod analytics;

/// Threshold alerts over structural analytics.
pub mod alert;

/// Application root wiring the pipeline stages together.
pub mod service;

pub use event::{Greeks, Tick};

#[cfg(test)]
mod test_utils;
