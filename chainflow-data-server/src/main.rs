use anyhow::Context;
use chainflow_data::{
    analytics::StructuralSnapshot,
    chain::StaticCatalog,
    config::Config,
    feed::{
        FeedClient, FrameQueue,
        auth::{EnvTokenProvider, HttpFeedAuthorizer},
        transport::WebSocketTransport,
    },
    service::{AnalyticsUpdate, MarketService},
    shutdown::{Shutdown, shutdown_channel},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Analytics update as published downstream.
#[derive(Debug, Serialize)]
struct MetricsMessage<'a> {
    kind: &'static str,
    time_published: DateTime<Utc>,
    metrics: &'a StructuralSnapshot,
    alerts: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting chainflow-data server");

    // Configurable via CHAINFLOW_CONFIG env var (default: built-in defaults)
    let config_path = std::env::var("CHAINFLOW_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    let catalog = match &config.catalog_path {
        Some(path) => StaticCatalog::from_json_file(path)
            .with_context(|| format!("failed to load instrument catalog {}", path.display()))?,
        None => {
            warn!("no catalog_path configured, option chains will have no listed contracts");
            StaticCatalog::default()
        }
    };

    let queue = Arc::new(FrameQueue::new(config.feed.queue_capacity));
    let authorizer = Arc::new(HttpFeedAuthorizer::new(config.feed.authorize_url()?));
    let transport = Arc::new(WebSocketTransport::new(config.feed.read_timeout()));
    let (client, feed) = FeedClient::new(
        config.feed.clone(),
        authorizer,
        transport,
        Arc::clone(&queue),
    );

    let service = Arc::new(MarketService::new(
        config.clone(),
        Arc::new(catalog),
        Arc::new(feed.clone()),
    ));

    for chain in &config.chains {
        let builder = service.open_chain(chain.symbol.clone(), chain.expiry);
        info!(chain = %builder.key(), strikes = builder.strikes().len(), "opened option chain");
    }

    let (trigger, shutdown) = shutdown_channel();

    let mut tasks = service.spawn(Arc::clone(&queue), shutdown.clone());
    tasks.push(feed.spawn_heartbeat(
        Arc::clone(&queue),
        config.feed.heartbeat_interval(),
        shutdown.clone(),
    ));
    tasks.push(tokio::spawn(client.run(
        Arc::new(EnvTokenProvider::new(config.feed.token_env.clone())),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(publish(
        service.subscribe_updates(),
        shutdown.clone(),
    )));

    info!(
        chains = config.chains.len(),
        index_keys = service.index_keys().len(),
        "pipeline running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("Shutting down");
    trigger.trigger();

    for task in tasks {
        if let Err(error) = task.await {
            error!(%error, "pipeline task panicked");
        }
    }

    info!(dropped_frames = queue.dropped(), "chainflow-data server stopped");
    Ok(())
}

/// Emit every [`AnalyticsUpdate`] as a JSON log line, the hand-off point for an external
/// publisher.
async fn publish(mut updates: broadcast::Receiver<AnalyticsUpdate>, mut shutdown: Shutdown) {
    loop {
        let update = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            update = updates.recv() => update,
        };

        match update {
            Ok(update) => {
                let message = MetricsMessage {
                    kind: "structural_snapshot",
                    time_published: Utc::now(),
                    metrics: &update.metrics,
                    alerts: update.alerts.len(),
                };
                match serde_json::to_string(&message) {
                    Ok(json) => info!(target: "chainflow::publish", "{json}"),
                    Err(error) => warn!(%error, "failed to serialise analytics update"),
                }
                for alert in &update.alerts {
                    match serde_json::to_string(alert) {
                        Ok(json) => info!(target: "chainflow::alerts", "{json}"),
                        Err(error) => warn!(%error, "failed to serialise alert"),
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "publisher lagging, skipped analytics updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Configurable via CHAINFLOW_LOG_JSON env var (default: human readable)
    let json = std::env::var("CHAINFLOW_LOG_JSON")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
