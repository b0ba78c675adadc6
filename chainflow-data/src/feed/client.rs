use crate::{
    chain::SubscriptionControl,
    config::FeedConfig,
    error::FeedError,
    feed::{
        auth::{FeedAuthorizer, TokenProvider},
        backoff::ReconnectBackoff,
        queue::{FeedEvent, FrameQueue},
        subscription::{ControlMessage, ControlMethod, SubscriptionSet},
        transport::{FeedConnection, FeedTransport, WireMessage},
    },
    instrument::InstrumentKey,
    shutdown::Shutdown,
};
use chrono::Utc;
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of the [`FeedClient`] connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum FeedState {
    Disconnected,
    Authorizing,
    Connected,
    Subscribed,
    Receiving,
    Reconnecting,
    /// The access token was rejected, a fresh token is required to make progress.
    AuthRequired,
}

/// Commands sent from a [`FeedHandle`] to the running [`FeedClient`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FeedCommand {
    Subscribe(Vec<InstrumentKey>),
    Unsubscribe(Vec<InstrumentKey>),
    Ping,
}

/// Owns the single persistent broker feed connection.
///
/// Raw binary frames are pushed into the shared [`FrameQueue`], decoding happens downstream.
/// The last-known [`SubscriptionSet`] survives reconnects and is re-sent in full on every new
/// connection.
pub struct FeedClient {
    config: FeedConfig,
    authorizer: Arc<dyn FeedAuthorizer>,
    transport: Arc<dyn FeedTransport>,
    queue: Arc<FrameQueue>,
    connection: Option<Box<dyn FeedConnection>>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    state_tx: watch::Sender<FeedState>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    sequence: u64,
}

impl FeedClient {
    pub fn new(
        config: FeedConfig,
        authorizer: Arc<dyn FeedAuthorizer>,
        transport: Arc<dyn FeedTransport>,
        queue: Arc<FrameQueue>,
    ) -> (Self, FeedHandle) {
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::default()));

        let handle = FeedHandle {
            commands: command_tx,
            subscriptions: Arc::clone(&subscriptions),
            state: state_rx,
        };

        let client = Self {
            config,
            authorizer,
            transport,
            queue,
            connection: None,
            subscriptions,
            state_tx,
            commands,
            sequence: 0,
        };

        (client, handle)
    }

    pub fn state(&self) -> FeedState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Exchange `token` for a feed URL and open the transport.
    ///
    /// A rejected token moves the client to [`FeedState::AuthRequired`] and returns
    /// [`FeedError::AuthRequired`]. Credentials are never refreshed here.
    pub async fn connect(&mut self, token: &str) -> Result<(), FeedError> {
        self.close_connection().await;
        self.set_state(FeedState::Authorizing);

        let url = match self.authorizer.authorize(token).await {
            Ok(url) => url,
            Err(error) => {
                self.set_state(if error.requires_reauth() {
                    FeedState::AuthRequired
                } else {
                    FeedState::Disconnected
                });
                return Err(error);
            }
        };

        match self.transport.open(&url).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.set_state(FeedState::Connected);
                info!(host = ?url.host_str(), "feed connected");
                Ok(())
            }
            Err(error) => {
                self.set_state(FeedState::Disconnected);
                Err(error)
            }
        }
    }

    /// Add `keys` to the subscription set, sending only the keys not already subscribed.
    ///
    /// While disconnected the set is updated and the keys are sent on the next
    /// [`resubscribe`](Self::resubscribe).
    pub async fn subscribe(
        &mut self,
        keys: &[InstrumentKey],
    ) -> Result<Vec<InstrumentKey>, FeedError> {
        let added = self.subscriptions.lock().insert_all(keys);
        if added.is_empty() || self.connection.is_none() {
            return Ok(added);
        }

        self.send_control(ControlMethod::Sub, added.clone()).await?;
        if self.state() == FeedState::Connected {
            self.set_state(FeedState::Subscribed);
        }
        debug!(added = added.len(), "feed subscription added");
        Ok(added)
    }

    /// Remove `keys` from the subscription set, sending only the keys that were subscribed.
    pub async fn unsubscribe(
        &mut self,
        keys: &[InstrumentKey],
    ) -> Result<Vec<InstrumentKey>, FeedError> {
        let removed = self.subscriptions.lock().remove_all(keys);
        if removed.is_empty() || self.connection.is_none() {
            return Ok(removed);
        }

        self.send_control(ControlMethod::Unsub, removed.clone()).await?;
        debug!(removed = removed.len(), "feed subscription removed");
        Ok(removed)
    }

    /// Send the full last-known subscription set in a single control message.
    pub async fn resubscribe(&mut self) -> Result<(), FeedError> {
        let keys = self.subscriptions.lock().to_vec();
        if keys.is_empty() {
            return Ok(());
        }

        let count = keys.len();
        self.send_control(ControlMethod::Sub, keys).await?;
        self.set_state(FeedState::Subscribed);
        info!(instruments = count, "feed resubscribed");
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.close_connection().await;
        self.set_state(FeedState::Disconnected);
    }

    /// Supervise the feed connection until `shutdown` fires.
    ///
    /// Any transport failure closes the socket, waits the reconnect backoff, fetches a fresh
    /// token from `tokens`, reconnects and resubscribes. On shutdown the [`FrameQueue`] is
    /// closed so the processing stage drains and exits.
    pub async fn run(mut self, tokens: Arc<dyn TokenProvider>, mut shutdown: Shutdown) {
        let mut backoff = ReconnectBackoff::new(
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
            self.config.backoff_multiplier,
        );

        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                outcome = self.establish(tokens.as_ref()) => outcome,
            };

            match outcome {
                Ok(()) => {
                    backoff.reset();
                    match self.receive(&mut shutdown).await {
                        Ok(()) => break,
                        Err(error) => warn!(%error, "feed connection lost"),
                    }
                }
                Err(error) if error.requires_reauth() => {
                    error!(%error, "feed requires a fresh access token");
                }
                Err(error) => warn!(%error, "failed to establish feed connection"),
            }

            self.close_connection().await;
            if self.state() != FeedState::AuthRequired {
                self.set_state(FeedState::Reconnecting);
            }

            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempt_number(),
                delay_ms = delay.as_millis() as u64,
                "feed reconnecting after backoff"
            );
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("feed client shutting down");
        self.disconnect().await;
        self.queue.close();
    }

    async fn establish(&mut self, tokens: &dyn TokenProvider) -> Result<(), FeedError> {
        let token = match tokens.access_token().await {
            Ok(token) => token,
            Err(error) => {
                if error.requires_reauth() {
                    self.set_state(FeedState::AuthRequired);
                }
                return Err(error);
            }
        };
        self.connect(&token).await?;
        self.resubscribe().await
    }

    /// Receive loop over the open connection.
    ///
    /// Returns `Ok(())` on shutdown, or the error that ended the connection.
    async fn receive(&mut self, shutdown: &mut Shutdown) -> Result<(), FeedError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                Some(command) = self.commands.recv() => self.handle_command(command).await?,
                message = next_message(&mut self.connection) => match message {
                    Some(Ok(message)) => self.handle_message(message)?,
                    Some(Err(error)) => return Err(error),
                    None => return Err(FeedError::ConnectionClosed),
                },
            }
        }
    }

    async fn handle_command(&mut self, command: FeedCommand) -> Result<(), FeedError> {
        match command {
            FeedCommand::Subscribe(keys) => self.subscribe(&keys).await.map(|_| ()),
            FeedCommand::Unsubscribe(keys) => self.unsubscribe(&keys).await.map(|_| ()),
            FeedCommand::Ping => match self.connection.as_mut() {
                Some(connection) => connection.ping().await,
                None => Err(FeedError::NotConnected),
            },
        }
    }

    fn handle_message(&mut self, message: WireMessage) -> Result<(), FeedError> {
        match message {
            WireMessage::Binary(payload) => {
                if self.state() != FeedState::Receiving {
                    self.set_state(FeedState::Receiving);
                }
                let event = FeedEvent::Frame {
                    payload,
                    received: Utc::now(),
                };
                if self.queue.push(event).is_some() {
                    debug!(
                        dropped = self.queue.dropped(),
                        capacity = self.queue.capacity(),
                        "frame queue full, evicted oldest frame"
                    );
                }
                Ok(())
            }
            WireMessage::Text(text) => {
                debug!(%text, "feed text message");
                Ok(())
            }
            WireMessage::Ping | WireMessage::Pong => {
                trace!("feed keep-alive");
                Ok(())
            }
            WireMessage::Close => Err(FeedError::ConnectionClosed),
        }
    }

    async fn send_control(
        &mut self,
        method: ControlMethod,
        keys: Vec<InstrumentKey>,
    ) -> Result<(), FeedError> {
        self.sequence += 1;
        let message = ControlMessage::new(
            format!("chainflow-{}", self.sequence),
            method,
            self.config.mode,
            keys,
        );
        let payload =
            serde_json::to_vec(&message).map_err(|error| FeedError::Encode(error.to_string()))?;

        match self.connection.as_mut() {
            Some(connection) => connection.send_binary(payload).await,
            None => Err(FeedError::NotConnected),
        }
    }

    async fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
    }

    fn set_state(&self, state: FeedState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "feed state transition");
        }
    }
}

async fn next_message(
    connection: &mut Option<Box<dyn FeedConnection>>,
) -> Option<Result<WireMessage, FeedError>> {
    match connection.as_mut() {
        Some(connection) => connection.next_message().await,
        None => Some(Err(FeedError::NotConnected)),
    }
}

/// Cloneable control surface of a running [`FeedClient`].
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    state: watch::Receiver<FeedState>,
}

impl FeedHandle {
    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Snapshot of the last-known subscription set.
    pub fn subscriptions(&self) -> Vec<InstrumentKey> {
        self.subscriptions.lock().to_vec()
    }

    pub fn ping(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::Ping)
    }

    fn send(&self, command: FeedCommand) -> Result<(), FeedError> {
        self.commands
            .send(command)
            .map_err(|_| FeedError::NotConnected)
    }

    /// Spawn the heartbeat task: every `interval` ping the feed and enqueue a synthetic
    /// [`FeedEvent::Heartbeat`] so consumers can tell an idle feed from a dead one.
    pub fn spawn_heartbeat(
        &self,
        queue: Arc<FrameQueue>,
        interval: Duration,
        mut shutdown: Shutdown,
    ) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        let state = handle.state();
                        if matches!(state, FeedState::Subscribed | FeedState::Receiving | FeedState::Connected)
                            && handle.ping().is_err()
                        {
                            debug!("heartbeat ping skipped, feed client stopped");
                        }
                        queue.push(FeedEvent::Heartbeat {
                            time: Utc::now(),
                            state,
                        });
                    }
                }
            }
            debug!("heartbeat task stopped");
        })
    }
}

impl SubscriptionControl for FeedHandle {
    fn subscribe(&self, keys: &[InstrumentKey]) {
        if keys.is_empty() {
            return;
        }
        if let Err(error) = self.send(FeedCommand::Subscribe(keys.to_vec())) {
            warn!(%error, keys = keys.len(), "failed to request feed subscription");
        }
    }

    fn unsubscribe(&self, keys: &[InstrumentKey]) {
        if keys.is_empty() {
            return;
        }
        if let Err(error) = self.send(FeedCommand::Unsubscribe(keys.to_vec())) {
            warn!(%error, keys = keys.len(), "failed to request feed unsubscription");
        }
    }
}
