use crate::{error::FeedError, feed::timeout::IdleTimeout};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::debug;
use url::Url;

/// Transport-agnostic message read from a feed connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
    Ping,
    Pong,
    Close,
}

/// Open, bidirectional feed connection.
///
/// `next_message` must be cancel safe since it is raced against shutdown and outbound commands.
#[async_trait]
pub trait FeedConnection: Send {
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), FeedError>;

    async fn ping(&mut self) -> Result<(), FeedError>;

    /// Next inbound message, or `None` once the connection has ended.
    async fn next_message(&mut self) -> Option<Result<WireMessage, FeedError>>;

    async fn close(&mut self);
}

/// Opens [`FeedConnection`]s to an authorized feed URL.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn FeedConnection>, FeedError>;
}

pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`FeedTransport`] over a tokio-tungstenite WebSocket, with an idle read timeout.
#[derive(Debug, Copy, Clone)]
pub struct WebSocketTransport {
    pub read_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn FeedConnection>, FeedError> {
        debug!(host = ?url.host_str(), "opening feed WebSocket");
        let (websocket, _response) = connect_async(url.as_str()).await?;
        let (sink, stream) = websocket.split();

        Ok(Box::new(WebSocketConnection {
            sink,
            stream: IdleTimeout::new(stream, self.read_timeout),
        }))
    }
}

pub struct WebSocketConnection {
    sink: SplitSink<WebSocket, Message>,
    stream: IdleTimeout<SplitStream<WebSocket>>,
}

#[async_trait]
impl FeedConnection for WebSocketConnection {
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), FeedError> {
        self.sink
            .send(Message::Binary(payload.into()))
            .await
            .map_err(FeedError::from)
    }

    async fn ping(&mut self) -> Result<(), FeedError> {
        self.sink
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(FeedError::from)
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, FeedError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(error)),
            };

            let message = match message {
                Message::Binary(payload) => WireMessage::Binary(payload),
                Message::Text(text) => WireMessage::Text(text.as_str().to_owned()),
                Message::Ping(_) => WireMessage::Ping,
                Message::Pong(_) => WireMessage::Pong,
                Message::Close(frame) => {
                    debug!(?frame, "feed WebSocket close frame received");
                    WireMessage::Close
                }
                Message::Frame(_) => continue,
            };
            return Some(Ok(message));
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.sink.close().await {
            debug!(%error, "error closing feed WebSocket");
        }
    }
}
