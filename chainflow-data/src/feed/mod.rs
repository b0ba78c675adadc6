pub use client::{FeedClient, FeedCommand, FeedHandle, FeedState};
pub use queue::{FeedEvent, FrameQueue};

/// Bearer token and feed URL authorization collaborators.
pub mod auth;

/// Reconnect backoff policy.
pub mod backoff;

/// [`FeedClient`] connection supervisor and its [`FeedHandle`].
pub mod client;

/// Bounded drop-oldest [`FrameQueue`] between the feed and the processing stage.
pub mod queue;

/// Subscription control messages and the last-known subscription set.
pub mod subscription;

/// Idle read timeout of the feed socket.
pub mod timeout;

/// [`FeedTransport`](transport::FeedTransport) abstraction and its WebSocket implementation.
pub mod transport;
