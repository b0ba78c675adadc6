//! Idle read timeout for the feed socket.
//!
//! A feed socket can die without the peer ever sending a close frame. The read half of every
//! feed connection is wrapped in an [`IdleTimeout`], which fails the stream with
//! [`FeedError::ReadTimeout`] after a period of silence so the feed client reconnects.

use crate::error::FeedError;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::warn;

/// Feed read stream that fails once nothing has been received for `idle`.
///
/// The deadline lives with the stream rather than with each read, so outbound traffic that
/// interrupts a pending read (eg/ heartbeat pings) never extends it. Only inbound messages do.
/// Inner errors are converted into [`FeedError`]s. After a timeout the stream is finished.
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            expired: false,
        }
    }
}

impl<S, T, E> Stream for IdleTimeout<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: Into<FeedError>,
{
    type Item = Result<T, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.expired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let next_deadline = Instant::now() + self.idle;
                self.deadline.as_mut().reset(next_deadline);
                Poll::Ready(Some(item.map_err(Into::into)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.expired = true;
                    let idle_secs = self.idle.as_secs();
                    warn!(idle_secs, "no feed data received within the read timeout");
                    Poll::Ready(Some(Err(FeedError::ReadTimeout { idle_secs })))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
