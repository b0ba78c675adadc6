use crate::feed::FeedState;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::sync::Notify;

/// Default [`FrameQueue`] capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2_000;

/// Item handed from the feed client to the frame processing stage.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Raw binary frame as received from the feed.
    Frame {
        payload: Bytes,
        received: DateTime<Utc>,
    },
    /// Synthetic liveness marker, emitted even when the feed is idle.
    Heartbeat {
        time: DateTime<Utc>,
        state: FeedState,
    },
}

/// Bounded multi-producer queue with drop-oldest overflow.
///
/// Pushing into a full queue evicts the head so the freshest frames always get processed.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    items: Mutex<VecDeque<FeedEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an event, returning the evicted head if the queue was at capacity.
    pub fn push(&self, event: FeedEvent) -> Option<FeedEvent> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(event);
            evicted
        };

        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<FeedEvent> {
        self.items.lock().pop_front()
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<FeedEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue, waking any waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events evicted by overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    fn frame(byte: u8) -> FeedEvent {
        FeedEvent::Frame {
            payload: Bytes::from(vec![byte]),
            received: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[test]
    fn test_push_at_capacity_evicts_oldest() {
        let queue = FrameQueue::new(3);
        for byte in 0..3 {
            assert_eq!(queue.push(frame(byte)), None);
        }
        assert_eq!(queue.len(), 3);

        let evicted = queue.push(frame(3));
        assert_eq!(evicted, Some(frame(0)));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);

        let drained = std::iter::from_fn(|| queue.try_pop()).collect::<Vec<_>>();
        assert_eq!(drained, vec![frame(1), frame(2), frame(3)]);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(frame(7));

        let actual = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(actual, Some(frame(7)));
    }

    #[tokio::test]
    async fn test_pop_returns_none_when_closed_and_drained() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.close();

        assert_eq!(queue.pop().await, Some(frame(1)));
        assert_eq!(queue.pop().await, None);
    }
}
