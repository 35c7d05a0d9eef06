//! Live fan-out of a running session's display lines.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::session::{SessionId, SessionStatus};

/// Lines buffered per subscriber before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 256;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMessage {
    Line(String),
    /// The session ended. Always the last message.
    Closed(SessionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("session output hub is closed")]
    Closed,

    #[error("too many subscribers (max {max})")]
    TooManySubscribers { max: u64 },
}

/// Broadcasts one session's display lines to any number of viewers.
///
/// Subscribers are unlimited unless a cap is given. Publishing never waits on a subscriber: each has a ring buffer and a
/// lagging one loses its oldest lines. A hub is closed exactly once and
/// cannot be subscribed to afterwards.
pub struct Hub {
    session_id: SessionId,
    tx: broadcast::Sender<HubMessage>,
    closed: AtomicBool,
    subscriber_count: Arc<AtomicU64>,
    max_subscribers: Option<u64>,
    dropped: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(session_id: SessionId, capacity: usize, max_subscribers: Option<u64>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id,
            tx,
            closed: AtomicBool::new(false),
            subscriber_count: Arc::new(AtomicU64::new(0)),
            max_subscribers,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Deliver a line to current subscribers. Returns how many received it.
    pub fn publish(&self, line: impl Into<String>) -> usize {
        if self.is_closed() {
            return 0;
        }
        // No receivers is fine
        self.tx.send(HubMessage::Line(line.into())).unwrap_or(0)
    }

    /// Signal end of session. Only the first call has an effect.
    pub fn close(&self, status: SessionStatus) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(HubMessage::Closed(status));
        tracing::debug!(
            session_id = %self.session_id,
            status = %status,
            dropped = self.dropped_lines(),
            "Hub closed"
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Lines lost to lagging subscribers, summed over all of them.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe to lines published from now on.
    pub fn subscribe(&self) -> Result<HubSubscription, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        // Atomically increment only if below the limit, when there is one.
        let counter = Arc::clone(&self.subscriber_count);
        match self.max_subscribers {
            Some(max) => {
                counter
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        (current < max).then_some(current + 1)
                    })
                    .map_err(|_| HubError::TooManySubscribers { max })?;
            }
            None => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        let rx = self.tx.subscribe();
        let subscription = HubSubscription {
            inner: BroadcastStream::new(rx),
            counter,
            dropped: Arc::clone(&self.dropped),
            session_id: self.session_id,
            done: false,
        };

        // A close that raced us may have sent its terminal message before we
        // subscribed.
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        Ok(subscription)
    }
}

/// A viewer's stream of [`HubMessage`]s. Ends right after `Closed`.
pub struct HubSubscription {
    inner: BroadcastStream<HubMessage>,
    counter: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    session_id: SessionId,
    done: bool,
}

impl Stream for HubSubscription {
    type Item = HubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => {
                    if matches!(message, HubMessage::Closed(_)) {
                        self.done = true;
                    }
                    return Poll::Ready(Some(message));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %self.session_id,
                        skipped = n,
                        "Slow subscriber lost lines"
                    );
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for HubSubscription {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use uuid::Uuid;

    use super::*;

    fn hub() -> Hub {
        Hub::new(Uuid::new_v4(), DEFAULT_CAPACITY, None)
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = hub();
        assert_eq!(hub.publish("nobody listening"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_get_lines_then_closed() {
        let hub = hub();
        let mut a = hub.subscribe().unwrap();
        let mut b = hub.subscribe().unwrap();
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.publish("one"), 2);
        hub.publish("two");
        assert!(hub.close(SessionStatus::Succeeded));

        let got: Vec<HubMessage> = (&mut a).collect().await;
        assert_eq!(
            got,
            vec![
                HubMessage::Line("one".into()),
                HubMessage::Line("two".into()),
                HubMessage::Closed(SessionStatus::Succeeded),
            ]
        );
        assert_eq!(b.next().await, Some(HubMessage::Line("one".into())));
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let hub = hub();
        hub.close(SessionStatus::Killed);
        assert!(matches!(hub.subscribe(), Err(HubError::Closed)));
        assert!(!hub.close(SessionStatus::Failed), "second close is a no-op");
        assert_eq!(hub.publish("late"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_unbounded_by_default() {
        let hub = hub();
        let mut viewers: Vec<HubSubscription> =
            (0..500).map(|_| hub.subscribe().unwrap()).collect();
        assert_eq!(hub.subscriber_count(), 500);

        assert_eq!(hub.publish("fan out"), 500);
        hub.close(SessionStatus::Succeeded);
        for viewer in viewers.iter_mut().step_by(97) {
            assert_eq!(viewer.next().await, Some(HubMessage::Line("fan out".into())));
        }
        drop(viewers);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_limit_and_release() {
        let hub = Hub::new(Uuid::new_v4(), 8, Some(1));
        let first = hub.subscribe().unwrap();
        assert!(matches!(
            hub.subscribe(),
            Err(HubError::TooManySubscribers { max: 1 })
        ));
        drop(first);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest_without_blocking() {
        let hub = Hub::new(Uuid::new_v4(), 4, None);
        let mut slow = hub.subscribe().unwrap();
        for i in 0..10 {
            hub.publish(format!("line {}", i));
        }
        hub.close(SessionStatus::Succeeded);

        let got: Vec<HubMessage> = (&mut slow).collect().await;
        assert_eq!(got.last(), Some(&HubMessage::Closed(SessionStatus::Succeeded)));
        assert!(got.len() < 11);
        assert!(hub.dropped_lines() > 0);
        // What survived is the newest tail, in order.
        assert_eq!(got[got.len() - 2], HubMessage::Line("line 9".into()));
    }
}
