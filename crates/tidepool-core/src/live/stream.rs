// ── Reactive result streams ──
//
// Subscription type for consuming a live query's materialized result.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::result::LiveResult;

/// A subscription to a live query's result.
///
/// Provides both point-in-time snapshot access and change notification
/// via [`changed()`](Self::changed) or by converting into a `Stream`.
pub struct ResultStream {
    current: Arc<LiveResult>,
    receiver: watch::Receiver<Arc<LiveResult>>,
}

impl ResultStream {
    pub(crate) fn new(receiver: watch::Receiver<Arc<LiveResult>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Snapshot captured at creation (or at the last `changed()`).
    pub fn current(&self) -> &Arc<LiveResult> {
        &self.current
    }

    /// Latest snapshot, which may be newer than `current()`.
    pub fn latest(&self) -> Arc<LiveResult> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change and return the new snapshot.
    /// Returns `None` once the live query has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<LiveResult>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    /// The first item is the current snapshot.
    pub fn into_stream(self) -> ResultWatchStream {
        ResultWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
pub struct ResultWatchStream {
    inner: WatchStream<Arc<LiveResult>>,
}

impl Stream for ResultWatchStream {
    type Item = Arc<LiveResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn changed_tracks_sender() {
        let (tx, rx) = watch::channel(Arc::new(LiveResult::Count(1)));
        let mut stream = ResultStream::new(rx);
        assert_eq!(**stream.current(), LiveResult::Count(1));

        tx.send_replace(Arc::new(LiveResult::Count(2)));
        let snap = stream.changed().await.unwrap();
        assert_eq!(*snap, LiveResult::Count(2));
        assert_eq!(**stream.current(), LiveResult::Count(2));

        drop(tx);
        assert!(stream.changed().await.is_none());
    }

    #[test]
    fn changed_waits_for_a_new_value() {
        let (tx, rx) = watch::channel(Arc::new(LiveResult::Count(0)));
        let mut stream = ResultStream::new(rx);
        let mut changed = tokio_test::task::spawn(stream.changed());

        tokio_test::assert_pending!(changed.poll());
        tx.send_replace(Arc::new(LiveResult::Count(3)));
        assert!(changed.is_woken());
        let snap = tokio_test::assert_ready!(changed.poll()).unwrap();
        assert_eq!(*snap, LiveResult::Count(3));
    }

    #[tokio::test]
    async fn stream_yields_current_then_updates() {
        let (tx, rx) = watch::channel(Arc::new(LiveResult::Count(0)));
        let mut stream = ResultStream::new(rx).into_stream();

        assert_eq!(*stream.next().await.unwrap(), LiveResult::Count(0));
        tx.send_replace(Arc::new(LiveResult::Count(5)));
        assert_eq!(*stream.next().await.unwrap(), LiveResult::Count(5));
    }
}
