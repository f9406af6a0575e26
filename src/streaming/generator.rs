//! Item sources.
//!
//! Adapters that turn ordinary async streams and iterators into
//! [`Publisher`]s. The wrapped stream is polled at most one item ahead of the
//! subscriber's demand, so a slow consumer stalls the source rather than
//! letting items pile up. Holding that one item back is what lets the end of
//! a finite source be signalled right after its last item, with no further
//! demand needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::streaming::channel::{BoxPublisher, Publisher, Subscriber, Subscription};

/// Adapt a fallible byte stream.
///
/// Subscribing spawns a task on the current tokio runtime. Each item is held
/// until there is demand for it; completion and errors are delivered as soon
/// as the stream yields them. A stream error ends the subscription with
/// [`StreamError::Producer`].
pub fn from_stream<S, E>(stream: S) -> BoxPublisher
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    Box::new(StreamPublisher { stream })
}

/// Adapt a finite in-memory source.
pub fn from_iter<I>(items: I) -> BoxPublisher
where
    I: IntoIterator,
    I::Item: Into<Bytes>,
    I::IntoIter: Send + 'static,
{
    let stream = futures::stream::iter(
        items
            .into_iter()
            .map(|item| Ok::<Bytes, std::convert::Infallible>(item.into())),
    );
    from_stream(stream)
}

/// A publisher that fails as soon as it is subscribed.
pub fn failed(err: impl Into<anyhow::Error>) -> BoxPublisher {
    Box::new(FailedPublisher { err: err.into() })
}

// =============================================================================
// Stream adapter
// =============================================================================

struct StreamPublisher<S> {
    stream: S,
}

/// Demand shared between the subscriber and the polling task
struct Demand {
    outstanding: AtomicU64,
    ready: Notify,
    cancel: CancellationToken,
}

impl Demand {
    fn try_take(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }

    /// Wait for one unit of demand. Returns `false` once cancelled.
    async fn acquire(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.try_take() {
                return true;
            }
            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

impl Subscription for Demand {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(n))
            });
        self.ready.notify_one();
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<S, E> Publisher for StreamPublisher<S>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber>) {
        let demand = Arc::new(Demand {
            outstanding: AtomicU64::new(0),
            ready: Notify::new(),
            cancel: CancellationToken::new(),
        });
        subscriber.on_subscribe(demand.clone());

        let stream = self.stream;
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = demand.cancel.cancelled() => break,
                };
                match next {
                    Some(Ok(item)) => {
                        if !demand.acquire().await {
                            break;
                        }
                        subscriber.on_next(item);
                    }
                    Some(Err(e)) => {
                        subscriber.on_error(StreamError::Producer(e.into()));
                        return;
                    }
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
            tracing::trace!("item source cancelled");
        });
    }
}

// =============================================================================
// Failed source
// =============================================================================

struct FailedPublisher {
    err: anyhow::Error,
}

struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

impl Publisher for FailedPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber>) {
        subscriber.on_subscribe(Arc::new(NoopSubscription));
        subscriber.on_error(StreamError::Producer(self.err));
    }
}
