//! Pull adapter.
//!
//! [`ItemStream`] turns any [`Publisher`] into a `futures::Stream`, requesting
//! items in batches: one batch up front on the first poll, the next once the
//! previous batch has been consumed. Dropping the stream before it ends
//! cancels the publisher.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Result, StreamError};
use crate::streaming::channel::{BoxPublisher, Notification, Subscriber, Subscription};

/// Subscriber that forwards notifications into a channel
struct Forwarder {
    tx: mpsc::UnboundedSender<Notification>,
    subscription: OnceLock<Arc<dyn Subscription>>,
}

impl Subscriber for Forwarder {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if let Err(extra) = self.subscription.set(subscription) {
            extra.cancel();
        }
    }

    fn on_notification(&self, notification: Notification) {
        // receiver gone means the stream was dropped and already cancelled
        let _ = self.tx.send(notification);
    }
}

pub struct ItemStream {
    rx: mpsc::UnboundedReceiver<Notification>,
    subscription: Arc<dyn Subscription>,
    batch: u64,
    /// Requested but not yet received
    outstanding: u64,
    done: bool,
}

impl ItemStream {
    /// Subscribe to `publisher`. The publisher must hand over its
    /// subscription synchronously inside `subscribe`.
    pub fn new(publisher: BoxPublisher, batch: u64) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = Arc::new(Forwarder {
            tx,
            subscription: OnceLock::new(),
        });
        publisher.subscribe(forwarder.clone());

        let subscription = forwarder
            .subscription
            .get()
            .cloned()
            .ok_or_else(|| StreamError::protocol("publisher did not provide a subscription"))?;

        Ok(Self {
            rx,
            subscription,
            batch: batch.max(1),
            outstanding: 0,
            done: false,
        })
    }

    /// Demand handle for callers that want to request items themselves.
    ///
    /// Items requested here are delivered through this stream like any other.
    pub fn subscription(&self) -> Arc<dyn Subscription> {
        self.subscription.clone()
    }

    /// Stop the stream early. Also happens on drop.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.subscription.cancel();
        }
    }

    /// Collect every remaining item.
    pub async fn collect_all(mut self) -> Result<Vec<Bytes>> {
        let mut items = Vec::new();
        while let Some(item) = futures::StreamExt::next(&mut self).await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Stream for ItemStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.outstanding == 0 {
            self.outstanding = self.batch;
            self.subscription.request(self.batch);
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Notification::Next(item))) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Notification::Complete)) => {
                self.done = true;
                Poll::Ready(None)
            }
            // publisher dropped its subscriber without a terminal signal
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(StreamError::Closed)))
            }
            Poll::Ready(Some(Notification::Error(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl Drop for ItemStream {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!("item stream dropped before termination, cancelling");
            self.cancel();
        }
    }
}
