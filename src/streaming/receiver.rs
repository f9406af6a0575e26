//! Decoding engine: the client half of a stream.
//!
//! Reads the stream id and frames from the response body and delivers items
//! to a [`Subscriber`], never more than it has requested. Demand is forwarded
//! to the server through a [`Requester`]; the server only writes what was
//! signalled, and whatever it has written beyond local demand stays unread in
//! the input until more is requested.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::hooks;
use crate::streaming::channel::{DemandSignal, Publisher, StreamId, Subscriber, Subscription};
use crate::streaming::protocol::{read_frame_with_limit, read_stream_id, Frame};
use crate::transport::demand::Requester;

/// Publisher over a framed input.
pub struct Decoder<R> {
    input: R,
    requester: Arc<dyn Requester>,
    prefetched: u64,
    max_frame_size: Option<usize>,
}

impl<R> Decoder<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(input: R, requester: Arc<dyn Requester>) -> Self {
        Self {
            input,
            requester,
            prefetched: 0,
            max_frame_size: None,
        }
    }

    /// Demand the server was already granted when the stream was opened.
    ///
    /// The first `n` requested items are covered by that grant and are not
    /// signalled again.
    pub fn prefetched(mut self, n: u64) -> Self {
        self.prefetched = n;
        self
    }

    /// Fail the stream on any frame whose payload exceeds `limit` bytes.
    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = Some(limit);
        self
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Routing {
    id: Option<StreamId>,
    /// Demand requested before the id was known
    pending: u64,
    /// Remaining prefetched grant
    credit: u64,
}

struct Shared {
    routing: Mutex<Routing>,
    demand: AtomicU64,
    ready: Notify,
    cancelled: AtomicBool,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<DemandSignal>,
}

impl Shared {
    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.routing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, signal: DemandSignal) {
        // the signalling task outlives every sender; a send can only fail
        // once the runtime is shutting down
        if self.signals.send(signal).is_err() {
            tracing::trace!(stream = %signal.id, "signal dropped, signalling task gone");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn try_take(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }

    /// Wait until one item may be read. `false` once cancelled.
    async fn acquire(&self) -> bool {
        loop {
            if self.is_cancelled() {
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

/// Subscription handed to the decoder's subscriber.
pub struct DecoderSubscription {
    shared: Arc<Shared>,
}

impl DecoderSubscription {
    /// The stream id, once it has been read
    pub fn id(&self) -> Option<StreamId> {
        self.shared.routing().id
    }
}

impl Subscription for DecoderSubscription {
    fn request(&self, n: u64) {
        let shared = &self.shared;
        if n == 0 || shared.is_cancelled() {
            return;
        }
        let _ = shared
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(n))
            });
        {
            let mut routing = shared.routing();
            let covered = n.min(routing.credit);
            routing.credit -= covered;
            let rest = n - covered;
            if rest > 0 {
                match routing.id {
                    Some(id) => shared.send(DemandSignal::request(id, rest)),
                    None => routing.pending = routing.pending.saturating_add(rest),
                }
            }
        }
        shared.ready.notify_one();
    }

    fn cancel(&self) {
        let shared = &self.shared;
        if shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.cancel.cancel();
        // without an id the reader sends the cancel right after reading it
        let routing = shared.routing();
        if let Some(id) = routing.id {
            shared.send(DemandSignal::cancel(id));
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

impl<R> Publisher for Decoder<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            routing: Mutex::new(Routing {
                id: None,
                pending: 0,
                credit: self.prefetched,
            }),
            demand: AtomicU64::new(0),
            ready: Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            signals: tx,
        });

        tokio::spawn(signal_loop(rx, self.requester));
        subscriber.on_subscribe(Arc::new(DecoderSubscription {
            shared: shared.clone(),
        }));
        tokio::spawn(read_loop(self.input, self.max_frame_size, shared, subscriber));
    }
}

/// Sends one stream's signals in order.
async fn signal_loop(
    mut rx: mpsc::UnboundedReceiver<DemandSignal>,
    requester: Arc<dyn Requester>,
) {
    while let Some(signal) = rx.recv().await {
        if let Err(e) = requester.send(signal).await {
            hooks::report(e);
        }
    }
}

async fn read_loop<R>(
    mut input: R,
    limit: Option<usize>,
    shared: Arc<Shared>,
    subscriber: Arc<dyn Subscriber>,
) where
    R: AsyncRead + Unpin + Send,
{
    let id = match read_stream_id(&mut input).await {
        Ok(id) => id,
        Err(e) => {
            if !shared.is_cancelled() {
                subscriber.on_error(e);
            }
            return;
        }
    };
    tracing::debug!(stream = %id, "stream id received");

    {
        let mut routing = shared.routing();
        routing.id = Some(id);
        if shared.is_cancelled() {
            shared.send(DemandSignal::cancel(id));
            return;
        }
        let pending = mem::take(&mut routing.pending);
        if pending > 0 {
            shared.send(DemandSignal::request(id, pending));
        }
    }

    while shared.acquire().await {
        let frame = tokio::select! {
            frame = read_frame_with_limit(&mut input, limit) => frame,
            _ = shared.cancel.cancelled() => break,
        };
        if shared.is_cancelled() {
            break;
        }
        match frame {
            Ok(Frame::Item(item)) => subscriber.on_next(item),
            Ok(Frame::Complete) => {
                tracing::debug!(stream = %id, "stream completed");
                subscriber.on_complete();
                return;
            }
            Ok(Frame::Error(text)) => {
                tracing::debug!(stream = %id, error = %text, "remote stream failed");
                subscriber.on_error(StreamError::Remote(text));
                return;
            }
            Err(e) => {
                subscriber.on_error(e);
                return;
            }
        }
    }
    tracing::debug!(stream = %id, "stream cancelled");
}
