//! Emission engine: the server half of a stream.
//!
//! Drives a push-based [`Publisher`] under pull discipline. Producer
//! notifications and demand signals arrive on arbitrary tasks; all of them
//! only touch a short state lock and then schedule a drain pass. Drain passes
//! are serialized through a work-in-progress counter: whoever moves it off
//! zero spawns the drain task, everyone else just bumps it and leaves, and
//! the running task loops until it has accounted for every bump. Only the
//! drain task writes to the sink, so frames are never interleaved.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::error::{Result, StreamError};
use crate::hooks;
use crate::streaming::channel::{
    BoxPublisher, Notification, Signal, StreamId, Subscriber, Subscription,
};
use crate::streaming::protocol::{encode_stream_id, Frame};
use crate::streaming::sink::{BoxSink, FlushStrategy};

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Producer or transport failure, with the error text
    Failed(String),
    Cancelled,
}

/// Invoked exactly once when the stream reaches its terminal state
pub type CompletionFn = Box<dyn FnOnce(Outcome) + Send + 'static>;

#[derive(Default)]
struct State {
    requested: u64,
    emitted: u64,
    received: u64,
    queue: VecDeque<Bytes>,
    finished: bool,
    error: Option<StreamError>,
    header_written: bool,
    terminated: bool,
    upstream: Option<Arc<dyn Subscription>>,
    /// Demand that arrived before the producer subscribed
    unforwarded: u64,
}

/// Sink plus flush policy; owned by whichever drain pass is running
struct Output {
    sink: BoxSink,
    flush: Box<dyn FlushStrategy>,
}

pub struct EmissionEngine {
    id: StreamId,
    me: Weak<EmissionEngine>,
    state: Mutex<State>,
    wip: AtomicUsize,
    cancelled: AtomicBool,
    output: tokio::sync::Mutex<Option<Output>>,
    on_done: Mutex<Option<CompletionFn>>,
    handle: Handle,
}

impl EmissionEngine {
    /// Create an engine writing to `sink`. Must be called inside a tokio
    /// runtime; drain passes run on that runtime.
    pub fn new(
        id: StreamId,
        sink: BoxSink,
        flush: Box<dyn FlushStrategy>,
        on_done: CompletionFn,
    ) -> Result<Arc<Self>> {
        let handle = Handle::try_current().map_err(|_| {
            StreamError::Config("emission engine requires a tokio runtime".to_string())
        })?;
        Ok(Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            state: Mutex::new(State::default()),
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            output: tokio::sync::Mutex::new(Some(Output { sink, flush })),
            on_done: Mutex::new(Some(on_done)),
            handle,
        }))
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Write the stream id, apply the initial demand and subscribe to the
    /// producer. Call once.
    pub fn start(&self, publisher: BoxPublisher, initial_demand: u64) {
        tracing::debug!(stream = %self.id, initial_demand, "stream opened");
        if initial_demand > 0 {
            let mut st = self.lock();
            st.requested = initial_demand;
            st.unforwarded = initial_demand;
        }
        // first pass writes the header even with zero demand
        self.drain();

        let Some(me) = self.me.upgrade() else { return };
        publisher.subscribe(me);
    }

    /// Route a side-channel signal.
    pub fn signal(&self, signal: Signal) {
        match signal {
            Signal::Request(n) => self.on_demand(n),
            Signal::Cancel => self.on_cancel(),
        }
    }

    /// Permit `n` more items.
    pub fn on_demand(&self, n: u64) {
        if n == 0 {
            return;
        }
        let forward = {
            let mut st = self.lock();
            if st.terminated {
                return;
            }
            st.requested = st.requested.saturating_add(n);
            match &st.upstream {
                Some(up) => Some(up.clone()),
                None => {
                    st.unforwarded = st.unforwarded.saturating_add(n);
                    None
                }
            }
        };
        tracing::trace!(stream = %self.id, n, "demand");
        if let Some(up) = forward {
            up.request(n);
        }
        self.drain();
    }

    /// Stop the stream. Idempotent.
    pub fn on_cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(stream = %self.id, "cancel requested");
        }
        self.drain();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // state stays consistent across a panicking holder: every update is a
        // plain field assignment
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Drain
    // =========================================================================

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        self.handle.spawn(async move { me.drain_loop().await });
    }

    async fn drain_loop(self: Arc<Self>) {
        let mut output = self.output.lock().await;
        let mut missed = 1;
        loop {
            self.pass(&mut output).await;

            let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = prev - missed;
            if missed == 0 {
                break;
            }
        }
    }

    async fn pass(&self, output: &mut Option<Output>) {
        if self.lock().terminated {
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            return self.terminate_cancelled(output).await;
        }
        let Some(out) = output.as_mut() else { return };

        let header_written = self.lock().header_written;
        if !header_written {
            let written = async {
                out.sink.write(&encode_stream_id(self.id)).await?;
                out.sink.flush().await
            }
            .await;
            if let Err(e) = written {
                return self.fail(output, e).await;
            }
            self.lock().header_written = true;
        }

        loop {
            let next = {
                let mut st = self.lock();
                if self.cancelled.load(Ordering::Acquire) || st.emitted >= st.requested {
                    None
                } else {
                    let item = st.queue.pop_front();
                    if item.is_some() {
                        st.emitted += 1;
                    }
                    item
                }
            };
            let Some(item) = next else { break };

            let len = item.len();
            let written = async {
                out.sink.write(&Frame::Item(item).encode()?).await?;
                if out.flush.after_item(len) {
                    out.sink.flush().await?;
                }
                Ok::<_, StreamError>(())
            }
            .await;
            if let Err(e) = written {
                return self.fail(output, e).await;
            }
        }

        if self.cancelled.load(Ordering::Acquire) {
            return self.terminate_cancelled(output).await;
        }

        let terminal = {
            let mut st = self.lock();
            if st.finished && st.queue.is_empty() {
                st.terminated = true;
                st.upstream = None;
                Some(st.error.take())
            } else {
                None
            }
        };
        match terminal {
            Some(None) => self.terminate_completed(output).await,
            Some(Some(err)) => self.terminate_failed(output, err).await,
            None => {}
        }
    }

    async fn terminate_completed(&self, output: &mut Option<Output>) {
        let outcome = match self.write_terminal(output, &Frame::Complete).await {
            Ok(()) => Outcome::Completed,
            Err(e) => {
                let text = e.to_string();
                hooks::report(e);
                Outcome::Failed(text)
            }
        };
        self.close(output).await;
        self.finish(outcome);
    }

    async fn terminate_failed(&self, output: &mut Option<Output>, err: StreamError) {
        let Some(text) = render_error(&err) else {
            hooks::report(err);
            self.close(output).await;
            return self.finish(Outcome::Failed("unrenderable producer error".to_string()));
        };
        tracing::debug!(stream = %self.id, error = %text, "stream failed");
        if let Err(e) = self.write_terminal(output, &Frame::error(text.clone())).await {
            hooks::report(e);
        }
        self.close(output).await;
        self.finish(Outcome::Failed(text));
    }

    async fn terminate_cancelled(&self, output: &mut Option<Output>) {
        let upstream = {
            let mut st = self.lock();
            if st.terminated {
                return;
            }
            st.terminated = true;
            st.queue.clear();
            st.upstream.take()
        };
        if let Some(up) = upstream {
            up.cancel();
        }
        self.close(output).await;
        self.finish(Outcome::Cancelled);
    }

    /// A write to the sink failed; the stream cannot continue.
    async fn fail(&self, output: &mut Option<Output>, err: StreamError) {
        let upstream = {
            let mut st = self.lock();
            st.terminated = true;
            st.queue.clear();
            st.upstream.take()
        };
        if let Some(up) = upstream {
            up.cancel();
        }
        let text = render_error(&err).unwrap_or_else(|| "stream write failed".to_string());
        tracing::debug!(stream = %self.id, error = %text, "write failed");

        if !self.cancelled.load(Ordering::Acquire) {
            if let Err(e) = self.write_terminal(output, &Frame::error(text.clone())).await {
                hooks::report(e);
            }
        }
        self.close(output).await;
        self.finish(Outcome::Failed(text));
    }

    async fn write_terminal(&self, output: &mut Option<Output>, frame: &Frame) -> Result<()> {
        let out = output.as_mut().ok_or(StreamError::Closed)?;
        out.sink.write(&frame.encode()?).await?;
        out.sink.flush().await
    }

    async fn close(&self, output: &mut Option<Output>) {
        if let Some(mut out) = output.take() {
            if let Err(e) = out.sink.close().await {
                tracing::trace!(stream = %self.id, error = %e, "sink close failed");
            }
        }
    }

    fn finish(&self, outcome: Outcome) {
        tracing::debug!(stream = %self.id, ?outcome, "stream terminated");
        let on_done = self
            .on_done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(on_done) = on_done {
            on_done(outcome);
        }
    }
}

/// Error text carried by an error frame. `None` if the error's `Display`
/// implementation fails.
fn render_error(err: &StreamError) -> Option<String> {
    let mut text = String::new();
    let rendered = match err {
        StreamError::Producer(e) => write!(text, "{:#}", e),
        other => write!(text, "{}", other),
    };
    rendered.ok().map(|_| text)
}

// =============================================================================
// Producer side
// =============================================================================

impl Subscriber for EmissionEngine {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let pending = {
            let mut st = self.lock();
            if st.terminated || st.upstream.is_some() || self.cancelled.load(Ordering::Acquire) {
                None
            } else {
                st.upstream = Some(subscription.clone());
                Some(std::mem::take(&mut st.unforwarded))
            }
        };
        match pending {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    fn on_notification(&self, notification: Notification) {
        let mut overflow = None;
        {
            let mut st = self.lock();
            if st.finished || st.terminated {
                tracing::trace!(stream = %self.id, "notification after terminal state ignored");
                return;
            }
            match notification {
                Notification::Next(item) => {
                    st.received += 1;
                    if st.received > st.requested {
                        tracing::warn!(
                            stream = %self.id,
                            received = st.received,
                            requested = st.requested,
                            "producer emitted more items than requested"
                        );
                        st.finished = true;
                        st.error = Some(StreamError::protocol(format!(
                            "producer emitted {} items but only {} were requested",
                            st.received, st.requested
                        )));
                        overflow = st.upstream.take();
                    } else {
                        st.queue.push_back(item);
                    }
                }
                Notification::Complete => st.finished = true,
                Notification::Error(err) => {
                    st.finished = true;
                    st.error = Some(err);
                }
            }
        }
        if let Some(up) = overflow {
            up.cancel();
        }
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::generator::{failed, from_iter, from_stream};
    use crate::streaming::protocol::{read_frame, read_stream_id};
    use crate::streaming::sink::{FlushPolicy, IoSink};
    use crate::streaming::channel::Publisher;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    fn start(
        publisher: BoxPublisher,
        initial: u64,
    ) -> (Arc<EmissionEngine>, DuplexStream, oneshot::Receiver<Outcome>) {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = oneshot::channel();
        let engine = EmissionEngine::new(
            StreamId::random(),
            Box::new(IoSink::new(writer)),
            Box::new(FlushPolicy::always()),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .unwrap();
        engine.start(publisher, initial);
        (engine, reader, rx)
    }

    fn endless() -> BoxPublisher {
        from_stream(futures::stream::repeat(Ok::<_, std::convert::Infallible>(
            Bytes::from_static(b"tick"),
        )))
    }

    async fn no_frame_within(reader: &mut DuplexStream, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), read_frame(reader))
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_items_then_completion_in_order() {
        let (engine, mut reader, done) = start(from_iter(vec![vec![], vec![1u8, 2, 3]]), 10);

        assert_eq!(read_stream_id(&mut reader).await.unwrap(), engine.id());
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(Bytes::new()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(vec![1u8, 2, 3]));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Complete);
        assert_eq!(done.await.unwrap(), Outcome::Completed);
        assert!(engine.is_terminated());
    }

    #[tokio::test]
    async fn test_exact_demand_completes() {
        let (engine, mut reader, done) = start(from_iter(vec![vec![1u8], vec![2]]), 2);

        read_stream_id(&mut reader).await.unwrap();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(vec![1u8]));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(vec![2u8]));
        let last = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut reader)).await;
        assert_eq!(last.unwrap().unwrap(), Frame::Complete);
        assert_eq!(done.await.unwrap(), Outcome::Completed);
        assert!(engine.is_terminated());
    }

    #[tokio::test]
    async fn test_header_written_without_demand() {
        let (engine, mut reader, _done) = start(endless(), 0);
        assert_eq!(read_stream_id(&mut reader).await.unwrap(), engine.id());
        assert!(no_frame_within(&mut reader, 50).await);
    }

    #[tokio::test]
    async fn test_backpressure_limits_emission() {
        let (engine, mut reader, _done) = start(endless(), 0);
        read_stream_id(&mut reader).await.unwrap();

        engine.on_demand(2);
        for _ in 0..2 {
            assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(&b"tick"[..]));
        }
        assert!(no_frame_within(&mut reader, 100).await);

        engine.on_demand(3);
        for _ in 0..3 {
            assert!(matches!(read_frame(&mut reader).await.unwrap(), Frame::Item(_)));
        }
        assert!(no_frame_within(&mut reader, 100).await);
    }

    #[tokio::test]
    async fn test_producer_error_becomes_error_frame() {
        let items = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(anyhow::anyhow!("boo")),
        ]);
        let (_engine, mut reader, done) = start(from_stream(items), 5);

        read_stream_id(&mut reader).await.unwrap();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(&b"a"[..]));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::error("boo"));
        assert_eq!(done.await.unwrap(), Outcome::Failed("boo".to_string()));
    }

    #[tokio::test]
    async fn test_failed_source_still_writes_header() {
        let (engine, mut reader, done) = start(failed(anyhow::anyhow!("no source")), 0);
        assert_eq!(read_stream_id(&mut reader).await.unwrap(), engine.id());
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::error("no source"));
        assert!(matches!(done.await.unwrap(), Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let (engine, mut reader, done) = start(endless(), 1);
        read_stream_id(&mut reader).await.unwrap();
        assert!(matches!(read_frame(&mut reader).await.unwrap(), Frame::Item(_)));

        engine.on_cancel();
        engine.on_cancel();
        engine.on_demand(10);
        assert_eq!(done.await.unwrap(), Outcome::Cancelled);

        // sink was closed without a terminal frame
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(StreamError::Protocol(_))
        ));
    }

    /// Emits everything at once, ignoring demand
    struct Flood(usize);

    impl Publisher for Flood {
        fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber>) {
            struct Ignore;
            impl Subscription for Ignore {
                fn request(&self, _n: u64) {}
                fn cancel(&self) {}
            }
            subscriber.on_subscribe(Arc::new(Ignore));
            for i in 0..self.0 {
                subscriber.on_next(Bytes::from(vec![i as u8]));
            }
            subscriber.on_complete();
        }
    }

    #[tokio::test]
    async fn test_over_emission_is_protocol_error() {
        let (_engine, mut reader, done) = start(Box::new(Flood(3)), 1);
        read_stream_id(&mut reader).await.unwrap();

        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(vec![0u8]));
        match read_frame(&mut reader).await.unwrap() {
            Frame::Error(text) => assert!(text.contains("more") || text.contains("requested")),
            other => panic!("expected error frame, got {:?}", other),
        }
        assert!(matches!(done.await.unwrap(), Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_write_failure_terminates_once() {
        let (engine, reader, done) = start(endless(), 0);
        drop(reader);
        engine.on_demand(5);
        assert!(matches!(done.await.unwrap(), Outcome::Failed(_)));
        assert!(engine.is_terminated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_completion_has_single_outcome() {
        for _ in 0..200 {
            let calls = Arc::new(AtomicUsize::new(0));
            let c = calls.clone();
            let (writer, mut reader) = tokio::io::duplex(1024);
            let engine = EmissionEngine::new(
                StreamId::random(),
                Box::new(IoSink::new(writer)),
                Box::new(FlushPolicy::always()),
                Box::new(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
            engine.start(from_iter(vec![vec![1u8]]), 0);

            let a = engine.clone();
            let b = engine.clone();
            let t1 = tokio::spawn(async move { a.on_demand(1) });
            let t2 = tokio::spawn(async move { b.on_cancel() });
            t1.await.unwrap();
            t2.await.unwrap();

            // drain until the sink closes
            let mut rest = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
                .await
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), async {
                while !engine.is_terminated() || calls.load(Ordering::SeqCst) == 0 {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
