//! Stream registry.
//!
//! Maps stream ids to their emission engines so that demand signals, which
//! arrive on unrelated HTTP requests, reach the right stream. An entry lives
//! from open until the stream's terminal event.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Result, StreamError};
use crate::streaming::channel::{BoxPublisher, Signal, StreamId};
use crate::streaming::sender::{CompletionFn, EmissionEngine, Outcome};
use crate::streaming::sink::{BoxSink, FlushPolicy};

#[derive(Default)]
struct Inner {
    streams: DashMap<StreamId, Arc<EmissionEngine>>,
    flush: FlushPolicy,
}

/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(flush: FlushPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: DashMap::new(),
                flush,
            }),
        }
    }

    /// Open a stream in detached mode.
    ///
    /// Returns as soon as the engine is started; the engine's own tasks carry
    /// the stream to its end and deregister it.
    pub fn open(
        &self,
        publisher: BoxPublisher,
        sink: BoxSink,
        initial_demand: u64,
    ) -> Result<(StreamId, Arc<EmissionEngine>)> {
        self.open_inner(publisher, sink, initial_demand, None)
    }

    /// Open a stream in blocking mode: wait for it to end.
    pub async fn serve(
        &self,
        publisher: BoxPublisher,
        sink: BoxSink,
        initial_demand: u64,
    ) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        let on_done: CompletionFn = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.open_inner(publisher, sink, initial_demand, Some(on_done))?;
        rx.await.map_err(|_| StreamError::Closed)
    }

    fn open_inner(
        &self,
        publisher: BoxPublisher,
        sink: BoxSink,
        initial_demand: u64,
        then: Option<CompletionFn>,
    ) -> Result<(StreamId, Arc<EmissionEngine>)> {
        // no collision check: a 64-bit random id colliding with a live one
        // is not worth a lookup per open
        let id = StreamId::random();
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_done: CompletionFn = Box::new(move |outcome| {
            if let Some(inner) = registry.upgrade() {
                inner.streams.remove(&id);
            }
            match &outcome {
                Outcome::Failed(text) => {
                    tracing::debug!(stream = %id, error = %text, "stream deregistered after failure")
                }
                _ => tracing::debug!(stream = %id, ?outcome, "stream deregistered"),
            }
            if let Some(then) = then {
                then(outcome);
            }
        });

        let engine =
            EmissionEngine::new(id, sink, Box::new(self.inner.flush), on_done)?;
        self.inner.streams.insert(id, engine.clone());
        engine.start(publisher, initial_demand);
        Ok((id, engine))
    }

    /// Route a signal. Unknown and finished ids are ignored; the return value
    /// only says whether the id was registered.
    pub fn signal(&self, id: StreamId, signal: Signal) -> bool {
        // clone out so the shard lock is not held while the engine runs
        let engine = self.inner.streams.get(&id).map(|e| e.value().clone());
        match engine {
            Some(engine) => {
                engine.signal(signal);
                true
            }
            None => {
                tracing::trace!(stream = %id, ?signal, "signal for unknown stream ignored");
                false
            }
        }
    }

    /// Idempotent.
    pub fn remove(&self, id: StreamId) -> bool {
        self.inner.streams.remove(&id).is_some()
    }

    /// Cancel every registered stream and clear the table.
    pub fn teardown(&self) {
        let engines: Vec<_> = self
            .inner
            .streams
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.inner.streams.clear();
        if !engines.is_empty() {
            tracing::debug!(count = engines.len(), "cancelling open streams");
        }
        for engine in engines {
            engine.on_cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.inner.streams.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::generator::{from_iter, from_stream};
    use crate::streaming::protocol::{read_frame, read_stream_id, Frame};
    use crate::streaming::sink::IoSink;
    use bytes::Bytes;
    use std::time::Duration;

    fn endless() -> BoxPublisher {
        from_stream(futures::stream::repeat(Ok::<_, std::convert::Infallible>(
            Bytes::from_static(b"x"),
        )))
    }

    async fn wait_until(pred: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_signal_routes_to_stream() {
        let registry = Registry::default();
        let (writer, mut reader) = tokio::io::duplex(4096);
        let (id, _engine) = registry
            .open(endless(), Box::new(IoSink::new(writer)), 0)
            .unwrap();
        assert_ne!(id.as_i64(), 0);
        assert!(registry.contains(id));

        assert_eq!(read_stream_id(&mut reader).await.unwrap(), id);
        assert!(registry.signal(id, Signal::Request(1)));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::item(&b"x"[..]));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let registry = Registry::default();
        assert!(!registry.signal(StreamId::random(), Signal::Request(5)));
        assert!(!registry.signal(StreamId::random(), Signal::Cancel));
        assert!(!registry.remove(StreamId::random()));
    }

    #[tokio::test]
    async fn test_completion_deregisters() {
        let registry = Registry::default();
        let (writer, _reader) = tokio::io::duplex(4096);
        let (id, _engine) = registry
            .open(from_iter(vec![vec![1u8]]), Box::new(IoSink::new(writer)), 10)
            .unwrap();
        wait_until(|| !registry.contains(id)).await;
        assert!(registry.is_empty());
        assert!(!registry.signal(id, Signal::Request(1)));
    }

    #[tokio::test]
    async fn test_serve_blocks_until_done() {
        let registry = Registry::default();
        let (writer, mut reader) = tokio::io::duplex(4096);
        let reading = tokio::spawn(async move {
            let mut rest = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
                .await
                .unwrap();
            rest
        });

        let outcome = registry
            .serve(
                from_iter(vec![vec![1u8, 2, 3], vec![4, 5, 6, 7]]),
                Box::new(IoSink::new(writer)),
                100,
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert!(registry.is_empty());

        // id + two item frames + completion
        assert_eq!(reading.await.unwrap().len(), 8 + 7 + 8 + 4);
    }

    #[tokio::test]
    async fn test_teardown_cancels_everything() {
        let registry = Registry::default();
        let mut readers = Vec::new();
        let mut engines = Vec::new();
        for _ in 0..3 {
            let (writer, reader) = tokio::io::duplex(4096);
            let (_, engine) = registry
                .open(endless(), Box::new(IoSink::new(writer)), 0)
                .unwrap();
            readers.push(reader);
            engines.push(engine);
        }
        assert_eq!(registry.len(), 3);

        registry.teardown();
        assert!(registry.is_empty());
        wait_until(|| engines.iter().all(|e| e.is_terminated())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_signals_and_completion() {
        let registry = Registry::default();
        let mut ids = Vec::new();
        let mut readers = Vec::new();
        for _ in 0..50 {
            let (writer, reader) = tokio::io::duplex(4096);
            let (id, _) = registry
                .open(from_iter(vec![vec![1u8], vec![2]]), Box::new(IoSink::new(writer)), 0)
                .unwrap();
            ids.push(id);
            readers.push(reader);
        }

        let mut tasks = Vec::new();
        for (i, id) in ids.iter().copied().enumerate() {
            let r = registry.clone();
            tasks.push(tokio::spawn(async move {
                r.signal(id, Signal::Request(1));
                r.signal(id, Signal::Request(1));
                r.signal(id, Signal::Request(1));
                if i % 2 == 0 {
                    r.signal(id, Signal::Cancel);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        wait_until(|| registry.is_empty()).await;
    }
}
