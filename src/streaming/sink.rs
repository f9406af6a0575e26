//! Output sinks for the emission engine.
//!
//! A sink receives already-encoded bytes: the stream id header and frames.
//! Only the engine's drain task touches a sink, so implementations need no
//! internal locking.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Result, StreamError};

#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Close the sink. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

pub type BoxSink = Box<dyn FrameSink>;

// =============================================================================
// IoSink
// =============================================================================

/// Sink over any tokio writer.
pub struct IoSink<W> {
    inner: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for IoSink<W> {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.inner.shutdown().await?;
        Ok(())
    }
}

// =============================================================================
// BodySink
// =============================================================================

/// Receiving half of a [`BodySink`], consumed by the HTTP response body.
pub type BodyReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Sink feeding an HTTP response body.
///
/// Writes are buffered; each flush hands the buffered bytes to the body as one
/// chunk. The bounded channel keeps a slow client from letting chunks pile up
/// in memory. If the body is dropped every later write fails with
/// `BrokenPipe`.
pub struct BodySink {
    buffer: BytesMut,
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl BodySink {
    pub fn channel(capacity: usize) -> (Self, BodyReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                buffer: BytesMut::new(),
                tx: Some(tx),
            },
            rx,
        )
    }

    fn sender(&self) -> Result<&mpsc::Sender<io::Result<Bytes>>> {
        match &self.tx {
            Some(tx) if tx.is_closed() => Err(broken_pipe()),
            Some(tx) => Ok(tx),
            None => Err(StreamError::Closed),
        }
    }
}

fn broken_pipe() -> StreamError {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped by client").into()
}

#[async_trait]
impl FrameSink for BodySink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.sender()?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let tx = self.sender()?.clone();
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        tx.send(Ok(chunk)).await.map_err(|_| broken_pipe())
    }

    async fn close(&mut self) -> Result<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        let flushed = self.flush().await;
        self.tx = None;
        flushed
    }
}

// =============================================================================
// Flush policy
// =============================================================================

/// Decides after each written item whether the sink is flushed.
pub trait FlushStrategy: Send {
    fn after_item(&mut self, len: usize) -> bool;
}

/// Threshold flush policy. A zero threshold is disabled; with both disabled
/// the sink is only flushed when the stream ends.
///
/// Both counters accumulate across items; whichever threshold is reached
/// first triggers the flush and resets both.
///
/// In configuration an omitted threshold is disabled: `{ bytes = 65536 }`
/// flushes on size alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// Flush after this many items
    #[serde(default)]
    pub items: u64,
    /// Flush after this many payload bytes
    #[serde(default)]
    pub bytes: u64,
    #[serde(skip)]
    pending_items: u64,
    #[serde(skip)]
    pending_bytes: u64,
}

impl FlushPolicy {
    pub fn after(items: u64, bytes: u64) -> Self {
        Self {
            items,
            bytes,
            pending_items: 0,
            pending_bytes: 0,
        }
    }

    /// Flush after every item
    pub fn always() -> Self {
        Self::after(1, 0)
    }

    pub fn after_items(n: u64) -> Self {
        Self::after(n, 0)
    }

    pub fn after_bytes(n: u64) -> Self {
        Self::after(0, n)
    }

    /// Never flush mid-stream
    pub fn at_end() -> Self {
        Self::after(0, 0)
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::always()
    }
}

impl FlushStrategy for FlushPolicy {
    fn after_item(&mut self, len: usize) -> bool {
        self.pending_items = self.pending_items.saturating_add(1);
        self.pending_bytes = self.pending_bytes.saturating_add(len as u64);

        let due = (self.items > 0 && self.pending_items >= self.items)
            || (self.bytes > 0 && self.pending_bytes >= self.bytes);
        if due {
            self.pending_items = 0;
            self.pending_bytes = 0;
        }
        due
    }
}
