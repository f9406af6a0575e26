//! Shared stream types.
//!
//! Stream ids, demand signals and the publisher/subscriber contract that
//! connects item sources, the emission engine and the decoding engine.
//!
//! The contract follows Reactive Streams: a [`Publisher`] is subscribed once,
//! hands its [`Subscriber`] a [`Subscription`], and then delivers at most as
//! many items as were requested, followed by at most one terminal
//! notification.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::StreamError;

/// Capacity of the chunk channel between an emission engine and an HTTP body
pub const BODY_CHANNEL_SIZE: usize = 16;

/// Items requested per round trip by the pull adapter
pub const DEFAULT_BATCH: u64 = 16;

// =============================================================================
// StreamId
// =============================================================================

/// Identifier of one logical stream. Zero is reserved as "unassigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(i64);

impl StreamId {
    /// Returns `None` for the reserved id 0.
    pub fn new(raw: i64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// A random nonzero id.
    pub fn random() -> Self {
        loop {
            let raw: i64 = rand::random();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Demand signals
// =============================================================================

/// What a consumer asks of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Permit this many more items
    Request(u64),
    /// Stop the stream
    Cancel,
}

impl Signal {
    /// Decode the `r` value of a side-channel call. Any negative value cancels;
    /// zero carries nothing and yields `None`.
    pub fn from_delta(delta: i64) -> Option<Self> {
        match delta {
            0 => None,
            d if d < 0 => Some(Self::Cancel),
            d => Some(Self::Request(d as u64)),
        }
    }

    /// Wire value. Requests above `i64::MAX` are clamped; the server
    /// saturates anyway.
    pub fn to_delta(self) -> i64 {
        match self {
            Self::Request(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Self::Cancel => -1,
        }
    }
}

/// A signal addressed to one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandSignal {
    pub id: StreamId,
    pub signal: Signal,
}

impl DemandSignal {
    pub fn request(id: StreamId, n: u64) -> Self {
        Self {
            id,
            signal: Signal::Request(n),
        }
    }

    pub fn cancel(id: StreamId) -> Self {
        Self {
            id,
            signal: Signal::Cancel,
        }
    }

    /// Query parameters of the side-channel call (`id`, `r`)
    pub fn query(&self) -> [(&'static str, String); 2] {
        [
            ("id", self.id.to_string()),
            ("r", self.signal.to_delta().to_string()),
        ]
    }
}

// =============================================================================
// Publisher / Subscriber contract
// =============================================================================

/// One event delivered to a subscriber.
#[derive(Debug)]
pub enum Notification {
    Next(Bytes),
    Complete,
    Error(StreamError),
}

/// Demand handle given to a subscriber.
pub trait Subscription: Send + Sync {
    /// Permit `n` more items. Zero is ignored.
    fn request(&self, n: u64);

    /// Stop delivery. Idempotent.
    fn cancel(&self);
}

pub trait Subscriber: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_notification(&self, notification: Notification);

    fn on_next(&self, item: Bytes) {
        self.on_notification(Notification::Next(item));
    }

    fn on_complete(&self) {
        self.on_notification(Notification::Complete);
    }

    fn on_error(&self, err: StreamError) {
        self.on_notification(Notification::Error(err));
    }
}

/// A source of items that can be subscribed exactly once.
pub trait Publisher: Send {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber>);
}

pub type BoxPublisher = Box<dyn Publisher>;

// =============================================================================
// Tests
// =============================================================================
