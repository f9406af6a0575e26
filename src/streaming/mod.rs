//! Backpressured item streams over a byte transport.
//!
//! # Architecture
//!
//! ```text
//!            server                                  client
//! +-----------+    +-----------------+  bytes  +-------------+    +------------+
//! | Publisher | -> | EmissionEngine  | ------> |   Decoder   | -> | ItemStream |
//! | (source)  |    | (drain + sink)  |         | (read loop) |    | (Stream)   |
//! +-----------+    +-----------------+         +-------------+    +------------+
//!                          ^                          |
//!                          |     demand side channel  |
//!                          +---- Registry <-----------+
//! ```
//!
//! The engine writes the stream id, then one frame per item, never more items
//! than the client has signalled. See [`protocol`] for the wire format.

pub mod channel;
pub mod generator;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sink;

pub use channel::{
    BoxPublisher, DemandSignal, Notification, Publisher, Signal, StreamId, Subscriber,
    Subscription, BODY_CHANNEL_SIZE, DEFAULT_BATCH,
};

pub use generator::{failed, from_iter, from_stream};
pub use pipeline::ItemStream;
pub use receiver::{Decoder, DecoderSubscription};
pub use sender::{CompletionFn, EmissionEngine, Outcome};
pub use sink::{BodySink, BoxSink, FlushPolicy, FlushStrategy, FrameSink, IoSink};

pub use protocol::{
    read_frame, read_frame_with_limit, read_stream_id, write_stream_id, Frame,
    COMPLETION_SENTINEL, MAX_PAYLOAD_SIZE,
};
