//! Producing side: the stream registry and its HTTP front end.

pub mod http;
pub mod registry;

pub use http::{router, OpenRequest, SourceFactory, StreamServer};
pub use registry::Registry;
