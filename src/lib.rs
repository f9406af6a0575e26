//! pullwire: backpressured byte streams over plain HTTP.
//!
//! A producer serves an unbounded sequence of binary items; a consumer pulls
//! them with "request N more" semantics. HTTP offers no receiver-driven flow
//! control, so the main response carries only framed items while demand
//! travels back on separate small requests addressed by stream id.
//!
//! - [`server`]: stream registry and HTTP front end ([`StreamServer`])
//! - [`transport`]: HTTP client ([`Client`]) and the demand side channel
//! - [`streaming`]: wire format, emission and decoding engines, sources
//!
//! ```no_run
//! use std::sync::Arc;
//! use pullwire::streaming::{from_iter, BoxPublisher};
//! use pullwire::{config::ServerConfig, OpenRequest, SourceFactory, StreamServer};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let factory: SourceFactory = Arc::new(|_req: &OpenRequest| -> anyhow::Result<BoxPublisher> {
//!     Ok(from_iter(vec![b"hello".to_vec(), b"world".to_vec()]))
//! });
//! let server = StreamServer::bind(&ServerConfig::default(), factory).await?;
//! server.serve(std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod server;
pub mod streaming;
pub mod transport;

pub use config::Config;
pub use error::{Result, StreamError};
pub use server::{OpenRequest, Registry, SourceFactory, StreamServer};
pub use streaming::{ItemStream, Outcome, Signal, StreamId};
pub use transport::Client;
