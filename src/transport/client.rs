//! HTTP client for pullwire streams.
//!
//! ```no_run
//! # async fn demo() -> pullwire::Result<()> {
//! use futures::StreamExt;
//!
//! let mut items = pullwire::Client::get("http://127.0.0.1:8080/")
//!     .pre_request(16)
//!     .batch(16)
//!     .open()
//!     .await?;
//! while let Some(item) = items.next().await {
//!     println!("{} bytes", item?.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::io::StreamReader;

use crate::config::{ClientConfig, Method};
use crate::error::{Result, StreamError};
use crate::streaming::channel::{Publisher, Subscriber, DEFAULT_BATCH};
use crate::streaming::pipeline::ItemStream;
use crate::streaming::receiver::Decoder;
use crate::transport::demand::HttpRequester;

/// Response body as an `AsyncRead`
pub type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Builder for one stream. Consumed by [`open`](Self::open) or
/// [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct Client {
    url: String,
    method: Method,
    pre_request: u64,
    batch: u64,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    max_frame_size: Option<usize>,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
    /// First invalid builder input, reported by `open`
    invalid: Option<String>,
}

impl Client {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            pre_request: 0,
            batch: DEFAULT_BATCH,
            connect_timeout: None,
            read_timeout: None,
            max_frame_size: None,
            headers: HeaderMap::new(),
            basic_auth: None,
            invalid: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn from_config(url: impl Into<String>, config: &ClientConfig) -> Self {
        let mut client = Self::new(config.method, url)
            .pre_request(config.pre_request)
            .batch(config.batch);
        client.connect_timeout = config.connect_timeout();
        client.read_timeout = config.read_timeout();
        client.max_frame_size = config.max_frame_size;
        client
    }

    /// Demand granted in the open call itself, saving one signal round trip
    pub fn pre_request(mut self, n: u64) -> Self {
        self.pre_request = n;
        self
    }

    /// Items requested per signal by [`ItemStream`]
    pub fn batch(mut self, n: u64) -> Self {
        self.batch = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Fail the stream on any item larger than `limit` bytes
    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = Some(limit);
        self
    }

    /// Header sent with the open call and every signal
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| e.to_string())
            .and_then(|n| {
                HeaderValue::from_str(value)
                    .map(|v| (n, v))
                    .map_err(|e| e.to_string())
            });
        match parsed {
            Ok((n, v)) => {
                self.headers.insert(n, v);
            }
            Err(e) if self.invalid.is_none() => {
                self.invalid = Some(format!("invalid header {:?}: {}", name, e));
            }
            Err(_) => {}
        }
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Open the stream and pull items through a `futures::Stream`.
    pub async fn open(self) -> Result<ItemStream> {
        let batch = self.batch;
        let decoder = self.connect().await?;
        ItemStream::new(Box::new(decoder), batch)
    }

    /// Open the stream and drive `subscriber` directly; it controls demand
    /// through the subscription it is handed.
    pub async fn subscribe(self, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let decoder = self.connect().await?;
        Box::new(decoder).subscribe(subscriber);
        Ok(())
    }

    fn validate(&self) -> Result<reqwest::Url> {
        if let Some(msg) = &self.invalid {
            return Err(StreamError::Config(msg.clone()));
        }
        if self.batch == 0 {
            return Err(StreamError::Config("batch must be positive".to_string()));
        }
        for timeout in [self.connect_timeout, self.read_timeout].into_iter().flatten() {
            if timeout.is_zero() {
                return Err(StreamError::Config("timeouts must be positive".to_string()));
            }
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| StreamError::Config(format!("invalid url {:?}: {}", self.url, e)))
    }

    async fn connect(self) -> Result<Decoder<BodyReader>> {
        let url = self.validate()?;

        let mut builder = reqwest::Client::builder();
        if let Some(t) = self.connect_timeout {
            builder = builder.connect_timeout(t);
        }
        if let Some(t) = self.read_timeout {
            builder = builder.read_timeout(t);
        }
        let http = builder.build()?;

        let mut req = http
            .request(self.method.as_reqwest(), url.clone())
            .headers(self.headers.clone());
        if self.pre_request > 0 {
            req = req.query(&[("r", self.pre_request.to_string())]);
        }
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }

        tracing::debug!(url = %url, pre_request = self.pre_request, "opening stream");
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StreamError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
            .boxed();

        let mut requester =
            HttpRequester::new(http, url, self.method).with_headers(self.headers);
        if let Some((user, password)) = self.basic_auth {
            requester = requester.with_basic_auth(user, password);
        }
        if let Some(t) = self.read_timeout {
            requester = requester.with_timeout(t);
        }

        let mut decoder =
            Decoder::new(StreamReader::new(body), Arc::new(requester)).prefetched(self.pre_request);
        if let Some(limit) = self.max_frame_size {
            decoder = decoder.max_frame_size(limit);
        }
        Ok(decoder)
    }
}
