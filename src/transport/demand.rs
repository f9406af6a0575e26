//! Demand side channel.
//!
//! HTTP has no receiver-driven flow control, so demand travels out of band:
//! every signal is its own small request carrying `id` and `r` query
//! parameters. Delivery is best effort; callers hand failures to
//! [`crate::hooks::report`] rather than to the data stream.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Method;
use crate::error::{Result, StreamError};
use crate::streaming::channel::DemandSignal;

/// Sends demand signals to the producing side.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn send(&self, signal: DemandSignal) -> Result<()>;
}

/// Requester issuing `GET|POST <url>?id=<id>&r=<delta>`.
pub struct HttpRequester {
    client: reqwest::Client,
    url: reqwest::Url,
    method: Method,
    headers: reqwest::header::HeaderMap,
    basic_auth: Option<(String, String)>,
    read_timeout: Option<Duration>,
}

impl HttpRequester {
    pub fn new(client: reqwest::Client, url: reqwest::Url, method: Method) -> Self {
        Self {
            client,
            url,
            method,
            headers: reqwest::header::HeaderMap::new(),
            basic_auth: None,
            read_timeout: None,
        }
    }

    /// Headers added to every signal request
    pub fn with_headers(mut self, headers: reqwest::header::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Upper bound on a whole signal call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn send(&self, signal: DemandSignal) -> Result<()> {
        let mut req = self
            .client
            .request(self.method.as_reqwest(), self.url.clone())
            .query(&signal.query())
            .headers(self.headers.clone());
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(timeout) = self.read_timeout {
            req = req.timeout(timeout);
        }

        tracing::trace!(stream = %signal.id, delta = signal.signal.to_delta(), "sending demand");
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StreamError::Status {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }
        Ok(())
    }
}
