//! Error types for pullwire.
//!
//! Errors intrinsic to a data stream travel through that stream's own error
//! channel. Errors on the side channel (demand signals) have no return path
//! and go to the process-wide sink in [`crate::hooks`].

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Read or write failure on the underlying transport
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Connect, timeout or other HTTP client failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with a non-2xx status
    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// The byte stream does not follow the framing rules
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote producer failed; carries the error text from the error frame
    #[error("remote stream failed: {0}")]
    Remote(String),

    /// The local producer failed
    #[error("producer failed: {0:#}")]
    Producer(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The stream already reached a terminal state
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the error came from the transport rather than from the stream content.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Http(_) | Self::Status { .. } | Self::Protocol(_)
        )
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_and_transport_classification() {
        let short = StreamError::protocol("encountered EOF before expected length was read");
        assert!(short.is_transport());
        assert!(short.to_string().contains("EOF"));

        let remote = StreamError::Remote("boo".to_string());
        assert!(!remote.is_transport());
        assert_eq!(remote.to_string(), "remote stream failed: boo");
    }

    #[test]
    fn test_producer_error_shows_cause_chain() {
        let err = anyhow::anyhow!("disk gone").context("reading source");
        let wrapped = StreamError::Producer(err);
        let text = wrapped.to_string();
        assert!(text.contains("reading source"));
        assert!(text.contains("disk gone"));
    }
}
