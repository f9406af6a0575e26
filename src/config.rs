//! Configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! path = "/items"
//! flush = { items = 16, bytes = 65536 }
//!
//! [client]
//! method = "post"
//! pre_request = 32
//! batch = 32
//! connect_timeout_ms = 2000
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::streaming::channel::{BODY_CHANNEL_SIZE, DEFAULT_BATCH};
use crate::streaming::sink::FlushPolicy;

/// Environment variable overriding `server.bind`
pub const BIND_ENV: &str = "PULLWIRE_BIND";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind: SocketAddr,

    /// Route serving both stream opens and demand signals
    pub path: String,

    /// When buffered output is flushed to the client
    pub flush: FlushPolicy,

    /// Flushed chunks that may wait for a slow client before writes stall
    pub body_channel_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            path: "/".to_string(),
            flush: FlushPolicy::default(),
            body_channel_size: BODY_CHANNEL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Method used for the open call and for demand signals
    pub method: Method,

    /// Demand granted in the open call itself (`r` on the first request)
    pub pre_request: u64,

    /// Items requested per demand signal
    pub batch: u64,

    pub connect_timeout_ms: Option<u64>,

    /// Applies to each demand signal and to every read of the stream body
    pub read_timeout_ms: Option<u64>,

    /// Reject items larger than this many bytes. Unset accepts anything the
    /// wire format can carry.
    pub max_frame_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            method: Method::Get,
            pre_request: 0,
            batch: DEFAULT_BATCH,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            max_frame_size: None,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> std::result::Result<(), StreamError> {
        if !self.server.path.starts_with('/') {
            return Err(StreamError::Config(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.server.body_channel_size == 0 {
            return Err(StreamError::Config(
                "server.body_channel_size must be positive".to_string(),
            ));
        }
        if self.client.batch == 0 {
            return Err(StreamError::Config("client.batch must be positive".to_string()));
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(bind) = std::env::var(BIND_ENV) {
            self.server.bind = bind
                .parse()
                .with_context(|| format!("{} is not a socket address: {}", BIND_ENV, bind))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.path, "/");
        assert_eq!(config.client.batch, DEFAULT_BATCH);
        assert_eq!(config.server.flush, FlushPolicy::always());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"
            path = "/items"
            flush = { items = 16, bytes = 65536 }

            [client]
            method = "post"
            pre_request = 32
            batch = 8
            connect_timeout_ms = 2000
            max_frame_size = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.server.path, "/items");
        assert_eq!(config.server.flush, FlushPolicy::after(16, 65536));
        assert_eq!(config.client.method, Method::Post);
        assert_eq!(config.client.pre_request, 32);
        assert_eq!(config.client.connect_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.client.read_timeout(), None);
        assert_eq!(config.client.max_frame_size, Some(1 << 20));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.client.method = Method::Post;
        config.server.flush = FlushPolicy::after_bytes(4096);
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[server]\npath = \"items\"").is_err());
        assert!(Config::from_toml_str("[client]\nbatch = 0").is_err());
        assert!(Config::from_toml_str("[client]\nmethod = \"put\"").is_err());
    }

    #[test]
    #[serial]
    fn test_load_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"127.0.0.1:7000\"").unwrap();

        std::env::remove_var(BIND_ENV);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.bind.port(), 7000);

        std::env::set_var(BIND_ENV, "127.0.0.1:7001");
        let config = Config::load(file.path()).unwrap();
        std::env::remove_var(BIND_ENV);
        assert_eq!(config.server.bind.port(), 7001);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = Config::load(Path::new("/nonexistent/pullwire.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
