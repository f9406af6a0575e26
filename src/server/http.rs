//! HTTP front end.
//!
//! One route serves both kinds of call:
//!
//! | Query | Meaning | Response |
//! |---|---|---|
//! | no `id`, optional `r` | open a stream with `r` initial demand | 200, framed body |
//! | `id`, `r > 0` | request `r` more items | 200, empty |
//! | `id`, `r < 0` | cancel | 200, empty |
//! | malformed `id` or `r` | | 400 |
//!
//! Signals for unknown ids are answered with 200: the stream may simply have
//! finished while the signal was in flight.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::server::registry::Registry;
use crate::streaming::channel::{BoxPublisher, Signal, StreamId};
use crate::streaming::generator::failed;
use crate::streaming::sink::{BodyReceiver, BodySink};

/// What a source factory gets to see of the open call.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub method: Method,
    pub headers: HeaderMap,
    /// Query parameters other than `id` and `r`
    pub params: HashMap<String, String>,
    /// Request body; empty for GET
    pub body: Bytes,
}

/// Builds the item source for each opened stream.
pub type SourceFactory =
    Arc<dyn Fn(&OpenRequest) -> anyhow::Result<BoxPublisher> + Send + Sync + 'static>;

#[derive(Clone)]
struct AppState {
    registry: Registry,
    factory: SourceFactory,
    body_channel_size: usize,
}

/// Router serving streams from `factory` on `config.path`.
pub fn router(registry: Registry, factory: SourceFactory, config: &ServerConfig) -> Router {
    let state = AppState {
        registry,
        factory,
        body_channel_size: config.body_channel_size,
    };
    Router::new()
        .route(&config.path, get(handle).post(handle))
        .with_state(state)
}

fn bad_request(msg: String) -> Response {
    tracing::debug!(error = %msg, "rejected request");
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn parse_i64(params: &HashMap<String, String>, key: &str) -> Result<Option<i64>, String> {
    params
        .get(key)
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| format!("query parameter {:?} is not an integer: {:?}", key, v))
        })
        .transpose()
}

async fn handle(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(mut params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let id = match parse_i64(&params, "id") {
        Ok(id) => id,
        Err(msg) => return bad_request(msg),
    };
    let r = match parse_i64(&params, "r") {
        Ok(r) => r,
        Err(msg) => return bad_request(msg),
    };

    match id {
        Some(raw) => {
            let Some(id) = StreamId::new(raw) else {
                return bad_request("stream id 0 is reserved".to_string());
            };
            let Some(r) = r else {
                return bad_request("signal without query parameter \"r\"".to_string());
            };
            if let Some(signal) = Signal::from_delta(r) {
                state.registry.signal(id, signal);
            }
            StatusCode::OK.into_response()
        }
        None => {
            let initial = match r.unwrap_or(0) {
                r if r < 0 => {
                    return bad_request(format!("initial demand must not be negative, got {}", r))
                }
                r => r as u64,
            };
            params.remove("id");
            params.remove("r");
            let request = OpenRequest {
                method,
                headers,
                params,
                body,
            };
            open_stream(&state, &request, initial)
        }
    }
}

fn open_stream(state: &AppState, request: &OpenRequest, initial: u64) -> Response {
    let publisher = match (state.factory)(request) {
        Ok(publisher) => publisher,
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "source factory failed");
            failed(e)
        }
    };

    let (sink, rx) = BodySink::channel(state.body_channel_size);
    let id = match state.registry.open(publisher, Box::new(sink), initial) {
        Ok((id, _)) => id,
        Err(e) => {
            tracing::error!(error = %e, "failed to open stream");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let guard = CancelOnDrop {
        registry: state.registry.clone(),
        id,
        armed: true,
    };
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body_stream(rx, guard)),
    )
        .into_response()
}

/// Cancels the stream if the response body is dropped before the sink closed
struct CancelOnDrop {
    registry: Registry,
    id: StreamId,
    armed: bool,
}

impl CancelOnDrop {
    /// The body ended normally; dropping the guard no longer cancels.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(stream = %self.id, "client went away");
            self.registry.signal(self.id, Signal::Cancel);
        }
    }
}

fn body_stream(
    rx: BodyReceiver,
    guard: CancelOnDrop,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
        match rx.recv().await {
            Some(chunk) => Some((chunk, (rx, guard))),
            None => {
                guard.disarm();
                None
            }
        }
    })
}

// =============================================================================
// Server
// =============================================================================

/// Listener plus registry; serves until shut down.
pub struct StreamServer {
    listener: TcpListener,
    registry: Registry,
    router: Router,
}

impl StreamServer {
    pub async fn bind(config: &ServerConfig, factory: SourceFactory) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?;
        let registry = Registry::new(config.flush);
        let router = router(registry.clone(), factory, config);
        Ok(Self {
            listener,
            registry,
            router,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Serve until `shutdown` resolves. Open streams are cancelled at shutdown
    /// so their responses end and the connections can drain.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "serving streams");

        let registry = self.registry.clone();
        let shutdown = async move {
            shutdown.await;
            tracing::info!("shutting down, cancelling open streams");
            registry.teardown();
        };
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed")?;

        self.registry.teardown();
        Ok(())
    }
}
