//! Event-driven connection pipeline.
//!
//! A [`PipelineFactory`] opens one logical connection per tile and reports
//! progress as [`ConnectionEvent`]s on a multiplexed channel, tagged with the
//! connection id chosen by the caller. Whoever owns the receiving end keeps
//! its own registry of per-connection state keyed by that id.
//!
//! The factory is long-lived and shared: it is constructed once by whatever
//! assembles the coordinator and injected, never reached through a global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::HeaderValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use super::request::TileHttpRequest;
use super::transport::map_reqwest_error;
use crate::error::{TileError, TransportError};

/// Identifies one logical connection.
pub type ConnectionId = u64;

/// Sending half of the multiplexed event stream.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>;

/// Receiving half of the multiplexed event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>;

/// Progress of one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Response status line and framing headers arrived.
    Head {
        status: u16,
        content_length: Option<u64>,
        chunked: bool,
    },

    /// A piece of the response body.
    Data(Bytes),

    /// The response body ended.
    End,

    /// The connection failed; no further events follow.
    Failed(TileError),
}

/// Opens and closes pipelined connections.
pub trait PipelineFactory: Send + Sync {
    /// URL scheme this factory can speak, e.g. `http`.
    fn supported_scheme(&self) -> &str;

    /// Allocate a connection id, unique for the factory's lifetime.
    fn allocate_id(&self) -> ConnectionId;

    /// Open a connection for `request` and stream its events to `events`.
    ///
    /// Must not block. Exactly one terminal event (`End` or `Failed`)
    /// follows, unless the connection is closed first.
    fn open(&self, id: ConnectionId, request: TileHttpRequest, events: EventSender);

    /// Close a connection. Closing an unknown or finished id is a no-op.
    fn close(&self, id: ConnectionId);

    /// Number of connections opened and not yet closed.
    fn open_connections(&self) -> usize;
}

// =============================================================================
// HTTP Pipeline Factory
// =============================================================================

/// Pipeline factory over plain HTTP/1.1.
///
/// Every tile gets its own connection: idle pooling is disabled and each
/// request asks the server to close once the response is sent.
pub struct HttpPipelineFactory {
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
    connections: Arc<DashMap<ConnectionId, AbortHandle>>,
}

impl HttpPipelineFactory {
    /// Create a factory whose connections time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            next_id: AtomicU64::new(1),
            connections: Arc::new(DashMap::new()),
        })
    }

    async fn stream_response(
        client: reqwest::Client,
        timeout: Duration,
        id: ConnectionId,
        request: TileHttpRequest,
        events: &EventSender,
    ) -> Result<(), TileError> {
        let mut response = client
            .request(request.method, request.url)
            .headers(request.headers)
            .header(CONNECTION, HeaderValue::from_static("close"))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let chunked = response
            .headers()
            .get_all(TRANSFER_ENCODING)
            .iter()
            .any(|v| v.to_str().map(|s| s.contains("chunked")).unwrap_or(false));

        let head = ConnectionEvent::Head {
            status: response.status().as_u16(),
            content_length: if chunked {
                None
            } else {
                response.content_length()
            },
            chunked,
        };
        if events.send((id, head)).is_err() {
            return Ok(());
        }

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
        {
            trace!(connection = id, bytes = chunk.len(), "body chunk");
            if events.send((id, ConnectionEvent::Data(chunk))).is_err() {
                return Ok(());
            }
        }

        let _ = events.send((id, ConnectionEvent::End));
        Ok(())
    }
}

impl PipelineFactory for HttpPipelineFactory {
    fn supported_scheme(&self) -> &str {
        "http"
    }

    fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open(&self, id: ConnectionId, request: TileHttpRequest, events: EventSender) {
        let client = self.client.clone();
        let timeout = self.timeout;

        trace!(connection = id, url = %request.url, "opening connection");
        let handle = tokio::spawn(async move {
            if let Err(e) = Self::stream_response(client, timeout, id, request, &events).await {
                let _ = events.send((id, ConnectionEvent::Failed(e)));
            }
        });

        self.connections.insert(id, handle.abort_handle());
    }

    fn close(&self, id: ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            trace!(connection = id, "closing connection");
            handle.abort();
        }
    }

    fn open_connections(&self) -> usize {
        self.connections.len()
    }
}
