//! Event-driven strategy: one pipelined connection per miss.
//!
//! A single dispatcher task owns the [`ConnectionRegistry`] and consumes the
//! multiplexed event stream of every connection the request opened. Bodies
//! are framed from the response head, buffered per connection, and decoded
//! on the blocking pool once complete. A connection still open when its
//! fetch timeout elapses fails with [`TileError::Timeout`].
//!
//! ```text
//! submit ──► claim ──┬── Hit ─────► push
//!                    ├── Waiter ──► await leader ──► push
//!                    └── Leader ──► factory.open(id)
//!                                        │
//!                      events (id, Head/Data/End/Failed)
//!                                        ▼
//!                     dispatcher ──► decode ──► complete ──► push
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::strategy::{decode_tile, publish_tile, FetchContext, FetchStrategy, StrategyKind};
use super::tracker::CountdownGuard;
use crate::error::TileError;
use crate::io::{ConnectionEvent, ConnectionId, EventReceiver, EventSender, PipelineFactory};
use crate::tile::{CacheClaim, FetchedTile, FlightGuard, TileRequest};

// =============================================================================
// Body Framing
// =============================================================================

/// How a response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No head yet
    Pending,

    /// `Content-Length` bytes
    Fixed(u64),

    /// Chunked transfer encoding; ends at `End`
    Chunked,

    /// Neither length nor chunking; ends when the connection closes
    UntilClose,
}

impl BodyFraming {
    fn from_head(content_length: Option<u64>, chunked: bool) -> Self {
        match (chunked, content_length) {
            (true, _) => BodyFraming::Chunked,
            (false, Some(length)) => BodyFraming::Fixed(length),
            (false, None) => BodyFraming::UntilClose,
        }
    }

    /// Whether `received` bytes complete the body before `End` arrives.
    fn is_complete(&self, received: usize) -> bool {
        matches!(*self, BodyFraming::Fixed(length) if received as u64 >= length)
    }

    /// Check the body once the connection reports `End`.
    fn check_end(&self, received: usize) -> Result<(), TileError> {
        match *self {
            BodyFraming::Pending => Err(TileError::Transport(
                "connection ended before a response head".to_string(),
            )),
            BodyFraming::Fixed(length) if (received as u64) < length => {
                Err(TileError::TruncatedBody {
                    expected: length,
                    actual: received as u64,
                })
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Connection Registry
// =============================================================================

/// Per-connection tile state.
///
/// Dropping a context abandons its flight and counts its fetch down, in that
/// order.
struct ConnectionContext {
    request: TileRequest,
    url: String,
    guard: FlightGuard,
    countdown: CountdownGuard,
    buffer: BytesMut,
    framing: BodyFraming,
    opened_at: Instant,
    deadline: Instant,
}

/// Open connections of one bulk request, keyed by connection id.
type ConnectionRegistry = DashMap<ConnectionId, ConnectionContext>;

// =============================================================================
// Strategy
// =============================================================================

/// Fetches misses over an injected [`PipelineFactory`].
pub struct PipelinedFetchStrategy {
    factory: Arc<dyn PipelineFactory>,
}

impl PipelinedFetchStrategy {
    /// Create a strategy over a shared pipeline factory.
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl FetchStrategy for PipelinedFetchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pipelined
    }

    async fn dispatch(&self, work: Vec<TileRequest>, ctx: FetchContext) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (resubmit, resubmit_rx) = mpsc::unbounded_channel();

        debug!(tiles = work.len(), "dispatching to pipeline");
        let dispatcher = Dispatcher {
            factory: self.factory.clone(),
            ctx,
            registry: ConnectionRegistry::new(),
            events,
            resubmit,
        };
        for request in work {
            dispatcher.submit(request);
        }

        tokio::spawn(dispatcher.run(event_rx, resubmit_rx));
    }
}

struct Dispatcher {
    factory: Arc<dyn PipelineFactory>,
    ctx: FetchContext,
    registry: ConnectionRegistry,
    events: EventSender,
    resubmit: mpsc::UnboundedSender<TileRequest>,
}

impl Dispatcher {
    async fn run(
        self,
        mut events: EventReceiver,
        mut resubmits: mpsc::UnboundedReceiver<TileRequest>,
    ) {
        let cancel = self.ctx.publisher.cancel_handle();
        let tracker = self.ctx.tracker.clone();
        let mut cancel_seen = false;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = tracker.completed() => break,
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    self.close_all();
                }
                Some(request) = resubmits.recv() => self.submit(request),
                Some((id, event)) = events.recv() => self.on_event(id, event),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }

        debug!("pipeline dispatcher finished");
    }

    /// Claim `request`'s key and route it.
    fn submit(&self, request: TileRequest) {
        let countdown = CountdownGuard::new(self.ctx.tracker.clone());
        if self.ctx.publisher.is_cancelled() {
            return;
        }

        let key = request.key.clone();
        match self.ctx.cache.claim(&key) {
            CacheClaim::Hit(image) => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let _countdown = countdown;
                    publish_tile(&ctx, FetchedTile::from_cache(key, image)).await;
                });
            }
            CacheClaim::Waiter(waiter) => {
                let ctx = self.ctx.clone();
                let resubmit = self.resubmit.clone();
                tokio::spawn(async move {
                    match waiter.wait().await {
                        Ok(image) => {
                            publish_tile(&ctx, FetchedTile::from_network(key, image)).await;
                        }
                        Err(e) if e.is_leader_gone() && !ctx.publisher.is_cancelled() => {
                            trace!(tile = %key, "leader abandoned, resubmitting");
                            if resubmit.send(request).is_ok() {
                                countdown.disarm();
                            }
                        }
                        Err(e) => warn!(tile = %key, error = %e, "tile fetch failed, skipping"),
                    }
                });
            }
            CacheClaim::Leader(guard) => {
                let http_request = match self.ctx.builder.build(&request) {
                    Ok(http_request) => http_request,
                    Err(e) => {
                        warn!(tile = %key, error = %e, "tile fetch failed, skipping");
                        let _ = guard.complete(Err(e));
                        return;
                    }
                };

                let id = self.factory.allocate_id();
                let opened_at = Instant::now();
                trace!(tile = %key, connection = id, "opening pipelined connection");
                self.registry.insert(
                    id,
                    ConnectionContext {
                        request,
                        url: http_request.url.to_string(),
                        guard,
                        countdown,
                        buffer: BytesMut::new(),
                        framing: BodyFraming::Pending,
                        opened_at,
                        deadline: opened_at + self.ctx.config.fetch_timeout,
                    },
                );
                self.factory.open(id, http_request, self.events.clone());
            }
        }
    }

    fn on_event(&self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Head {
                status,
                content_length,
                chunked,
            } => {
                let complete = {
                    let Some(mut conn) = self.registry.get_mut(&id) else {
                        return;
                    };
                    if !(200..300).contains(&status) {
                        let url = conn.url.clone();
                        drop(conn);
                        self.fail(id, TileError::HttpStatus { status, url });
                        return;
                    }
                    conn.framing = BodyFraming::from_head(content_length, chunked);
                    trace!(connection = id, status, framing = ?conn.framing, "response head");
                    conn.framing.is_complete(conn.buffer.len())
                };
                if complete {
                    self.finish(id);
                }
            }
            ConnectionEvent::Data(chunk) => {
                let complete = {
                    let Some(mut conn) = self.registry.get_mut(&id) else {
                        return;
                    };
                    conn.buffer.extend_from_slice(&chunk);
                    conn.framing.is_complete(conn.buffer.len())
                };
                if complete {
                    self.finish(id);
                }
            }
            ConnectionEvent::End => {
                let checked = match self.registry.get(&id) {
                    Some(conn) => conn.framing.check_end(conn.buffer.len()),
                    None => return,
                };
                match checked {
                    Ok(()) => self.finish(id),
                    Err(e) => self.fail(id, e),
                }
            }
            ConnectionEvent::Failed(e) => self.fail(id, e),
        }
    }

    /// The body is complete: close, then decode, cache and push off-loop.
    fn finish(&self, id: ConnectionId) {
        let Some((_, conn)) = self.registry.remove(&id) else {
            return;
        };
        self.factory.close(id);

        let ConnectionContext {
            request,
            guard,
            countdown,
            mut buffer,
            framing,
            opened_at,
            ..
        } = conn;
        if let BodyFraming::Fixed(length) = framing {
            buffer.truncate(length as usize);
        }
        trace!(
            tile = %request.key,
            connection = id,
            bytes = buffer.len(),
            elapsed_ms = u64::try_from(opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "body complete"
        );

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _countdown = countdown;
            if ctx.publisher.is_cancelled() {
                return;
            }

            let TileRequest { key, hints } = request;
            let result = decode_tile(ctx.decoder.clone(), buffer.freeze(), hints).await;
            match guard.complete(result) {
                Ok(image) => publish_tile(&ctx, FetchedTile::from_network(key, image)).await,
                Err(e) => warn!(tile = %key, error = %e, "tile decode failed, skipping"),
            }
        });
    }

    fn fail(&self, id: ConnectionId, error: TileError) {
        let Some((_, conn)) = self.registry.remove(&id) else {
            return;
        };
        self.factory.close(id);

        warn!(tile = %conn.request.key, connection = id, error = %error, "tile fetch failed, skipping");
        let _ = conn.guard.complete(Err(error));
    }

    /// Earliest deadline among open connections.
    fn next_deadline(&self) -> Option<Instant> {
        self.registry.iter().map(|entry| entry.deadline).min()
    }

    /// Fail every connection whose deadline has passed by `now`.
    fn expire(&self, now: Instant) {
        let expired: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let millis = u64::try_from(self.ctx.config.fetch_timeout.as_millis()).unwrap_or(u64::MAX);
        for id in expired {
            self.fail(id, TileError::Timeout { millis });
        }
    }

    /// Close every open connection without decoding.
    fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.registry.iter().map(|entry| *entry.key()).collect();
        debug!(connections = ids.len(), "bulk request cancelled, closing connections");

        for id in ids {
            if let Some((_, conn)) = self.registry.remove(&id) {
                self.factory.close(id);
                drop(conn);
            }
        }
    }
}
