//! Worker-pool strategy: one blocking fetch + decode per miss.
//!
//! # Pool Lifecycle
//!
//! The pool is created per bulk request as a semaphore of `pool_size`
//! permits and accepts exactly one task per miss. It is closed when the
//! request is cancelled or the tracker completes; tasks still waiting for a
//! permit then give up without fetching. A permit is held by the blocking
//! fetch itself, so a fetch that outlives its timeout still occupies its
//! slot. Tasks already fetching run to completion and still populate the
//! cache, but push nothing once the request is cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::channel::CancelHandle;
use super::strategy::{decode_tile, publish_tile, FetchContext, FetchStrategy, StrategyKind};
use super::tracker::CountdownGuard;
use crate::error::TileError;
use crate::io::{RequestBuilder, TileTransport};
use crate::tile::{FetchedTile, TileDecoder, TileImage, TileRequest};

/// Fetches misses with a bounded pool of blocking workers.
pub struct BlockingPoolFetchStrategy {
    transport: Arc<dyn TileTransport>,
}

impl BlockingPoolFetchStrategy {
    /// Create a strategy over a blocking transport.
    pub fn new(transport: Arc<dyn TileTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl FetchStrategy for BlockingPoolFetchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlockingPool
    }

    async fn dispatch(&self, work: Vec<TileRequest>, ctx: FetchContext) {
        let pool = Arc::new(Semaphore::new(ctx.config.pool_size.max(1)));
        debug!(
            tiles = work.len(),
            workers = ctx.config.pool_size.max(1),
            "dispatching to worker pool"
        );

        // Shut the pool once there is nothing left to accept.
        tokio::spawn({
            let pool = pool.clone();
            let cancel = ctx.publisher.cancel_handle();
            let tracker = ctx.tracker.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("bulk request cancelled, closing worker pool"),
                    _ = tracker.completed() => {}
                }
                pool.close();
            }
        });

        for request in work {
            let countdown = CountdownGuard::new(ctx.tracker.clone());
            let pool = pool.clone();
            let ctx = ctx.clone();
            let transport = self.transport.clone();

            tokio::spawn(async move {
                let _countdown = countdown;
                run_worker(request, pool, transport, ctx).await;
            });
        }
    }
}

/// Fetch one miss and publish it.
///
/// Cancellation is checked before the fetch and before the push. A tile whose
/// bytes already arrived is still decoded so the shared cache, and any waiter
/// from another request, receives it.
async fn run_worker(
    request: TileRequest,
    pool: Arc<Semaphore>,
    transport: Arc<dyn TileTransport>,
    ctx: FetchContext,
) {
    let key = request.key.clone();
    if ctx.publisher.is_cancelled() {
        return;
    }

    let fetch = || {
        fetch_blocking(
            request.clone(),
            pool.clone(),
            ctx.publisher.cancel_handle(),
            ctx.builder.clone(),
            transport.clone(),
            ctx.decoder.clone(),
            ctx.config.fetch_timeout,
        )
    };

    let result = match ctx.cache.get_or_try_insert_with(key.clone(), fetch).await {
        // Whoever was computing this key went away; compute it ourselves.
        Err(e) if e.is_leader_gone() && !ctx.publisher.is_cancelled() => {
            ctx.cache.get_or_try_insert_with(key.clone(), fetch).await
        }
        other => other,
    };

    match result {
        Ok(image) => publish_tile(&ctx, FetchedTile::from_network(key, image)).await,
        Err(TileError::Cancelled) => debug!(tile = %key, "worker pool closed, skipping"),
        Err(e) => warn!(tile = %key, error = %e, "tile fetch failed, skipping"),
    }
}

/// Build, execute and decode one tile, bounded by `timeout`.
///
/// The pool permit moves into the blocking task and is released only when
/// `execute` returns, so a timed-out fetch keeps its slot until the thread
/// is free again.
async fn fetch_blocking(
    request: TileRequest,
    pool: Arc<Semaphore>,
    cancel: CancelHandle,
    builder: Arc<dyn RequestBuilder>,
    transport: Arc<dyn TileTransport>,
    decoder: Arc<dyn TileDecoder>,
    timeout: Duration,
) -> Result<TileImage, TileError> {
    let permit = pool
        .acquire_owned()
        .await
        .map_err(|_| TileError::Cancelled)?;
    if cancel.is_cancelled() {
        return Err(TileError::Cancelled);
    }
    let http_request = builder.build(&request)?;

    let fetch = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        transport.execute(&http_request)
    });
    let bytes = match tokio::time::timeout(timeout, fetch).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(TileError::Transport(format!("fetch task failed: {}", e))),
        Err(_) => {
            return Err(TileError::Timeout {
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    };

    decode_tile(decoder, bytes, request.hints).await
}
