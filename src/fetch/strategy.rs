//! Fetch strategy seam and selection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::channel::TilePublisher;
use super::tracker::FetchOutcomeTracker;
use crate::config::FetchConfig;
use crate::error::TileError;
use crate::io::RequestBuilder;
use crate::tile::{BoundedTileCache, FetchedTile, TileDecoder, TileHints, TileImage, TileRequest};

/// Which strategy handles a bulk request's cache misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Bounded worker pool doing blocking fetches
    BlockingPool,

    /// One event-driven connection per tile
    Pipelined,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::BlockingPool => write!(f, "blocking-pool"),
            StrategyKind::Pipelined => write!(f, "pipelined"),
        }
    }
}

/// Pick a strategy.
///
/// Pipelined only when the caller opted in, the connection is plain and
/// unauthenticated, and a pipeline exists for the destination's scheme.
pub fn select_strategy(
    prefer_pipelined: bool,
    plain_unauthenticated: bool,
    destination_scheme: &str,
    pipeline_scheme: Option<&str>,
) -> StrategyKind {
    match pipeline_scheme {
        Some(scheme)
            if prefer_pipelined
                && plain_unauthenticated
                && scheme.eq_ignore_ascii_case(destination_scheme) =>
        {
            StrategyKind::Pipelined
        }
        _ => StrategyKind::BlockingPool,
    }
}

/// Everything a strategy needs for one bulk request.
#[derive(Clone)]
pub struct FetchContext {
    /// Shared tile cache
    pub cache: Arc<BoundedTileCache>,

    /// Request builder
    pub builder: Arc<dyn RequestBuilder>,

    /// Codec
    pub decoder: Arc<dyn TileDecoder>,

    /// Output channel
    pub publisher: TilePublisher,

    /// Outstanding-fetch countdown; completing it delivers the sentinel
    pub tracker: Arc<FetchOutcomeTracker>,

    /// Timeouts and pool sizing
    pub config: FetchConfig,
}

/// Fetches a bulk request's cache misses.
///
/// `dispatch` hands the work off and returns; completion is signalled only
/// through the tracker. Every request in `work` must be counted down exactly
/// once, whatever happens to it.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Start fetching `work`.
    async fn dispatch(&self, work: Vec<TileRequest>, ctx: FetchContext);
}

/// Decode on the blocking thread pool.
pub(crate) async fn decode_tile(
    decoder: Arc<dyn TileDecoder>,
    bytes: Bytes,
    hints: TileHints,
) -> Result<TileImage, TileError> {
    tokio::task::spawn_blocking(move || decoder.decode(&bytes, &hints).map(Arc::new))
        .await
        .map_err(|e| TileError::Decode {
            message: format!("decode task failed: {}", e),
        })?
}

/// Push a tile, riding out backpressure until it lands or the request is
/// cancelled.
pub(crate) async fn publish_tile(ctx: &FetchContext, tile: FetchedTile) {
    let key = tile.key.clone();
    if !ctx
        .publisher
        .push_with_backpressure(tile, ctx.config.push_timeout)
        .await
    {
        debug!(tile = %key, "push abandoned");
    }
}
