//! Bulk tile fetch orchestration.
//!
//! The coordinator turns one bulk request into a [`TileStream`]: cached tiles
//! are pushed straight away, misses are handed to a fetch strategy, and the
//! sentinel follows the last outcome.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::channel::{cancellable_channel, TilePublisher, TileStream};
use super::pipelined::PipelinedFetchStrategy;
use super::pooled::BlockingPoolFetchStrategy;
use super::strategy::{select_strategy, FetchContext, FetchStrategy, StrategyKind};
use super::tracker::FetchOutcomeTracker;
use crate::config::FetchConfig;
use crate::error::TileError;
use crate::io::{PipelineFactory, RequestBuilder, TileTransport};
use crate::tile::{
    BoundedTileCache, CacheStats, FetchedTile, TileDecoder, TileHints, TileKey, TileRequest,
};

// =============================================================================
// Coordinator State
// =============================================================================

/// Lifecycle of one bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Splitting keys into cache hits and misses
    Partitioning,

    /// Handing misses to a strategy
    Dispatching,

    /// Waiting for outstanding fetches
    Draining,

    /// The sentinel has been delivered
    Done,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Partitioning => write!(f, "partitioning"),
            CoordinatorState::Dispatching => write!(f, "dispatching"),
            CoordinatorState::Draining => write!(f, "draining"),
            CoordinatorState::Done => write!(f, "done"),
        }
    }
}

// =============================================================================
// Tile Fetch Coordinator
// =============================================================================

/// Entry point for bulk tile fetches.
///
/// One coordinator is typically shared by every caller of a tile source, so
/// concurrent bulk requests share its cache and never fetch the same tile
/// twice at once.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tile_prefetch::config::FetchConfig;
/// use tile_prefetch::fetch::TileFetchCoordinator;
/// use tile_prefetch::io::{HttpTransport, UrlTemplateBuilder};
/// use tile_prefetch::tile::{BoundedTileCache, ImageTileDecoder, TileHints};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     // The blocking transport is created and dropped outside the runtime.
///     let builder = UrlTemplateBuilder::new("http://tiles.example.com/{mosaic}/{col}/{row}.png")?;
///     let transport = Arc::new(HttpTransport::with_timeout(Duration::from_secs(10))?);
///
///     let coordinator = TileFetchCoordinator::new(
///         Arc::new(BoundedTileCache::with_capacity(512)),
///         Arc::new(builder),
///         transport,
///         Arc::new(ImageTileDecoder::new()),
///         FetchConfig::default(),
///     );
///
///     let runtime = tokio::runtime::Runtime::new()?;
///     let summary = runtime.block_on(async {
///         let coords = [(0, 0), (0, 1), (1, 0), (1, 1)];
///         let stream = coordinator.fetch_tiles("osm", "4", &coords, &TileHints::new(), false)?;
///         Ok::<_, tile_prefetch::TileError>(stream.collect().await)
///     })?;
///     println!("{} tiles", summary.tiles.len());
///     Ok(())
/// }
/// ```
pub struct TileFetchCoordinator {
    cache: Arc<BoundedTileCache>,
    builder: Arc<dyn RequestBuilder>,
    transport: Arc<dyn TileTransport>,
    decoder: Arc<dyn TileDecoder>,
    pipeline: Option<Arc<dyn PipelineFactory>>,
    config: FetchConfig,
}

impl TileFetchCoordinator {
    /// Create a coordinator that fetches misses on the worker pool.
    pub fn new(
        cache: Arc<BoundedTileCache>,
        builder: Arc<dyn RequestBuilder>,
        transport: Arc<dyn TileTransport>,
        decoder: Arc<dyn TileDecoder>,
        config: FetchConfig,
    ) -> Self {
        Self {
            cache,
            builder,
            transport,
            decoder,
            pipeline: None,
            config,
        }
    }

    /// Enable the pipelined strategy over `factory` for callers that opt in.
    pub fn with_pipeline(mut self, factory: Arc<dyn PipelineFactory>) -> Self {
        self.pipeline = Some(factory);
        self
    }

    /// The shared tile cache.
    pub fn cache(&self) -> &Arc<BoundedTileCache> {
        &self.cache
    }

    /// Cache diagnostics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fetch settings.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch the tiles at `coords` of one mosaic.
    ///
    /// Returns immediately with a stream that yields each tile as it becomes
    /// available, then a sentinel. Tiles that fail to fetch or decode are
    /// logged and skipped. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::InvalidRequest`] for an empty pyramid or mosaic
    /// id, or when called outside a runtime.
    pub fn fetch_tiles(
        &self,
        pyramid_id: &str,
        mosaic_id: &str,
        coords: &[(i64, i64)],
        hints: &TileHints,
        prefer_pipelined: bool,
    ) -> Result<TileStream, TileError> {
        let pyramid: Arc<str> = Arc::from(pyramid_id);
        let mosaic: Arc<str> = Arc::from(mosaic_id);
        // Checked up front so that an empty coordinate list is rejected too.
        TileKey::new(pyramid.clone(), mosaic.clone(), 0, 0).validate()?;

        let keys = coords
            .iter()
            .map(|&(col, row)| TileKey::new(pyramid.clone(), mosaic.clone(), col, row));
        self.fetch_keys(keys, hints, prefer_pipelined)
    }

    /// Fetch an arbitrary set of tiles, possibly across mosaics.
    ///
    /// Duplicate keys are fetched and delivered once.
    pub fn fetch_keys(
        &self,
        keys: impl IntoIterator<Item = TileKey>,
        hints: &TileHints,
        prefer_pipelined: bool,
    ) -> Result<TileStream, TileError> {
        let mut seen = HashSet::new();
        let mut requests = Vec::new();
        for key in keys {
            key.validate()?;
            if seen.insert(key.clone()) {
                requests.push(TileRequest::with_hints(key, hints.clone()));
            }
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TileError::InvalidRequest("tile fetches must be started within a tokio runtime".into())
        })?;

        let (publisher, stream) = cancellable_channel(self.config.channel_capacity);
        let job = BulkFetch {
            cache: self.cache.clone(),
            builder: self.builder.clone(),
            transport: self.transport.clone(),
            decoder: self.decoder.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            requests,
            prefer_pipelined,
        };
        runtime.spawn(job.run(publisher));

        Ok(stream)
    }
}

// =============================================================================
// Bulk Fetch
// =============================================================================

/// One bulk request, owned by its driving task.
struct BulkFetch {
    cache: Arc<BoundedTileCache>,
    builder: Arc<dyn RequestBuilder>,
    transport: Arc<dyn TileTransport>,
    decoder: Arc<dyn TileDecoder>,
    pipeline: Option<Arc<dyn PipelineFactory>>,
    config: FetchConfig,
    requests: Vec<TileRequest>,
    prefer_pipelined: bool,
}

fn enter(state: CoordinatorState, tiles: usize) {
    debug!(state = %state, tiles, "bulk fetch state");
}

impl BulkFetch {
    async fn run(mut self, publisher: TilePublisher) {
        let Some(sentinel) = publisher.reserve_sentinel().await else {
            debug!("tile stream dropped before the fetch started");
            return;
        };

        if publisher.is_cancelled() {
            enter(CoordinatorState::Done, 0);
            sentinel.fire();
            return;
        }

        enter(CoordinatorState::Partitioning, self.requests.len());
        let requests = std::mem::take(&mut self.requests);
        let mut misses = Vec::new();
        for request in requests {
            match self.cache.get(&request.key) {
                Some(image) => {
                    debug!(tile = %request.key, "cache hit");
                    publisher
                        .push_with_backpressure(
                            FetchedTile::from_cache(request.key, image),
                            self.config.push_timeout,
                        )
                        .await;
                }
                None => {
                    debug!(tile = %request.key, "cache miss");
                    misses.push(request);
                }
            }
        }

        if misses.is_empty() || publisher.is_cancelled() {
            enter(CoordinatorState::Done, 0);
            sentinel.fire();
            return;
        }

        enter(CoordinatorState::Dispatching, misses.len());
        let strategy = self.strategy_for(&misses[0]);
        debug!(strategy = %strategy.kind(), misses = misses.len(), "strategy selected");

        let tracker = Arc::new(FetchOutcomeTracker::new(misses.len(), move || {
            sentinel.fire()
        }));
        let ctx = FetchContext {
            cache: self.cache.clone(),
            builder: self.builder.clone(),
            decoder: self.decoder.clone(),
            publisher,
            tracker: tracker.clone(),
            config: self.config.clone(),
        };
        let outstanding = misses.len();
        strategy.dispatch(misses, ctx).await;

        enter(CoordinatorState::Draining, outstanding);
        tracker.completed().await;
        enter(CoordinatorState::Done, 0);
    }

    /// Pick the strategy for this request's misses, probing the first one to
    /// learn the destination scheme and credentials.
    fn strategy_for(&self, probe: &TileRequest) -> Box<dyn FetchStrategy> {
        let kind = match (&self.pipeline, self.builder.build(probe)) {
            (Some(factory), Ok(request)) => select_strategy(
                self.prefer_pipelined,
                self.transport.is_plain_unauthenticated() && !request.has_credentials(),
                request.scheme(),
                Some(factory.supported_scheme()),
            ),
            // An unbuildable request fails per tile on the pool.
            _ => StrategyKind::BlockingPool,
        };

        match (kind, &self.pipeline) {
            (StrategyKind::Pipelined, Some(factory)) => {
                Box::new(PipelinedFetchStrategy::new(factory.clone()))
            }
            _ => Box::new(BlockingPoolFetchStrategy::new(self.transport.clone())),
        }
    }
}
