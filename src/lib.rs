//! # tile-prefetch
//!
//! A bounded tile cache and concurrent prefetch pipeline for raster map
//! pyramids.
//!
//! Given a set of tile coordinates, the pipeline returns decoded tiles as
//! they become available on a cancellable, backpressured stream that always
//! ends with exactly one sentinel.
//!
//! ## Features
//!
//! - **Compute-once caching**: concurrent requests for the same tile share a
//!   single fetch and decode
//! - **Two fetch strategies**: a bounded blocking worker pool, or an
//!   event-driven pipeline over plain unauthenticated HTTP
//! - **Deterministic termination**: every bulk request ends with one
//!   sentinel, whether tiles succeed, fail, or the caller cancels
//! - **Failure isolation**: a tile that fails to fetch or decode is logged
//!   and skipped
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tile`] - Tile keys, the bounded cache, and decoding
//! - [`io`] - Request building and the blocking and pipelined transports
//! - [`fetch`] - Output channel, outcome tracking, strategies, and the coordinator
//! - [`config`] - Fetch tuning and CLI configuration
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_prefetch::{
//!     BoundedTileCache, FetchConfig, HttpTransport, ImageTileDecoder, TileFetchCoordinator,
//!     TileHints, UrlTemplateBuilder,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = TileFetchCoordinator::new(
//!         Arc::new(BoundedTileCache::with_capacity(1024)),
//!         Arc::new(UrlTemplateBuilder::new("http://tiles.example.com/{mosaic}/{col}/{row}.png")?),
//!         Arc::new(HttpTransport::new()?),
//!         Arc::new(ImageTileDecoder::new()),
//!         FetchConfig::default(),
//!     );
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(async {
//!         let mut stream = coordinator.fetch_tiles("osm", "6", &[(10, 20), (11, 20)], &TileHints::new(), false)?;
//!         while let Some(item) = stream.take().await {
//!             println!("{:?}", item.is_sentinel());
//!         }
//!         Ok::<_, tile_prefetch::TileError>(())
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod io;
pub mod tile;

// Re-export commonly used types
pub use config::{Config, FetchConfig};
pub use error::{TileError, TransportError};
pub use fetch::{
    select_strategy, BlockingPoolFetchStrategy, CancelHandle, ChannelItem, CoordinatorState,
    FetchOutcomeTracker, FetchStrategy, FetchSummary, PipelinedFetchStrategy, StrategyKind,
    TileFetchCoordinator, TileStream, DEFAULT_CHANNEL_CAPACITY,
};
pub use io::{
    ConnectionEvent, ConnectionId, HttpPipelineFactory, HttpTransport, PipelineFactory,
    RequestBuilder, TileHttpRequest, TileTransport, UrlTemplateBuilder,
};
pub use tile::{
    BoundedTileCache, CacheStats, FetchedTile, ImageTileDecoder, TileDecoder, TileHints,
    TileImage, TileKey, TileRequest, TileSource, DEFAULT_TILE_CACHE_CAPACITY,
};
