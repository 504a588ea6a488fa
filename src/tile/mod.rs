//! Tile data model, cache and codec boundary.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          TileFetchCoordinator           │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │  ┌──────────────────┐ ┌──────────────┐  │
//! │  │ BoundedTileCache │ │ TileDecoder  │  │
//! │  │ (decoded tiles,  │ │ (bytes →     │  │
//! │  │  compute-once)   │ │  image)      │  │
//! │  └──────────────────┘ └──────────────┘  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileKey`]: Composite key for tile identification (pyramid, mosaic, col, row)
//! - [`TileRequest`]: A key plus opaque rendering hints
//! - [`FetchedTile`]: A decoded tile as delivered to the caller
//! - [`BoundedTileCache`]: LRU cache of decoded tiles with per-key compute-once
//! - [`TileDecoder`] / [`ImageTileDecoder`]: Codec boundary

mod cache;
mod decoder;
mod key;

pub use cache::{
    BoundedTileCache, CacheClaim, CacheStats, FlightGuard, FlightWaiter,
    DEFAULT_TILE_CACHE_CAPACITY,
};
pub use decoder::{format_from_hint, ImageTileDecoder, TileDecoder};
pub use key::{
    FetchedTile, TileHints, TileImage, TileKey, TileRequest, TileSource, FORMAT_HINT,
};
