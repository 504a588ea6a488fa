//! Tile identity and request types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;

use crate::error::TileError;

/// A decoded tile image, shared between the cache and every consumer.
pub type TileImage = Arc<DynamicImage>;

/// Opaque rendering hints passed through to the request builder and decoder.
///
/// Ordered so that the same hints always render the same URL.
pub type TileHints = BTreeMap<String, String>;

/// Hint key naming the requested image format (e.g. `png`, `jpeg`).
pub const FORMAT_HINT: &str = "format";

// =============================================================================
// Tile Key
// =============================================================================

/// Identifies one tile of one mosaic level of one pyramid.
///
/// Used as the cache key and as the correlation key for fetch outcomes.
/// Two keys are equal iff all four fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileKey {
    /// Pyramid identifier
    pub pyramid_id: Arc<str>,

    /// Mosaic (level) identifier within the pyramid
    pub mosaic_id: Arc<str>,

    /// Tile column
    pub col: i64,

    /// Tile row
    pub row: i64,
}

impl TileKey {
    /// Create a new tile key.
    pub fn new(
        pyramid_id: impl Into<Arc<str>>,
        mosaic_id: impl Into<Arc<str>>,
        col: i64,
        row: i64,
    ) -> Self {
        Self {
            pyramid_id: pyramid_id.into(),
            mosaic_id: mosaic_id.into(),
            col,
            row,
        }
    }

    /// Reject keys that could never address a tile.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.pyramid_id.is_empty() {
            return Err(TileError::InvalidRequest(format!(
                "empty pyramid id for tile ({}, {})",
                self.col, self.row
            )));
        }
        if self.mosaic_id.is_empty() {
            return Err(TileError::InvalidRequest(format!(
                "empty mosaic id for tile ({}, {}) of pyramid {}",
                self.col, self.row, self.pyramid_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pyramid_id, self.mosaic_id, self.col, self.row
        )
    }
}

// =============================================================================
// Tile Request
// =============================================================================

/// Everything needed to build a fetch request for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    /// The tile being requested
    pub key: TileKey,

    /// Rendering hints, passed through unmodified
    pub hints: TileHints,
}

impl TileRequest {
    /// Create a request with no hints.
    pub fn new(key: TileKey) -> Self {
        Self {
            key,
            hints: TileHints::new(),
        }
    }

    /// Create a request carrying the given hints.
    pub fn with_hints(key: TileKey, hints: TileHints) -> Self {
        Self { key, hints }
    }

    /// The requested format, if hinted.
    pub fn format(&self) -> Option<&str> {
        self.hints.get(FORMAT_HINT).map(String::as_str)
    }
}

// =============================================================================
// Fetched Tile
// =============================================================================

/// Where a delivered tile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileSource {
    /// Served from the tile cache without a fetch
    Cache,

    /// Fetched and decoded during this bulk request (or awaited from a
    /// concurrent fetch of the same key)
    Network,
}

/// The unit delivered on the output channel.
#[derive(Debug, Clone)]
pub struct FetchedTile {
    /// The tile key
    pub key: TileKey,

    /// Decoded image
    pub image: TileImage,

    /// Whether this was a cache hit
    pub source: TileSource,
}

impl FetchedTile {
    /// Create a tile delivered from the cache.
    pub fn from_cache(key: TileKey, image: TileImage) -> Self {
        Self {
            key,
            image,
            source: TileSource::Cache,
        }
    }

    /// Create a tile delivered from a fetch.
    pub fn from_network(key: TileKey, image: TileImage) -> Self {
        Self {
            key,
            image,
            source: TileSource::Network,
        }
    }

    /// Whether this tile was a cache hit.
    pub fn is_cache_hit(&self) -> bool {
        self.source == TileSource::Cache
    }
}
