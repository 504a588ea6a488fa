//! Configuration management for the tile prefetcher.
//!
//! Two layers:
//! - [`FetchConfig`]: the library's knobs (channel size, timeouts, pool size),
//!   consumed by [`TileFetchCoordinator`](crate::fetch::TileFetchCoordinator)
//! - [`Config`]: the `tile-prefetch` command line, parsed by clap, which
//!   produces a `FetchConfig`
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use tile_prefetch::config::Config;
//!
//! let config = Config::parse();
//! config.validate()?;
//! let fetch = config.fetch_config();
//! println!("{} workers, {} tiles", fetch.pool_size, config.coords().len());
//! ```
//!
//! # Environment Variables
//!
//! All command-line options can be set via environment variables with the
//! `TILE_` prefix:
//!
//! - `TILE_URL_TEMPLATE` - Tile URL template (required)
//! - `TILE_PYRAMID` - Pyramid id (required)
//! - `TILE_MOSAIC` - Mosaic id (required)
//! - `TILE_MIN_COL` / `TILE_MAX_COL` - Column range, inclusive (default: 0..0)
//! - `TILE_MIN_ROW` / `TILE_MAX_ROW` - Row range, inclusive (default: 0..0)
//! - `TILE_FORMAT` - Requested image format hint
//! - `TILE_CACHE_TILES` - Max decoded tiles to cache (default: 1024)
//! - `TILE_CHANNEL_CAPACITY` - Output channel capacity (default: 1000)
//! - `TILE_PUSH_TIMEOUT_MS` - Per-attempt push timeout (default: 100)
//! - `TILE_FETCH_TIMEOUT_MS` - Per-tile fetch timeout (default: 30000)
//! - `TILE_WORKERS` - Worker pool size (default: 2 × CPU cores)
//! - `TILE_PIPELINED` - Prefer the pipelined strategy (default: false)
//! - `TILE_BEARER_TOKEN` - Bearer token sent with every request

use std::time::Duration;

use clap::Parser;

use crate::fetch::DEFAULT_CHANNEL_CAPACITY;
use crate::tile::{TileHints, DEFAULT_TILE_CACHE_CAPACITY, FORMAT_HINT};

// =============================================================================
// Default Values
// =============================================================================

/// Default per-attempt push timeout in milliseconds.
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 100;

/// Default per-tile fetch timeout in milliseconds.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Largest coordinate range the CLI accepts in one pass.
pub const MAX_TILES_PER_PASS: u64 = 1_000_000;

/// Default worker pool size: twice the available parallelism.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        * 2
}

// =============================================================================
// Fetch Configuration
// =============================================================================

/// Tuning for bulk fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Tiles the output channel buffers before producers wait
    pub channel_capacity: usize,

    /// How long one push attempt waits for channel space
    pub push_timeout: Duration,

    /// Upper bound on one tile's fetch; exceeding it fails the tile
    pub fetch_timeout: Duration,

    /// Concurrent blocking fetches per bulk request
    pub pool_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            pool_size: default_pool_size(),
        }
    }
}

impl FetchConfig {
    /// Set the output channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the per-attempt push timeout.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Set the per-tile fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the worker pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// tile-prefetch - Warm a tile cache from a remote tile server.
///
/// Fetches a rectangular range of tiles of one mosaic concurrently, decoding
/// each and reporting what arrived. Repeated passes are served from the cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-prefetch")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Source
    // =========================================================================
    /// Tile URL template, e.g. `http://host/{pyramid}/{mosaic}/{col}/{row}.{format}`.
    #[arg(long, env = "TILE_URL_TEMPLATE")]
    pub url_template: String,

    /// Pyramid identifier.
    #[arg(long, env = "TILE_PYRAMID")]
    pub pyramid: String,

    /// Mosaic (level) identifier.
    #[arg(long, env = "TILE_MOSAIC")]
    pub mosaic: String,

    /// Bearer token sent with every request. Disables the pipelined path.
    #[arg(long, env = "TILE_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    // =========================================================================
    // Tile Range
    // =========================================================================
    /// First column (inclusive).
    #[arg(long, default_value_t = 0, env = "TILE_MIN_COL", allow_negative_numbers = true)]
    pub min_col: i64,

    /// Last column (inclusive).
    #[arg(long, default_value_t = 0, env = "TILE_MAX_COL", allow_negative_numbers = true)]
    pub max_col: i64,

    /// First row (inclusive).
    #[arg(long, default_value_t = 0, env = "TILE_MIN_ROW", allow_negative_numbers = true)]
    pub min_row: i64,

    /// Last row (inclusive).
    #[arg(long, default_value_t = 0, env = "TILE_MAX_ROW", allow_negative_numbers = true)]
    pub max_row: i64,

    /// Image format hint (png, jpeg, ...).
    #[arg(long, env = "TILE_FORMAT")]
    pub format: Option<String>,

    // =========================================================================
    // Fetch Tuning
    // =========================================================================
    /// Maximum number of decoded tiles to cache.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "TILE_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Output channel capacity.
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY, env = "TILE_CHANNEL_CAPACITY")]
    pub channel_capacity: usize,

    /// Per-attempt push timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_PUSH_TIMEOUT_MS, env = "TILE_PUSH_TIMEOUT_MS")]
    pub push_timeout_ms: u64,

    /// Per-tile fetch timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_MS, env = "TILE_FETCH_TIMEOUT_MS")]
    pub fetch_timeout_ms: u64,

    /// Worker pool size (default: 2 × CPU cores).
    #[arg(long, env = "TILE_WORKERS")]
    pub workers: Option<usize>,

    /// Prefer the pipelined strategy when the server qualifies.
    #[arg(long, default_value_t = false, env = "TILE_PIPELINED")]
    pub pipelined: bool,

    /// Number of passes over the range; passes after the first hit the cache.
    #[arg(long, default_value_t = 1)]
    pub passes: u32,

    // =========================================================================
    // Output
    // =========================================================================
    /// Print the summary as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.url_template.is_empty() {
            return Err(
                "URL template is required. Set --url-template or TILE_URL_TEMPLATE".to_string(),
            );
        }
        if self.pyramid.is_empty() {
            return Err("Pyramid id is required. Set --pyramid or TILE_PYRAMID".to_string());
        }
        if self.mosaic.is_empty() {
            return Err("Mosaic id is required. Set --mosaic or TILE_MOSAIC".to_string());
        }

        if self.min_col > self.max_col {
            return Err("min_col must not exceed max_col".to_string());
        }
        if self.min_row > self.max_row {
            return Err("min_row must not exceed max_row".to_string());
        }
        if self.tile_count() > MAX_TILES_PER_PASS {
            return Err(format!(
                "tile range covers {} tiles; at most {} per pass",
                self.tile_count(),
                MAX_TILES_PER_PASS
            ));
        }

        if self.cache_tiles == 0 {
            return Err("cache_tiles must be greater than 0".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }
        if self.push_timeout_ms == 0 {
            return Err("push_timeout_ms must be greater than 0".to_string());
        }
        if self.fetch_timeout_ms == 0 {
            return Err("fetch_timeout_ms must be greater than 0".to_string());
        }
        if self.workers == Some(0) {
            return Err("workers must be greater than 0".to_string());
        }
        if self.passes == 0 {
            return Err("passes must be at least 1".to_string());
        }

        Ok(())
    }

    /// Number of tiles in the configured range.
    pub fn tile_count(&self) -> u64 {
        let span = |min: i64, max: i64| (max as i128 - min as i128 + 1).max(0) as u128;
        span(self.min_col, self.max_col)
            .checked_mul(span(self.min_row, self.max_row))
            .and_then(|count| u64::try_from(count).ok())
            .unwrap_or(u64::MAX)
    }

    /// Every `(col, row)` in the range, row by row.
    ///
    /// Call `validate()` first; the range is not bounded otherwise.
    pub fn coords(&self) -> Vec<(i64, i64)> {
        (self.min_row..=self.max_row)
            .flat_map(|row| (self.min_col..=self.max_col).map(move |col| (col, row)))
            .collect()
    }

    /// Hints attached to every request.
    pub fn hints(&self) -> TileHints {
        let mut hints = TileHints::new();
        if let Some(ref format) = self.format {
            hints.insert(FORMAT_HINT.to_string(), format.clone());
        }
        hints
    }

    /// Library fetch settings.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default()
            .with_channel_capacity(self.channel_capacity)
            .with_push_timeout(Duration::from_millis(self.push_timeout_ms))
            .with_fetch_timeout(Duration::from_millis(self.fetch_timeout_ms))
            .with_pool_size(self.workers.unwrap_or_else(default_pool_size))
    }
}

// =============================================================================
// Tests
// =============================================================================
