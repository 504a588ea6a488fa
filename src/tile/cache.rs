//! Bounded cache for decoded tiles.
//!
//! This module provides an LRU cache for decoded tile images with
//! compute-once semantics: concurrent requests for the same missing tile
//! share a single computation.
//!
//! # Eviction
//!
//! Capacity is a fixed number of entries. Once full, inserting a new key
//! evicts the least-recently-used entry. `get` and successful computations
//! count as uses; `contains` and `peek`-style introspection do not.
//!
//! # In-Flight Tracking
//!
//! In-flight computations live in a sharded map beside the LRU, never inside
//! it, so eviction cannot interrupt a computation and a reader never observes
//! a partially computed value. The first caller for a missing key becomes the
//! leader and receives a [`FlightGuard`]; later callers become waiters and
//! receive the leader's result (success or error) through a broadcast.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::TileError;

use super::key::{TileImage, TileKey};

/// Default cache capacity in tiles.
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 1024;

/// Only the single completion message ever travels on a flight channel.
const FLIGHT_CHANNEL_CAPACITY: usize = 1;

type FlightResult = Result<TileImage, TileError>;
type FlightMap = DashMap<TileKey, broadcast::Sender<FlightResult>>;

// =============================================================================
// Cache Stats
// =============================================================================

/// Diagnostic snapshot of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cached tiles
    pub size: usize,

    /// Maximum number of cached tiles
    pub capacity: usize,

    /// Number of keys currently being computed
    pub in_flight: usize,
}

// =============================================================================
// Claims
// =============================================================================

/// Outcome of claiming a key.
pub enum CacheClaim {
    /// The tile is cached.
    Hit(TileImage),

    /// The caller owns the computation and must complete the guard.
    Leader(FlightGuard),

    /// Another caller is computing this key.
    Waiter(FlightWaiter),
}

/// Ownership of one in-flight computation.
///
/// Completing the guard stores a successful result, releases the in-flight
/// marker and wakes every waiter. Dropping it uncompleted releases the marker
/// and hands waiters [`TileError::Abandoned`].
pub struct FlightGuard {
    key: TileKey,
    sender: broadcast::Sender<FlightResult>,
    entries: Arc<Mutex<LruCache<TileKey, TileImage>>>,
    in_flight: Arc<FlightMap>,
    completed: bool,
}

impl FlightGuard {
    /// The key this guard computes.
    pub fn key(&self) -> &TileKey {
        &self.key
    }

    /// Publish the result of the computation and return it.
    pub fn complete(mut self, result: FlightResult) -> FlightResult {
        self.finish(result.clone());
        result
    }

    fn finish(&mut self, result: FlightResult) {
        // Store before releasing the marker so that a caller arriving between
        // the two steps finds the entry rather than starting a new flight.
        if let Ok(ref image) = result {
            self.entries.lock().put(self.key.clone(), image.clone());
        }
        self.in_flight.remove(&self.key);
        // No receivers is fine: nobody was waiting.
        let _ = self.sender.send(result);
        self.completed = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.finish(Err(TileError::Abandoned));
        }
    }
}

/// A subscription to another caller's in-flight computation.
pub struct FlightWaiter {
    receiver: broadcast::Receiver<FlightResult>,
}

impl FlightWaiter {
    /// Wait for the leader's result.
    pub async fn wait(mut self) -> FlightResult {
        match self.receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(TileError::Abandoned),
        }
    }
}

// =============================================================================
// Bounded Tile Cache
// =============================================================================

/// Fixed-capacity LRU cache of decoded tiles with per-key compute-once.
///
/// # Thread Safety
///
/// The cache is shared across bulk requests via `Arc`. The LRU sits behind a
/// mutex that is only held for O(1) operations; in-flight markers live in a
/// sharded map, so claiming unrelated keys never contends on a global lock.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use image::DynamicImage;
/// use tile_prefetch::tile::{BoundedTileCache, TileKey};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = BoundedTileCache::with_capacity(100);
///     let key = TileKey::new("osm", "z3", 1, 2);
///
///     let image = cache
///         .get_or_try_insert_with(key.clone(), || async {
///             Ok(Arc::new(DynamicImage::new_rgb8(256, 256)))
///         })
///         .await
///         .unwrap();
///
///     assert_eq!(image.width(), 256);
///     assert!(cache.contains(&key));
/// }
/// ```
pub struct BoundedTileCache {
    entries: Arc<Mutex<LruCache<TileKey, TileImage>>>,
    in_flight: Arc<FlightMap>,
    capacity: usize,
}

impl BoundedTileCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `capacity` tiles (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            in_flight: Arc::new(DashMap::new()),
            capacity: capacity.get(),
        }
    }

    /// Get a tile, marking it as recently used.
    pub fn get(&self, key: &TileKey) -> Option<TileImage> {
        self.entries.lock().get(key).cloned()
    }

    /// Check if a tile is cached without updating LRU order.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.lock().contains(key)
    }

    /// Store a tile directly, bypassing in-flight tracking.
    pub fn put(&self, key: TileKey, image: TileImage) {
        self.entries.lock().put(key, image);
    }

    /// Remove a tile, returning it if it was cached.
    pub fn remove(&self, key: &TileKey) -> Option<TileImage> {
        self.entries.lock().pop(key)
    }

    /// Drop every cached tile. In-flight computations are unaffected.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no tiles.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of cached tiles.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys currently being computed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Diagnostic snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            in_flight: self.in_flight_count(),
        }
    }

    /// Claim a key: a hit, the right to compute it, or a place in line
    /// behind whoever is computing it.
    pub fn claim(&self, key: &TileKey) -> CacheClaim {
        if let Some(image) = self.get(key) {
            return CacheClaim::Hit(image);
        }

        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => CacheClaim::Waiter(FlightWaiter {
                receiver: occupied.get().subscribe(),
            }),
            Entry::Vacant(vacant) => {
                // A leader may have stored and released between our first
                // look and taking the entry.
                if let Some(image) = self.get(key) {
                    return CacheClaim::Hit(image);
                }

                let (sender, _) = broadcast::channel(FLIGHT_CHANNEL_CAPACITY);
                vacant.insert(sender.clone());

                CacheClaim::Leader(FlightGuard {
                    key: key.clone(),
                    sender,
                    entries: Arc::clone(&self.entries),
                    in_flight: Arc::clone(&self.in_flight),
                    completed: false,
                })
            }
        }
    }

    /// Return the cached tile, or compute it at most once across all
    /// concurrent callers.
    ///
    /// Callers that arrive while another caller is computing the same key
    /// wait and receive that caller's result without running `compute`. A
    /// failed computation stores nothing; the next call may retry.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        key: TileKey,
        compute: F,
    ) -> Result<TileImage, TileError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TileImage, TileError>>,
    {
        match self.claim(&key) {
            CacheClaim::Hit(image) => Ok(image),
            CacheClaim::Waiter(waiter) => waiter.wait().await,
            CacheClaim::Leader(guard) => {
                let result = compute().await;
                guard.complete(result)
            }
        }
    }
}

impl Default for BoundedTileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
