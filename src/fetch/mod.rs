//! Concurrent bulk tile fetching.
//!
//! # Architecture
//!
//! ```text
//!  fetch_tiles(coords) ──► TileFetchCoordinator ──► TileStream ──► caller
//!                               │                      ▲
//!                 hits ─────────┤                      │ tiles, then sentinel
//!                               ▼                      │
//!                        select_strategy ──────────────┤
//!                         │            │               │
//!            BlockingPoolFetchStrategy  PipelinedFetchStrategy
//!             (spawn_blocking fetch)    (event-driven connections)
//!                         │            │
//!                         └─► FetchOutcomeTracker ──► sentinel
//! ```
//!
//! # Guarantees
//!
//! - Each tile is delivered at most once per bulk request.
//! - Exactly one sentinel ends every stream, after all tiles, including when
//!   the request is cancelled or every fetch fails.
//! - Per-tile failures are logged and skipped; they never fail the request.
//! - Concurrent requests for the same tile share one fetch through the cache.

mod channel;
mod coordinator;
mod pipelined;
mod pooled;
mod strategy;
mod tracker;

pub use channel::{
    cancellable_channel, CancelHandle, ChannelItem, FetchSummary, PushOutcome, SentinelSlot,
    TilePublisher, TileStream, DEFAULT_CHANNEL_CAPACITY,
};
pub use coordinator::{CoordinatorState, TileFetchCoordinator};
pub use pipelined::PipelinedFetchStrategy;
pub use pooled::BlockingPoolFetchStrategy;
pub use strategy::{select_strategy, FetchContext, FetchStrategy, StrategyKind};
pub use tracker::{CountdownGuard, FetchOutcomeTracker};
