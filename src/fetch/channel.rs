//! Cancellable, bounded output channel.
//!
//! Producers hold a [`TilePublisher`]; the caller holds the [`TileStream`].
//! Both share one cancellation flag. Cancelling never drains or closes the
//! queue: producers observe the flag and stop pushing, and the sentinel still
//! arrives so consumers always terminate.
//!
//! The sentinel has its own reserved slot ([`SentinelSlot`]), so delivering
//! it never waits for queue space and can happen at most once.

use std::time::Duration;

use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tile::FetchedTile;

/// Default number of tiles the channel buffers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// An item on the output channel.
#[derive(Debug, Clone)]
pub enum ChannelItem {
    /// A decoded tile
    Tile(FetchedTile),

    /// No more tiles will arrive
    Sentinel,
}

impl ChannelItem {
    /// Whether this is the terminal marker.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ChannelItem::Sentinel)
    }
}

/// Result of a single push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The tile was queued
    Pushed,

    /// No space became available within the timeout
    TimedOut,

    /// The request was cancelled; the tile was dropped
    Cancelled,

    /// The consumer is gone; the tile was dropped
    Closed,
}

/// Create a channel buffering up to `capacity` tiles (minimum 1).
pub fn cancellable_channel(capacity: usize) -> (TilePublisher, TileStream) {
    // One extra slot for the sentinel.
    let (sender, receiver) = mpsc::channel(capacity.max(1) + 1);
    let token = CancellationToken::new();

    (
        TilePublisher {
            sender,
            token: token.clone(),
        },
        TileStream {
            receiver,
            token,
            finished: false,
        },
    )
}

// =============================================================================
// Cancel Handle
// =============================================================================

/// Cloneable handle for cancelling a bulk request from anywhere.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the request. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Producer half of the output channel.
#[derive(Debug, Clone)]
pub struct TilePublisher {
    sender: mpsc::Sender<ChannelItem>,
    token: CancellationToken,
}

impl TilePublisher {
    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the request. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Handle sharing this channel's cancellation flag.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Reserve the sentinel's slot.
    ///
    /// Returns `None` if the consumer is already gone.
    pub async fn reserve_sentinel(&self) -> Option<SentinelSlot> {
        self.sender
            .clone()
            .reserve_owned()
            .await
            .ok()
            .map(|permit| SentinelSlot { permit })
    }

    /// Try once to queue `tile`, waiting up to `timeout` for space.
    pub async fn try_push(&self, tile: FetchedTile, timeout: Duration) -> PushOutcome {
        if self.token.is_cancelled() {
            return PushOutcome::Cancelled;
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => PushOutcome::Cancelled,
            reserved = tokio::time::timeout(timeout, self.sender.reserve()) => match reserved {
                Ok(Ok(permit)) => {
                    // Cancellation may have landed while we waited for space.
                    if self.token.is_cancelled() {
                        return PushOutcome::Cancelled;
                    }
                    permit.send(ChannelItem::Tile(tile));
                    PushOutcome::Pushed
                }
                Ok(Err(_)) => PushOutcome::Closed,
                Err(_) => PushOutcome::TimedOut,
            },
        }
    }

    /// Queue `tile`, waiting up to `timeout` for space.
    ///
    /// Returns whether the tile was queued.
    pub async fn push(&self, tile: FetchedTile, timeout: Duration) -> bool {
        self.try_push(tile, timeout).await == PushOutcome::Pushed
    }

    /// Queue `tile`, retrying in `wait`-sized steps until it is queued, the
    /// request is cancelled, or the consumer goes away.
    pub async fn push_with_backpressure(&self, tile: FetchedTile, wait: Duration) -> bool {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_push(tile.clone(), wait).await {
                PushOutcome::Pushed => return true,
                PushOutcome::TimedOut => {
                    debug!(tile = %tile.key, attempts, "output channel full, retrying");
                }
                PushOutcome::Cancelled | PushOutcome::Closed => return false,
            }
        }
    }
}

/// The reserved slot for the terminal marker.
///
/// Consumed by [`SentinelSlot::fire`], so a channel can carry at most one
/// sentinel.
#[derive(Debug)]
pub struct SentinelSlot {
    permit: OwnedPermit<ChannelItem>,
}

impl SentinelSlot {
    /// Deliver the sentinel. Never blocks.
    pub fn fire(self) {
        self.permit.send(ChannelItem::Sentinel);
    }
}

// =============================================================================
// Stream
// =============================================================================

/// Consumer half of the output channel, returned by the coordinator.
#[derive(Debug)]
pub struct TileStream {
    receiver: mpsc::Receiver<ChannelItem>,
    token: CancellationToken,
    finished: bool,
}

impl TileStream {
    /// Cancel the request. Idempotent; keep draining to reach the sentinel.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Handle sharing this stream's cancellation flag.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Whether the sentinel has been taken.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take the next item.
    ///
    /// Returns `None` once the sentinel has been taken, or if every producer
    /// went away without delivering one.
    pub async fn take(&mut self) -> Option<ChannelItem> {
        if self.finished {
            return None;
        }
        let item = self.receiver.recv().await;
        self.observe(item)
    }

    /// Take the next item, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout as well as in the cases [`take`](Self::take)
    /// does.
    pub async fn take_timeout(&mut self, timeout: Duration) -> Option<ChannelItem> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(item) => self.observe(item),
            Err(_) => None,
        }
    }

    /// Take the next item from synchronous code.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_take(&mut self) -> Option<ChannelItem> {
        if self.finished {
            return None;
        }
        let item = self.receiver.blocking_recv();
        self.observe(item)
    }

    /// Drain until the sentinel.
    pub async fn collect(mut self) -> FetchSummary {
        let mut tiles = Vec::new();
        while let Some(item) = self.take().await {
            if let ChannelItem::Tile(tile) = item {
                tiles.push(tile);
            }
        }
        FetchSummary {
            tiles,
            sentinel_seen: self.finished,
        }
    }

    fn observe(&mut self, item: Option<ChannelItem>) -> Option<ChannelItem> {
        match item {
            Some(ChannelItem::Sentinel) => {
                self.finished = true;
                Some(ChannelItem::Sentinel)
            }
            other => other,
        }
    }
}

/// Everything a drained stream delivered.
#[derive(Debug, Clone, Default)]
pub struct FetchSummary {
    /// Tiles in arrival order
    pub tiles: Vec<FetchedTile>,

    /// Whether the stream ended with a sentinel
    pub sentinel_seen: bool,
}

impl FetchSummary {
    /// Number of tiles served from the cache.
    pub fn cache_hits(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_cache_hit()).count()
    }

    /// Number of tiles obtained by fetching.
    pub fn fetched(&self) -> usize {
        self.tiles.len() - self.cache_hits()
    }
}
