//! Countdown of outstanding fetches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

type Callback = Box<dyn FnOnce() + Send>;

/// Counts outstanding fetches down to zero and fires a completion callback
/// exactly once.
///
/// The caller whose decrement takes the count to zero runs the callback, so
/// two concurrent "last" workers can never both fire it. A tracker created
/// with zero outstanding fetches fires immediately, inside `new`.
pub struct FetchOutcomeTracker {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Callback>>,
    done: CancellationToken,
}

impl FetchOutcomeTracker {
    /// Create a tracker for `outstanding` fetches.
    pub fn new(outstanding: usize, on_complete: impl FnOnce() + Send + 'static) -> Self {
        let tracker = Self {
            remaining: AtomicUsize::new(outstanding),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
            done: CancellationToken::new(),
        };
        if outstanding == 0 {
            tracker.fire();
        }
        tracker
    }

    /// Record one finished fetch.
    ///
    /// Returns `true` for the call that completed the tracker.
    pub fn count_down(&self) -> bool {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.fire();
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("count_down on a completed fetch tracker ignored");
                false
            }
        }
    }

    /// Fetches still outstanding.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Whether the completion callback has fired.
    pub fn is_complete(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the completion callback has fired.
    pub async fn completed(&self) {
        self.done.cancelled().await
    }

    fn fire(&self) {
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        self.done.cancel();
    }
}

/// Counts down its tracker when dropped, so a worker that returns early,
/// panics or is aborted still accounts for its fetch.
pub struct CountdownGuard {
    tracker: Option<Arc<FetchOutcomeTracker>>,
}

impl CountdownGuard {
    /// Guard one outstanding fetch of `tracker`.
    pub fn new(tracker: Arc<FetchOutcomeTracker>) -> Self {
        Self {
            tracker: Some(tracker),
        }
    }

    /// Release the guard without counting down; the fetch has been handed
    /// to someone else who will.
    pub fn disarm(mut self) {
        self.tracker.take();
    }
}

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.count_down();
        }
    }
}
