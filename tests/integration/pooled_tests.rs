//! Worker-pool fetch integration tests.
//!
//! Tests verify:
//! - Every requested tile arrives once, followed by one sentinel
//! - Cached tiles are served without touching the transport
//! - Failures and timeouts skip only the affected tile
//! - Cancellation still terminates the stream

use std::sync::Arc;
use std::time::Duration;

use tile_prefetch::fetch::ChannelItem;
use tile_prefetch::tile::{TileHints, TileKey, TileSource};

use super::test_utils::{
    all_images_match, coordinator_with, delivered_cols, is_tile, png_tile, row_coords,
    test_fetch_config, MockTransport,
};

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_tiles_all_succeed() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..5), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert_eq!(delivered_cols(&summary), vec![0, 1, 2, 3, 4]);
    assert_eq!(summary.fetched(), 5);
    assert!(all_images_match(&summary));
    assert_eq!(transport.calls(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sentinel_is_last() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(5)));
    let coordinator = coordinator_with(transport, 64, test_fetch_config());

    let mut stream = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..8), &TileHints::new(), false)
        .unwrap();

    let mut items = Vec::new();
    while let Some(item) = stream.take().await {
        items.push(item);
    }

    assert_eq!(items.len(), 9);
    assert!(items[..8].iter().all(is_tile));
    assert!(items[8].is_sentinel());
    assert!(stream.is_finished());
    assert!(stream.take().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_of_five_cached() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let decoded = |col: i64| {
        Arc::new(image::load_from_memory(&png_tile(col, 0)).unwrap())
    };
    for col in [0, 2, 4] {
        coordinator
            .cache()
            .put(TileKey::new("osm", "7", col, 0), decoded(col));
    }

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..5), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert_eq!(summary.tiles.len(), 5);
    assert_eq!(summary.cache_hits(), 3);
    assert_eq!(summary.fetched(), 2);
    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.calls_for(0, 0), 0);
    assert_eq!(transport.calls_for(1, 0), 1);

    let sources: Vec<(i64, TileSource)> = summary
        .tiles
        .iter()
        .map(|t| (t.key.col, t.source))
        .collect();
    for (col, source) in sources {
        let expected = if col % 2 == 0 {
            TileSource::Cache
        } else {
            TileSource::Network
        };
        assert_eq!(source, expected, "column {}", col);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_request_is_all_hits() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());
    let coords = row_coords(0..6);

    let first = coordinator
        .fetch_tiles("osm", "7", &coords, &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;
    assert_eq!(first.fetched(), 6);
    assert_eq!(transport.calls(), 6);

    let second = coordinator
        .fetch_tiles("osm", "7", &coords, &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(second.sentinel_seen);
    assert_eq!(second.cache_hits(), 6);
    assert_eq!(transport.calls(), 6);
    assert_eq!(coordinator.cache_stats().size, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_input_keys_delivered_once() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());
    let coords = vec![(3, 1), (4, 1), (3, 1), (3, 1), (4, 1)];

    let summary = coordinator
        .fetch_tiles("osm", "7", &coords, &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert_eq!(delivered_cols(&summary), vec![3, 4]);
    assert_eq!(transport.calls_for(3, 1), 1);
    assert_eq!(transport.calls_for(4, 1), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_channel_applies_backpressure() {
    let transport = Arc::new(MockTransport::new());
    let config = test_fetch_config().with_channel_capacity(2);
    let coordinator = coordinator_with(transport, 64, config);

    let mut stream = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..20), &TileHints::new(), false)
        .unwrap();

    // Let producers fill the channel and start retrying.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut tiles = 0;
    while let Some(item) = stream.take().await {
        if is_tile(&item) {
            tiles += 1;
        }
    }
    assert_eq!(tiles, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_smaller_than_batch() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport, 3, test_fetch_config());

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..10), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.tiles.len(), 10);
    assert!(all_images_match(&summary));
    assert_eq!(coordinator.cache_stats().size, 3);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_of_three_times_out() {
    let transport = Arc::new(MockTransport::new().with_slow_col(1, Duration::from_millis(600)));
    let config = test_fetch_config().with_fetch_timeout(Duration::from_millis(150));
    let coordinator = coordinator_with(transport, 64, config);

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..3), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert_eq!(delivered_cols(&summary), vec![0, 2]);
    assert!(!coordinator.cache().contains(&TileKey::new("osm", "7", 1, 0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_skips_only_that_tile() {
    let transport = Arc::new(MockTransport::new().with_failing_col(2));
    let coordinator = coordinator_with(transport, 64, test_fetch_config());

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..4), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert_eq!(delivered_cols(&summary), vec![0, 1, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_fail_still_terminates() {
    let mut transport = MockTransport::new();
    for col in 0..5 {
        transport = transport.with_failing_col(col);
    }
    let transport = Arc::new(transport);
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let summary = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..5), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.is_empty());
    assert_eq!(transport.calls(), 5);
    assert!(coordinator.cache().is_empty());

    // Failures are not cached; a retry fetches again.
    coordinator
        .fetch_tiles("osm", "7", &row_coords(0..5), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;
    assert_eq!(transport.calls(), 10);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_tiles_cancelled_immediately() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(20)));
    let coordinator = coordinator_with(transport.clone(), 256, test_fetch_config());

    let stream = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..100), &TileHints::new(), false)
        .unwrap();
    stream.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("sentinel within bound");

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.len() <= 100);
    assert!(transport.calls() < 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_fetch_stops_pushing() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(50)));
    let config = test_fetch_config().with_pool_size(2);
    let coordinator = coordinator_with(transport.clone(), 256, config);

    let mut stream = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..40), &TileHints::new(), false)
        .unwrap();

    let mut before_cancel = 0;
    if let Some(ChannelItem::Tile(_)) = stream.take().await {
        before_cancel += 1;
    }
    stream.cancel();

    let mut after_cancel = 0;
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = stream.take().await {
            if is_tile(&item) {
                after_cancel += 1;
            }
        }
    })
    .await;

    assert!(drained.is_ok());
    assert!(stream.is_finished());
    assert_eq!(before_cancel, 1);
    // At most the tiles already queued or in a worker's hands.
    assert!(after_cancel <= 3, "got {} tiles after cancel", after_cancel);
    assert!(transport.calls() < 40);
}
