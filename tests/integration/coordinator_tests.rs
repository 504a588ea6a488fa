//! Coordinator integration tests.
//!
//! Tests verify:
//! - Overlapping bulk requests share fetches through the cache
//! - Malformed input fails fast, everything else terminates with a sentinel
//! - Key-based requests across mosaics

use std::sync::Arc;
use std::time::Duration;

use tile_prefetch::tile::{TileHints, TileKey};
use tile_prefetch::TileError;

use super::test_utils::{
    all_images_match, coordinator_with, delivered_cols, row_coords, test_fetch_config,
    MockTransport,
};

// =============================================================================
// Shared Fetches
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_requests_fetch_shared_keys_once() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let first = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..4), &TileHints::new(), false)
        .unwrap();
    let second = coordinator
        .fetch_tiles("osm", "7", &row_coords(2..6), &TileHints::new(), false)
        .unwrap();

    let (first, second) = tokio::join!(first.collect(), second.collect());

    assert!(first.sentinel_seen && second.sentinel_seen);
    assert_eq!(delivered_cols(&first), vec![0, 1, 2, 3]);
    assert_eq!(delivered_cols(&second), vec![2, 3, 4, 5]);
    assert!(all_images_match(&first));
    assert!(all_images_match(&second));

    assert_eq!(transport.calls(), 6);
    assert_eq!(transport.calls_for(2, 0), 1);
    assert_eq!(transport.calls_for(3, 0), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_requests_same_tiles() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(30)));
    let coordinator = Arc::new(coordinator_with(transport.clone(), 64, test_fetch_config()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .fetch_tiles("osm", "7", &row_coords(0..5), &TileHints::new(), false)
                .unwrap()
                .collect()
                .await
        }));
    }

    for handle in handles {
        let summary = handle.await.unwrap();
        assert!(summary.sentinel_seen);
        assert_eq!(delivered_cols(&summary), vec![0, 1, 2, 3, 4]);
    }
    assert_eq!(transport.calls(), 5);
    assert_eq!(coordinator.cache_stats().in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_leader_does_not_starve_other_request() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(80)));
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let first = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..4), &TileHints::new(), false)
        .unwrap();
    let second = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..4), &TileHints::new(), false)
        .unwrap();
    first.cancel();

    let (first, second) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(first.collect(), second.collect()) },
    )
    .await
    .unwrap();

    assert!(first.sentinel_seen);
    assert!(second.sentinel_seen);
    assert_eq!(delivered_cols(&second), vec![0, 1, 2, 3]);
}

// =============================================================================
// Boundary
// =============================================================================

#[tokio::test]
async fn test_empty_request_yields_only_sentinel() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let summary = coordinator
        .fetch_tiles("osm", "7", &[], &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.is_empty());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_invalid_ids_rejected() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport, 64, test_fetch_config());
    let hints = TileHints::new();

    let result = coordinator.fetch_tiles("", "7", &row_coords(0..2), &hints, false);
    assert!(matches!(result, Err(TileError::InvalidRequest(_))));

    let result = coordinator.fetch_tiles("osm", "", &row_coords(0..2), &hints, false);
    assert!(matches!(result, Err(TileError::InvalidRequest(_))));

    let keys = vec![TileKey::new("osm", "7", 0, 0), TileKey::new("osm", "", 1, 0)];
    let result = coordinator.fetch_keys(keys, &hints, false);
    assert!(matches!(result, Err(TileError::InvalidRequest(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_keys_across_mosaics() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let keys = vec![
        TileKey::new("osm", "7", 1, 1),
        TileKey::new("osm", "8", 1, 1),
        TileKey::new("osm", "7", 1, 1),
    ];
    let summary = coordinator
        .fetch_keys(keys, &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.tiles.len(), 2);
    let mut mosaics: Vec<&str> = summary
        .tiles
        .iter()
        .map(|t| t.key.mosaic_id.as_ref())
        .collect();
    mosaics.sort_unstable();
    assert_eq!(mosaics, vec!["7", "8"]);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_stream_does_not_hang_producers() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(10)));
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config());

    let stream = coordinator
        .fetch_tiles("osm", "7", &row_coords(0..10), &TileHints::new(), false)
        .unwrap();
    drop(stream);

    // Workers finish and populate the cache; nothing waits on the consumer.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.cache_stats().in_flight, 0);
    assert_eq!(coordinator.cache().len(), transport.calls());
}
