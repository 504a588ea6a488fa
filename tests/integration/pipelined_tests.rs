//! Pipelined fetch integration tests.
//!
//! Tests verify:
//! - Fixed-length, chunked and close-delimited bodies are reassembled
//! - A truncated body fails only its tile
//! - Cancelling mid-stream closes every connection and still terminates
//! - The pipeline is only used when the caller opts in over a plain connection

use std::sync::Arc;
use std::time::Duration;

use tile_prefetch::fetch::FetchSummary;
use tile_prefetch::io::{PipelineFactory, UrlTemplateBuilder};
use tile_prefetch::tile::{BoundedTileCache, ImageTileDecoder, TileHints};
use tile_prefetch::TileFetchCoordinator;

use super::test_utils::{
    all_images_match, coordinator_with, delivered_cols, row_coords, test_fetch_config, BodyMode,
    MockPipelineFactory, MockTransport,
};

async fn fetch_pipelined(
    mode: BodyMode,
    tiles: i64,
) -> (FetchSummary, Arc<MockPipelineFactory>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(mode);
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config())
        .with_pipeline(factory.clone());

    let summary = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..tiles), &TileHints::new(), true)
        .unwrap()
        .collect()
        .await;
    (summary, factory, transport)
}

// =============================================================================
// Framing
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_length_bodies() {
    let (summary, factory, transport) = fetch_pipelined(BodyMode::Fixed, 6).await;

    assert!(summary.sentinel_seen);
    assert_eq!(delivered_cols(&summary), vec![0, 1, 2, 3, 4, 5]);
    assert!(all_images_match(&summary));
    assert_eq!(factory.opened(), 6);
    assert_eq!(factory.open_connections(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunked_bodies() {
    let (summary, factory, _) = fetch_pipelined(BodyMode::Chunked, 4).await;

    assert!(summary.sentinel_seen);
    assert_eq!(delivered_cols(&summary), vec![0, 1, 2, 3]);
    assert!(all_images_match(&summary));
    assert_eq!(factory.closed(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_delimited_bodies() {
    let (summary, _, _) = fetch_pipelined(BodyMode::CloseDelimited, 3).await;

    assert!(summary.sentinel_seen);
    assert_eq!(summary.fetched(), 3);
    assert!(all_images_match(&summary));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncated_bodies_fail() {
    let (summary, factory, _) = fetch_pipelined(BodyMode::Truncated, 3).await;

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.is_empty());
    assert_eq!(factory.open_connections(), 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_stream() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Stall);
    let coordinator = coordinator_with(transport, 64, test_fetch_config())
        .with_pipeline(factory.clone());

    let stream = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..10), &TileHints::new(), true)
        .unwrap();

    // Wait for every connection to be mid-body.
    let opened = tokio::time::timeout(Duration::from_secs(5), async {
        while factory.opened() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(opened.is_ok());
    tokio::time::sleep(Duration::from_millis(20)).await;

    stream.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("sentinel after cancel");

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.is_empty());
    assert_eq!(factory.open_connections(), 0);
    assert_eq!(factory.closed(), 10);
    assert_eq!(coordinator.cache_stats().in_flight, 0);
    assert_eq!(coordinator.cache_stats().size, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_connections_time_out() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Stall);
    let config = test_fetch_config().with_fetch_timeout(Duration::from_millis(150));
    let coordinator = coordinator_with(transport, 64, config).with_pipeline(factory.clone());

    let stream = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..4), &TileHints::new(), true)
        .unwrap();

    // Nobody cancels; the fetch timeout alone must end the request.
    let summary = tokio::time::timeout(Duration::from_secs(3), stream.collect())
        .await
        .expect("sentinel after fetch timeout");

    assert!(summary.sentinel_seen);
    assert!(summary.tiles.is_empty());
    assert_eq!(factory.opened(), 4);
    assert_eq!(factory.closed(), 4);
    assert_eq!(factory.open_connections(), 0);
    assert_eq!(coordinator.cache_stats().in_flight, 0);
    assert_eq!(coordinator.cache_stats().size, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_before_start() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Fixed);
    let coordinator = coordinator_with(transport, 64, test_fetch_config())
        .with_pipeline(factory.clone());

    let stream = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..10), &TileHints::new(), true)
        .unwrap();
    stream.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .unwrap();

    assert!(summary.sentinel_seen);
    assert_eq!(factory.open_connections(), 0);
}

// =============================================================================
// Strategy Selection
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_not_opted_in_uses_pool() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Fixed);
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config())
        .with_pipeline(factory.clone());

    let summary = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..3), &TileHints::new(), false)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.fetched(), 3);
    assert_eq!(factory.opened(), 0);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_authenticated_transport_uses_pool() {
    let transport = Arc::new(MockTransport::new().authenticated());
    let factory = MockPipelineFactory::new(BodyMode::Fixed);
    let coordinator = coordinator_with(transport.clone(), 64, test_fetch_config())
        .with_pipeline(factory.clone());

    let summary = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..3), &TileHints::new(), true)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.fetched(), 3);
    assert_eq!(factory.opened(), 0);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bearer_header_uses_pool() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Fixed);
    let builder = UrlTemplateBuilder::new(super::test_utils::TEST_TEMPLATE)
        .unwrap()
        .with_bearer_token("secret")
        .unwrap();
    let coordinator = TileFetchCoordinator::new(
        Arc::new(BoundedTileCache::with_capacity(64)),
        Arc::new(builder),
        transport.clone(),
        Arc::new(ImageTileDecoder::new()),
        test_fetch_config(),
    )
    .with_pipeline(factory.clone());

    let summary = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..3), &TileHints::new(), true)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.fetched(), 3);
    assert_eq!(factory.opened(), 0);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheme_mismatch_uses_pool() {
    let transport = Arc::new(MockTransport::new());
    let factory = MockPipelineFactory::new(BodyMode::Fixed);
    let builder =
        UrlTemplateBuilder::new("https://tiles.test/{pyramid}/{mosaic}/{col}/{row}.png").unwrap();
    let coordinator = TileFetchCoordinator::new(
        Arc::new(BoundedTileCache::with_capacity(64)),
        Arc::new(builder),
        transport.clone(),
        Arc::new(ImageTileDecoder::new()),
        test_fetch_config(),
    )
    .with_pipeline(factory.clone());

    let summary = coordinator
        .fetch_tiles("osm", "9", &row_coords(0..2), &TileHints::new(), true)
        .unwrap()
        .collect()
        .await;

    assert_eq!(summary.fetched(), 2);
    assert_eq!(factory.opened(), 0);
}
