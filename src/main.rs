//! tile-prefetch - Warm a tile cache from a remote tile server.
//!
//! This binary fetches a range of tiles through the prefetch pipeline and
//! reports what arrived.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_prefetch::{
    BoundedTileCache, CacheStats, Config, HttpPipelineFactory, HttpTransport, ImageTileDecoder,
    TileError, TileFetchCoordinator, TransportError, UrlTemplateBuilder,
};

/// Outcome of one pass over the tile range.
#[derive(Debug, Serialize)]
struct PassReport {
    pass: u32,
    requested: usize,
    delivered: usize,
    cache_hits: usize,
    fetched: usize,
    skipped: usize,
    cancelled: bool,
    elapsed_ms: u64,
    cache: CacheStats,
}

fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let fetch_config = config.fetch_config();

    info!("Configuration:");
    info!("  URL template: {}", config.url_template);
    info!("  Tiles: {}/{} ({} tiles)", config.pyramid, config.mosaic, config.tile_count());
    info!(
        "  Cache: {} tiles, channel: {}, workers: {}",
        config.cache_tiles, fetch_config.channel_capacity, fetch_config.pool_size
    );
    if config.bearer_token.is_some() && config.pipelined {
        warn!("  Bearer token set: pipelined fetching disabled");
    }

    // The blocking client owns its own runtime and must be created and
    // dropped outside ours.
    let transport = match build_transport(&config, fetch_config.fetch_timeout) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to create transport: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let builder = match build_request_builder(&config) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Invalid URL template: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let pipeline = match HttpPipelineFactory::new(fetch_config.fetch_timeout) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to create pipeline: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let coordinator = TileFetchCoordinator::new(
        Arc::new(BoundedTileCache::with_capacity(config.cache_tiles)),
        Arc::new(builder),
        transport,
        Arc::new(ImageTileDecoder::new()),
        fetch_config,
    )
    .with_pipeline(Arc::new(pipeline));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run_passes(&config, &coordinator));
    runtime.shutdown_timeout(Duration::from_secs(1));

    let reports = match result {
        Ok(reports) => reports,
        Err(e) => {
            error!("Fetch failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if config.json {
        match serde_json::to_string_pretty(&reports) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_reports(&reports);
    }

    if reports.iter().any(|r| r.cancelled) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_prefetch=debug"
    } else {
        "tile_prefetch=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_transport(config: &Config, timeout: Duration) -> Result<HttpTransport, TransportError> {
    match config.bearer_token {
        Some(ref token) => HttpTransport::with_bearer_token(timeout, token),
        None => HttpTransport::with_timeout(timeout),
    }
}

fn build_request_builder(config: &Config) -> Result<UrlTemplateBuilder, TransportError> {
    let builder = UrlTemplateBuilder::new(config.url_template.clone())?;
    match config.bearer_token {
        Some(ref token) => builder.with_bearer_token(token),
        None => Ok(builder),
    }
}

// =============================================================================
// Passes
// =============================================================================

async fn run_passes(
    config: &Config,
    coordinator: &TileFetchCoordinator,
) -> Result<Vec<PassReport>, TileError> {
    let coords = config.coords();
    let hints = config.hints();
    let mut reports = Vec::new();

    for pass in 1..=config.passes {
        let started = Instant::now();
        let stream = coordinator.fetch_tiles(
            &config.pyramid,
            &config.mosaic,
            &coords,
            &hints,
            config.pipelined,
        )?;

        let cancel = stream.cancel_handle();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling outstanding fetches");
                    cancel.cancel();
                }
            }
        });

        let summary = stream.collect().await;
        interrupt.abort();

        let report = PassReport {
            pass,
            requested: coords.len(),
            delivered: summary.tiles.len(),
            cache_hits: summary.cache_hits(),
            fetched: summary.fetched(),
            skipped: coords.len().saturating_sub(summary.tiles.len()),
            cancelled: cancel.is_cancelled(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cache: coordinator.cache_stats(),
        };
        info!(
            "Pass {}: {} of {} tiles ({} cached, {} fetched) in {}ms",
            pass, report.delivered, report.requested, report.cache_hits, report.fetched,
            report.elapsed_ms
        );

        let cancelled = report.cancelled;
        reports.push(report);
        if cancelled {
            break;
        }
    }

    Ok(reports)
}

fn print_reports(reports: &[PassReport]) {
    for report in reports {
        println!(
            "pass {}: {}/{} tiles, {} cached, {} fetched, {} skipped, {}ms{}",
            report.pass,
            report.delivered,
            report.requested,
            report.cache_hits,
            report.fetched,
            report.skipped,
            report.elapsed_ms,
            if report.cancelled { " (cancelled)" } else { "" }
        );
    }
    if let Some(last) = reports.last() {
        println!(
            "cache: {}/{} tiles, {} in flight",
            last.cache.size, last.cache.capacity, last.cache.in_flight
        );
    }
}
