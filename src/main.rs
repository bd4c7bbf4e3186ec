//! vox-streamer - stream a synthetic volume end to end.
//!
//! This binary exercises the whole pipeline without any network backend:
//! it builds a synthetic volume, streams its frames through the cache and
//! request pool, verifies voxel fidelity and optionally decaches the result,
//! then prints a JSON run summary.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vox_streamer::{
    config::{Config, DecacheMode},
    synthetic::{self, synthetic_frame_id, SyntheticSliceLoader},
    ContextOptions, StreamEvent, StreamingContext, VolumeOptions,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration:");
    info!(
        "  Volume: {} frames of {}x{} ({} bytes)",
        config.frames,
        config.rows,
        config.columns,
        config.volume_size_in_bytes()
    );
    info!(
        "  Cache: {} bytes, pool: {} concurrent fetches",
        config.cache_capacity, config.max_concurrent
    );

    let ctx = StreamingContext::with_options(ContextOptions {
        cache_capacity: config.cache_capacity,
        max_concurrent: config.max_concurrent,
    });

    let mut loader = SyntheticSliceLoader::new();
    if config.fetch_delay_ms > 0 {
        loader = loader.with_delay(Duration::from_millis(config.fetch_delay_ms));
    }
    let loader = synthetic::register_with(&ctx, loader);

    // Frame i is uniformly filled with value i+1 (mod 255), so fidelity is
    // checkable after the load.
    let frame_ids: Vec<String> = (0..config.frames)
        .map(|i| {
            synthetic_frame_id(
                &format!("frame{i}"),
                config.rows,
                config.columns,
                (i % 255) as u8 + 1,
            )
        })
        .collect();

    let volume_id = format!("synthetic:demo_{}_{}_0", config.rows, config.columns);
    let volume = ctx
        .create_volume(&volume_id, VolumeOptions::new(frame_ids))
        .await?;

    let frames_seen = Arc::new(AtomicUsize::new(0));
    let failures_seen = Arc::new(AtomicUsize::new(0));
    let callback = {
        let frames_seen = frames_seen.clone();
        let failures_seen = failures_seen.clone();
        Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::FrameLoaded {
                frames_loaded,
                num_frames,
                ..
            } => {
                frames_seen.fetch_add(1, Ordering::SeqCst);
                info!("  frame loaded ({}/{})", frames_loaded, num_frames);
            }
            StreamEvent::FrameFailed { frame_index, error } => {
                failures_seen.fetch_add(1, Ordering::SeqCst);
                error!("  frame {} failed: {}", frame_index, error);
            }
            StreamEvent::Completed => info!("  volume completed"),
            StreamEvent::Cancelled => info!("  load cancelled"),
        }) as vox_streamer::LoadCallback
    };

    info!("Streaming...");
    let started = Instant::now();
    ctx.load_volume(&volume, Some(callback), !config.interactive)
        .await?;
    volume.wait_until_loaded().await;
    let elapsed = started.elapsed();

    // Voxel fidelity spot check: first and last frames.
    let first = volume.scalar_at(0, 0, 0);
    let last = volume.scalar_at(0, 0, config.frames as u32 - 1);
    info!(
        "Loaded in {:?}; scalar(frame 0) = {:?}, scalar(frame {}) = {:?}",
        elapsed,
        first,
        config.frames - 1,
        last
    );

    let cache_size_after_load = ctx.cache().total_size_in_bytes().await;

    match config.decache {
        DecacheMode::None => {}
        DecacheMode::Copy => {
            ctx.decache_volume(&volume, false).await?;
            info!(
                "Decached (copy): volume retained, cache size {}",
                ctx.cache().total_size_in_bytes().await
            );
        }
        DecacheMode::Move => {
            ctx.decache_volume(&volume, true).await?;
            info!(
                "Decached (move): volume removed, cache size {}",
                ctx.cache().total_size_in_bytes().await
            );
        }
    }

    let summary = json!({
        "volume_id": volume_id,
        "frames": config.frames,
        "volume_bytes": volume.size_in_bytes(),
        "elapsed_ms": elapsed.as_millis() as u64,
        "fetches": loader.fetch_count(),
        "frames_streamed": frames_seen.load(Ordering::SeqCst),
        "frame_failures": failures_seen.load(Ordering::SeqCst),
        "cache_bytes_after_load": cache_size_after_load,
        "cache_bytes_final": ctx.cache().total_size_in_bytes().await,
        "pending_requests": ctx.pool().snapshot().pending_count(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "vox_streamer=debug"
    } else {
        "vox_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
