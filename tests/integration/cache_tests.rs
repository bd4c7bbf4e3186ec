//! Cache behavior through the streaming context: volume registration and
//! accounting, teardown, and eviction pressure.

use std::sync::Arc;
use std::time::Duration;

use vox_streamer::synthetic::{self, synthetic_frame_id, SyntheticSliceLoader};
use vox_streamer::{ContextOptions, RequestPriority, StreamingContext, VolumeOptions};

use super::test_utils::{context, context_with, frame_ids, EventLog};

#[tokio::test]
async fn test_volume_registration_accounts_buffer_bytes() {
    let (ctx, _) = context();
    let ids = frame_ids(5, 100, 100);

    assert_eq!(ctx.cache().total_size_in_bytes().await, 0);

    let volume = ctx
        .create_volume("synthetic:vol_100_100_0", VolumeOptions::new(ids))
        .await
        .unwrap();

    // The buffer is accounted at registration, before any bytes arrive.
    assert_eq!(ctx.cache().total_size_in_bytes().await, 50_000);
    assert!(ctx.get_volume(volume.id()).await.is_some());

    ctx.remove_volume(volume.id()).await.unwrap();
    assert_eq!(ctx.cache().total_size_in_bytes().await, 0);
    assert!(ctx.get_volume(volume.id()).await.is_none());
}

#[tokio::test]
async fn test_create_volume_is_idempotent_by_id() {
    let (ctx, _) = context();
    let ids = frame_ids(3, 10, 10);

    let first = ctx
        .create_volume("synthetic:vol_10_10_0", VolumeOptions::new(ids.clone()))
        .await
        .unwrap();
    let second = ctx
        .create_volume("synthetic:vol_10_10_0", VolumeOptions::new(ids))
        .await
        .unwrap();

    // Same registration, not a second volume and not double accounting.
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ctx.cache().total_size_in_bytes().await, 300);
    assert_eq!(ctx.cache().len().await, 1);
}

#[tokio::test]
async fn test_purge_cache_cancels_loading_volumes() {
    let loader = SyntheticSliceLoader::new().with_delay(Duration::from_millis(50));
    let (ctx, _) = context_with(loader, 1);
    let ids = frame_ids(5, 10, 10);

    let volume = ctx
        .create_volume("synthetic:vol_10_10_0", VolumeOptions::new(ids))
        .await
        .unwrap();

    let log = EventLog::new();
    ctx.load_volume(&volume, Some(log.callback()), true)
        .await
        .unwrap();
    assert!(volume.is_loading());

    ctx.purge_cache().await;

    assert!(ctx.cache().is_empty().await);
    assert_eq!(ctx.cache().total_size_in_bytes().await, 0);
    assert_eq!(ctx.pool().snapshot().pending_count(), 0);
    assert!(!volume.is_loading());
    assert_eq!(log.cancelled_count(), 1);
}

#[tokio::test]
async fn test_remove_volume_mid_load_notifies_cancellation() {
    let loader = SyntheticSliceLoader::new().with_delay(Duration::from_millis(50));
    let (ctx, _) = context_with(loader, 1);
    let ids = frame_ids(4, 10, 10);

    let volume = ctx
        .create_volume("synthetic:vol_10_10_0", VolumeOptions::new(ids))
        .await
        .unwrap();

    let log = EventLog::new();
    ctx.load_volume(&volume, Some(log.callback()), true)
        .await
        .unwrap();

    ctx.remove_volume(volume.id()).await.unwrap();

    assert_eq!(log.cancelled_count(), 1);
    assert!(!volume.is_loading());
    assert!(ctx.get_volume(volume.id()).await.is_none());
    assert_eq!(ctx.pool().snapshot().pending_count(), 0);
}

#[tokio::test]
async fn test_eviction_under_pressure_spares_volumes() {
    let ctx = StreamingContext::with_options(ContextOptions {
        cache_capacity: 1_000,
        ..ContextOptions::default()
    });
    synthetic::register(&ctx);

    let volume = ctx
        .create_volume(
            "synthetic:vol_10_10_0",
            VolumeOptions::new(vec![synthetic_frame_id("frame", 10, 10, 1)]),
        )
        .await
        .unwrap();
    ctx.load_volume(&volume, None, true).await.unwrap();
    volume.wait_until_loaded().await;

    // Twelve 100-byte slices overflow the remaining 900 bytes; the oldest
    // slices get evicted, the volume never does.
    for i in 0..12u8 {
        let id = synthetic_frame_id(&format!("s{i}"), 10, 10, i + 1);
        ctx.load_slice(&id, RequestPriority::Prefetch).await.unwrap();
    }

    assert!(ctx.cache().total_size_in_bytes().await <= 1_000);
    assert!(ctx.get_volume(volume.id()).await.is_some());
    assert!(
        !ctx.cache()
            .contains_slice(&synthetic_frame_id("s0", 10, 10, 1))
            .await
    );
    assert!(
        ctx.cache()
            .contains_slice(&synthetic_frame_id("s11", 10, 10, 12))
            .await
    );
}
