//! Decache: converting a loaded volume into standalone per-frame entries,
//! by copy (volume retained) or by move (volume removed, bytes re-owned).

use vox_streamer::{LoadError, VolumeOptions};

use super::test_utils::{cached_slice, context, frame_ids};

#[tokio::test]
async fn test_copying_decache_duplicates_frames_and_keeps_volume() {
    let (ctx, _) = context();
    let ids = frame_ids(5, 100, 100);

    let volume = ctx
        .create_volume("synthetic:vol_100_100_0", VolumeOptions::new(ids.clone()))
        .await
        .unwrap();
    ctx.load_volume(&volume, None, true).await.unwrap();
    volume.wait_until_loaded().await;
    assert_eq!(ctx.cache().total_size_in_bytes().await, 50_000);

    ctx.decache_volume(&volume, false).await.unwrap();

    // Frame bytes are duplicated: 50000 of volume plus 5 x 10000 of slices.
    assert_eq!(ctx.cache().total_size_in_bytes().await, 100_000);
    assert!(ctx.get_volume(volume.id()).await.is_some());

    // The volume's own buffer is untouched.
    assert_eq!(volume.scalar_at(0, 0, 0), Some(1.0));
    assert_eq!(volume.scalar_at(99, 99, 4), Some(5.0));

    for (i, id) in ids.iter().enumerate() {
        let entry = ctx.cache().get_slice(id).await.unwrap();
        let slice = entry.slice().unwrap();
        assert_eq!(slice.rows, 100);
        assert_eq!(slice.columns, 100);
        assert_eq!(slice.size_in_bytes, 10_000);
        assert!(slice.invert);
        assert!(slice.pixel_data.iter().all(|&p| p == i as u8 + 1));
    }
}

#[tokio::test]
async fn test_destructive_decache_moves_bytes_and_removes_volume() {
    let (ctx, _) = context();
    let ids = frame_ids(5, 100, 100);

    let volume = ctx
        .create_volume("synthetic:vol_100_100_0", VolumeOptions::new(ids.clone()))
        .await
        .unwrap();
    ctx.load_volume(&volume, None, true).await.unwrap();
    volume.wait_until_loaded().await;
    assert_eq!(ctx.cache().total_size_in_bytes().await, 50_000);

    ctx.decache_volume(&volume, true).await.unwrap();

    // The bytes changed owner, not count: five 10000-byte entries replace
    // the one 50000-byte volume entry.
    assert_eq!(ctx.cache().total_size_in_bytes().await, 50_000);
    assert!(ctx.get_volume(volume.id()).await.is_none());

    // The volume gave up its buffer.
    assert!(volume.scalar_at(0, 0, 0).is_none());
    assert!(volume.copy_frame(0).is_none());

    for (i, id) in ids.iter().enumerate() {
        let entry = ctx.cache().get_slice(id).await.unwrap();
        let slice = entry.slice().unwrap();
        assert_eq!(slice.size_in_bytes, 10_000);
        assert!(slice.invert);
        assert!(slice.pixel_data.iter().all(|&p| p == i as u8 + 1));
    }
}

#[tokio::test]
async fn test_destructive_decache_leaves_existing_entries_untouched() {
    let (ctx, loader) = context();
    let ids = frame_ids(5, 100, 100);

    // Frames 0 and 1 are already cache-resident, as standalone loads would
    // have left them.
    for i in 0..2 {
        ctx.cache()
            .put_slice(cached_slice(&ids[i], 100, 100, i as u8 + 1))
            .await
            .unwrap();
    }

    let volume = ctx
        .create_volume("synthetic:vol_100_100_0", VolumeOptions::new(ids.clone()))
        .await
        .unwrap();
    ctx.load_volume(&volume, None, true).await.unwrap();
    volume.wait_until_loaded().await;

    // Two frames came from cache, three were fetched.
    assert_eq!(loader.fetch_count(), 3);
    assert_eq!(ctx.cache().total_size_in_bytes().await, 70_000);

    ctx.decache_volume(&volume, true).await.unwrap();

    // 2 pre-existing entries plus 3 produced ones, volume entry gone.
    assert_eq!(ctx.cache().total_size_in_bytes().await, 50_000);
    assert!(ctx.get_volume(volume.id()).await.is_none());

    // Pre-existing entries keep their identity (no invert flag rewrite);
    // produced entries carry it.
    let kept = ctx.cache().get_slice(&ids[0]).await.unwrap().slice().unwrap();
    assert!(!kept.invert);
    assert!(kept.pixel_data.iter().all(|&p| p == 1));

    let produced = ctx.cache().get_slice(&ids[4]).await.unwrap().slice().unwrap();
    assert!(produced.invert);
    assert!(produced.pixel_data.iter().all(|&p| p == 5));
}

#[tokio::test]
async fn test_decache_requires_loaded_volume() {
    let (ctx, _) = context();
    let ids = frame_ids(3, 10, 10);

    let volume = ctx
        .create_volume("synthetic:vol_10_10_0", VolumeOptions::new(ids))
        .await
        .unwrap();

    for completely_remove in [false, true] {
        match ctx.decache_volume(&volume, completely_remove).await {
            Err(LoadError::NotLoaded(id)) => assert_eq!(id, volume.id()),
            other => panic!("expected NotLoaded, got {:?}", other),
        }
    }

    // Nothing moved: the volume entry is still the only one.
    assert_eq!(ctx.cache().len().await, 1);
    assert_eq!(ctx.cache().total_size_in_bytes().await, 300);
}
