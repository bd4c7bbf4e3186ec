//! Streaming context: drives volumes from not-loaded to loaded.
//!
//! The context is the process-wide composition root: it owns the cache, the
//! request pool and both registries, and every component takes it by
//! reference instead of reaching into ambient globals. `purge_cache` is the
//! defined teardown between independent logical sessions.
//!
//! # Streaming algorithm
//!
//! `load_volume` reconciles the volume's frame bitmap against the cache
//! first: a resident slice with a matching byte size is copied (never moved)
//! into the frame's fixed offset with no pool traffic at all. Only the
//! remainder is submitted to the request pool, where fetches target-write
//! into the volume buffer when the loader supports it. Frames complete in
//! arbitrary order; all bookkeeping derives from the bitmap.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry, CachedPayload, HandleState, Slice};
use crate::error::{FetchError, LoadError};
use crate::io::{FetchOptions, FrameSink, FrameTarget, LoaderRegistry, VolumeOptions};
use crate::metadata::{modules, ImagePixelModule, MetadataRegistry};
use crate::pool::{FailureFn, FetchFn, RequestPoolManager, RequestPriority, SuccessFn};

use super::{LoadCallback, StreamEvent, Volume};

/// Construction options for [`StreamingContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Cache capacity in bytes.
    pub cache_capacity: usize,

    /// Bound on concurrently executing fetches.
    pub max_concurrent: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            cache_capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
            max_concurrent: crate::pool::DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// Process-wide streaming context.
///
/// Cheap to clone; clones share the same cache, pool and registries.
#[derive(Clone)]
pub struct StreamingContext {
    cache: Arc<Cache>,
    pool: RequestPoolManager,
    loaders: Arc<LoaderRegistry>,
    metadata: Arc<MetadataRegistry>,
}

impl StreamingContext {
    /// Create a context with default capacity and concurrency.
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    /// Create a context with explicit options.
    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            cache: Arc::new(Cache::with_capacity(options.cache_capacity)),
            pool: RequestPoolManager::with_concurrency(options.max_concurrent),
            loaders: Arc::new(LoaderRegistry::new()),
            metadata: Arc::new(MetadataRegistry::new()),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn pool(&self) -> &RequestPoolManager {
        &self.pool
    }

    pub fn loaders(&self) -> &Arc<LoaderRegistry> {
        &self.loaders
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    // -------------------------------------------------------------------------
    // Volume lifecycle
    // -------------------------------------------------------------------------

    /// Construct a volume and register it in the cache before any pixel
    /// bytes are fetched.
    ///
    /// A second call with the same id returns the already-cached volume
    /// instead of constructing a duplicate.
    pub async fn create_volume(
        &self,
        volume_id: &str,
        options: VolumeOptions,
    ) -> Result<Arc<Volume>, LoadError> {
        if let Some(existing) = self.get_volume(volume_id).await {
            return Ok(existing);
        }

        let loader = self.loaders.volume_loader(volume_id)?;
        let volume = Arc::new(loader.create_volume(volume_id, &options).await?);

        match self.cache.put_volume(CacheEntry::for_volume(volume.clone())).await {
            Ok(()) => {
                debug!(id = volume_id, bytes = volume.size_in_bytes(), "volume registered");
                Ok(volume)
            }
            // Lost a construction race; the winner's volume is the one.
            Err(crate::error::CacheError::DuplicateId(_)) => self
                .get_volume(volume_id)
                .await
                .ok_or_else(|| LoadError::NotLoaded(volume_id.to_string())),
            Err(error) => Err(error.into()),
        }
    }

    /// The cached volume registered under `volume_id`, if any.
    pub async fn get_volume(&self, volume_id: &str) -> Option<Arc<Volume>> {
        self.cache.get_volume(volume_id).await?.volume()
    }

    /// Remove a volume from the cache, clearing its pending pool requests.
    pub async fn remove_volume(&self, volume_id: &str) -> Result<(), LoadError> {
        self.pool.clear_for_volume(volume_id);
        self.cache.remove(volume_id).await?;
        Ok(())
    }

    /// Remove every cache entry and drop all pending pool requests.
    pub async fn purge_cache(&self) {
        self.pool.clear_pending();
        self.cache.purge_all().await;
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Drive `volume` toward loaded.
    ///
    /// * Already loaded: the new callback (if any) is invoked immediately
    ///   with [`StreamEvent::Completed`]; no requests are created.
    /// * Already loading: the callback is registered into the active session
    ///   and the call returns; at most one streaming session runs per volume.
    /// * Otherwise a session starts: cache-resident frames are copied in with
    ///   no pool traffic, the remainder is fetched with `Interaction`
    ///   priority when `prefetch` is false, `Prefetch` otherwise.
    pub async fn load_volume(
        &self,
        volume: &Arc<Volume>,
        callback: Option<LoadCallback>,
        prefetch: bool,
    ) -> Result<(), LoadError> {
        let (pending, generation) = {
            let mut status = volume.status_lock();
            if status.loaded {
                drop(status);
                if let Some(callback) = callback {
                    callback(&StreamEvent::Completed);
                }
                return Ok(());
            }
            if status.loading {
                if let Some(callback) = callback {
                    status.callbacks.push(callback);
                }
                return Ok(());
            }

            status.loading = true;
            if let Some(callback) = callback {
                status.callbacks.push(callback);
            }
            // A retry re-attempts exactly the frames that are not resident;
            // stale failure flags from the previous session are cleared.
            status.failed_frames.fill(false);
            let pending: Vec<usize> = status
                .cached_frames
                .iter()
                .enumerate()
                .filter_map(|(index, cached)| (!cached).then_some(index))
                .collect();
            status.remaining = pending.len();
            (pending, status.generation)
        };

        if pending.is_empty() {
            finish_resident(volume, generation);
            return Ok(());
        }

        info!(
            id = volume.id(),
            pending = pending.len(),
            total = volume.num_frames(),
            prefetch,
            "streaming session started"
        );

        let priority = if prefetch {
            RequestPriority::Prefetch
        } else {
            RequestPriority::Interaction
        };

        for frame_index in pending {
            self.stream_frame(volume, frame_index, generation, priority).await;
        }
        Ok(())
    }

    /// Cancel an active streaming session.
    ///
    /// Pending (not yet started) pool requests are dropped; fetches already
    /// in flight complete into an abandoned generation and are discarded.
    /// Registered callbacks receive [`StreamEvent::Cancelled`] and the
    /// residency bitmap is cleared.
    pub fn cancel_load(&self, volume: &Arc<Volume>) {
        volume.abort_load();
        self.pool.clear_for_volume(volume.id());
    }

    /// Resolve one frame: cache fast path, shared in-flight handle, or a
    /// fresh pool request.
    async fn stream_frame(
        &self,
        volume: &Arc<Volume>,
        frame_index: usize,
        generation: u64,
        priority: RequestPriority,
    ) {
        let frame_id = volume.frame_ids()[frame_index].clone();
        let frame_size = volume.frame_size_in_bytes();

        if let Some(entry) = self.cache.get_slice(&frame_id).await {
            match entry.handle.state() {
                HandleState::Resolved(CachedPayload::Slice(slice)) => {
                    if slice.size_in_bytes == frame_size {
                        // Buffer-sharing fast path: copy, never move, so the
                        // standalone entry stays valid.
                        match volume.write_frame(frame_index, &slice.pixel_data) {
                            Ok(()) => {
                                debug!(id = %frame_id, frame_index, "frame reused from cache");
                                complete_frame(volume, frame_index, generation);
                                return;
                            }
                            Err(error) => {
                                warn!(id = %frame_id, %error, "cached slice copy failed, refetching");
                            }
                        }
                    } else {
                        warn!(
                            id = %frame_id,
                            expected = frame_size,
                            actual = slice.size_in_bytes,
                            "cached slice size mismatch, refetching"
                        );
                    }
                }
                HandleState::Pending => {
                    // A standalone load for the same identity is in flight;
                    // share its result instead of fetching twice.
                    let volume = volume.clone();
                    let handle = entry.handle.clone();
                    let frame_id = frame_id.clone();
                    tokio::spawn(async move {
                        match handle.wait().await {
                            Ok(CachedPayload::Slice(slice)) => {
                                let result = if slice.size_in_bytes == frame_size {
                                    volume.write_frame(frame_index, &slice.pixel_data)
                                } else {
                                    Err(FetchError::SizeMismatch {
                                        id: frame_id.to_string(),
                                        expected: frame_size,
                                        actual: slice.size_in_bytes,
                                    })
                                };
                                match result {
                                    Ok(()) => complete_frame(&volume, frame_index, generation),
                                    Err(error) => {
                                        fail_frame(&volume, frame_index, generation, error)
                                    }
                                }
                            }
                            Ok(CachedPayload::Volume(_)) => fail_frame(
                                &volume,
                                frame_index,
                                generation,
                                FetchError::Transport {
                                    id: frame_id.to_string(),
                                    reason: "cache entry resolved to a volume".to_string(),
                                },
                            ),
                            Err(error) => fail_frame(&volume, frame_index, generation, error),
                        }
                    });
                    return;
                }
                // Rejected entries and volume payloads fall through to a
                // fresh fetch.
                _ => {}
            }
        }

        self.submit_frame_fetch(volume, frame_index, generation, priority, frame_id, frame_size);
    }

    fn submit_frame_fetch(
        &self,
        volume: &Arc<Volume>,
        frame_index: usize,
        generation: u64,
        priority: RequestPriority,
        frame_id: Arc<str>,
        frame_size: usize,
    ) {
        let loader = volume.frame_loader(frame_index);
        let offset = frame_index * frame_size;
        let sink: Arc<dyn FrameSink> = volume.clone();

        let fetch_id = frame_id.clone();
        let fetch: FetchFn = Box::new(move || {
            Box::pin(async move {
                let options = FetchOptions {
                    target: Some(FrameTarget::new(sink, offset, frame_size)),
                };
                loader.fetch(&fetch_id, &options).await
            })
        });

        let success_volume = volume.clone();
        let success_id = frame_id.clone();
        let on_success: SuccessFn = Box::new(move |payload| {
            let result = match payload {
                // Loader wrote through the target; nothing left to copy.
                crate::io::FetchPayload::Written => Ok(()),
                crate::io::FetchPayload::Image(slice) => {
                    if slice.size_in_bytes == frame_size {
                        success_volume.write_frame(frame_index, &slice.pixel_data)
                    } else {
                        Err(FetchError::SizeMismatch {
                            id: success_id.to_string(),
                            expected: frame_size,
                            actual: slice.size_in_bytes,
                        })
                    }
                }
            };
            match result {
                Ok(()) => complete_frame(&success_volume, frame_index, generation),
                Err(error) => fail_frame(&success_volume, frame_index, generation, error),
            }
        });

        let failure_volume = volume.clone();
        let on_failure: FailureFn = Box::new(move |error| {
            fail_frame(&failure_volume, frame_index, generation, error);
        });

        let accepted = self.pool.add_request(
            frame_id.clone(),
            Some(volume.id_arc()),
            priority,
            fetch,
            on_success,
            on_failure,
        );
        if !accepted {
            // Another owner's fetch for this identity is outstanding and its
            // completion will not write our frame; surface the collision so
            // a later load_volume call can retry.
            warn!(id = %frame_id, "frame fetch collided with an outstanding request");
            fail_frame(
                volume,
                frame_index,
                generation,
                FetchError::DuplicateInFlight(frame_id.to_string()),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Standalone slice loading
    // -------------------------------------------------------------------------

    /// Load a single slice into the cache, deduplicated by identity.
    ///
    /// Concurrent callers for the same id share one fetch through the cached
    /// entry's handle. A failed entry is removed so a later call can
    /// re-fetch.
    pub async fn load_slice(
        &self,
        slice_id: &str,
        priority: RequestPriority,
    ) -> Result<Arc<Slice>, LoadError> {
        if let Some(entry) = self.cache.get_slice(slice_id).await {
            return match entry.handle.wait().await? {
                CachedPayload::Slice(slice) => Ok(slice),
                CachedPayload::Volume(_) => Err(LoadError::Fetch(FetchError::Transport {
                    id: slice_id.to_string(),
                    reason: "cache entry resolved to a volume".to_string(),
                })),
            };
        }

        let loader = self.loaders.slice_loader(slice_id)?;

        // The entry's size is immutable after registration, so it is sized
        // from metadata ahead of the fetch.
        let pixel: ImagePixelModule = self
            .metadata
            .get_module(modules::IMAGE_PIXEL, slice_id)
            .ok_or_else(|| {
                LoadError::Fetch(FetchError::MissingMetadata {
                    module: modules::IMAGE_PIXEL.to_string(),
                    id: slice_id.to_string(),
                })
            })?;
        let expected_size = pixel.frame_size_in_bytes();

        let entry = CacheEntry::pending_slice(slice_id, expected_size);
        let handle = entry.handle.clone();

        match self.cache.put_slice(entry).await {
            Ok(()) => {}
            Err(crate::error::CacheError::DuplicateId(_)) => {
                // Lost the registration race; wait on the winner's handle.
                if let Some(existing) = self.cache.get_slice(slice_id).await {
                    return match existing.handle.wait().await? {
                        CachedPayload::Slice(slice) => Ok(slice),
                        CachedPayload::Volume(_) => {
                            Err(LoadError::Fetch(FetchError::Transport {
                                id: slice_id.to_string(),
                                reason: "cache entry resolved to a volume".to_string(),
                            }))
                        }
                    };
                }
                return Err(LoadError::Fetch(FetchError::Aborted));
            }
            Err(error) => return Err(error.into()),
        }

        let owned_id: Arc<str> = Arc::from(slice_id);

        let fetch_loader = loader.clone();
        let fetch_id = owned_id.clone();
        let fetch: FetchFn = Box::new(move || {
            Box::pin(async move { fetch_loader.fetch(&fetch_id, &FetchOptions::default()).await })
        });

        let success_handle = handle.clone();
        let success_id = owned_id.clone();
        let success_cache = self.cache.clone();
        let on_success: SuccessFn = Box::new(move |payload| {
            match payload {
                crate::io::FetchPayload::Image(slice) => {
                    if slice.size_in_bytes == expected_size {
                        success_handle.resolve(CachedPayload::Slice(Arc::new(slice)));
                    } else {
                        let error = FetchError::SizeMismatch {
                            id: success_id.to_string(),
                            expected: expected_size,
                            actual: slice.size_in_bytes,
                        };
                        success_handle.reject(error);
                        evict_rejected(success_cache, success_id);
                    }
                }
                crate::io::FetchPayload::Written => {
                    // No target was offered; a loader answering Written
                    // produced nothing we can cache.
                    success_handle.reject(FetchError::Transport {
                        id: success_id.to_string(),
                        reason: "loader returned no image payload".to_string(),
                    });
                    evict_rejected(success_cache, success_id);
                }
            }
        });

        let failure_handle = handle.clone();
        let failure_id = owned_id.clone();
        let failure_cache = self.cache.clone();
        let on_failure: FailureFn = Box::new(move |error| {
            failure_handle.reject(error);
            evict_rejected(failure_cache, failure_id);
        });

        let accepted = self.pool.add_request(
            owned_id.clone(),
            None,
            priority,
            fetch,
            on_success,
            on_failure,
        );
        if !accepted {
            // An unrelated fetch (a volume frame) owns the identity right
            // now; give the registration back and let the caller retry.
            let _ = self.cache.remove(slice_id).await;
            handle.reject(FetchError::DuplicateInFlight(slice_id.to_string()));
            return Err(LoadError::Fetch(FetchError::DuplicateInFlight(
                slice_id.to_string(),
            )));
        }

        match handle.wait().await? {
            CachedPayload::Slice(slice) => Ok(slice),
            CachedPayload::Volume(_) => Err(LoadError::Fetch(FetchError::Transport {
                id: slice_id.to_string(),
                reason: "cache entry resolved to a volume".to_string(),
            })),
        }
    }

    /// Load several slices concurrently, preserving input order in the
    /// result.
    pub async fn load_slices(
        &self,
        slice_ids: &[String],
        priority: RequestPriority,
    ) -> Vec<Result<Arc<Slice>, LoadError>> {
        let handles: Vec<_> = slice_ids
            .iter()
            .map(|id| {
                let ctx = self.clone();
                let id = id.clone();
                tokio::spawn(async move { ctx.load_slice(&id, priority).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(_) => Err(LoadError::Fetch(FetchError::Aborted)),
            });
        }
        results
    }
}

impl Default for StreamingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop a rejected entry off-task so a later load can re-fetch the id.
fn evict_rejected(cache: Arc<Cache>, slice_id: Arc<str>) {
    tokio::spawn(async move {
        let _ = cache.remove(&slice_id).await;
    });
}

// =============================================================================
// Frame completion bookkeeping
// =============================================================================

/// Mark a frame resident and fire progress; finishes the session when every
/// pending frame has resolved.
fn complete_frame(volume: &Arc<Volume>, frame_index: usize, generation: u64) {
    let num_frames = volume.num_frames();
    let (events, callbacks, became_loaded) = {
        let mut status = volume.status_lock();
        if status.generation != generation || !status.loading {
            // Stale completion from a cancelled session; the bytes land in a
            // buffer that is about to be abandoned.
            return;
        }
        if !status.cached_frames[frame_index] {
            status.cached_frames[frame_index] = true;
        }
        status.failed_frames[frame_index] = false;
        status.remaining = status.remaining.saturating_sub(1);

        let frames_loaded = status.cached_frames.iter().filter(|c| **c).count();
        let mut events = vec![StreamEvent::FrameLoaded {
            frame_index,
            frames_loaded,
            num_frames,
        }];

        if status.remaining > 0 {
            (events, status.callbacks.clone(), false)
        } else {
            status.loading = false;
            if status.cached_frames.iter().all(|c| *c) {
                status.loaded = true;
                events.push(StreamEvent::Completed);
                // Completed is single-shot: the session's callbacks are
                // consumed with it.
                (events, std::mem::take(&mut status.callbacks), true)
            } else {
                // Some sibling frames failed; callbacks stay registered for
                // the retry session.
                (events, status.callbacks.clone(), false)
            }
        }
    };

    for event in &events {
        for callback in &callbacks {
            callback(event);
        }
    }
    if became_loaded {
        info!(id = volume.id(), "volume loaded");
        volume.signal_loaded();
    }
}

/// Mark a frame failed and fire the failure; the session leaves `loading`
/// once every pending frame has resolved, without reaching `loaded`.
fn fail_frame(volume: &Arc<Volume>, frame_index: usize, generation: u64, error: FetchError) {
    let (event, callbacks) = {
        let mut status = volume.status_lock();
        if status.generation != generation || !status.loading {
            return;
        }
        status.failed_frames[frame_index] = true;
        status.remaining = status.remaining.saturating_sub(1);
        if status.remaining == 0 {
            // Terminal for now: not loaded, not loading, retryable by a
            // fresh load_volume call.
            status.loading = false;
        }
        (
            StreamEvent::FrameFailed {
                frame_index,
                error: error.clone(),
            },
            status.callbacks.clone(),
        )
    };

    warn!(id = volume.id(), frame_index, %error, "frame fetch failed");
    for callback in &callbacks {
        callback(&event);
    }
}

/// Finish a session whose every frame was already resident at start.
fn finish_resident(volume: &Arc<Volume>, generation: u64) {
    let callbacks = {
        let mut status = volume.status_lock();
        // The session can be cancelled between its status snapshot and this
        // call; a stale finish must not mark the volume loaded.
        if status.generation != generation || !status.loading {
            return;
        }
        status.loading = false;
        status.loaded = true;
        std::mem::take(&mut status.callbacks)
    };
    let event = StreamEvent::Completed;
    for callback in &callbacks {
        callback(&event);
    }
    info!(id = volume.id(), "volume loaded (all frames cache-resident)");
    volume.signal_loaded();
}

// =============================================================================
// Tests
// =============================================================================
