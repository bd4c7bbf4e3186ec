//! Synthetic slice loader and metadata provider.
//!
//! Ids encode their own image: `scheme:<name>_<rows>_<columns>_<value>`
//! yields a `rows x columns` 8-bit frame uniformly filled with `value`. The
//! loader honors target writes (the zero-copy path) unless configured not
//! to, tracks fetch counts, and can inject failures and latency, which is
//! enough to exercise the full streaming pipeline without any network
//! backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::cache::Slice;
use crate::error::FetchError;
use crate::io::{FetchOptions, FetchPayload, SliceLoader};
use crate::metadata::{modules, MetadataProvider};
use crate::volume::{MetadataVolumeLoader, StreamingContext};

/// Image description parsed out of a synthetic id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticImageSpec {
    pub rows: u32,
    pub columns: u32,
    pub value: u8,
}

impl SyntheticImageSpec {
    pub fn size_in_bytes(&self) -> usize {
        self.rows as usize * self.columns as usize
    }
}

/// Parse `scheme:<name>_<rows>_<columns>_<value>`, any scheme.
pub fn parse_synthetic_id(id: &str) -> Option<SyntheticImageSpec> {
    let (_, path) = id.split_once(':')?;
    let mut parts = path.rsplitn(4, '_');
    let value: u8 = parts.next()?.parse().ok()?;
    let columns: u32 = parts.next()?.parse().ok()?;
    let rows: u32 = parts.next()?.parse().ok()?;
    // The leading name segment must exist, content irrelevant.
    parts.next()?;
    (rows > 0 && columns > 0).then_some(SyntheticImageSpec {
        rows,
        columns,
        value,
    })
}

/// Build a synthetic frame id.
pub fn synthetic_frame_id(name: &str, rows: u32, columns: u32, value: u8) -> String {
    format!("synthetic:{name}_{rows}_{columns}_{value}")
}

// =============================================================================
// Slice loader
// =============================================================================

/// Slice loader that synthesizes uniform frames from their ids.
pub struct SyntheticSliceLoader {
    delay: Option<Duration>,
    write_targets: bool,
    fetch_count: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl SyntheticSliceLoader {
    pub fn new() -> Self {
        Self {
            delay: None,
            write_targets: true,
            fetch_count: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Sleep this long before answering, to simulate transport latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always return a full image, even when a target buffer is offered.
    pub fn without_target_writes(mut self) -> Self {
        self.write_targets = false;
        self
    }

    /// Make fetches for `id` fail with a transport error.
    pub fn fail_on(&self, id: impl Into<String>) {
        lock(&self.failing).insert(id.into());
    }

    /// Let fetches for `id` succeed again.
    pub fn heal(&self, id: &str) {
        lock(&self.failing).remove(id);
    }

    /// Number of fetches attempted so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticSliceLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SliceLoader for SyntheticSliceLoader {
    async fn fetch(
        &self,
        slice_id: &str,
        options: &FetchOptions,
    ) -> Result<FetchPayload, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.failing).contains(slice_id) {
            return Err(FetchError::Transport {
                id: slice_id.to_string(),
                reason: "synthetic failure injected".to_string(),
            });
        }

        let spec = parse_synthetic_id(slice_id).ok_or_else(|| FetchError::Transport {
            id: slice_id.to_string(),
            reason: "unparseable synthetic id".to_string(),
        })?;
        let pixels = vec![spec.value; spec.size_in_bytes()];

        if self.write_targets {
            if let Some(target) = &options.target {
                target.write(slice_id, &pixels)?;
                return Ok(FetchPayload::Written);
            }
        }

        Ok(FetchPayload::Image(Slice::new(
            slice_id,
            spec.rows,
            spec.columns,
            Bytes::from(pixels),
        )))
    }
}

fn lock(mutex: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Metadata provider
// =============================================================================

/// Provider serving pixel and plane modules for any parseable synthetic id.
pub fn synthetic_metadata_provider() -> MetadataProvider {
    Arc::new(|module: &str, slice_id: &str| -> Option<Value> {
        let spec = parse_synthetic_id(slice_id)?;
        match module {
            modules::IMAGE_PIXEL => Some(json!({
                "Rows": spec.rows,
                "Columns": spec.columns,
                "BitsAllocated": 8,
                "PixelRepresentation": 0,
                "PhotometricInterpretation": "MONOCHROME2",
                "SamplesPerPixel": 1,
            })),
            modules::IMAGE_PLANE => Some(json!({
                "PixelSpacing": [1.0, 1.0],
                "ImageOrientationPatient": [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                "ImagePositionPatient": [0.0, 0.0, 0.0],
            })),
            _ => None,
        }
    })
}

/// Register the synthetic stack on a context under the `synthetic` scheme:
/// slice loader, metadata provider and a metadata-driven volume loader.
///
/// Returns the loader so callers can inspect fetch counts or inject
/// failures.
pub fn register(ctx: &StreamingContext) -> Arc<SyntheticSliceLoader> {
    register_with(ctx, SyntheticSliceLoader::new())
}

/// Like [`register`], with a caller-configured loader.
pub fn register_with(
    ctx: &StreamingContext,
    loader: SyntheticSliceLoader,
) -> Arc<SyntheticSliceLoader> {
    let loader = Arc::new(loader);
    ctx.loaders()
        .register_slice_loader("synthetic", loader.clone());
    ctx.metadata().add_provider(0, synthetic_metadata_provider());
    ctx.loaders().register_volume_loader(
        "synthetic",
        Arc::new(MetadataVolumeLoader::new(
            ctx.metadata().clone(),
            ctx.loaders().clone(),
        )),
    );
    loader
}

// =============================================================================
// Tests
// =============================================================================
