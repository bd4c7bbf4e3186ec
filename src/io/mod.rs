//! Loader seams and scheme-based loader resolution.
//!
//! Slice and volume construction are injected capabilities: a slice id's
//! scheme (the part before the first `:`) selects which registered loader
//! performs the transport. Resolution happens once, at construction time,
//! never per fetch.
//!
//! # Zero-copy contract
//!
//! When [`FetchOptions`] carries a [`FrameTarget`], a loader that supports
//! target writing copies pixel bytes straight into the target's byte range
//! and returns [`FetchPayload::Written`] instead of allocating a fresh
//! buffer. Loaders that cannot target-write return a full
//! [`FetchPayload::Image`]; the streaming layer then performs the copy.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::cache::Slice;
use crate::error::{FetchError, LoadError};
use crate::volume::Volume;

// =============================================================================
// Id helpers
// =============================================================================

/// Extract the scheme of a `scheme:path` id.
///
/// Returns `None` when the id carries no scheme or an empty one.
pub fn scheme_of(id: &str) -> Option<&str> {
    match id.split_once(':') {
        Some(("", _)) => None,
        Some((scheme, _)) => Some(scheme),
        None => None,
    }
}

// =============================================================================
// Fetch contract
// =============================================================================

/// Destination byte range for a target-writing fetch.
///
/// Wraps a shared sink (in practice the volume's pixel buffer) plus the
/// frame's fixed offset and length. Ranges of distinct frames never overlap,
/// so concurrent frame writes never race on the same bytes.
#[derive(Clone)]
pub struct FrameTarget {
    sink: Arc<dyn FrameSink>,
    offset: usize,
    length: usize,
}

impl FrameTarget {
    /// Create a target for `length` bytes at `offset` within `sink`.
    pub fn new(sink: Arc<dyn FrameSink>, offset: usize, length: usize) -> Self {
        Self {
            sink,
            offset,
            length,
        }
    }

    /// Expected pixel payload length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Write the full pixel payload into the target range.
    ///
    /// Fails with [`FetchError::SizeMismatch`] when the payload length
    /// disagrees with the target length; nothing is written in that case.
    pub fn write(&self, id: &str, pixels: &[u8]) -> Result<(), FetchError> {
        if pixels.len() != self.length {
            return Err(FetchError::SizeMismatch {
                id: id.to_string(),
                expected: self.length,
                actual: pixels.len(),
            });
        }
        self.sink.write_at(self.offset, pixels)
    }
}

/// A mutable pixel destination that accepts writes at fixed offsets.
pub trait FrameSink: Send + Sync {
    /// Copy `pixels` into the sink starting at `offset`.
    fn write_at(&self, offset: usize, pixels: &[u8]) -> Result<(), FetchError>;
}

/// Options handed to a slice loader for one fetch.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Target byte range for the zero-copy path, when the caller has one.
    pub target: Option<FrameTarget>,
}

/// What a slice fetch produced.
pub enum FetchPayload {
    /// A fully materialized standalone slice.
    Image(Slice),

    /// Pixel bytes were written through the offered [`FrameTarget`]; no
    /// separate allocation exists.
    Written,
}

/// Scheme-addressed slice fetch capability.
///
/// Implementations perform the actual transport (network, disk, synthesis)
/// and are free to honor or ignore the target-write option.
#[async_trait]
pub trait SliceLoader: Send + Sync {
    /// Fetch the pixel data for `slice_id`.
    async fn fetch(
        &self,
        slice_id: &str,
        options: &FetchOptions,
    ) -> Result<FetchPayload, FetchError>;
}

/// Volume constructor collaborator.
///
/// Given a volume id and its frame identity sequence, builds the volume's
/// geometry and zeroed pixel buffer. No pixel bytes are fetched here.
#[async_trait]
pub trait VolumeLoader: Send + Sync {
    /// Construct a volume from its description.
    async fn create_volume(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
    ) -> Result<Volume, LoadError>;
}

/// Description handed to a volume loader.
#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    /// Ordered frame identity sequence; position is the frame index.
    pub frame_ids: Vec<String>,
}

impl VolumeOptions {
    pub fn new(frame_ids: Vec<String>) -> Self {
        Self { frame_ids }
    }
}

// =============================================================================
// Loader Registry
// =============================================================================

/// Registry mapping a scheme string to loader implementations.
///
/// Resolution happens at slice/volume construction time; the resolved loader
/// is then carried by the construct, so later re-registration does not affect
/// objects already built.
#[derive(Default)]
pub struct LoaderRegistry {
    slice_loaders: RwLock<HashMap<String, Arc<dyn SliceLoader>>>,
    volume_loaders: RwLock<HashMap<String, Arc<dyn VolumeLoader>>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the slice loader for `scheme`.
    pub fn register_slice_loader(&self, scheme: impl Into<String>, loader: Arc<dyn SliceLoader>) {
        let mut loaders = write(&self.slice_loaders);
        loaders.insert(scheme.into(), loader);
    }

    /// Register (or replace) the volume loader for `scheme`.
    pub fn register_volume_loader(&self, scheme: impl Into<String>, loader: Arc<dyn VolumeLoader>) {
        let mut loaders = write(&self.volume_loaders);
        loaders.insert(scheme.into(), loader);
    }

    /// Resolve the slice loader for an id by its scheme.
    pub fn slice_loader(&self, id: &str) -> Result<Arc<dyn SliceLoader>, FetchError> {
        let scheme = scheme_of(id).ok_or_else(|| FetchError::UnknownScheme(id.to_string()))?;
        let loaders = read(&self.slice_loaders);
        loaders
            .get(scheme)
            .cloned()
            .ok_or_else(|| FetchError::UnknownScheme(scheme.to_string()))
    }

    /// Resolve the volume loader for an id by its scheme.
    pub fn volume_loader(&self, id: &str) -> Result<Arc<dyn VolumeLoader>, FetchError> {
        let scheme = scheme_of(id).ok_or_else(|| FetchError::UnknownScheme(id.to_string()))?;
        let loaders = read(&self.volume_loaders);
        loaders
            .get(scheme)
            .cloned()
            .ok_or_else(|| FetchError::UnknownScheme(scheme.to_string()))
    }

    /// Drop every registered loader. Test isolation between sessions.
    pub fn unregister_all(&self) {
        write(&self.slice_loaders).clear();
        write(&self.volume_loaders).clear();
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Tests
// =============================================================================
