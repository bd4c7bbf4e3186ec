//! Volume data model and per-frame load state machine.
//!
//! A volume is a single contiguous scalar buffer assembled from an ordered
//! sequence of slice identities. Each frame occupies a fixed byte range
//! `frame_index * frame_size .. (frame_index + 1) * frame_size`; ranges of
//! distinct frames never overlap, so concurrent frame writes never race.
//!
//! Load progress is tracked by a per-frame bitmap (`cached_frames`) rather
//! than any ordering assumption: frames complete in arbitrary order and the
//! volume is loaded exactly when every bitmap entry is true.

mod decache;
mod loader;
mod streaming;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::error::{FetchError, LoadError};
use crate::io::{FrameSink, SliceLoader};

pub use loader::MetadataVolumeLoader;
pub use streaming::{ContextOptions, StreamingContext};

// =============================================================================
// Events and callbacks
// =============================================================================

/// Progress event delivered to load callbacks.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One frame's pixel bytes landed in the volume buffer.
    FrameLoaded {
        frame_index: usize,
        frames_loaded: usize,
        num_frames: usize,
    },

    /// One frame's fetch failed; sibling frames are unaffected.
    FrameFailed {
        frame_index: usize,
        error: FetchError,
    },

    /// Every frame is resident; the volume transitioned to loaded.
    Completed,

    /// The streaming session was cancelled before completion.
    Cancelled,
}

/// Completion/progress callback registered through `load_volume`.
pub type LoadCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

// =============================================================================
// Pixel format
// =============================================================================

/// Scalar storage format of the volume's voxels.
#[derive(Debug, Clone)]
pub struct PixelFormat {
    /// Bits per stored sample (8 or 16).
    pub bits_allocated: u8,

    /// Two's-complement signed samples.
    pub signed: bool,

    /// Photometric interpretation keyword (e.g. `MONOCHROME2`).
    pub photometric_interpretation: String,
}

impl PixelFormat {
    /// Storage size of one voxel in bytes.
    pub fn bytes_per_voxel(&self) -> usize {
        (self.bits_allocated as usize / 8).max(1)
    }
}

// =============================================================================
// Load status
// =============================================================================

pub(crate) struct LoadStatus {
    pub loaded: bool,
    pub loading: bool,
    /// One flag per frame: pixel bytes are resident in the buffer.
    pub cached_frames: Vec<bool>,
    /// One flag per frame: the most recent fetch attempt failed.
    pub failed_frames: Vec<bool>,
    /// Callbacks of the active (or retryable) streaming session.
    pub callbacks: Vec<LoadCallback>,
    /// Frames of the active session that have not yet resolved.
    pub remaining: usize,
    /// Bumped on cancellation; completions from an older generation are
    /// discarded instead of mutating the bitmap.
    pub generation: u64,
}

impl LoadStatus {
    fn new(num_frames: usize) -> Self {
        Self {
            loaded: false,
            loading: false,
            cached_frames: vec![false; num_frames],
            failed_frames: vec![false; num_frames],
            callbacks: Vec::new(),
            remaining: 0,
            generation: 0,
        }
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Construction parameters for [`Volume::new`].
pub struct VolumeDescriptor {
    pub id: Arc<str>,
    /// Extent as `[columns, rows, num_frames]`.
    pub dimensions: [u32; 3],
    /// Voxel spacing `[column, row, frame]`.
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    /// Direction cosines, three unit vectors row-major.
    pub direction: [f64; 9],
    pub pixel_format: PixelFormat,
    /// Ordered frame identities; position is the frame index.
    pub frame_ids: Vec<Arc<str>>,
    /// Slice loader per frame, resolved once at construction.
    pub frame_loaders: Vec<Arc<dyn SliceLoader>>,
}

/// A 3-D pixel buffer assembled from an ordered sequence of slice identities.
pub struct Volume {
    id: Arc<str>,
    dimensions: [u32; 3],
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: [f64; 9],
    pixel_format: PixelFormat,
    frame_ids: Vec<Arc<str>>,
    frame_loaders: Vec<Arc<dyn SliceLoader>>,

    /// The contiguous scalar buffer. `None` after a destructive decache has
    /// moved the bytes out to per-frame owners.
    buffer: Mutex<Option<BytesMut>>,

    status: Mutex<LoadStatus>,

    /// Single-shot completion signal; late subscribers observe `true`
    /// immediately instead of missing the event.
    loaded_tx: watch::Sender<bool>,
}

impl Volume {
    /// Construct a volume with a zero-filled buffer sized from its extent.
    pub fn new(descriptor: VolumeDescriptor) -> Result<Self, LoadError> {
        let num_frames = descriptor.dimensions[2] as usize;
        if num_frames == 0 {
            return Err(LoadError::InvalidVolume {
                id: descriptor.id.to_string(),
                reason: "volume has zero frames".to_string(),
            });
        }
        if descriptor.frame_ids.len() != num_frames
            || descriptor.frame_loaders.len() != num_frames
        {
            return Err(LoadError::InvalidVolume {
                id: descriptor.id.to_string(),
                reason: format!(
                    "frame sequence length {} does not match extent {}",
                    descriptor.frame_ids.len(),
                    num_frames
                ),
            });
        }

        let byte_len = descriptor.dimensions[0] as usize
            * descriptor.dimensions[1] as usize
            * num_frames
            * descriptor.pixel_format.bytes_per_voxel();
        let (loaded_tx, _) = watch::channel(false);

        Ok(Self {
            id: descriptor.id,
            dimensions: descriptor.dimensions,
            spacing: descriptor.spacing,
            origin: descriptor.origin,
            direction: descriptor.direction,
            pixel_format: descriptor.pixel_format,
            frame_ids: descriptor.frame_ids,
            frame_loaders: descriptor.frame_loaders,
            buffer: Mutex::new(Some(BytesMut::zeroed(byte_len))),
            status: Mutex::new(LoadStatus::new(num_frames)),
            loaded_tx,
        })
    }

    // -------------------------------------------------------------------------
    // Identity and geometry
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn id_arc(&self) -> Arc<str> {
        self.id.clone()
    }

    /// Extent as `[columns, rows, num_frames]`.
    pub fn dimensions(&self) -> [u32; 3] {
        self.dimensions
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn direction(&self) -> [f64; 9] {
        self.direction
    }

    pub fn pixel_format(&self) -> &PixelFormat {
        &self.pixel_format
    }

    pub fn num_frames(&self) -> usize {
        self.dimensions[2] as usize
    }

    /// Ordered frame identity sequence.
    pub fn frame_ids(&self) -> &[Arc<str>] {
        &self.frame_ids
    }

    pub(crate) fn frame_loader(&self, frame_index: usize) -> Arc<dyn SliceLoader> {
        self.frame_loaders[frame_index].clone()
    }

    /// Byte size of one frame.
    pub fn frame_size_in_bytes(&self) -> usize {
        self.dimensions[0] as usize
            * self.dimensions[1] as usize
            * self.pixel_format.bytes_per_voxel()
    }

    /// Total buffer size in bytes; fixed at construction.
    pub fn size_in_bytes(&self) -> usize {
        self.frame_size_in_bytes() * self.num_frames()
    }

    // -------------------------------------------------------------------------
    // Load state
    // -------------------------------------------------------------------------

    pub fn is_loaded(&self) -> bool {
        self.status_lock().loaded
    }

    pub fn is_loading(&self) -> bool {
        self.status_lock().loading
    }

    /// Per-frame residency bitmap snapshot.
    pub fn cached_frames(&self) -> Vec<bool> {
        self.status_lock().cached_frames.clone()
    }

    /// Indices of frames whose most recent fetch attempt failed.
    pub fn failed_frame_indices(&self) -> Vec<usize> {
        self.status_lock()
            .failed_frames
            .iter()
            .enumerate()
            .filter_map(|(index, failed)| failed.then_some(index))
            .collect()
    }

    /// Wait until the volume transitions to loaded.
    ///
    /// Resolves immediately when the volume is already loaded.
    pub async fn wait_until_loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we
        // hold `&self`.
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    pub(crate) fn status_lock(&self) -> MutexGuard<'_, LoadStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn signal_loaded(&self) {
        let _ = self.loaded_tx.send(true);
    }

    /// Tear down an active streaming session: bump the generation so stale
    /// completions are discarded, clear the residency bitmap and notify the
    /// session's callbacks of cancellation.
    pub(crate) fn abort_load(&self) {
        let callbacks = {
            let mut status = self.status_lock();
            if !status.loading {
                return;
            }
            status.generation += 1;
            status.loading = false;
            status.remaining = 0;
            status.cached_frames.fill(false);
            status.failed_frames.fill(false);
            std::mem::take(&mut status.callbacks)
        };
        let event = StreamEvent::Cancelled;
        for callback in &callbacks {
            callback(&event);
        }
    }

    // -------------------------------------------------------------------------
    // Pixel access
    // -------------------------------------------------------------------------

    /// Write one frame's pixel bytes at its fixed offset.
    ///
    /// Fails with [`FetchError::SizeMismatch`] on a wrong payload length and
    /// [`FetchError::BufferReleased`] after a destructive decache.
    pub(crate) fn write_frame(&self, frame_index: usize, pixels: &[u8]) -> Result<(), FetchError> {
        let frame_size = self.frame_size_in_bytes();
        if pixels.len() != frame_size {
            return Err(FetchError::SizeMismatch {
                id: self.frame_ids[frame_index].to_string(),
                expected: frame_size,
                actual: pixels.len(),
            });
        }
        let offset = frame_index * frame_size;
        self.write_at_offset(offset, pixels)
    }

    fn write_at_offset(&self, offset: usize, pixels: &[u8]) -> Result<(), FetchError> {
        let mut guard = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = guard
            .as_mut()
            .ok_or_else(|| FetchError::BufferReleased(self.id.to_string()))?;
        let end = offset + pixels.len();
        if end > buffer.len() {
            return Err(FetchError::SizeMismatch {
                id: self.id.to_string(),
                expected: buffer.len().saturating_sub(offset),
                actual: pixels.len(),
            });
        }
        buffer[offset..end].copy_from_slice(pixels);
        Ok(())
    }

    /// Copy one frame's byte range out of the buffer.
    ///
    /// Returns `None` for an out-of-range frame index or after a destructive
    /// decache has released the buffer.
    pub fn copy_frame(&self, frame_index: usize) -> Option<Bytes> {
        if frame_index >= self.num_frames() {
            return None;
        }
        let guard = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = guard.as_ref()?;
        let frame_size = self.frame_size_in_bytes();
        let offset = frame_index * frame_size;
        Some(Bytes::copy_from_slice(&buffer[offset..offset + frame_size]))
    }

    /// Take ownership of the whole buffer, leaving the volume bufferless.
    pub(crate) fn take_buffer(&self) -> Option<BytesMut> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Scalar value at `(column, row, frame)`, decoded per the pixel format.
    ///
    /// Returns `None` when the coordinate is out of bounds or the buffer has
    /// been released.
    pub fn scalar_at(&self, column: u32, row: u32, frame: u32) -> Option<f64> {
        let [columns, rows, frames] = self.dimensions;
        if column >= columns || row >= rows || frame >= frames {
            return None;
        }
        let guard = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = guard.as_ref()?;

        let voxel = (frame as usize * rows as usize + row as usize) * columns as usize
            + column as usize;
        let offset = voxel * self.pixel_format.bytes_per_voxel();

        let value = match (self.pixel_format.bits_allocated, self.pixel_format.signed) {
            (8, false) => buffer[offset] as f64,
            (8, true) => buffer[offset] as i8 as f64,
            (16, false) => u16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as f64,
            (16, true) => i16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as f64,
            _ => return None,
        };
        Some(value)
    }
}

impl FrameSink for Volume {
    fn write_at(&self, offset: usize, pixels: &[u8]) -> Result<(), FetchError> {
        self.write_at_offset(offset, pixels)
    }
}

// =============================================================================
// Tests
// =============================================================================
