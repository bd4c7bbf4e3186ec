//! Cache entry types: standalone slices, deferred load handles and the
//! entry record the cache stores under each id.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::FetchError;
use crate::volume::Volume;

// =============================================================================
// Slice
// =============================================================================

/// A standalone 2-D pixel image with its own cache identity.
///
/// A slice either owns its pixel buffer exclusively or shares an allocation
/// with sibling slices produced by a destructive decache (`Bytes` sub-slices
/// of one frozen volume buffer). Sharing is invisible to readers: the pixel
/// data is immutable either way.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Cache identity (`scheme:path`).
    pub id: Arc<str>,

    /// Number of pixel rows.
    pub rows: u32,

    /// Number of pixel columns.
    pub columns: u32,

    /// Pixel payload size in bytes.
    pub size_in_bytes: usize,

    /// Raw pixel bytes, row-major.
    pub pixel_data: Bytes,

    /// Set on decache-produced slices: intensity presentation was flipped to
    /// display the frame as a conventional 2-D image.
    pub invert: bool,
}

impl Slice {
    /// Create a slice owning the given pixel buffer.
    pub fn new(id: impl Into<Arc<str>>, rows: u32, columns: u32, pixel_data: Bytes) -> Self {
        Self {
            id: id.into(),
            rows,
            columns,
            size_in_bytes: pixel_data.len(),
            pixel_data,
            invert: false,
        }
    }

    /// Mark this slice as intensity-inverted (decache output).
    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }
}

// =============================================================================
// Load Handle
// =============================================================================

/// What a resolved cache entry holds.
#[derive(Clone)]
pub enum CachedPayload {
    /// A standalone 2-D slice.
    Slice(Arc<Slice>),

    /// An assembled (or assembling) 3-D volume.
    Volume(Arc<Volume>),
}

/// Resolution state of a deferred load.
#[derive(Clone, Default)]
pub enum HandleState {
    /// The payload is still being produced.
    #[default]
    Pending,

    /// The payload is available.
    Resolved(CachedPayload),

    /// Production failed; the error is shared with every waiter.
    Rejected(FetchError),
}

impl HandleState {
    fn is_pending(&self) -> bool {
        matches!(self, HandleState::Pending)
    }
}

/// Deferred-resolution handle wrapping a slice or a volume.
///
/// Cloning the handle is cheap; every clone observes the same single-shot
/// resolution. A waiter that subscribes after resolution is notified
/// immediately, so late `wait` calls never miss the event.
#[derive(Clone)]
pub struct LoadHandle {
    tx: Arc<watch::Sender<HandleState>>,
    rx: watch::Receiver<HandleState>,
}

impl LoadHandle {
    /// Create a handle in the pending state.
    pub fn pending() -> Self {
        let (tx, rx) = watch::channel(HandleState::Pending);
        Self { tx: Arc::new(tx), rx }
    }

    /// Create a handle that is already resolved.
    pub fn resolved(payload: CachedPayload) -> Self {
        let (tx, rx) = watch::channel(HandleState::Resolved(payload));
        Self { tx: Arc::new(tx), rx }
    }

    /// Resolve the handle. A second resolution attempt is ignored.
    pub fn resolve(&self, payload: CachedPayload) {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = HandleState::Resolved(payload);
                true
            } else {
                false
            }
        });
    }

    /// Reject the handle. A second resolution attempt is ignored.
    pub fn reject(&self, error: FetchError) {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = HandleState::Rejected(error);
                true
            } else {
                false
            }
        });
    }

    /// Current state snapshot.
    pub fn state(&self) -> HandleState {
        self.rx.borrow().clone()
    }

    /// Whether the handle is still pending.
    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_pending()
    }

    /// Wait until the handle leaves the pending state.
    ///
    /// Resolves immediately for an already-settled handle.
    pub async fn wait(&self) -> Result<CachedPayload, FetchError> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| FetchError::Aborted)?
            .clone();
        match settled {
            HandleState::Resolved(payload) => Ok(payload),
            HandleState::Rejected(error) => Err(error),
            HandleState::Pending => Err(FetchError::Aborted),
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Kind of payload an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Slice,
    Volume,
}

/// A cache entry: id, kind, immutable size accounting and the load handle.
///
/// `size_in_bytes` is fixed at registration; removing the entry decreases the
/// cache's running total by exactly this amount.
#[derive(Clone)]
pub struct CacheEntry {
    /// Cache identity the entry is registered under.
    pub id: Arc<str>,

    /// Slice or volume.
    pub kind: EntryKind,

    /// Byte size accounted against the cache total.
    pub size_in_bytes: usize,

    /// Deferred handle to the payload.
    pub handle: LoadHandle,
}

impl CacheEntry {
    /// Entry for an already-materialized slice.
    pub fn for_slice(slice: Arc<Slice>) -> Self {
        Self {
            id: slice.id.clone(),
            kind: EntryKind::Slice,
            size_in_bytes: slice.size_in_bytes,
            handle: LoadHandle::resolved(CachedPayload::Slice(slice)),
        }
    }

    /// Pending slice entry sized ahead of its fetch.
    pub fn pending_slice(id: impl Into<Arc<str>>, size_in_bytes: usize) -> Self {
        Self {
            id: id.into(),
            kind: EntryKind::Slice,
            size_in_bytes,
            handle: LoadHandle::pending(),
        }
    }

    /// Entry for a constructed volume (registered before any pixel fetch).
    pub fn for_volume(volume: Arc<Volume>) -> Self {
        Self {
            id: volume.id_arc(),
            kind: EntryKind::Volume,
            size_in_bytes: volume.size_in_bytes(),
            handle: LoadHandle::resolved(CachedPayload::Volume(volume)),
        }
    }

    /// The resolved slice payload, if this entry holds one.
    pub fn slice(&self) -> Option<Arc<Slice>> {
        match self.handle.state() {
            HandleState::Resolved(CachedPayload::Slice(slice)) => Some(slice),
            _ => None,
        }
    }

    /// The resolved volume payload, if this entry holds one.
    pub fn volume(&self) -> Option<Arc<Volume>> {
        match self.handle.state() {
            HandleState::Resolved(CachedPayload::Volume(volume)) => Some(volume),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
