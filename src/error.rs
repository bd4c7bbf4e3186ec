use thiserror::Error;

/// Errors raised by cache bookkeeping operations.
///
/// These are identity/accounting errors and are always reported synchronously
/// to the caller; they never travel through a frame's callback chain.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// An entry with this id is already registered (slice or volume).
    #[error("Duplicate cache id: {0}")]
    DuplicateId(String),

    /// No entry with this id is registered.
    #[error("Cache id not found: {0}")]
    NotFound(String),

    /// The entry cannot fit even after evicting every evictable slice.
    #[error("Entry of {required} bytes cannot fit in cache of {capacity} bytes")]
    CapacityExceeded { required: usize, capacity: usize },
}

/// Errors raised while fetching a single slice's pixel data.
///
/// A fetch error is isolated to the frame that triggered it: sibling frames of
/// the same volume keep streaming and previously written bytes are untouched.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// No slice loader is registered for the id's scheme.
    #[error("No loader registered for scheme: {0}")]
    UnknownScheme(String),

    /// Transport-level failure reported by the loader.
    #[error("Fetch failed for {id}: {reason}")]
    Transport { id: String, reason: String },

    /// Pixel payload size disagrees with the expected frame size.
    ///
    /// Never silently copied: a mismatched cache hit falls back to a fresh
    /// fetch, a mismatched fetch payload fails that frame.
    #[error("Size mismatch for {id}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    /// A metadata module required to size or describe the slice is missing.
    #[error("Missing metadata module {module} for {id}")]
    MissingMetadata { module: String, id: String },

    /// Another fetch for the same id is already outstanding in the pool.
    #[error("A fetch for {0} is already in flight")]
    DuplicateInFlight(String),

    /// The target pixel buffer was released before the fetch landed.
    #[error("Pixel buffer released for {0}")]
    BufferReleased(String),

    /// The fetch was abandoned before it produced a result.
    #[error("Fetch aborted before completion")]
    Aborted,
}

/// Top-level errors for volume construction, streaming and decache.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Cache bookkeeping error.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Slice fetch error surfaced synchronously (scheme resolution, sizing).
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Operation requires a fully loaded volume.
    #[error("Volume {0} is not loaded")]
    NotLoaded(String),

    /// The volume description is unusable (empty frame list, bad pixel format).
    #[error("Invalid volume {id}: {reason}")]
    InvalidVolume { id: String, reason: String },
}
