//! # Vox Streamer
//!
//! A caching and progressive-assembly layer for volumetric imaging data.
//!
//! A 3-D volume is logically a sequence of independently, asynchronously
//! fetched 2-D slices that are written into one contiguous buffer without
//! duplicating memory, while individual slices may also exist as standalone
//! cached entries.
//!
//! ## Features
//!
//! - **Progressive assembly**: per-frame completion bitmap tolerates
//!   out-of-order, concurrent slice arrivals
//! - **Deduplicated fetching**: at most one outstanding fetch per slice
//!   identity across all priority classes
//! - **Shared pixel memory**: cache-resident slices are reused without a
//!   second fetch; destructive decache re-owns frame ranges with zero copies
//! - **Reversible decache**: one volume and N standalone slices are
//!   interchangeable representations, by move or by copy
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`cache`] - Capacity-tracked store of slice and volume entries
//! - [`pool`] - Priority-queued, deduplicated fetch scheduler
//! - [`io`] - Loader traits and scheme-based loader resolution
//! - [`volume`] - Volume data model, streaming coordinator and decache
//! - [`metadata`] - Priority-ordered metadata provider registry
//! - [`synthetic`] - Self-describing synthetic loader for demos and tests
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use vox_streamer::{synthetic, StreamingContext, VolumeOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = StreamingContext::new();
//!     synthetic::register(&ctx);
//!
//!     let frame_ids: Vec<String> = (1..=5)
//!         .map(|i| synthetic::synthetic_frame_id("frame", 100, 100, i))
//!         .collect();
//!
//!     let volume = ctx
//!         .create_volume("synthetic:demo_100_100_0", VolumeOptions::new(frame_ids))
//!         .await
//!         .unwrap();
//!
//!     ctx.load_volume(&volume, None, true).await.unwrap();
//!     volume.wait_until_loaded().await;
//!
//!     assert_eq!(volume.scalar_at(0, 0, 0), Some(1.0));
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod io;
pub mod metadata;
pub mod pool;
pub mod synthetic;
pub mod volume;

// Re-export commonly used types
pub use cache::{
    Cache, CacheEntry, CachedPayload, EntryKind, HandleState, LoadHandle, Slice,
    DEFAULT_CACHE_CAPACITY,
};
pub use config::{Config, DecacheMode};
pub use error::{CacheError, FetchError, LoadError};
pub use io::{
    scheme_of, FetchOptions, FetchPayload, FrameSink, FrameTarget, LoaderRegistry, SliceLoader,
    VolumeLoader, VolumeOptions,
};
pub use metadata::{
    ImagePixelModule, ImagePlaneModule, MetadataProvider, MetadataRegistry, ProviderId,
};
pub use pool::{
    RequestPoolManager, RequestPoolSnapshot, RequestPriority, DEFAULT_MAX_CONCURRENT,
};
pub use volume::{
    ContextOptions, LoadCallback, MetadataVolumeLoader, PixelFormat, StreamEvent,
    StreamingContext, Volume, VolumeDescriptor,
};
