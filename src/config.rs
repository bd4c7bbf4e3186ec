//! Configuration for the vox-streamer demo binary.
//!
//! Options come from command-line arguments via clap with environment
//! variable fallbacks (`VOX_` prefix) and sensible defaults.
//!
//! # Environment Variables
//!
//! - `VOX_FRAMES` - Number of frames in the demo volume (default: 5)
//! - `VOX_ROWS` - Rows per frame (default: 100)
//! - `VOX_COLUMNS` - Columns per frame (default: 100)
//! - `VOX_CACHE_CAPACITY` - Cache capacity in bytes (default: 1GB)
//! - `VOX_MAX_CONCURRENT` - Concurrent fetch bound (default: 6)
//! - `VOX_FETCH_DELAY_MS` - Artificial per-fetch latency (default: 0)

use clap::{Parser, ValueEnum};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::pool::DEFAULT_MAX_CONCURRENT;

// =============================================================================
// Default Values
// =============================================================================

/// Default number of frames in the demo volume.
pub const DEFAULT_FRAMES: usize = 5;

/// Default in-plane extent.
pub const DEFAULT_ROWS: u32 = 100;

/// Default in-plane extent.
pub const DEFAULT_COLUMNS: u32 = 100;

// =============================================================================
// CLI Arguments
// =============================================================================

/// What to do with the volume after it finishes loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecacheMode {
    /// Leave the volume as-is.
    None,
    /// Copy frames into standalone slices, volume retained.
    Copy,
    /// Move frames into standalone slices, volume removed.
    Move,
}

/// vox-streamer - stream a synthetic volume end to end.
///
/// Builds a synthetic N-frame volume, streams its slices through the cache
/// and request pool, and reports a JSON run summary.
#[derive(Parser, Debug, Clone)]
#[command(name = "vox-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Volume Shape
    // =========================================================================
    /// Number of frames in the demo volume.
    #[arg(long, default_value_t = DEFAULT_FRAMES, env = "VOX_FRAMES")]
    pub frames: usize,

    /// Rows per frame.
    #[arg(long, default_value_t = DEFAULT_ROWS, env = "VOX_ROWS")]
    pub rows: u32,

    /// Columns per frame.
    #[arg(long, default_value_t = DEFAULT_COLUMNS, env = "VOX_COLUMNS")]
    pub columns: u32,

    // =========================================================================
    // Cache and Pool Configuration
    // =========================================================================
    /// Cache capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY, env = "VOX_CACHE_CAPACITY")]
    pub cache_capacity: usize,

    /// Maximum number of concurrently executing fetches.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT, env = "VOX_MAX_CONCURRENT")]
    pub max_concurrent: usize,

    // =========================================================================
    // Streaming Behavior
    // =========================================================================
    /// Submit fetches at interaction priority instead of prefetch.
    #[arg(long, default_value_t = false)]
    pub interactive: bool,

    /// Artificial per-fetch latency in milliseconds.
    #[arg(long, default_value_t = 0, env = "VOX_FETCH_DELAY_MS")]
    pub fetch_delay_ms: u64,

    /// Post-load decache mode.
    #[arg(long, value_enum, default_value_t = DecacheMode::None)]
    pub decache: DecacheMode,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.frames == 0 {
            return Err("frames must be greater than 0".to_string());
        }
        if self.rows == 0 || self.columns == 0 {
            return Err("rows and columns must be greater than 0".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".to_string());
        }

        // The volume and its decached slices must both fit.
        let volume_bytes = self.volume_size_in_bytes();
        if self.cache_capacity < volume_bytes * 2 {
            return Err(format!(
                "cache_capacity must be at least twice the volume size ({} bytes)",
                volume_bytes * 2
            ));
        }

        Ok(())
    }

    /// Byte size of the configured demo volume (8-bit voxels).
    pub fn volume_size_in_bytes(&self) -> usize {
        self.rows as usize * self.columns as usize * self.frames
    }
}

// =============================================================================
// Tests
// =============================================================================
