//! Metadata provider registry.
//!
//! Providers are synchronous `(module_name, slice_id) -> record` lookups
//! registered with a numeric priority; higher priorities are consulted
//! first and the first non-empty answer wins. Records travel as JSON values
//! so providers stay decoupled from the typed modules consumers deserialize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Well-known module names.
pub mod modules {
    /// Pixel description: extent, bit depth, representation.
    pub const IMAGE_PIXEL: &str = "imagePixelModule";

    /// Spatial description: spacing, orientation, position.
    pub const IMAGE_PLANE: &str = "imagePlaneModule";
}

/// A metadata lookup function.
pub type MetadataProvider = Arc<dyn Fn(&str, &str) -> Option<Value> + Send + Sync>;

// =============================================================================
// Typed modules
// =============================================================================

/// Pixel description of a slice, DICOM-keyword field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImagePixelModule {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u8,
    /// 0 = unsigned, 1 = two's-complement signed.
    pub pixel_representation: u8,
    pub photometric_interpretation: String,
    #[serde(default = "default_samples")]
    pub samples_per_pixel: u8,
}

fn default_samples() -> u8 {
    1
}

impl ImagePixelModule {
    /// Storage size of one voxel in bytes.
    pub fn bytes_per_voxel(&self) -> usize {
        (self.bits_allocated as usize / 8).max(1) * self.samples_per_pixel as usize
    }

    /// Byte size of one full slice.
    pub fn frame_size_in_bytes(&self) -> usize {
        self.rows as usize * self.columns as usize * self.bytes_per_voxel()
    }
}

/// Spatial description of a slice, DICOM-keyword field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImagePlaneModule {
    /// Row spacing then column spacing, in mm.
    pub pixel_spacing: [f64; 2],
    /// Row direction cosines then column direction cosines.
    pub image_orientation_patient: [f64; 6],
    pub image_position_patient: [f64; 3],
    #[serde(default)]
    pub spacing_between_slices: Option<f64>,
}

// =============================================================================
// Registry
// =============================================================================

/// Opaque registration handle returned by [`MetadataRegistry::add_provider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderId(u64);

struct ProviderEntry {
    id: u64,
    priority: i32,
    provider: MetadataProvider,
}

/// Priority-ordered registry of metadata providers.
#[derive(Default)]
pub struct MetadataRegistry {
    providers: RwLock<Vec<ProviderEntry>>,
    next_id: AtomicU64,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Higher `priority` is consulted first; ties keep
    /// registration order. The returned handle removes this registration.
    pub fn add_provider(&self, priority: i32, provider: MetadataProvider) -> ProviderId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let at = providers
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(providers.len());
        providers.insert(
            at,
            ProviderEntry {
                id,
                priority,
                provider,
            },
        );
        ProviderId(id)
    }

    /// Unregister one provider by its handle.
    ///
    /// Returns `false` when the handle was already removed.
    pub fn remove_provider(&self, id: ProviderId) -> bool {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match providers.iter().position(|entry| entry.id == id.0) {
            Some(at) => {
                providers.remove(at);
                true
            }
            None => false,
        }
    }

    /// Drop every provider. Test isolation between sessions.
    pub fn clear(&self) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Look up `module` for `slice_id`, first answer wins.
    pub fn get(&self, module: &str, slice_id: &str) -> Option<Value> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        providers
            .iter()
            .find_map(|entry| (entry.provider)(module, slice_id))
    }

    /// Look up and deserialize `module` for `slice_id`.
    ///
    /// A record that exists but does not deserialize is treated as absent
    /// (logged), so a malformed provider cannot poison consumers.
    pub fn get_module<T: DeserializeOwned>(&self, module: &str, slice_id: &str) -> Option<T> {
        let value = self.get(module, slice_id)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(error) => {
                warn!(module, slice_id, %error, "metadata record failed to deserialize");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
