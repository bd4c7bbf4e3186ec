//! Built-in volume constructor that derives geometry from metadata.
//!
//! Extent and pixel format come from the first frame's pixel module, spatial
//! placement from its plane module; the scan-axis direction is the cross
//! product of the in-plane orientation cosines. Every frame's slice loader
//! is resolved once, here, never per fetch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FetchError, LoadError};
use crate::io::{LoaderRegistry, SliceLoader, VolumeLoader, VolumeOptions};
use crate::metadata::{modules, ImagePixelModule, ImagePlaneModule, MetadataRegistry};

use super::{PixelFormat, Volume, VolumeDescriptor};

/// Volume loader backed by the metadata and loader registries.
pub struct MetadataVolumeLoader {
    metadata: Arc<MetadataRegistry>,
    loaders: Arc<LoaderRegistry>,
}

impl MetadataVolumeLoader {
    pub fn new(metadata: Arc<MetadataRegistry>, loaders: Arc<LoaderRegistry>) -> Self {
        Self { metadata, loaders }
    }

    fn pixel_module(&self, slice_id: &str) -> Result<ImagePixelModule, LoadError> {
        self.metadata
            .get_module(modules::IMAGE_PIXEL, slice_id)
            .ok_or_else(|| {
                LoadError::Fetch(FetchError::MissingMetadata {
                    module: modules::IMAGE_PIXEL.to_string(),
                    id: slice_id.to_string(),
                })
            })
    }

    fn plane_module(&self, slice_id: &str) -> Result<ImagePlaneModule, LoadError> {
        self.metadata
            .get_module(modules::IMAGE_PLANE, slice_id)
            .ok_or_else(|| {
                LoadError::Fetch(FetchError::MissingMetadata {
                    module: modules::IMAGE_PLANE.to_string(),
                    id: slice_id.to_string(),
                })
            })
    }
}

#[async_trait]
impl VolumeLoader for MetadataVolumeLoader {
    async fn create_volume(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
    ) -> Result<Volume, LoadError> {
        if options.frame_ids.is_empty() {
            return Err(LoadError::InvalidVolume {
                id: volume_id.to_string(),
                reason: "empty frame identity sequence".to_string(),
            });
        }

        let first_id = options.frame_ids[0].as_str();
        let pixel = self.pixel_module(first_id)?;
        let plane = self.plane_module(first_id)?;

        if pixel.bits_allocated != 8 && pixel.bits_allocated != 16 {
            return Err(LoadError::InvalidVolume {
                id: volume_id.to_string(),
                reason: format!("unsupported bits allocated: {}", pixel.bits_allocated),
            });
        }

        let frame_ids: Vec<Arc<str>> = options
            .frame_ids
            .iter()
            .map(|id| Arc::from(id.as_str()))
            .collect();

        // Resolve every frame's loader up front so a missing scheme fails
        // construction instead of a fetch mid-stream.
        let frame_loaders: Vec<Arc<dyn SliceLoader>> = options
            .frame_ids
            .iter()
            .map(|id| self.loaders.slice_loader(id))
            .collect::<Result<_, _>>()?;

        let direction = direction_from_orientation(&plane.image_orientation_patient);
        let spacing = [
            plane.pixel_spacing[1],
            plane.pixel_spacing[0],
            plane.spacing_between_slices.unwrap_or(1.0),
        ];

        Volume::new(VolumeDescriptor {
            id: Arc::from(volume_id),
            dimensions: [pixel.columns, pixel.rows, options.frame_ids.len() as u32],
            spacing,
            origin: plane.image_position_patient,
            direction,
            pixel_format: PixelFormat {
                bits_allocated: pixel.bits_allocated,
                signed: pixel.pixel_representation == 1,
                photometric_interpretation: pixel.photometric_interpretation,
            },
            frame_ids,
            frame_loaders,
        })
    }
}

/// Build the 3x3 direction cosine matrix from the in-plane orientation.
///
/// The scan-axis vector is the cross product of the row and column cosines.
fn direction_from_orientation(orientation: &[f64; 6]) -> [f64; 9] {
    let row = [orientation[0], orientation[1], orientation[2]];
    let col = [orientation[3], orientation[4], orientation[5]];
    let normal = [
        row[1] * col[2] - row[2] * col[1],
        row[2] * col[0] - row[0] * col[2],
        row[0] * col[1] - row[1] * col[0],
    ];
    [
        row[0], row[1], row[2], col[0], col[1], col[2], normal[0], normal[1], normal[2],
    ]
}

// =============================================================================
// Tests
// =============================================================================
