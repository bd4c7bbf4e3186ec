//! Decache: convert a loaded volume into standalone per-frame cache entries.
//!
//! Two modes with explicit ownership semantics:
//!
//! * **Non-destructive** (`completely_remove == false`): each frame's bytes
//!   are *copied* into a fresh slice; the volume entry and its buffer stay
//!   alive. The byte duplication is deliberate and shows up in the cache
//!   total.
//! * **Destructive** (`completely_remove == true`): the volume's buffer is
//!   taken out, frozen, and each produced slice re-owns its frame's byte
//!   range as a zero-copy sub-slice of that one allocation. The volume's
//!   cache entry is removed afterward; its bytes end up accounted once,
//!   under the per-frame entries.
//!
//! In both modes a frame id that already has a cache entry is left
//! untouched: its pixel data is cache-sourced or byte-identical, so there is
//! nothing to overwrite.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{CacheEntry, Slice};
use crate::error::LoadError;

use super::{StreamingContext, Volume};

impl StreamingContext {
    /// Redistribute a loaded volume's pixel data into per-frame cache
    /// entries.
    ///
    /// Fails with [`LoadError::NotLoaded`] before the volume has completed
    /// loading.
    pub async fn decache_volume(
        &self,
        volume: &Arc<Volume>,
        completely_remove: bool,
    ) -> Result<(), LoadError> {
        if !volume.is_loaded() {
            return Err(LoadError::NotLoaded(volume.id().to_string()));
        }
        if completely_remove {
            self.decache_destructive(volume).await
        } else {
            self.decache_copying(volume).await
        }
    }

    /// Copy mode: volume retained, frames duplicated into fresh slices.
    async fn decache_copying(&self, volume: &Arc<Volume>) -> Result<(), LoadError> {
        let [columns, rows, _] = volume.dimensions();
        let mut produced = 0usize;

        for (frame_index, frame_id) in volume.frame_ids().iter().enumerate() {
            if self.cache().contains_slice(frame_id).await {
                continue;
            }
            let pixels = volume
                .copy_frame(frame_index)
                .ok_or_else(|| LoadError::NotLoaded(volume.id().to_string()))?;
            let slice = Slice {
                id: frame_id.clone(),
                rows,
                columns,
                size_in_bytes: pixels.len(),
                pixel_data: pixels,
                invert: true,
            };
            self.cache().put_slice(CacheEntry::for_slice(Arc::new(slice))).await?;
            produced += 1;
        }

        info!(
            id = volume.id(),
            produced,
            "volume decached (copying), volume retained"
        );
        Ok(())
    }

    /// Move mode: frames re-own sub-ranges of the frozen volume buffer, the
    /// volume entry is removed.
    async fn decache_destructive(&self, volume: &Arc<Volume>) -> Result<(), LoadError> {
        let [columns, rows, _] = volume.dimensions();
        let frame_size = volume.frame_size_in_bytes();

        let buffer = volume
            .take_buffer()
            .ok_or_else(|| LoadError::NotLoaded(volume.id().to_string()))?
            .freeze();

        let mut produced = 0usize;
        for (frame_index, frame_id) in volume.frame_ids().iter().enumerate() {
            if self.cache().contains_slice(frame_id).await {
                debug!(id = %frame_id, "frame entry already present, left untouched");
                continue;
            }
            let offset = frame_index * frame_size;
            let slice = Slice {
                id: frame_id.clone(),
                rows,
                columns,
                size_in_bytes: frame_size,
                // Zero-copy: this slice shares the frozen allocation.
                pixel_data: buffer.slice(offset..offset + frame_size),
                invert: true,
            };
            self.cache().put_slice(CacheEntry::for_slice(Arc::new(slice))).await?;
            produced += 1;
        }

        // The volume's own entry goes last so a concurrent lookup never
        // observes the bytes owned by nobody.
        self.pool().clear_for_volume(volume.id());
        self.cache().remove(volume.id()).await?;

        info!(
            id = volume.id(),
            produced,
            "volume decached (destructive), volume removed"
        );
        Ok(())
    }
}
