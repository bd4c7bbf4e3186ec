//! Name-addressed cache for slices and volumes.
//!
//! The cache is the single source of truth for byte accounting and
//! identity-based deduplication: other components look here first to decide
//! whether a slice fetch is needed at all.
//!
//! # Accounting
//!
//! Every entry carries an immutable `size_in_bytes` recorded at registration.
//! The running total is incremented on `put` and decremented by exactly the
//! recorded amount on `remove`, so `total_size_in_bytes` is O(1) and each
//! byte range is counted once even when a volume's buffer later backs
//! per-frame slice views.
//!
//! # Eviction
//!
//! Slice entries live in an LRU ordering and are evicted oldest-first when a
//! `put` would exceed capacity. Volume entries are never auto-evicted; they
//! leave the cache only through explicit removal or destructive decache.

mod entry;

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::CacheError;

pub use entry::{CacheEntry, CachedPayload, EntryKind, HandleState, LoadHandle, Slice};

/// Default cache capacity: 1GB.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024 * 1024 * 1024;

/// Capacity-tracked store of named slice and volume entries.
///
/// Thread-safe; share across tasks via `Arc`.
pub struct Cache {
    /// Slice entries in LRU order (`get_slice` promotes recency).
    slices: RwLock<LruCache<Arc<str>, CacheEntry>>,

    /// Volume entries, exempt from eviction.
    volumes: RwLock<HashMap<Arc<str>, CacheEntry>>,

    /// Running byte total across both maps.
    current_size: RwLock<usize>,

    /// Maximum total size in bytes.
    max_size: usize,
}

impl Cache {
    /// Create a cache with the default capacity (1GB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a cache bounded to `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            slices: RwLock::new(LruCache::unbounded()),
            volumes: RwLock::new(HashMap::new()),
            current_size: RwLock::new(0),
            max_size,
        }
    }

    /// Register a slice entry under its id.
    ///
    /// Evicts least-recently-used slices until the entry fits. Fails with
    /// [`CacheError::DuplicateId`] if the id is present under either kind and
    /// [`CacheError::CapacityExceeded`] if the entry cannot fit even with
    /// every evictable slice gone.
    pub async fn put_slice(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut slices = self.slices.write().await;
        let volumes = self.volumes.read().await;
        let mut current_size = self.current_size.write().await;

        if slices.contains(&entry.id) || volumes.contains_key(&entry.id) {
            return Err(CacheError::DuplicateId(entry.id.to_string()));
        }

        // Make room: evict LRU slices, never volumes.
        while *current_size + entry.size_in_bytes > self.max_size {
            match slices.pop_lru() {
                Some((evicted_id, evicted)) => {
                    *current_size = current_size.saturating_sub(evicted.size_in_bytes);
                    debug!(id = %evicted_id, bytes = evicted.size_in_bytes, "evicted slice");
                }
                None => {
                    return Err(CacheError::CapacityExceeded {
                        required: entry.size_in_bytes,
                        capacity: self.max_size,
                    })
                }
            }
        }

        *current_size += entry.size_in_bytes;
        slices.put(entry.id.clone(), entry);
        Ok(())
    }

    /// Register a volume entry under its id.
    ///
    /// Volumes are registered before any pixel bytes are fetched, so the
    /// streaming layer can deduplicate concurrent loads by identity.
    pub async fn put_volume(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut slices = self.slices.write().await;
        let mut volumes = self.volumes.write().await;
        let mut current_size = self.current_size.write().await;

        if slices.contains(&entry.id) || volumes.contains_key(&entry.id) {
            return Err(CacheError::DuplicateId(entry.id.to_string()));
        }

        while *current_size + entry.size_in_bytes > self.max_size {
            match slices.pop_lru() {
                Some((evicted_id, evicted)) => {
                    *current_size = current_size.saturating_sub(evicted.size_in_bytes);
                    debug!(id = %evicted_id, bytes = evicted.size_in_bytes, "evicted slice");
                }
                None => {
                    return Err(CacheError::CapacityExceeded {
                        required: entry.size_in_bytes,
                        capacity: self.max_size,
                    })
                }
            }
        }

        *current_size += entry.size_in_bytes;
        volumes.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Look up a slice entry, promoting its recency.
    pub async fn get_slice(&self, id: &str) -> Option<CacheEntry> {
        let mut slices = self.slices.write().await;
        slices.get(id).cloned()
    }

    /// Check for a slice entry without touching LRU order.
    pub async fn contains_slice(&self, id: &str) -> bool {
        let slices = self.slices.read().await;
        slices.contains(id)
    }

    /// Look up a volume entry.
    pub async fn get_volume(&self, id: &str) -> Option<CacheEntry> {
        let volumes = self.volumes.read().await;
        volumes.get(id).cloned()
    }

    /// Remove the entry registered under `id` (slice or volume).
    ///
    /// Decreases the running total by exactly the entry's recorded size.
    /// Removing a volume that is mid-load notifies its registered callbacks
    /// of cancellation before the entry disappears.
    pub async fn remove(&self, id: &str) -> Result<CacheEntry, CacheError> {
        let removed = {
            let mut slices = self.slices.write().await;
            let mut volumes = self.volumes.write().await;
            let mut current_size = self.current_size.write().await;

            let removed = if let Some(entry) = slices.pop(id) {
                entry
            } else if let Some(entry) = volumes.remove(id) {
                entry
            } else {
                return Err(CacheError::NotFound(id.to_string()));
            };

            *current_size = current_size.saturating_sub(removed.size_in_bytes);
            removed
        };

        if let Some(volume) = removed.volume() {
            if volume.is_loading() {
                warn!(id = %removed.id, "removed a volume mid-load, notifying cancellation");
                volume.abort_load();
            }
        }

        Ok(removed)
    }

    /// Remove every entry and reset the running total to zero.
    ///
    /// Loading volumes are notified of cancellation first. Always safe; used
    /// as session teardown between independent logical sessions.
    pub async fn purge_all(&self) {
        let volumes: Vec<CacheEntry> = {
            let mut slices = self.slices.write().await;
            let mut volumes = self.volumes.write().await;
            let mut current_size = self.current_size.write().await;

            slices.clear();
            *current_size = 0;
            volumes.drain().map(|(_, entry)| entry).collect()
        };

        for entry in volumes {
            if let Some(volume) = entry.volume() {
                if volume.is_loading() {
                    volume.abort_load();
                }
            }
        }
    }

    /// Current total size of all entries in bytes.
    pub async fn total_size_in_bytes(&self) -> usize {
        *self.current_size.read().await
    }

    /// Number of registered entries (slices plus volumes).
    pub async fn len(&self) -> usize {
        let slices = self.slices.read().await;
        let volumes = self.volumes.read().await;
        slices.len() + volumes.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
