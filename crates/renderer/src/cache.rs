//! Source-texture cache keyed by layer identity.
//!
//! One entry per layer. An entry is re-uploaded only when the layer's content
//! signature changes. [`TextureCache::sweep`] runs after every render attempt and
//! releases entries for layers that disappeared, entries idle for longer than
//! the generation window, and the least recently used entries beyond capacity.

use std::collections::{HashMap, HashSet};

use renderconfig::TextureCacheConfig;

use crate::gpu::{GpuBackend, GpuError, TextureHandle};
use crate::types::LayerId;

#[derive(Debug)]
struct CacheEntry {
    handle: TextureHandle,
    signature: String,
    last_used_generation: u64,
    last_touch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub uploads: u64,
    pub hits: u64,
    pub evictions: u64,
    pub resident: usize,
}

pub struct TextureCache {
    label: &'static str,
    entries: HashMap<LayerId, CacheEntry>,
    generation_window: u64,
    capacity: usize,
    touch: u64,
    stats: CacheStats,
}

impl TextureCache {
    pub fn new(label: &'static str, config: &TextureCacheConfig) -> Self {
        Self {
            label,
            entries: HashMap::new(),
            generation_window: config.generation_window,
            capacity: config.capacity,
            touch: 0,
            stats: CacheStats::default(),
        }
    }

    /// Returns the resident handle for `key`, uploading through `load` when
    /// there is no entry or its signature differs.
    pub fn acquire<F>(
        &mut self,
        backend: &mut dyn GpuBackend,
        key: LayerId,
        signature: &str,
        generation: u64,
        load: F,
    ) -> Result<TextureHandle, GpuError>
    where
        F: FnOnce(&mut dyn GpuBackend) -> Result<TextureHandle, GpuError>,
    {
        self.touch += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.signature == signature {
                entry.last_used_generation = generation;
                entry.last_touch = self.touch;
                self.stats.hits += 1;
                return Ok(entry.handle);
            }
        }

        let handle = load(backend)?;
        self.stats.uploads += 1;
        let replaced = self.entries.insert(
            key,
            CacheEntry {
                handle,
                signature: signature.to_owned(),
                last_used_generation: generation,
                last_touch: self.touch,
            },
        );
        if let Some(previous) = replaced {
            backend.destroy(previous.handle);
            self.stats.evictions += 1;
            tracing::debug!(cache = self.label, layer = %key, "content changed; re-uploaded");
        } else {
            tracing::debug!(cache = self.label, layer = %key, "uploaded");
        }
        Ok(handle)
    }

    /// Applies the three eviction rules. Returns the number of released entries.
    pub fn sweep(
        &mut self,
        backend: &mut dyn GpuBackend,
        live: &HashSet<LayerId>,
        generation: u64,
    ) -> usize {
        let window = self.generation_window;
        let mut doomed: Vec<LayerId> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                !live.contains(key)
                    || generation.saturating_sub(entry.last_used_generation) > window
            })
            .map(|(key, _)| *key)
            .collect();

        let survivors = self.entries.len() - doomed.len();
        if survivors > self.capacity {
            let mut by_recency: Vec<_> = self
                .entries
                .iter()
                .filter(|(key, _)| !doomed.contains(key))
                .map(|(key, entry)| (entry.last_used_generation, entry.last_touch, *key))
                .collect();
            by_recency.sort_unstable();
            doomed.extend(
                by_recency
                    .into_iter()
                    .take(survivors - self.capacity)
                    .map(|(_, _, key)| key),
            );
        }

        for key in &doomed {
            if let Some(entry) = self.entries.remove(key) {
                backend.destroy(entry.handle);
                self.stats.evictions += 1;
            }
        }
        if !doomed.is_empty() {
            tracing::debug!(cache = self.label, released = doomed.len(), "swept texture cache");
        }
        doomed.len()
    }

    pub fn clear(&mut self, backend: &mut dyn GpuBackend) {
        for (_, entry) in self.entries.drain() {
            backend.destroy(entry.handle);
        }
    }

    pub fn handle(&self, key: LayerId) -> Option<TextureHandle> {
        self.entries.get(&key).map(|entry| entry.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resident: self.entries.len(),
            ..self.stats
        }
    }
}
