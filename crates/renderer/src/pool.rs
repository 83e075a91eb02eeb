//! Render-target recycling.
//!
//! Targets live in `(width, height)` buckets while resident. Checking one out
//! moves it out of the pool; giving it back stamps it with a recency tick and
//! trims the pool to `max_resident` by destroying the stalest entries.

use std::collections::{HashMap, HashSet};

use renderconfig::ResourcePoolConfig;

use crate::gpu::{GpuBackend, GpuError, TextureHandle};

type BucketKey = (u32, u32);

/// A render target owned by exactly one in-flight pass.
#[derive(Debug, PartialEq, Eq)]
pub struct PooledTarget {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
struct Resident {
    handle: TextureHandle,
    returned_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub destroyed: u64,
}

pub struct ResourcePool {
    buckets: HashMap<BucketKey, Vec<Resident>>,
    checked_out: HashSet<TextureHandle>,
    max_resident: usize,
    clock: u64,
    stats: PoolStats,
}

impl ResourcePool {
    pub fn new(config: &ResourcePoolConfig) -> Self {
        Self {
            buckets: HashMap::new(),
            checked_out: HashSet::new(),
            max_resident: config.max_resident,
            clock: 0,
            stats: PoolStats::default(),
        }
    }

    pub fn checkout(
        &mut self,
        backend: &mut dyn GpuBackend,
        width: u32,
        height: u32,
    ) -> Result<PooledTarget, GpuError> {
        let recycled = self
            .buckets
            .get_mut(&(width, height))
            .and_then(|bucket| bucket.pop());
        let handle = match recycled {
            Some(resident) => {
                self.stats.reused += 1;
                resident.handle
            }
            None => {
                let handle = backend.create_target(width, height)?;
                self.stats.allocated += 1;
                tracing::debug!(%handle, width, height, "allocated render target");
                handle
            }
        };
        self.checked_out.insert(handle);
        Ok(PooledTarget {
            handle,
            width,
            height,
        })
    }

    /// Returns a target to its bucket. A target that is not checked out is
    /// left untouched and reported as rejected.
    pub fn give_back(&mut self, backend: &mut dyn GpuBackend, target: PooledTarget) -> bool {
        if !self.checked_out.remove(&target.handle) {
            tracing::warn!(handle = %target.handle, "ignoring return of a target that is not checked out");
            return false;
        }
        self.clock += 1;
        self.buckets
            .entry((target.width, target.height))
            .or_default()
            .push(Resident {
                handle: target.handle,
                returned_at: self.clock,
            });
        self.trim(backend);
        true
    }

    fn trim(&mut self, backend: &mut dyn GpuBackend) {
        while self.resident_count() > self.max_resident {
            let stalest = self
                .buckets
                .iter()
                .flat_map(|(key, bucket)| {
                    bucket
                        .iter()
                        .enumerate()
                        .map(move |(index, resident)| (resident.returned_at, *key, index))
                })
                .min();
            let Some((_, key, index)) = stalest else {
                break;
            };
            if let Some(bucket) = self.buckets.get_mut(&key) {
                let resident = bucket.remove(index);
                backend.destroy(resident.handle);
                self.stats.destroyed += 1;
                tracing::debug!(handle = %resident.handle, width = key.0, height = key.1, "evicted pooled target");
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
    }

    /// Destroys every resident target. Checked-out targets are unaffected.
    pub fn clear(&mut self, backend: &mut dyn GpuBackend) {
        for (_, bucket) in self.buckets.drain() {
            for resident in bucket {
                backend.destroy(resident.handle);
                self.stats.destroyed += 1;
            }
        }
    }

    pub fn resident_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

/// The long-lived compositing pair. Never pooled; resized in place.
pub struct PingPong {
    read: TextureHandle,
    write: TextureHandle,
    width: u32,
    height: u32,
}

impl PingPong {
    pub fn new(backend: &mut dyn GpuBackend, width: u32, height: u32) -> Result<Self, GpuError> {
        let read = backend.create_target(width, height)?;
        let write = match backend.create_target(width, height) {
            Ok(handle) => handle,
            Err(err) => {
                backend.destroy(read);
                return Err(err);
            }
        };
        Ok(Self {
            read,
            write,
            width,
            height,
        })
    }

    /// Re-allocates both sides when the canvas size changed.
    pub fn ensure_size(
        &mut self,
        backend: &mut dyn GpuBackend,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        if (self.width, self.height) == (width, height) {
            return Ok(());
        }
        let replacement = PingPong::new(backend, width, height)?;
        self.destroy(backend);
        *self = replacement;
        tracing::debug!(width, height, "resized ping-pong targets");
        Ok(())
    }

    pub fn read(&self) -> TextureHandle {
        self.read
    }

    pub fn write(&self) -> TextureHandle {
        self.write
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    pub fn destroy(&self, backend: &mut dyn GpuBackend) {
        backend.destroy(self.read);
        backend.destroy(self.write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn pool(max_resident: usize) -> ResourcePool {
        ResourcePool::new(&ResourcePoolConfig { max_resident })
    }

    #[test]
    fn returned_targets_are_reused_by_size() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let mut pool = pool(4);
        let first = pool.checkout(&mut backend, 8, 8).unwrap();
        let handle = first.handle;
        assert!(pool.give_back(&mut backend, first));
        let again = pool.checkout(&mut backend, 8, 8).unwrap();
        assert_eq!(again.handle, handle);
        let other = pool.checkout(&mut backend, 4, 4).unwrap();
        assert_ne!(other.handle, handle);
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn resident_count_never_exceeds_cap() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let mut pool = pool(3);
        for round in 0..4u32 {
            let targets: Vec<_> = (1..=6u32)
                .map(|size| pool.checkout(&mut backend, size + round, size).unwrap())
                .collect();
            for target in targets {
                pool.give_back(&mut backend, target);
                assert!(pool.resident_count() <= 3);
            }
        }
        assert_eq!(pool.checked_out_count(), 0);
        assert_eq!(backend.live_textures(), pool.resident_count());
    }

    #[test]
    fn stalest_target_is_evicted_first() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let mut pool = pool(1);
        let old = pool.checkout(&mut backend, 2, 2).unwrap();
        let new = pool.checkout(&mut backend, 3, 3).unwrap();
        let old_handle = old.handle;
        let new_handle = new.handle;
        pool.give_back(&mut backend, old);
        pool.give_back(&mut backend, new);
        assert_eq!(backend.dimensions(old_handle), None);
        assert_eq!(backend.dimensions(new_handle), Some((3, 3)));
    }

    #[test]
    fn foreign_targets_are_rejected() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let mut pool = pool(2);
        let stray = PooledTarget {
            handle: backend.create_target(2, 2).unwrap(),
            width: 2,
            height: 2,
        };
        assert!(!pool.give_back(&mut backend, stray));
        assert_eq!(pool.resident_count(), 0);
    }

    #[test]
    fn ping_pong_swaps_and_resizes_in_place() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let mut pair = PingPong::new(&mut backend, 4, 4).unwrap();
        let (read, write) = (pair.read(), pair.write());
        assert_ne!(read, write);
        pair.swap();
        assert_eq!(pair.read(), write);
        pair.ensure_size(&mut backend, 6, 2).unwrap();
        assert_eq!(pair.size(), (6, 2));
        assert_eq!(backend.live_textures(), 2);
        assert_eq!(backend.dimensions(pair.read()), Some((6, 2)));
    }
}
