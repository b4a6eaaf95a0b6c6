//! Singleton cache for descriptor-set layouts, executable layouts, and
//! prepared executables.
//!
//! Keys are structural: identical layout descriptions map to the same
//! cached object regardless of where they were requested from, so the
//! compiler's resource-cache globals and runtime lookups agree on
//! identity.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tensile_base::{Ref, StatusResult};
use xxhash_rust::xxh3::Xxh3;

use crate::device::Device;
use crate::executable::Executable;
use crate::executable_format;
use crate::executable_layout::{DescriptorSetLayout, ExecutableLayout};

fn structural_key<T: Hash>(value: &T) -> u64 {
    let mut hasher = Xxh3::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A per-device cache of materialized resource objects.
pub struct ExecutableCache {
    device_id: String,
    set_layouts: Mutex<IndexMap<u64, Arc<DescriptorSetLayout>>>,
    layouts: Mutex<IndexMap<u64, Arc<ExecutableLayout>>>,
    executables: Mutex<IndexMap<u64, Ref<Executable>>>,
}

impl ExecutableCache {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            set_layouts: Mutex::new(IndexMap::new()),
            layouts: Mutex::new(IndexMap::new()),
            executables: Mutex::new(IndexMap::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the singleton for a descriptor-set layout description.
    pub fn descriptor_set_layout(&self, layout: DescriptorSetLayout) -> Arc<DescriptorSetLayout> {
        let key = structural_key(&layout);
        Arc::clone(
            self.set_layouts
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(layout)),
        )
    }

    /// Returns the singleton executable layout for (set layouts, push
    /// constant count).
    pub fn executable_layout(
        &self,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_count: usize,
    ) -> Arc<ExecutableLayout> {
        let layout = ExecutableLayout::new(set_layouts, push_constant_count);
        let key = structural_key(&layout);
        Arc::clone(
            self.layouts
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(layout)),
        )
    }

    /// Loads an executable payload through the format registry, caching
    /// by payload identity.
    pub fn prepare_executable(
        &self,
        device: &dyn Device,
        format: &str,
        data: &[u8],
    ) -> StatusResult<Ref<Executable>> {
        let key = {
            let mut hasher = Xxh3::new();
            format.hash(&mut hasher);
            data.hash(&mut hasher);
            hasher.finish()
        };
        if let Some(existing) = self.executables.lock().get(&key) {
            return Ok(existing.retain());
        }
        // The load runs outside the lock; a racing load of the same
        // payload resolves to whichever insert lands first.
        let executable = executable_format::load_executable(device, format, data)?;
        let mut executables = self.executables.lock();
        let entry = executables.entry(key).or_insert(executable);
        Ok(entry.retain())
    }

    /// Number of cached executables.
    pub fn executable_count(&self) -> usize {
        self.executables.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_set_layout_singletons() {
        let cache = ExecutableCache::new("local");
        let a = cache.descriptor_set_layout(DescriptorSetLayout::storage_buffers(2));
        let b = cache.descriptor_set_layout(DescriptorSetLayout::storage_buffers(2));
        let c = cache.descriptor_set_layout(DescriptorSetLayout::storage_buffers(3));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_executable_layout_sharing_rule() {
        let cache = ExecutableCache::new("local");
        let set = cache.descriptor_set_layout(DescriptorSetLayout::storage_buffers(2));
        let a = cache.executable_layout(vec![Arc::clone(&set)], 4);
        let b = cache.executable_layout(vec![Arc::clone(&set)], 4);
        let c = cache.executable_layout(vec![set], 8);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
