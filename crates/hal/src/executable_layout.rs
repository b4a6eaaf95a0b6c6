//! Descriptor-set and executable layouts.
//!
//! An executable layout is the resource interface of an executable:
//! ordered descriptor-set layouts plus a push-constant count. Two
//! executables may share a layout iff the ordered tuple is structurally
//! equal; the [`ExecutableCache`](crate::ExecutableCache) enforces the
//! sharing.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Descriptor slot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    StorageBuffer,
    UniformBuffer,
}

/// Access declared for a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorAccess {
    ReadOnly,
    ReadWrite,
}

/// One binding slot within a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub access: DescriptorAccess,
}

/// An ordered list of binding slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorSetLayout {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn new(bindings: Vec<DescriptorSetLayoutBinding>) -> Self {
        Self { bindings }
    }

    /// A layout of `count` read-write storage buffers at bindings 0..count.
    pub fn storage_buffers(count: usize) -> Self {
        Self {
            bindings: (0..count as u32)
                .map(|binding| DescriptorSetLayoutBinding {
                    binding,
                    descriptor_type: DescriptorType::StorageBuffer,
                    access: DescriptorAccess::ReadWrite,
                })
                .collect(),
        }
    }
}

/// Ordered set layouts plus a push-constant count. Equality and hashing
/// are structural over the set-layout contents, not the `Arc`
/// identities.
#[derive(Debug, Clone)]
pub struct ExecutableLayout {
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constant_count: usize,
}

impl ExecutableLayout {
    pub fn new(set_layouts: Vec<Arc<DescriptorSetLayout>>, push_constant_count: usize) -> Self {
        Self {
            set_layouts,
            push_constant_count,
        }
    }

    /// Total bindings across all sets.
    pub fn binding_count(&self) -> usize {
        self.set_layouts
            .iter()
            .map(|layout| layout.bindings.len())
            .sum()
    }
}

impl PartialEq for ExecutableLayout {
    fn eq(&self, other: &Self) -> bool {
        self.push_constant_count == other.push_constant_count
            && self.set_layouts.len() == other.set_layouts.len()
            && self
                .set_layouts
                .iter()
                .zip(&other.set_layouts)
                .all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl Eq for ExecutableLayout {}

impl Hash for ExecutableLayout {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.push_constant_count.hash(state);
        for layout in &self.set_layouts {
            layout.as_ref().hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(layout: &ExecutableLayout) -> u64 {
        let mut hasher = DefaultHasher::new();
        layout.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_structural_equality_ignores_arc_identity() {
        let a = ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(3))],
            2,
        );
        let b = ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(3))],
            2,
        );
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_push_constant_count_distinguishes() {
        let a = ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(3))],
            2,
        );
        let b = ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(3))],
            3,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_layout_order_matters() {
        let small = Arc::new(DescriptorSetLayout::storage_buffers(1));
        let large = Arc::new(DescriptorSetLayout::storage_buffers(2));
        let a = ExecutableLayout::new(vec![Arc::clone(&small), Arc::clone(&large)], 0);
        let b = ExecutableLayout::new(vec![large, small], 0);
        assert_ne!(a, b);
    }
}
