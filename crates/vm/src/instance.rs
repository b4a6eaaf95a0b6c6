//! Process-facing instance: context factory and global registries.
//!
//! The built-in type registry is process-wide and populated exactly once,
//! during first instance creation. The debug registry tracks live
//! contexts behind a single mutex; long-running operations never hold it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use tensile_base::{ReferenceTracker, Status, StatusResult};

use crate::context::Context;
use crate::module::Module;

/// Process-wide registry of ref-object type names. Append-only; reads
/// take the same mutex registration does, but entries are never removed.
static TYPE_REGISTRY: Lazy<Mutex<Vec<&'static str>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Built-in types registered during instance creation.
const BUILTIN_TYPES: &[&str] = &["vm.bytes", "vm.list"];

/// Registers a ref-object type name, ignoring duplicates.
pub fn register_type(name: &'static str) {
    let mut registry = TYPE_REGISTRY.lock().expect("type registry poisoned");
    if !registry.contains(&name) {
        registry.push(name);
    }
}

/// True when the type name has been registered.
pub fn is_type_registered(name: &str) -> bool {
    TYPE_REGISTRY
        .lock()
        .expect("type registry poisoned")
        .contains(&name)
}

/// A process-wide registry of built-in types and the factory for
/// contexts.
pub struct Instance {
    next_context_id: AtomicU64,
    debug_registry: Mutex<Vec<(u64, Weak<Context>)>>,
    tracker: ReferenceTracker,
}

impl Instance {
    /// Creates an instance, registering built-in types on first use.
    pub fn new() -> Arc<Self> {
        for name in BUILTIN_TYPES {
            register_type(name);
        }
        Arc::new(Self {
            next_context_id: AtomicU64::new(1),
            debug_registry: Mutex::new(Vec::new()),
            tracker: ReferenceTracker::new(),
        })
    }

    /// Live-handle accounting shared by this instance's objects.
    pub fn tracker(&self) -> &ReferenceTracker {
        &self.tracker
    }

    /// Creates an empty context, open for later registration.
    pub fn create_context(self: &Arc<Self>) -> Arc<Context> {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        let context = Context::new(id);
        self.debug_registry
            .lock()
            .expect("debug registry poisoned")
            .push((id, Arc::downgrade(&context)));
        context
    }

    /// Creates a context with a fixed module list, frozen at creation.
    pub fn create_context_with_modules(
        self: &Arc<Self>,
        modules: &[Arc<dyn Module>],
    ) -> StatusResult<Arc<Context>> {
        let context = self.create_context();
        context.register_modules(modules)?;
        context.freeze();
        Ok(context)
    }

    /// Number of contexts still alive.
    pub fn live_context_count(&self) -> usize {
        let mut registry = self.debug_registry.lock().expect("debug registry poisoned");
        registry.retain(|(_, weak)| weak.upgrade().is_some());
        registry.len()
    }

    /// Looks up a live context by id.
    pub fn find_context(&self, id: u64) -> StatusResult<Arc<Context>> {
        self.debug_registry
            .lock()
            .expect("debug registry poisoned")
            .iter()
            .find(|(context_id, _)| *context_id == id)
            .and_then(|(_, weak)| weak.upgrade())
            .ok_or_else(|| Status::not_found(format!("no live context with id {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_registered() {
        let _instance = Instance::new();
        assert!(is_type_registered("vm.bytes"));
        assert!(is_type_registered("vm.list"));
        assert!(!is_type_registered("vm.unknown"));
    }

    #[test]
    fn test_context_ids_unique() {
        let instance = Instance::new();
        let a = instance.create_context();
        let b = instance.create_context();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_debug_registry_tracks_live_contexts() {
        let instance = Instance::new();
        let a = instance.create_context();
        {
            let _b = instance.create_context();
            assert_eq!(instance.live_context_count(), 2);
        }
        assert_eq!(instance.live_context_count(), 1);
        assert_eq!(instance.find_context(a.id()).unwrap().id(), a.id());
        assert!(instance.find_context(9999).is_err());
    }
}
