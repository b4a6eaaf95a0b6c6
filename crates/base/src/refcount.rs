//! Reference-counted handles for runtime objects.
//!
//! Every object that crosses the VM boundary (buffers, buffer views,
//! command buffers, executables, semaphores) is held through a [`Ref`]:
//! a typed strong handle with a valid null state. [`AnyRef`] is the
//! type-erased form carried inside VM values; it supports typed narrowing
//! back to a concrete [`Ref`].
//!
//! Retain is handle clone, release is handle drop; the last release runs
//! the object's `Drop` exactly once. The [`ReferenceTracker`] is an
//! instance-scoped registry of live handle counts used by the debug
//! registry and by leak assertions in tests.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::status::{Status, StatusResult};

/// Implemented by every runtime object that can be held through a
/// [`Ref`] or [`AnyRef`].
///
/// Use the [`ref_object!`](crate::ref_object) macro rather than writing
/// the three methods by hand.
pub trait RefObject: Any + Send + Sync {
    /// Stable type name used in narrowing errors and diagnostics.
    fn type_name(&self) -> &'static str;

    /// Borrow as `Any` for type tests.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Convert an owning `Arc` into an `Arc<dyn Any>` for downcasting.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Implements [`RefObject`] for a concrete type.
#[macro_export]
macro_rules! ref_object {
    ($ty:ty) => {
        impl $crate::refcount::RefObject for $ty {
            fn type_name(&self) -> &'static str {
                stringify!($ty)
            }

            fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
                self
            }

            fn as_any_arc(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }
    };
}

/// A typed strong handle to a runtime object. Null is a valid state and
/// releases to a no-op.
pub struct Ref<T: RefObject> {
    inner: Option<Arc<T>>,
}

impl<T: RefObject> Ref<T> {
    /// The null handle.
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Creates a handle owning a fresh object with count one.
    pub fn new(value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
        }
    }

    /// Wraps an existing shared object.
    pub fn from_arc(value: Arc<T>) -> Self {
        Self { inner: Some(value) }
    }

    /// True when this handle is null.
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Borrows the object, or `None` for a null handle.
    pub fn as_ref(&self) -> Option<&T> {
        self.inner.as_deref()
    }

    /// Borrows the object, failing with `failed-precondition` on null.
    pub fn get(&self) -> StatusResult<&T> {
        self.inner.as_deref().ok_or_else(|| {
            Status::failed_precondition(format!(
                "null {} handle",
                std::any::type_name::<T>()
            ))
        })
    }

    /// The shared object, or `None` for a null handle.
    pub fn as_arc(&self) -> Option<&Arc<T>> {
        self.inner.as_ref()
    }

    /// Takes an additional retain on the handle.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Releases this handle. Equivalent to drop; named form for call
    /// sites that want the release to be visible.
    pub fn release(self) {}

    /// Number of live handles to the object, zero for null.
    pub fn strong_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }
}

impl<T: RefObject> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RefObject> Default for Ref<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: RefObject> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(value) => write!(f, "Ref<{}>", value.type_name()),
            None => write!(f, "Ref<null>"),
        }
    }
}

/// A type-erased strong handle. Carried inside VM values; narrows back
/// to a concrete [`Ref`] with [`AnyRef::downcast`].
#[derive(Clone, Default)]
pub struct AnyRef {
    inner: Option<Arc<dyn RefObject>>,
}

impl AnyRef {
    /// The null handle.
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// True when this handle is null.
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The object's type name, or `"null"`.
    pub fn type_name(&self) -> &'static str {
        self.inner.as_ref().map_or("null", |obj| obj.type_name())
    }

    /// True when the handle holds a `T`.
    pub fn is<T: RefObject>(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|obj| obj.as_any().is::<T>())
    }

    /// Narrows to a typed handle. A null handle narrows to a null
    /// `Ref<T>` of any type; a type mismatch is `invalid-argument`.
    pub fn downcast<T: RefObject>(&self) -> StatusResult<Ref<T>> {
        match &self.inner {
            None => Ok(Ref::null()),
            Some(obj) => {
                let arc = Arc::clone(obj)
                    .as_any_arc()
                    .downcast::<T>()
                    .map_err(|_| {
                        Status::invalid_argument(format!(
                            "ref type mismatch: have {}, want {}",
                            self.type_name(),
                            std::any::type_name::<T>()
                        ))
                    })?;
                Ok(Ref::from_arc(arc))
            }
        }
    }

    /// Number of live handles to the object, zero for null.
    pub fn strong_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }
}

impl<T: RefObject> From<Ref<T>> for AnyRef {
    fn from(value: Ref<T>) -> Self {
        Self {
            inner: value.inner.map(|arc| arc as Arc<dyn RefObject>),
        }
    }
}

impl fmt::Debug for AnyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyRef<{}>", self.type_name())
    }
}

/// Instance-scoped accounting of live handles.
///
/// Objects register once and retain/release as handles are created and
/// dropped; the tracker answers "how many are still live" for the debug
/// registry and for leak assertions. A single mutex guards the count
/// table; no lock is held across any outside call.
pub struct ReferenceTracker {
    next_id: AtomicUsize,
    total: AtomicUsize,
    counts: Mutex<HashMap<usize, usize>>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            total: AtomicUsize::new(0),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new object and returns its id. The object starts with
    /// zero references.
    pub fn register(&self) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.counts
            .lock()
            .expect("reference tracker poisoned")
            .insert(id, 0);
        id
    }

    /// Adds one reference to the object.
    pub fn retain(&self, id: usize) {
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut counts = self.counts.lock().expect("reference tracker poisoned");
        *counts.entry(id).or_insert(0) += 1;
    }

    /// Removes one reference. Returns true when the object's count
    /// reached zero.
    pub fn release(&self, id: usize) -> bool {
        self.total.fetch_sub(1, Ordering::SeqCst);
        let mut counts = self.counts.lock().expect("reference tracker poisoned");
        let count = counts.entry(id).or_insert(0);
        if *count > 0 {
            *count -= 1;
        }
        let zero = *count == 0;
        if zero {
            counts.remove(&id);
            log::trace!("reference tracker: object {id} dropped to zero");
        }
        zero
    }

    /// Current count for one object.
    pub fn count_of(&self, id: usize) -> usize {
        *self
            .counts
            .lock()
            .expect("reference tracker poisoned")
            .get(&id)
            .unwrap_or(&0)
    }

    /// Total references across all objects.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Default for ReferenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusKind;

    struct Probe {
        label: &'static str,
    }
    crate::ref_object!(Probe);

    struct Other;
    crate::ref_object!(Other);

    #[test]
    fn test_null_ref_is_valid() {
        let handle: Ref<Probe> = Ref::null();
        assert!(handle.is_null());
        assert_eq!(handle.strong_count(), 0);
        let clone = handle.retain();
        assert!(clone.is_null());
        clone.release();
    }

    #[test]
    fn test_retain_release_counts() {
        let handle = Ref::new(Probe { label: "a" });
        assert_eq!(handle.strong_count(), 1);
        let second = handle.retain();
        assert_eq!(handle.strong_count(), 2);
        second.release();
        assert_eq!(handle.strong_count(), 1);
        assert_eq!(handle.get().unwrap().label, "a");
    }

    #[test]
    fn test_any_ref_roundtrip() {
        let typed = Ref::new(Probe { label: "b" });
        let erased: AnyRef = typed.retain().into();
        assert!(erased.is::<Probe>());
        assert!(!erased.is::<Other>());
        let narrowed = erased.downcast::<Probe>().unwrap();
        assert_eq!(narrowed.get().unwrap().label, "b");
    }

    #[test]
    fn test_downcast_mismatch() {
        let erased: AnyRef = Ref::new(Other).into();
        let err = erased.downcast::<Probe>().unwrap_err();
        assert!(err.is(StatusKind::InvalidArgument));
    }

    #[test]
    fn test_null_downcasts_to_any_type() {
        let erased = AnyRef::null();
        assert!(erased.downcast::<Probe>().unwrap().is_null());
        assert!(erased.downcast::<Other>().unwrap().is_null());
    }

    #[test]
    fn test_tracker_balanced() {
        let tracker = ReferenceTracker::new();
        let a = tracker.register();
        let b = tracker.register();
        tracker.retain(a);
        tracker.retain(a);
        tracker.retain(b);
        assert_eq!(tracker.total(), 3);
        assert!(!tracker.release(a));
        assert!(tracker.release(a));
        assert!(tracker.release(b));
        assert_eq!(tracker.total(), 0);
    }
}
