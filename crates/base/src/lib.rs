//! # Tensile Base
//!
//! Foundation types shared by every Tensile crate: the kind-typed
//! [`Status`] error model and the reference-counted handle layer used for
//! values that cross the VM boundary.
//!
//! Nothing in this crate knows about tensors, devices, or bytecode; it is
//! deliberately the bottom of the dependency graph.

/// Reference-counted handles and typed narrowing
pub mod refcount;
/// Kind-typed status errors with annotation chains
pub mod status;

pub use refcount::{AnyRef, Ref, RefObject, ReferenceTracker};
pub use status::{SourceLocation, Status, StatusKind, StatusResult};
