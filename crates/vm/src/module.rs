//! The module interface: the contract any loadable unit satisfies.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use tensile_base::{SourceLocation, StatusResult};

use crate::function::{FunctionDecl, Linkage, ResolvedFunction, Signature};
use crate::stack::{Frame, Stack};
use crate::value::Value;

/// Table sizes of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleSignature {
    pub import_count: usize,
    pub export_count: usize,
    pub internal_count: usize,
}

/// Per-context opaque storage produced when a module is registered into
/// a context. Holds resolved import slots and mutable globals. Freed by
/// drop.
pub trait ModuleState: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to a module's per-context state. Contexts own the
/// strong side; stack frames hold weak references (the context outlives
/// any stack using it).
pub type SharedState = Arc<Mutex<Box<dyn ModuleState>>>;

/// Weak form stored in stack frames.
pub type WeakState = Weak<Mutex<Box<dyn ModuleState>>>;

/// Resolves a module's per-context state by module name. Implemented by
/// [`Context`](crate::Context); threaded through the [`Stack`] so frame
/// entry can locate the callee's state.
pub trait StateResolver: Send + Sync {
    fn resolve_state(&self, module_name: &str) -> StatusResult<SharedState>;
}

/// One synchronous call into a module export.
pub struct CallRecord {
    pub function: ResolvedFunction,
    pub arguments: Vec<Value>,
}

/// The contract any loadable unit (bytecode, native, HAL) satisfies.
pub trait Module: Send + Sync {
    /// The module's registration name.
    fn name(&self) -> &str;

    /// Import/export/internal table sizes.
    fn signature(&self) -> ModuleSignature;

    /// Looks up a function by linkage and unqualified name.
    fn lookup_function_by_name(
        &self,
        linkage: Linkage,
        name: &str,
    ) -> StatusResult<Arc<FunctionDecl>>;

    /// Looks up a function by linkage and ordinal.
    fn lookup_function_by_ordinal(
        &self,
        linkage: Linkage,
        ordinal: usize,
    ) -> StatusResult<Arc<FunctionDecl>>;

    /// Allocates this module's per-context state.
    fn alloc_state(&self) -> StatusResult<Box<dyn ModuleState>>;

    /// Wires one import slot in previously allocated state.
    fn resolve_import(
        &self,
        state: &mut dyn ModuleState,
        import_index: usize,
        target: ResolvedFunction,
        expected: &Signature,
    ) -> StatusResult<()>;

    /// Synchronously invokes one function, pushing and popping stack
    /// frames as needed. On error, implementations annotate the status
    /// with their frame's backtrace line before leaving the frame.
    fn begin_call(&self, stack: &mut Stack, call: CallRecord) -> StatusResult<Vec<Value>>;

    /// Resolves a source location for a frame, if debug info exists.
    fn resolve_source_location(&self, _frame: &Frame) -> Option<SourceLocation> {
        None
    }
}

/// Looks up an export across linkage tables in the order the resolver
/// scans them: exports first, internals only for same-module calls.
pub fn lookup_export(module: &dyn Module, name: &str) -> StatusResult<Arc<FunctionDecl>> {
    module.lookup_function_by_name(Linkage::Export, name)
}
