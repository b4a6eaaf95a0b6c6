//! # Tensile VM
//!
//! A minimal bytecode virtual machine that orchestrates device dispatches
//! at runtime. The VM is an isolated, resumable, typed execution
//! substrate: host code enters through [`invoke`], which drives calls
//! between native (host-provided) modules and compiled bytecode modules
//! over a shared frame [`Stack`].
//!
//! ## Architecture
//!
//! - [`Module`]: the contract any loadable unit satisfies (bytecode,
//!   native, or the HAL module from `tensile-hal`).
//! - [`Stack`]: a dynamically growable arena of call frames with
//!   state-resolver plumbing and backtrace capture.
//! - [`Context`]: an execution sandbox binding modules, their per-context
//!   state, and import resolutions; write-once after freeze.
//! - [`Instance`]: process-facing factory for contexts; owns the debug
//!   registry and registers the built-in type registry once per process.
//! - [`bytecode`]: the register-based instruction set, its interpreter,
//!   the [`bytecode::ModuleBuilder`], and the persisted artifact format.

/// Persisted artifact encoding and decoding
pub mod archive;
/// Register-based bytecode: opcodes, interpreter, builder
pub mod bytecode;
/// Calling-convention descriptor strings
pub mod convention;
/// Execution contexts
pub mod context;
/// Function declarations and signatures
pub mod function;
/// Process-facing instance and registries
pub mod instance;
/// Host entry point into the VM
pub mod invoke;
/// Ref-typed list values
pub mod list;
/// The module interface
pub mod module;
/// Host modules assembled from closures
pub mod native;
/// The execution stack
pub mod stack;
/// VM values and value types
pub mod value;

pub use context::Context;
pub use convention::ConvString;
pub use function::{FunctionDecl, Linkage, ResolvedFunction, Signature};
pub use instance::Instance;
pub use invoke::{invoke, InvocationPolicy};
pub use list::VmList;
pub use module::{CallRecord, Module, ModuleSignature, ModuleState, SharedState, StateResolver};
pub use native::NativeModule;
pub use stack::{Frame, FrameType, Stack, StackLimits};
pub use value::{Value, ValueType, VmBytes};
