//! The register-based bytecode: instruction set, module representation,
//! interpreter, and the builder used by the compiler and by tests.

/// Module and function builders
pub mod builder;
/// The interpreter dispatch loop
mod dispatch;
/// Bytecode module, state, and tables
pub mod module;
/// Instruction set and encoding
pub mod opcode;

pub use builder::{FunctionBuilder, GlobalId, ImportId, Label, ModuleBuilder, RodataId};
pub use module::{
    BytecodeFunction, BytecodeModule, FunctionDebug, GlobalDecl, RodataEntry, TargetPayload,
};
pub use opcode::Instruction;
