//! SPIR-V-target lowering: kernel modules with push-constant globals,
//! built-in extracts, resource variables, and optional
//! cooperative-matrix promotion.

/// Cooperative-matrix analysis and rewrite
pub mod coop;
/// Lowering from outlined executables
pub mod lower;
/// The kernel module model and its serialization
pub mod module;

pub use coop::analyze_cooperative_matmul;
pub use lower::{lower_executable, SpirvTargetOptions, VULKAN_SPIRV_FORMAT};
pub use module::{
    ArithKind, BuiltIn, Operand, SpirvGlobal, SpirvInst, SpirvModule, SpirvType, StorageClass,
};
