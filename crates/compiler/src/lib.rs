//! # Tensile Compiler
//!
//! The mid-end that lowers tensor programs into dispatchable work:
//! graphs of tensor operations are partitioned into dispatch regions,
//! tiled onto workgroup grids, outlined into device executables,
//! deduplicated, and finally emitted as a bytecode module that drives
//! devices through the HAL at runtime.
//!
//! The pass order is fixed by [`pipeline::compile`]:
//!
//! 1. preprocessing rewrites (conv shaping, mmt4d, padding),
//! 2. dispatch-region formation,
//! 3. tiling and workgroup distribution,
//! 4. outlining into executables,
//! 5. structural deduplication,
//! 6. constant rematerialization and outlining,
//! 7. resource-cache materialization,
//! 8. per-target lowering (host loop nests, SPIR-V kernels),
//! 9. VM bytecode emission.

/// Dispatch formation passes
pub mod dispatch;
/// Host-target lowering and kernel execution
pub mod host;
/// The tensor graph IR
pub mod ir;
/// The pass pipeline
pub mod pipeline;
/// Preprocessing rewrites behind driver flags
pub mod preprocess;
/// SPIR-V-target lowering
pub mod spirv;
/// Bytecode emission
pub mod vmgen;

pub use pipeline::{compile, CompileOptions, CompileOutput};
