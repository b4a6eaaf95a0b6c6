//! Dispatch formation: partitioning, tiling, outlining, deduplication,
//! constant handling, and resource-cache materialization.

/// Constant rematerialization and outlining
pub mod constants;
/// Structural executable deduplication
pub mod dedup;
/// Outlining regions into executables
pub mod outline;
/// Region formation by producer-consumer fusion
pub mod partition;
/// Dispatch regions
pub mod region;
/// Cached resource-global materialization
pub mod resource_cache;
/// Tiling and workgroup distribution
pub mod tiling;

pub use constants::REMATERIALIZE_THRESHOLD_BYTES;
pub use dedup::deduplicate_executables;
pub use outline::{CompiledFunc, CompiledModule, DispatchOp, ExecutableIr, OutlinedConstant};
pub use partition::form_dispatch_regions;
pub use region::{DimExpr, DispatchRegion};
pub use resource_cache::{GlobalKind, MaterializedGlobal, ResourceCachePlan, TargetArm};
pub use tiling::{DistributionKind, Loop, LoopNest, ProcMapping, TiledRegion};
