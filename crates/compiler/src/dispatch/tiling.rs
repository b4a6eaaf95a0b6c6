//! Tiling and distribution: regions become perfectly nested parallel
//! loop nests whose outer axes map onto the workgroup grid.
//!
//! Distribution modes:
//!
//! - **Workgroups**: the outer (up to) three axes map to workgroup ids,
//!   innermost axis on x; excess axes are serialized inside. When the
//!   workgroup count covers the extent exactly, no guard is emitted;
//!   under cyclic distribution the lower bound becomes `lb + id*step`
//!   and the step becomes `step * nprocs`.
//! - **Workitems**: the same scheme one level down, using the thread id
//!   and block dimension; cyclic vs single-iteration is chosen per op
//!   by the marker set here.
//! - **Global invocation id**: the fallback for leaf elementwise ops; a
//!   collapsed single-axis loop mapped one iteration per global
//!   invocation, de-linearized at the top of the body.
//!
//! Workgroup-local copies collapse all loops into one and compare total
//! bytes against the workgroup's invocation count: at most one element
//! per invocation uses a guarded single iteration, more uses cyclic
//! distribution.

use tensile_base::{Status, StatusResult};

use crate::dispatch::region::{DimExpr, DispatchRegion};
use crate::ir::{GraphFunc, Operation};

/// Fixed workgroup count used when cyclic distribution is requested.
pub const CYCLIC_WORKGROUP_COUNT: u32 = 64;

/// Processor dimension a loop is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMapping {
    WorkgroupX,
    WorkgroupY,
    WorkgroupZ,
    WorkitemX,
    WorkitemY,
    WorkitemZ,
    GlobalInvocation,
}

/// One loop of a nest. Bounds are static after tiling; dynamic extents
/// are rejected earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub extent: usize,
    pub step: usize,
    pub mapping: Option<ProcMapping>,
    /// Cyclic distribution: `lb += id*step`, `step *= nprocs`.
    pub cyclic: bool,
    /// An in-bounds guard is required (count overshoots the extent).
    pub guarded: bool,
}

impl Loop {
    fn sequential(extent: usize) -> Self {
        Self {
            extent,
            step: 1,
            mapping: None,
            cyclic: false,
            guarded: false,
        }
    }
}

/// How a region's root op is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    /// Outer axes to workgroups, one iteration per workgroup.
    WorkgroupPerIteration,
    /// Outer axes to workgroups cyclically.
    WorkgroupCyclic,
    /// Collapsed single axis, one iteration per global invocation.
    GlobalInvocation,
}

/// A perfectly nested loop structure over a region's iteration space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    /// Loops, outermost first. Mapped loops precede serialized ones.
    pub loops: Vec<Loop>,
    /// Original (pre-collapse) extents for de-linearization.
    pub delinearized_extents: Vec<usize>,
}

/// A region plus its tiling decisions.
#[derive(Debug, Clone)]
pub struct TiledRegion {
    pub region: DispatchRegion,
    pub nest: LoopNest,
    pub distribution: DistributionKind,
    pub workgroup_count: [u32; 3],
    pub workgroup_size: [u32; 3],
}

/// Tiles a region for the workgroup grid.
///
/// `constrained` forces cyclic distribution under a fixed workgroup
/// count cap.
pub fn tile_region(
    func: &GraphFunc,
    region: DispatchRegion,
    constrained: bool,
) -> StatusResult<TiledRegion> {
    let extents: Vec<usize> = region
        .workload
        .iter()
        .map(|extent| {
            extent.as_static().ok_or_else(|| {
                Status::unimplemented("dynamic workload extents are not distributable")
            })
        })
        .collect::<StatusResult<_>>()?;
    let root_is_elementwise = matches!(
        func.node(region.root).op,
        Operation::Elementwise { .. }
    );

    let (nest, distribution, workgroup_count) = if constrained {
        distribute_cyclic(&extents)
    } else if root_is_elementwise {
        distribute_collapsed(&extents)
    } else {
        distribute_per_iteration(&extents)
    };

    Ok(TiledRegion {
        region,
        nest,
        distribution,
        workgroup_count,
        // One invocation per workgroup on the host path; GPU lowering
        // re-tiles the innermost axis over workitems.
        workgroup_size: [1, 1, 1],
    })
}

/// Elementwise fallback: collapse every axis into one and hand each
/// iteration to one workgroup, de-linearizing inside the body.
fn distribute_collapsed(extents: &[usize]) -> (LoopNest, DistributionKind, [u32; 3]) {
    let total: usize = extents.iter().product::<usize>().max(1);
    let nest = LoopNest {
        loops: vec![Loop {
            extent: total,
            step: 1,
            mapping: Some(ProcMapping::WorkgroupX),
            cyclic: false,
            guarded: false,
        }],
        delinearized_extents: extents.to_vec(),
    };
    (
        nest,
        DistributionKind::WorkgroupPerIteration,
        [total as u32, 1, 1],
    )
}

/// Root ops with structure keep up to three mapped axes, innermost on
/// x; the count covers each extent exactly, so no guard is needed.
fn distribute_per_iteration(extents: &[usize]) -> (LoopNest, DistributionKind, [u32; 3]) {
    let mapped = extents.len().min(3);
    let mappings = [
        ProcMapping::WorkgroupX,
        ProcMapping::WorkgroupY,
        ProcMapping::WorkgroupZ,
    ];
    let mut loops = Vec::with_capacity(extents.len());
    let mut count = [1u32; 3];
    for (index, &extent) in extents.iter().enumerate() {
        if index < mapped {
            // Innermost mapped axis gets x.
            let axis = mapped - 1 - index;
            count[axis] = extent as u32;
            loops.push(Loop {
                extent,
                step: 1,
                mapping: Some(mappings[axis]),
                cyclic: false,
                guarded: false,
            });
        } else {
            loops.push(Loop::sequential(extent));
        }
    }
    (
        LoopNest {
            loops,
            delinearized_extents: extents.to_vec(),
        },
        DistributionKind::WorkgroupPerIteration,
        count,
    )
}

/// Constrained counts: collapse to one axis distributed cyclically over
/// a fixed workgroup count.
fn distribute_cyclic(extents: &[usize]) -> (LoopNest, DistributionKind, [u32; 3]) {
    let total: usize = extents.iter().product::<usize>().max(1);
    let nprocs = (total as u32).min(CYCLIC_WORKGROUP_COUNT);
    let nest = LoopNest {
        loops: vec![Loop {
            extent: total,
            step: 1,
            mapping: Some(ProcMapping::WorkgroupX),
            cyclic: true,
            guarded: false,
        }],
        delinearized_extents: extents.to_vec(),
    };
    (nest, DistributionKind::WorkgroupCyclic, [nprocs, 1, 1])
}

/// Distribution choice for a copy into workgroup-local memory: all
/// loops collapse into one; when the element count fits the workgroup's
/// invocation count, each invocation moves at most one element behind a
/// bounds guard, otherwise the loop is cyclic over the invocations.
pub fn distribute_local_copy(element_count: usize, invocation_count: u32) -> Loop {
    if element_count <= invocation_count as usize {
        Loop {
            extent: element_count,
            step: 1,
            mapping: Some(ProcMapping::WorkitemX),
            cyclic: false,
            guarded: true,
        }
    } else {
        Loop {
            extent: element_count,
            step: 1,
            mapping: Some(ProcMapping::WorkitemX),
            cyclic: true,
            guarded: false,
        }
    }
}

/// Iterates the indices a processor owns under a loop's distribution.
/// Used by the host executor and by tests; the GPU lowering emits the
/// same recurrence symbolically.
pub fn owned_indices(r#loop: &Loop, proc_id: u32, proc_count: u32) -> Vec<usize> {
    let extent = r#loop.extent;
    if r#loop.cyclic {
        // lb + id*step, stepping by step*nprocs.
        (0..extent)
            .skip(proc_id as usize * r#loop.step)
            .step_by((r#loop.step * proc_count as usize).max(1))
            .collect()
    } else {
        let index = proc_id as usize * r#loop.step;
        if index < extent {
            vec![index]
        } else {
            // Guarded single iteration out of bounds: nothing to do.
            debug_assert!(r#loop.guarded || proc_id < proc_count);
            Vec::new()
        }
    }
}
