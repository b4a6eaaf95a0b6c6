//! Dispatch regions: subgraphs slated to become one dispatchable
//! kernel.

use tensile_base::{Status, StatusResult};

use crate::ir::{GraphFunc, IteratorKind, OpId, ValueId};

/// A symbolic workload extent along one distribution axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimExpr {
    Static(usize),
    /// An extent not known until runtime.
    Dynamic,
}

impl DimExpr {
    pub fn as_static(self) -> Option<usize> {
        match self {
            DimExpr::Static(extent) => Some(extent),
            DimExpr::Dynamic => None,
        }
    }
}

/// A subgraph of tensor operations plus its workload and bound values.
#[derive(Debug, Clone)]
pub struct DispatchRegion {
    /// Position in program order.
    pub ordinal: usize,
    /// Member ops in topological order.
    pub ops: Vec<OpId>,
    /// The op whose iteration space defines the workload.
    pub root: OpId,
    /// Values defined outside the region and used inside.
    pub captures: Vec<ValueId>,
    /// Values defined inside the region that escape it.
    pub results: Vec<ValueId>,
    /// Workload extents along up to three distribution axes.
    pub workload: Vec<DimExpr>,
}

impl DispatchRegion {
    /// Total workload size; `None` when any axis is dynamic.
    pub fn workload_size(&self) -> Option<usize> {
        self.workload
            .iter()
            .map(|extent| extent.as_static())
            .product()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.ops.contains(&op)
    }
}

/// Computes a region's workload from its root op: the root's parallel
/// iteration extents, outermost first, collapsed to at most three axes
/// by folding leading extents together.
pub fn root_workload(func: &GraphFunc, root: OpId) -> StatusResult<Vec<DimExpr>> {
    let node = func.node(root);
    let kinds = func.iterator_kinds(node);
    // The parallel iterators co-iterate the root's result space.
    let result_ty = func.value_type(node.result);
    let parallel_rank = kinds
        .iter()
        .filter(|kind| **kind == IteratorKind::Parallel)
        .count();
    if parallel_rank != result_ty.rank() {
        return Err(Status::internal(format!(
            "root op {} has {parallel_rank} parallel iterators but a rank-{} result",
            node.op.mnemonic(),
            result_ty.rank()
        )));
    }
    let mut extents: Vec<DimExpr> = result_ty
        .dims
        .iter()
        .map(|dim| match dim.as_static() {
            Some(extent) => DimExpr::Static(extent),
            None => DimExpr::Dynamic,
        })
        .collect();
    if extents.is_empty() {
        extents.push(DimExpr::Static(1));
    }
    // Fold leading axes until at most three remain.
    while extents.len() > 3 {
        let folded = match (extents[0], extents[1]) {
            (DimExpr::Static(a), DimExpr::Static(b)) => DimExpr::Static(a * b),
            _ => DimExpr::Dynamic,
        };
        extents.splice(0..2, [folded]);
    }
    Ok(extents)
}
