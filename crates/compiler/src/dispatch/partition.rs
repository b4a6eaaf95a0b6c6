//! Region formation: a conservative producer-consumer fusion walk.
//!
//! Nodes are visited in reverse topological order, so by the time a
//! producer is considered every one of its consumers already has a
//! region. A producer joins its consumers' region only when all of them
//! agree on the region and the fusion rules admit the pairing:
//!
//! - elementwise producers always fuse into a single consumer;
//! - reduction-bearing producers fuse only when every consumer is an
//!   elementwise op over the reduction result;
//! - reshapes fuse only when fully static (dynamic-shape reshape fusion
//!   is rejected outright);
//! - other pointwise producers fuse when their result space matches the
//!   consumers' result space.
//!
//! Constants never open regions; they are handled by the constant pass
//! after outlining.

use tensile_base::{Status, StatusResult};

use crate::dispatch::region::{root_workload, DispatchRegion};
use crate::ir::{GraphFunc, Node, OpId, Operation};

/// Partitions a function into dispatch regions.
pub fn form_dispatch_regions(func: &GraphFunc) -> StatusResult<Vec<DispatchRegion>> {
    let nodes = func.nodes();
    let mut assignment: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut next_region = 0usize;

    for node in nodes.iter().rev() {
        if matches!(node.op, Operation::Constant { .. }) {
            continue;
        }
        let consumers = func.consumers(node.result);
        let fused_into = fusion_target(func, node, &consumers, &assignment);
        let index = node.id.0;
        match (assignment[index], fused_into) {
            (Some(_), _) => {}
            (None, Some(region)) => assignment[index] = Some(region),
            (None, None) => {
                assignment[index] = Some(next_region);
                next_region += 1;
            }
        }
    }

    build_regions(func, &assignment, next_region)
}

/// Decides the region `node` fuses into, if any.
fn fusion_target(
    func: &GraphFunc,
    node: &Node,
    consumers: &[OpId],
    assignment: &[Option<usize>],
) -> Option<usize> {
    if consumers.is_empty() || func.is_result(node.result) {
        return None;
    }
    let first = assignment[consumers[0].0]?;
    if !consumers
        .iter()
        .all(|consumer| assignment[consumer.0] == Some(first))
    {
        return None;
    }

    let producer_dims = &func.value_type(node.result).dims;
    let shapes_match = consumers.iter().all(|&consumer| {
        func.value_type(func.node(consumer).result).dims == *producer_dims
    });
    let all_elementwise = consumers.iter().all(|&consumer| {
        matches!(func.node(consumer).op, Operation::Elementwise { .. })
    });

    let admitted = match &node.op {
        Operation::Elementwise { .. } => consumers.len() == 1 || shapes_match,
        Operation::Reshape => {
            // Dynamic-shape reshape fusion is rejected until a clear
            // rule exists.
            consumers.len() == 1
                && func.value_type(node.result).is_fully_static()
                && func.value_type(node.inputs[0]).is_fully_static()
        }
        op if op.has_reduction() => all_elementwise && shapes_match,
        op if op.is_pointwise() => shapes_match,
        _ => false,
    };
    admitted.then_some(first)
}

fn build_regions(
    func: &GraphFunc,
    assignment: &[Option<usize>],
    region_count: usize,
) -> StatusResult<Vec<DispatchRegion>> {
    let mut members: Vec<Vec<OpId>> = vec![Vec::new(); region_count];
    for node in func.nodes() {
        if let Some(region) = assignment[node.id.0] {
            members[region].push(node.id);
        }
    }

    // Order regions by their first member so ordinals follow program
    // order, then compute captures, results, root, and workload.
    let mut order: Vec<usize> = (0..region_count).collect();
    order.sort_by_key(|&region| members[region].first().map_or(usize::MAX, |op| op.0));

    let mut regions = Vec::with_capacity(region_count);
    for (ordinal, &region_index) in order.iter().enumerate() {
        let ops = members[region_index].clone();
        if ops.is_empty() {
            return Err(Status::internal("partitioning produced an empty region"));
        }

        let mut captures = Vec::new();
        let mut results = Vec::new();
        for &op in &ops {
            let node = func.node(op);
            for &input in &node.inputs {
                let inside = func
                    .producer(input)
                    .is_some_and(|producer| ops.contains(&producer));
                if !inside && !captures.contains(&input) {
                    captures.push(input);
                }
            }
            let escapes = func.is_result(node.result)
                || func
                    .consumers(node.result)
                    .iter()
                    .any(|consumer| !ops.contains(consumer));
            if escapes {
                results.push(node.result);
            }
        }
        if results.is_empty() {
            return Err(Status::internal(format!(
                "region {ordinal} has no escaping results"
            )));
        }
        // The root is the last escaping op: the value the region exists
        // to produce.
        let root = func
            .producer(*results.last().expect("nonempty results"))
            .ok_or_else(|| Status::internal("region result has no producer"))?;
        let workload = root_workload(func, root)?;

        regions.push(DispatchRegion {
            ordinal,
            ops,
            root,
            captures,
            results,
            workload,
        });
    }
    Ok(regions)
}
