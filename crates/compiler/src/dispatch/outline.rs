//! Outlining: each dispatch region becomes a free-floating function in
//! an executable container, and the region itself is replaced by a
//! dispatch op carrying the workload, the executable reference, and the
//! tied-operand map.

use bytes::Bytes;
use tensile_base::{Status, StatusResult};

use crate::dispatch::region::DimExpr;
use crate::dispatch::tiling::{tile_region, TiledRegion};
use crate::dispatch::{constants, form_dispatch_regions};
use crate::ir::{GraphFunc, GraphModule, Operation, TensorType, ValueId};

/// A constant too large to rematerialize, outlined as a module-level
/// variable.
#[derive(Debug, Clone)]
pub struct OutlinedConstant {
    pub name: String,
    pub value: ValueId,
    pub ty: TensorType,
    pub data: Bytes,
}

/// An outlined executable: one entry point over one tiled region.
#[derive(Debug, Clone)]
pub struct ExecutableIr {
    /// Container symbol; dispatch sites reference it by this name.
    pub name: String,
    /// Entry point name: `<func>_dispatch_<ordinal>`.
    pub entry_name: String,
    /// Distributed workgroup axes (1 to 3).
    pub workgroup_rank: usize,
    /// Captures plus results: the binding table the interface declares.
    pub binding_count: usize,
    pub push_constant_count: usize,
    /// Mirrors the dispatch site's tied-operand map so the interface
    /// can alias tied bindings.
    pub tied_operands: Vec<Option<usize>>,
    /// The free-floating function holding the region body.
    pub func: GraphFunc,
    /// The tiling decisions for this region.
    pub tiled: TiledRegion,
}

/// The runtime form of invoking an outlined entry point.
#[derive(Debug, Clone)]
pub struct DispatchOp {
    /// Executable symbol; rewritten by deduplication.
    pub executable: String,
    pub entry_name: String,
    pub workload: Vec<DimExpr>,
    pub workgroup_count: [u32; 3],
    /// Captured operands, in binding order.
    pub operands: Vec<ValueId>,
    /// Produced results, in binding order after the operands.
    pub results: Vec<ValueId>,
    /// `tied_operands[i]` names the operand index result `i` aliases
    /// for in-place execution, if any.
    pub tied_operands: Vec<Option<usize>>,
}

/// A function after outlining: a sequence of dispatches over values.
#[derive(Debug, Clone)]
pub struct CompiledFunc {
    pub name: String,
    /// The original graph, kept for value typing.
    pub source: GraphFunc,
    pub dispatches: Vec<DispatchOp>,
}

/// The module after dispatch formation.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub name: String,
    pub funcs: Vec<CompiledFunc>,
    pub executables: Vec<ExecutableIr>,
    pub variables: Vec<OutlinedConstant>,
}

/// Runs partitioning, constant handling, tiling, and outlining over a
/// whole module.
pub fn outline_module(
    module: &GraphModule,
    constrained_workgroup_count: bool,
) -> StatusResult<CompiledModule> {
    let mut compiled = CompiledModule {
        name: module.name.clone(),
        funcs: Vec::new(),
        executables: Vec::new(),
        variables: Vec::new(),
    };

    for func in &module.funcs {
        let mut regions = form_dispatch_regions(func)?;
        let outlined_constants = constants::rematerialize_constants(func, &mut regions);
        for value in outlined_constants {
            let producer = func
                .producer(value)
                .ok_or_else(|| Status::internal("outlined variable has no producer"))?;
            let node = func.node(producer);
            let Operation::Constant { data } = &node.op else {
                return Err(Status::internal("outlined variable is not a constant"));
            };
            let ty = func.value_type(value).clone();
            let ordinal = compiled.variables.len();
            compiled.variables.push(OutlinedConstant {
                name: format!("__constant_{ordinal}"),
                value,
                data: data.to_dense_bytes(&ty)?,
                ty,
            });
        }

        let mut dispatches = Vec::new();
        for region in regions {
            let ordinal = region.ordinal;
            let entry_name = format!("{}_dispatch_{}", func.name, ordinal);
            let tiled = tile_region(func, region, constrained_workgroup_count)?;
            let outlined = outline_region(func, &entry_name, &tiled)?;
            let region = &tiled.region;

            let tied_operands = detect_tied_operands(func, region);
            dispatches.push(DispatchOp {
                executable: entry_name.clone(),
                entry_name: entry_name.clone(),
                workload: region.workload.clone(),
                workgroup_count: tiled.workgroup_count,
                operands: region.captures.clone(),
                results: region.results.clone(),
                tied_operands: tied_operands.clone(),
            });
            compiled.executables.push(ExecutableIr {
                name: entry_name.clone(),
                entry_name,
                workgroup_rank: tiled
                    .workgroup_count
                    .iter()
                    .rev()
                    .position(|&count| count > 1)
                    .map_or(1, |trailing| 3 - trailing),
                binding_count: region.captures.len() + region.results.len(),
                // The workload extents ride along as push constants.
                push_constant_count: region.workload.len(),
                tied_operands,
                func: outlined,
                tiled: tiled.clone(),
            });
        }
        compiled.funcs.push(CompiledFunc {
            name: func.name.clone(),
            source: func.clone(),
            dispatches,
        });
    }
    Ok(compiled)
}

/// Builds the free-floating function for a region: captures become
/// parameters, the region terminator becomes a plain return.
fn outline_region(
    func: &GraphFunc,
    entry_name: &str,
    tiled: &TiledRegion,
) -> StatusResult<GraphFunc> {
    let region = &tiled.region;
    let mut outlined = GraphFunc::new(entry_name.to_string());
    let mut mapping: hashbrown::HashMap<ValueId, ValueId> = hashbrown::HashMap::new();

    for (index, &capture) in region.captures.iter().enumerate() {
        let parameter = outlined.add_parameter(
            format!("binding{index}"),
            func.value_type(capture).clone(),
        );
        mapping.insert(capture, parameter);
    }

    for &op in &region.ops {
        let node = func.node(op);
        let inputs = node
            .inputs
            .iter()
            .map(|input| {
                mapping.get(input).copied().ok_or_else(|| {
                    Status::internal(format!(
                        "region op uses {input:?} which is neither a capture nor a \
                         region value"
                    ))
                })
            })
            .collect::<StatusResult<Vec<_>>>()?;
        let result = outlined.add_node_with_type(
            node.op.clone(),
            inputs,
            func.value_type(node.result).clone(),
        )?;
        mapping.insert(node.result, result);
    }

    for &result in &region.results {
        let mapped = mapping.get(&result).copied().ok_or_else(|| {
            Status::internal("region result was not produced by a region op")
        })?;
        outlined.add_result(mapped);
    }
    Ok(outlined)
}

/// Conservative in-place detection: a result ties to an operand when
/// the types match and the operand's value has no uses after this
/// region, so the storage can be reused.
fn detect_tied_operands(
    func: &GraphFunc,
    region: &crate::dispatch::region::DispatchRegion,
) -> Vec<Option<usize>> {
    let last_region_op = region.ops.iter().map(|op| op.0).max().unwrap_or(0);
    region
        .results
        .iter()
        .map(|&result| {
            region.captures.iter().position(|&capture| {
                if func.is_result(capture) || func.value_type(capture) != func.value_type(result)
                {
                    return false;
                }
                if func.producer(capture).is_none() {
                    // Parameters belong to the caller; never reuse.
                    return false;
                }
                // No consumer after this region.
                func.consumers(capture)
                    .iter()
                    .all(|consumer| consumer.0 <= last_region_op)
            })
        })
        .collect()
}
