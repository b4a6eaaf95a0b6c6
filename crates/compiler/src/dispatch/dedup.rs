//! Structural deduplication of outlined executables.
//!
//! Executables are grouped by structural equivalence of their inner
//! function and entry-point interface; one representative per class is
//! retained and every dispatch site referring to a duplicate is
//! rewritten to the representative's symbol. Attributes are folded into
//! the hash in a fixed canonical field order, so incidental ordering
//! cannot split a class.

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use tensile_base::StatusResult;
use xxhash_rust::xxh3::Xxh3;

use crate::dispatch::outline::{CompiledModule, ExecutableIr};
use crate::ir::{ConstantData, GraphFunc, Operation};

/// Deduplicates executables in place. Returns the number of executables
/// removed.
pub fn deduplicate_executables(module: &mut CompiledModule) -> StatusResult<usize> {
    // Structural key -> representative symbol, in first-seen order.
    let mut representatives: IndexMap<u64, String> = IndexMap::new();
    let mut rewrites: Vec<(String, String)> = Vec::new();
    let mut surviving: Vec<ExecutableIr> = Vec::new();
    let removed_count;

    let executables = std::mem::take(&mut module.executables);
    let total = executables.len();
    for executable in executables {
        let key = structural_key(&executable);
        match representatives.get(&key) {
            Some(representative) => {
                tracing::debug!(
                    duplicate = executable.name,
                    representative,
                    "deduplicating executable"
                );
                rewrites.push((executable.name.clone(), representative.clone()));
            }
            None => {
                representatives.insert(key, executable.name.clone());
                surviving.push(executable);
            }
        }
    }
    removed_count = total - surviving.len();
    module.executables = surviving;

    for func in &mut module.funcs {
        for dispatch in &mut func.dispatches {
            if let Some((_, representative)) = rewrites
                .iter()
                .find(|(duplicate, _)| *duplicate == dispatch.executable)
            {
                dispatch.executable = representative.clone();
                dispatch.entry_name = representative.clone();
            }
        }
    }
    Ok(removed_count)
}

fn structural_key(executable: &ExecutableIr) -> u64 {
    let mut hasher = Xxh3::new();
    executable.workgroup_rank.hash(&mut hasher);
    executable.binding_count.hash(&mut hasher);
    executable.push_constant_count.hash(&mut hasher);
    executable.tied_operands.hash(&mut hasher);
    executable.tiled.workgroup_count.hash(&mut hasher);
    executable.tiled.distribution_tag().hash(&mut hasher);
    hash_func(&executable.func, &mut hasher);
    hasher.finish()
}

impl crate::dispatch::tiling::TiledRegion {
    fn distribution_tag(&self) -> u8 {
        match self.distribution {
            crate::dispatch::tiling::DistributionKind::WorkgroupPerIteration => 0,
            crate::dispatch::tiling::DistributionKind::WorkgroupCyclic => 1,
            crate::dispatch::tiling::DistributionKind::GlobalInvocation => 2,
        }
    }
}

/// Hashes a function body structurally: parameter types, ops with their
/// attributes in canonical field order, operand indices, result types.
fn hash_func<H: Hasher>(func: &GraphFunc, hasher: &mut H) {
    func.parameters.len().hash(hasher);
    for &parameter in &func.parameters {
        func.value_type(parameter).hash(hasher);
    }
    func.nodes().len().hash(hasher);
    for node in func.nodes() {
        node.op.mnemonic().hash(hasher);
        hash_attributes(&node.op, hasher);
        for input in &node.inputs {
            input.0.hash(hasher);
        }
        func.value_type(node.result).hash(hasher);
    }
    func.results.len().hash(hasher);
    for &result in &func.results {
        result.0.hash(hasher);
    }
}

fn hash_attributes<H: Hasher>(op: &Operation, hasher: &mut H) {
    match op {
        Operation::Elementwise { op } => (*op as u8).hash(hasher),
        Operation::Mmt4d { m0, k0, n0 } => (m0, k0, n0).hash(hasher),
        Operation::Reduce { op, dims } => {
            (*op as u8).hash(hasher);
            dims.hash(hasher);
        }
        Operation::Im2col { kernel } => kernel.hash(hasher),
        Operation::Transpose { permutation } => permutation.hash(hasher),
        Operation::Pad { low, high, value } => {
            low.hash(hasher);
            high.hash(hasher);
            value.to_bits().hash(hasher);
        }
        Operation::Slice { offsets, sizes } => {
            offsets.hash(hasher);
            sizes.hash(hasher);
        }
        Operation::Constant { data } => match data {
            ConstantData::Splat(scalar) => scalar.as_f64().to_bits().hash(hasher),
            ConstantData::Dense(bytes) => bytes.hash(hasher),
        },
        Operation::Matmul | Operation::Conv2d | Operation::Reshape => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::outline::outline_module;
    use crate::ir::{EwOp, GraphFunc, GraphModule, Operation, TensorType};
    use tensile_hal::ElementType;

    fn f32_tensor(extents: &[usize]) -> TensorType {
        TensorType::static_shape(extents, ElementType::F32)
    }

    /// Two structurally identical elementwise dispatches plus one
    /// distinct matmul dispatch.
    fn module_with_duplicates() -> GraphModule {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[8, 8]));
        let b = func.add_parameter("b", f32_tensor(&[8, 8]));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        func.add_result(product);
        // Two identical adds over the matmul result, each escaping, so
        // they cannot fuse and outline into identical executables.
        let sum1 = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![product, a])
            .unwrap();
        let sum2 = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![product, a])
            .unwrap();
        func.add_result(sum1);
        func.add_result(sum2);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        module
    }

    #[test]
    fn test_duplicates_collapse_to_one_class() {
        let module = module_with_duplicates();
        let mut compiled = outline_module(&module, false).unwrap();
        assert_eq!(compiled.executables.len(), 3);
        let removed = deduplicate_executables(&mut compiled).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(compiled.executables.len(), 2);

        // Every dispatch still references a live executable.
        let names: Vec<&str> = compiled
            .executables
            .iter()
            .map(|executable| executable.name.as_str())
            .collect();
        for dispatch in &compiled.funcs[0].dispatches {
            assert!(names.contains(&dispatch.executable.as_str()));
        }
        // The two add dispatches now share a symbol.
        let dispatches = &compiled.funcs[0].dispatches;
        assert_eq!(dispatches[1].executable, dispatches[2].executable);
    }

    #[test]
    fn test_distinct_signatures_not_merged() {
        // Two chained matmuls with different shapes stay separate.
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[5, 3]));
        let b = func.add_parameter("b", f32_tensor(&[3, 5]));
        let r1 = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        let r2 = func.add_node(Operation::Matmul, vec![b, r1]).unwrap();
        func.add_result(r1);
        func.add_result(r2);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);

        let mut compiled = outline_module(&module, false).unwrap();
        let removed = deduplicate_executables(&mut compiled).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(compiled.executables.len(), 2);
    }

    #[test]
    fn test_count_equals_equivalence_classes() {
        let module = module_with_duplicates();
        let mut compiled = outline_module(&module, false).unwrap();
        let keys: std::collections::HashSet<u64> = compiled
            .executables
            .iter()
            .map(structural_key)
            .collect();
        deduplicate_executables(&mut compiled).unwrap();
        assert_eq!(compiled.executables.len(), keys.len());
    }
}
