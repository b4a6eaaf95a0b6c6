//! Cooperative-matrix analysis.
//!
//! A subgroup-level contraction may be promoted to cooperative-matrix
//! operations when the operands analyze as compatible: the region is a
//! single matmul whose operands come straight from interface bindings
//! (identity permutation), indexing is row-major, strides are static,
//! and every dimension divides the subgroup tile.

use crate::dispatch::outline::ExecutableIr;
use crate::ir::Operation;

/// The shape facts a promoted contraction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoopMatmulInfo {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Binding indices of the lhs and rhs interface parameters.
    pub lhs_binding: usize,
    pub rhs_binding: usize,
}

/// Checks whether the executable's region is a cooperative-matrix
/// compatible matmul for the given subgroup tile.
pub fn analyze_cooperative_matmul(
    executable: &ExecutableIr,
    subgroup_tile: [usize; 3],
) -> Option<CoopMatmulInfo> {
    let func = &executable.func;
    // A single contraction and nothing else; any interposed transpose
    // or reshape breaks the identity permutation requirement.
    if func.nodes().len() != 1 || func.results.len() != 1 {
        return None;
    }
    let node = &func.nodes()[0];
    if !matches!(node.op, Operation::Matmul) {
        return None;
    }
    let lhs_binding = func
        .parameters
        .iter()
        .position(|&parameter| parameter == node.inputs[0])?;
    let rhs_binding = func
        .parameters
        .iter()
        .position(|&parameter| parameter == node.inputs[1])?;

    // Row-major with static strides: every shape must be fully static.
    let lhs = func.value_type(node.inputs[0]).static_extents()?;
    let rhs = func.value_type(node.inputs[1]).static_extents()?;
    let (m, k, n) = (lhs[0], lhs[1], rhs[1]);
    let [tile_m, tile_n, tile_k] = subgroup_tile;
    if m % tile_m != 0 || n % tile_n != 0 || k % tile_k != 0 {
        return None;
    }
    Some(CoopMatmulInfo {
        m,
        n,
        k,
        lhs_binding,
        rhs_binding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::outline::outline_module;
    use crate::ir::{EwOp, GraphFunc, GraphModule, Operation, TensorType};
    use tensile_hal::ElementType;

    fn matmul_executable(m: usize, k: usize, n: usize) -> ExecutableIr {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", TensorType::static_shape(&[m, k], ElementType::F32));
        let b = func.add_parameter("b", TensorType::static_shape(&[k, n], ElementType::F32));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        func.add_result(product);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        outline_module(&module, false).unwrap().executables.remove(0)
    }

    #[test]
    fn test_compatible_matmul_analyzes() {
        let executable = matmul_executable(32, 16, 48);
        let info = analyze_cooperative_matmul(&executable, [16, 16, 16]).unwrap();
        assert_eq!((info.m, info.k, info.n), (32, 16, 48));
        assert_eq!(info.lhs_binding, 0);
        assert_eq!(info.rhs_binding, 1);
    }

    #[test]
    fn test_indivisible_tile_rejected() {
        let executable = matmul_executable(30, 16, 48);
        assert!(analyze_cooperative_matmul(&executable, [16, 16, 16]).is_none());
    }

    #[test]
    fn test_fused_region_rejected() {
        // A region with a fused elementwise consumer is not a bare
        // subgroup contraction.
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", TensorType::static_shape(&[16, 16], ElementType::F32));
        let b = func.add_parameter("b", TensorType::static_shape(&[16, 16], ElementType::F32));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        let biased = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![product, a])
            .unwrap();
        func.add_result(biased);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        let executable = outline_module(&module, false)
            .unwrap()
            .executables
            .remove(0);
        assert!(analyze_cooperative_matmul(&executable, [16, 16, 16]).is_none());
    }

    #[test]
    fn test_transposed_operand_rejected() {
        // An interposed transpose breaks the identity permutation.
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", TensorType::static_shape(&[16, 16], ElementType::F32));
        let b = func.add_parameter("b", TensorType::static_shape(&[16, 16], ElementType::F32));
        let flipped = func
            .add_node(
                Operation::Transpose {
                    permutation: vec![1, 0],
                },
                vec![a],
            )
            .unwrap();
        let product = func.add_node(Operation::Matmul, vec![flipped, b]).unwrap();
        func.add_result(product);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        // The transpose fuses into the matmul region only if admitted;
        // either way the contraction operand is not a bare binding.
        for executable in outline_module(&module, false).unwrap().executables {
            assert!(analyze_cooperative_matmul(&executable, [16, 16, 16]).is_none());
        }
    }
}
