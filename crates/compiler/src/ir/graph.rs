//! Graph functions: SSA values produced by single-result operation
//! nodes, held in topological order.

use bytes::Bytes;
use tensile_base::{Status, StatusResult};
use tensile_hal::ElementType;

use crate::ir::types::{Dim, TensorType};

/// Index of a value within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

/// Index of an operation node within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// Elementwise arithmetic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EwOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Exp,
}

impl EwOp {
    pub fn arity(self) -> usize {
        match self {
            EwOp::Exp => 1,
            _ => 2,
        }
    }
}

/// Reduction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// A scalar constant value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    I32(i32),
}

impl ScalarValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ScalarValue::F32(value) => value as f64,
            ScalarValue::I32(value) => value as f64,
        }
    }
}

/// Constant payloads: a splat scalar or dense bytes in element order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantData {
    Splat(ScalarValue),
    Dense(Bytes),
}

impl ConstantData {
    pub fn is_splat(&self) -> bool {
        matches!(self, ConstantData::Splat(_))
    }

    /// Bytes this constant occupies when captured: dense payload size,
    /// or the element size for a splat.
    pub fn captured_byte_size(&self, ty: &TensorType) -> usize {
        match self {
            ConstantData::Splat(_) => ty.element.byte_size(),
            ConstantData::Dense(data) => data.len(),
        }
    }

    /// Materializes dense bytes for a fully static type.
    pub fn to_dense_bytes(&self, ty: &TensorType) -> StatusResult<Bytes> {
        match self {
            ConstantData::Dense(data) => Ok(data.clone()),
            ConstantData::Splat(scalar) => {
                let count = ty.element_count().ok_or_else(|| {
                    Status::invalid_argument("cannot densify a dynamic splat")
                })?;
                let mut bytes = Vec::with_capacity(count * ty.element.byte_size());
                for _ in 0..count {
                    match (scalar, ty.element) {
                        (ScalarValue::F32(value), _) => {
                            bytes.extend_from_slice(&value.to_le_bytes())
                        }
                        (ScalarValue::I32(value), _) => {
                            bytes.extend_from_slice(&value.to_le_bytes())
                        }
                    }
                }
                Ok(bytes.into())
            }
        }
    }
}

/// Tensor operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Constant {
        data: ConstantData,
    },
    Elementwise {
        op: EwOp,
    },
    /// `(MxK, KxN) -> MxN`
    Matmul,
    /// Matmul in tiled `mmt4d` form; semantics are unchanged, the tile
    /// sizes steer distribution.
    Mmt4d {
        m0: usize,
        k0: usize,
        n0: usize,
    },
    Reduce {
        op: ReduceOp,
        dims: Vec<usize>,
    },
    /// NHWC x HWCF -> NHWC, unit stride, valid padding.
    Conv2d,
    /// NHWC input gathered into matmul-ready columns for a HxW kernel.
    Im2col {
        kernel: [usize; 2],
    },
    Reshape,
    Transpose {
        permutation: Vec<usize>,
    },
    Pad {
        low: Vec<usize>,
        high: Vec<usize>,
        value: f32,
    },
    Slice {
        offsets: Vec<usize>,
        sizes: Vec<usize>,
    },
}

impl Operation {
    /// Short mnemonic for diagnostics and structural hashing.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Operation::Constant { .. } => "constant",
            Operation::Elementwise { .. } => "elementwise",
            Operation::Matmul => "matmul",
            Operation::Mmt4d { .. } => "mmt4d",
            Operation::Reduce { .. } => "reduce",
            Operation::Conv2d => "conv2d",
            Operation::Im2col { .. } => "im2col",
            Operation::Reshape => "reshape",
            Operation::Transpose { .. } => "transpose",
            Operation::Pad { .. } => "pad",
            Operation::Slice { .. } => "slice",
        }
    }

    /// True when the op carries a reduction iterator.
    pub fn has_reduction(&self) -> bool {
        matches!(
            self,
            Operation::Matmul
                | Operation::Mmt4d { .. }
                | Operation::Reduce { .. }
                | Operation::Conv2d
        )
    }

    /// True for ops whose iteration space is the output space with
    /// purely parallel iterators (index shuffles included).
    pub fn is_pointwise(&self) -> bool {
        matches!(
            self,
            Operation::Elementwise { .. }
                | Operation::Transpose { .. }
                | Operation::Pad { .. }
                | Operation::Slice { .. }
                | Operation::Im2col { .. }
        )
    }
}

/// Iterator kind along one loop dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorKind {
    Parallel,
    Reduction,
}

/// One operation node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: OpId,
    pub op: Operation,
    pub inputs: Vec<ValueId>,
    pub result: ValueId,
}

/// One SSA value.
#[derive(Debug, Clone)]
pub struct ValueDef {
    pub ty: TensorType,
    pub producer: Option<OpId>,
    pub name: Option<String>,
}

/// A function over tensor values. Nodes are kept in topological order.
#[derive(Debug, Clone, Default)]
pub struct GraphFunc {
    pub name: String,
    values: Vec<ValueDef>,
    nodes: Vec<Node>,
    pub parameters: Vec<ValueId>,
    pub results: Vec<ValueId>,
}

impl GraphFunc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares a function parameter.
    pub fn add_parameter(&mut self, name: impl Into<String>, ty: TensorType) -> ValueId {
        let id = self.add_value(ty, None, Some(name.into()));
        self.parameters.push(id);
        id
    }

    fn add_value(
        &mut self,
        ty: TensorType,
        producer: Option<OpId>,
        name: Option<String>,
    ) -> ValueId {
        self.values.push(ValueDef { ty, producer, name });
        ValueId(self.values.len() - 1)
    }

    /// Appends a node, inferring and checking its result type.
    pub fn add_node(&mut self, op: Operation, inputs: Vec<ValueId>) -> StatusResult<ValueId> {
        let result_ty = self.infer_result_type(&op, &inputs)?;
        self.add_node_with_type(op, inputs, result_ty)
    }

    /// Appends a node with an explicit result type (reshape and friends).
    pub fn add_node_with_type(
        &mut self,
        op: Operation,
        inputs: Vec<ValueId>,
        result_ty: TensorType,
    ) -> StatusResult<ValueId> {
        for &input in &inputs {
            if input.0 >= self.values.len() {
                return Err(Status::invalid_argument(format!(
                    "operand {input:?} is undefined"
                )));
            }
        }
        let id = OpId(self.nodes.len());
        let result = self.add_value(result_ty, Some(id), None);
        self.nodes.push(Node {
            id,
            op,
            inputs,
            result,
        });
        Ok(result)
    }

    /// Marks a function result.
    pub fn add_result(&mut self, value: ValueId) {
        self.results.push(value);
    }

    pub fn values(&self) -> &[ValueDef] {
        &self.values
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: OpId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn value_type(&self, id: ValueId) -> &TensorType {
        &self.values[id.0].ty
    }

    pub fn producer(&self, id: ValueId) -> Option<OpId> {
        self.values[id.0].producer
    }

    /// Ops that consume `value`.
    pub fn consumers(&self, value: ValueId) -> Vec<OpId> {
        self.nodes
            .iter()
            .filter(|node| node.inputs.contains(&value))
            .map(|node| node.id)
            .collect()
    }

    /// True when `value` escapes as a function result.
    pub fn is_result(&self, value: ValueId) -> bool {
        self.results.contains(&value)
    }

    /// Iterator kinds of a node, outermost first.
    pub fn iterator_kinds(&self, node: &Node) -> Vec<IteratorKind> {
        match &node.op {
            Operation::Matmul => vec![
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Reduction,
            ],
            Operation::Mmt4d { .. } => vec![
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Reduction,
            ],
            Operation::Reduce { dims, .. } => {
                let input_rank = self.value_type(node.inputs[0]).rank();
                (0..input_rank)
                    .map(|dim| {
                        if dims.contains(&dim) {
                            IteratorKind::Reduction
                        } else {
                            IteratorKind::Parallel
                        }
                    })
                    .collect()
            }
            Operation::Conv2d => vec![
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Reduction,
                IteratorKind::Reduction,
                IteratorKind::Reduction,
            ],
            _ => vec![IteratorKind::Parallel; self.value_type(node.result).rank()],
        }
    }

    fn infer_result_type(&self, op: &Operation, inputs: &[ValueId]) -> StatusResult<TensorType> {
        let input_ty = |index: usize| -> StatusResult<&TensorType> {
            inputs
                .get(index)
                .map(|&id| self.value_type(id))
                .ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "{} expects operand {index}",
                        op.mnemonic()
                    ))
                })
        };
        match op {
            Operation::Constant { .. } => Err(Status::invalid_argument(
                "constants need an explicit result type",
            )),
            Operation::Elementwise { op: ew } => {
                if inputs.len() != ew.arity() {
                    return Err(Status::invalid_argument(format!(
                        "elementwise {ew:?} expects {} operands, got {}",
                        ew.arity(),
                        inputs.len()
                    )));
                }
                let first = input_ty(0)?.clone();
                for index in 1..inputs.len() {
                    if input_ty(index)?.dims != first.dims {
                        return Err(Status::invalid_argument(format!(
                            "elementwise operand {index} shape mismatch: {} vs {first}",
                            input_ty(index)?
                        )));
                    }
                }
                Ok(first)
            }
            Operation::Matmul | Operation::Mmt4d { .. } => {
                let lhs = input_ty(0)?;
                let rhs = input_ty(1)?;
                if lhs.rank() != 2 || rhs.rank() != 2 {
                    return Err(Status::invalid_argument("matmul operands must be rank 2"));
                }
                if lhs.dims[1] != rhs.dims[0] {
                    return Err(Status::invalid_argument(format!(
                        "matmul contraction mismatch: {lhs} x {rhs}"
                    )));
                }
                Ok(TensorType::new(
                    vec![lhs.dims[0], rhs.dims[1]],
                    lhs.element,
                ))
            }
            Operation::Reduce { dims, .. } => {
                let input = input_ty(0)?;
                let kept: Vec<Dim> = input
                    .dims
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !dims.contains(index))
                    .map(|(_, &dim)| dim)
                    .collect();
                Ok(TensorType::new(kept, input.element))
            }
            Operation::Conv2d => {
                let input = input_ty(0)?;
                let filter = input_ty(1)?;
                if input.rank() != 4 || filter.rank() != 4 {
                    return Err(Status::invalid_argument(
                        "conv2d expects NHWC input and HWCF filter",
                    ));
                }
                let dims = conv_output_dims(input, filter)?;
                Ok(TensorType::new(dims, input.element))
            }
            Operation::Im2col { kernel } => {
                let input = input_ty(0)?;
                let extents = input.static_extents().ok_or_else(|| {
                    Status::unimplemented("im2col over dynamic shapes")
                })?;
                let [kh, kw] = *kernel;
                let rows = extents[0] * (extents[1] - kh + 1) * (extents[2] - kw + 1);
                let cols = kh * kw * extents[3];
                Ok(TensorType::static_shape(&[rows, cols], input.element))
            }
            Operation::Reshape => Err(Status::invalid_argument(
                "reshape needs an explicit result type",
            )),
            Operation::Transpose { permutation } => {
                let input = input_ty(0)?;
                if permutation.len() != input.rank() {
                    return Err(Status::invalid_argument(
                        "transpose permutation rank mismatch",
                    ));
                }
                let dims = permutation.iter().map(|&axis| input.dims[axis]).collect();
                Ok(TensorType::new(dims, input.element))
            }
            Operation::Pad { low, high, .. } => {
                let input = input_ty(0)?;
                if low.len() != input.rank() || high.len() != input.rank() {
                    return Err(Status::invalid_argument("pad rank mismatch"));
                }
                let dims = input
                    .dims
                    .iter()
                    .zip(low.iter().zip(high))
                    .map(|(&dim, (&lo, &hi))| match dim {
                        Dim::Static(extent) => Dim::Static(extent + lo + hi),
                        Dim::Dynamic => Dim::Dynamic,
                    })
                    .collect();
                Ok(TensorType::new(dims, input.element))
            }
            Operation::Slice { offsets, sizes } => {
                let input = input_ty(0)?;
                if offsets.len() != input.rank() || sizes.len() != input.rank() {
                    return Err(Status::invalid_argument("slice rank mismatch"));
                }
                Ok(TensorType::static_shape(sizes, input.element))
            }
        }
    }

    /// Appends a constant node.
    pub fn add_constant(&mut self, data: ConstantData, ty: TensorType) -> StatusResult<ValueId> {
        self.add_node_with_type(Operation::Constant { data }, vec![], ty)
    }
}

fn conv_output_dims(input: &TensorType, filter: &TensorType) -> StatusResult<Vec<Dim>> {
    let out = |input_dim: Dim, filter_dim: Dim| -> StatusResult<Dim> {
        match (input_dim, filter_dim) {
            (Dim::Static(extent), Dim::Static(kernel)) => {
                if kernel > extent {
                    return Err(Status::invalid_argument("conv2d kernel exceeds input"));
                }
                Ok(Dim::Static(extent - kernel + 1))
            }
            _ => Ok(Dim::Dynamic),
        }
    };
    Ok(vec![
        input.dims[0],
        out(input.dims[1], filter.dims[0])?,
        out(input.dims[2], filter.dims[1])?,
        filter.dims[3],
    ])
}

/// A module of graph functions.
#[derive(Debug, Clone, Default)]
pub struct GraphModule {
    pub name: String,
    pub funcs: Vec<GraphFunc>,
}

impl GraphModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(extents: &[usize]) -> TensorType {
        TensorType::static_shape(extents, ElementType::F32)
    }

    #[test]
    fn test_build_and_infer() {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[16, 32]));
        let b = func.add_parameter("b", f32_tensor(&[32, 48]));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        assert_eq!(func.value_type(product), &f32_tensor(&[16, 48]));
        let doubled = func
            .add_node(
                Operation::Elementwise { op: EwOp::Add },
                vec![product, product],
            )
            .unwrap();
        func.add_result(doubled);

        assert_eq!(func.nodes().len(), 2);
        assert_eq!(func.consumers(product).len(), 1);
        assert!(func.is_result(doubled));
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[16, 32]));
        let b = func.add_parameter("b", f32_tensor(&[31, 48]));
        assert!(func.add_node(Operation::Matmul, vec![a, b]).is_err());
    }

    #[test]
    fn test_iterator_kinds() {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[8, 8]));
        let b = func.add_parameter("b", f32_tensor(&[8, 8]));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        let node = func.node(func.producer(product).unwrap());
        assert_eq!(
            func.iterator_kinds(node),
            vec![
                IteratorKind::Parallel,
                IteratorKind::Parallel,
                IteratorKind::Reduction
            ]
        );

        let summed = func
            .add_node(
                Operation::Reduce {
                    op: ReduceOp::Sum,
                    dims: vec![1],
                },
                vec![product],
            )
            .unwrap();
        assert_eq!(func.value_type(summed).rank(), 1);
        let node = func.node(func.producer(summed).unwrap());
        assert_eq!(
            func.iterator_kinds(node),
            vec![IteratorKind::Parallel, IteratorKind::Reduction]
        );
    }

    #[test]
    fn test_constant_densify() {
        let splat = ConstantData::Splat(ScalarValue::F32(2.0));
        let ty = f32_tensor(&[3]);
        let bytes = splat.to_dense_bytes(&ty).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &2.0f32.to_le_bytes());
    }
}
