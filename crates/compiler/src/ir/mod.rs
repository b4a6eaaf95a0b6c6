//! The tensor graph IR: SSA values over single-result operation nodes.

/// Serde model for driver input
pub mod desc;
/// Graph functions, nodes, and operations
pub mod graph;
/// Tensor types and dimensions
pub mod types;

pub use desc::GraphDesc;
pub use graph::{
    ConstantData, EwOp, GraphFunc, GraphModule, IteratorKind, Node, OpId, Operation, ReduceOp,
    ScalarValue, ValueId,
};
pub use types::{Dim, TensorType};
