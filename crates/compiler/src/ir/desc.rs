//! Serde model for driver input graphs.
//!
//! The CLI accepts a JSON description of a tensor program and builds a
//! [`GraphModule`] from it. The textual IR format proper is out of
//! scope; this model is the driver's ingestion surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tensile_base::{Status, StatusResult};
use tensile_hal::ElementType;

use crate::ir::graph::{
    ConstantData, EwOp, GraphFunc, GraphModule, Operation, ReduceOp, ScalarValue, ValueId,
};
use crate::ir::types::{Dim, TensorType};

/// A tensor declaration. `-1` extents are dynamic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDesc {
    pub id: String,
    pub shape: Vec<i64>,
    pub element: String,
}

/// One operation. `kind` selects the op; `attrs` carries op-specific
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDesc {
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub output: String,
    #[serde(default)]
    pub attrs: HashMap<String, serde_json::Value>,
}

/// A whole input graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDesc {
    pub name: String,
    pub tensors: Vec<TensorDesc>,
    pub ops: Vec<OpDesc>,
    pub parameters: Vec<String>,
    pub results: Vec<String>,
}

fn parse_element(name: &str) -> StatusResult<ElementType> {
    Ok(match name {
        "f32" => ElementType::F32,
        "f64" => ElementType::F64,
        "f16" => ElementType::F16,
        "i8" => ElementType::I8,
        "i32" => ElementType::I32,
        "i64" => ElementType::I64,
        "u8" => ElementType::U8,
        "u32" => ElementType::U32,
        other => {
            return Err(Status::invalid_argument(format!(
                "unknown element type '{other}'"
            )))
        }
    })
}

fn parse_type(desc: &TensorDesc) -> StatusResult<TensorType> {
    let dims = desc
        .shape
        .iter()
        .map(|&extent| {
            if extent < 0 {
                Ok(Dim::Dynamic)
            } else {
                Ok(Dim::Static(extent as usize))
            }
        })
        .collect::<StatusResult<Vec<_>>>()?;
    Ok(TensorType::new(dims, parse_element(&desc.element)?))
}

fn usize_list(attrs: &HashMap<String, serde_json::Value>, key: &str) -> StatusResult<Vec<usize>> {
    attrs
        .get(key)
        .and_then(|value| value.as_array())
        .map(|values| {
            values
                .iter()
                .map(|value| value.as_u64().map(|v| v as usize))
                .collect::<Option<Vec<_>>>()
        })
        .flatten()
        .ok_or_else(|| Status::invalid_argument(format!("missing or malformed attr '{key}'")))
}

impl GraphDesc {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> StatusResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| Status::invalid_argument(format!("malformed graph JSON: {e}")))
    }

    /// Builds the graph function this description denotes.
    pub fn build(&self) -> StatusResult<GraphModule> {
        let mut func = GraphFunc::new(self.name.clone());
        let mut types: HashMap<&str, TensorType> = HashMap::new();
        for tensor in &self.tensors {
            types.insert(tensor.id.as_str(), parse_type(tensor)?);
        }
        let lookup_ty = |id: &str| -> StatusResult<TensorType> {
            types
                .get(id)
                .cloned()
                .ok_or_else(|| Status::not_found(format!("undeclared tensor '{id}'")))
        };

        let mut bindings: HashMap<&str, ValueId> = HashMap::new();
        for parameter in &self.parameters {
            let value = func.add_parameter(parameter.clone(), lookup_ty(parameter)?);
            bindings.insert(parameter.as_str(), value);
        }

        for op in &self.ops {
            let inputs = op
                .inputs
                .iter()
                .map(|id| {
                    bindings.get(id.as_str()).copied().ok_or_else(|| {
                        Status::not_found(format!("op input '{id}' is not yet defined"))
                    })
                })
                .collect::<StatusResult<Vec<_>>>()?;
            let output_ty = lookup_ty(&op.output)?;

            let result = match op.kind.as_str() {
                "add" | "sub" | "mul" | "div" | "min" | "max" | "exp" => {
                    let ew = match op.kind.as_str() {
                        "add" => EwOp::Add,
                        "sub" => EwOp::Sub,
                        "mul" => EwOp::Mul,
                        "div" => EwOp::Div,
                        "min" => EwOp::Min,
                        "max" => EwOp::Max,
                        _ => EwOp::Exp,
                    };
                    func.add_node(Operation::Elementwise { op: ew }, inputs)?
                }
                "matmul" => func.add_node(Operation::Matmul, inputs)?,
                "conv2d" => func.add_node(Operation::Conv2d, inputs)?,
                "reduce_sum" | "reduce_max" => {
                    let op_kind = if op.kind == "reduce_sum" {
                        ReduceOp::Sum
                    } else {
                        ReduceOp::Max
                    };
                    let dims = usize_list(&op.attrs, "dims")?;
                    func.add_node(Operation::Reduce { op: op_kind, dims }, inputs)?
                }
                "reshape" => {
                    func.add_node_with_type(Operation::Reshape, inputs, output_ty.clone())?
                }
                "transpose" => {
                    let permutation = usize_list(&op.attrs, "permutation")?;
                    func.add_node(Operation::Transpose { permutation }, inputs)?
                }
                "splat" => {
                    let value = op
                        .attrs
                        .get("value")
                        .and_then(|v| v.as_f64())
                        .ok_or_else(|| {
                            Status::invalid_argument("splat requires a numeric 'value' attr")
                        })?;
                    func.add_constant(
                        ConstantData::Splat(ScalarValue::F32(value as f32)),
                        output_ty.clone(),
                    )?
                }
                "constant" => {
                    let values = op
                        .attrs
                        .get("values")
                        .and_then(|v| v.as_array())
                        .ok_or_else(|| {
                            Status::invalid_argument("constant requires a 'values' array attr")
                        })?;
                    let mut data = Vec::with_capacity(values.len() * 4);
                    for value in values {
                        let value = value.as_f64().ok_or_else(|| {
                            Status::invalid_argument("constant values must be numbers")
                        })? as f32;
                        data.extend_from_slice(&value.to_le_bytes());
                    }
                    func.add_constant(ConstantData::Dense(data.into()), output_ty.clone())?
                }
                other => {
                    return Err(Status::unimplemented(format!(
                        "unknown op kind '{other}'"
                    )))
                }
            };

            if func.value_type(result) != &output_ty {
                return Err(Status::invalid_argument(format!(
                    "op '{}' produces {} but '{}' is declared as {output_ty}",
                    op.kind,
                    func.value_type(result),
                    op.output
                )));
            }
            bindings.insert(op.output.as_str(), result);
        }

        for result in &self.results {
            let value = bindings.get(result.as_str()).copied().ok_or_else(|| {
                Status::not_found(format!("result '{result}' was never produced"))
            })?;
            func.add_result(value);
        }

        let mut module = GraphModule::new(self.name.clone());
        module.funcs.push(func);
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_build() {
        let json = r#"{
            "name": "main",
            "tensors": [
                {"id": "a", "shape": [16], "element": "f32"},
                {"id": "b", "shape": [16], "element": "f32"},
                {"id": "sum", "shape": [16], "element": "f32"}
            ],
            "ops": [
                {"kind": "add", "inputs": ["a", "b"], "output": "sum"}
            ],
            "parameters": ["a", "b"],
            "results": ["sum"]
        }"#;
        let desc = GraphDesc::from_json(json).unwrap();
        let module = desc.build().unwrap();
        let func = &module.funcs[0];
        assert_eq!(func.parameters.len(), 2);
        assert_eq!(func.nodes().len(), 1);
        assert_eq!(func.results.len(), 1);
    }

    #[test]
    fn test_undeclared_tensor_rejected() {
        let json = r#"{
            "name": "main",
            "tensors": [{"id": "a", "shape": [4], "element": "f32"}],
            "ops": [{"kind": "add", "inputs": ["a", "missing"], "output": "a"}],
            "parameters": ["a"],
            "results": []
        }"#;
        let desc = GraphDesc::from_json(json).unwrap();
        assert!(desc.build().is_err());
    }

    #[test]
    fn test_declared_output_type_checked() {
        let json = r#"{
            "name": "main",
            "tensors": [
                {"id": "a", "shape": [4], "element": "f32"},
                {"id": "out", "shape": [5], "element": "f32"}
            ],
            "ops": [{"kind": "add", "inputs": ["a", "a"], "output": "out"}],
            "parameters": ["a"],
            "results": ["out"]
        }"#;
        let desc = GraphDesc::from_json(json).unwrap();
        assert!(desc.build().is_err());
    }
}
