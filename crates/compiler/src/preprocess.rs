//! Preprocessing rewrites selected by driver flags: convolution
//! shaping, matmul padding, and mmt4d tiling. Each pass rebuilds the
//! function, replacing matched nodes with their expansion.

use tensile_base::{Status, StatusResult};

use crate::ir::{GraphFunc, GraphModule, Node, Operation, TensorType, ValueId};

/// Flags controlling the preprocessing pipeline.
#[derive(Debug, Clone, Default)]
pub struct PreprocessOptions {
    /// Rewrite 1x1 convolutions into matmuls.
    pub conv1x1_to_matmul: bool,
    /// Rewrite remaining convolutions through im2col.
    pub conv_to_img2col: bool,
    /// Pad matmul dimensions up to multiples of this size.
    pub padding_size: Option<usize>,
    /// Rewrite matmuls into mmt4d with (M0, K0, N0) tiles.
    pub mmt4d_tiles: Option<(usize, usize, usize)>,
}

impl PreprocessOptions {
    /// Validates flag combinations the driver accepts.
    pub fn validate(&self) -> StatusResult<()> {
        if let Some((m0, k0, n0)) = self.mmt4d_tiles {
            if m0 == 0 || k0 == 0 || n0 == 0 {
                return Err(Status::invalid_argument(
                    "mmt4d tile sizes M0/K0/N0 must all be nonzero",
                ));
            }
        }
        Ok(())
    }
}

/// Runs the enabled rewrites over every function.
pub fn run(module: &mut GraphModule, options: &PreprocessOptions) -> StatusResult<()> {
    options.validate()?;
    for func in &mut module.funcs {
        if options.conv1x1_to_matmul {
            *func = rewrite_func(func, conv1x1_rule)?;
        }
        if options.conv_to_img2col {
            *func = rewrite_func(func, img2col_rule)?;
        }
        if let Some(padding) = options.padding_size {
            *func = rewrite_func(func, |out, node, inputs| {
                pad_matmul_rule(out, node, inputs, padding)
            })?;
        }
        if let Some(tiles) = options.mmt4d_tiles {
            *func = rewrite_func(func, |out, node, inputs| {
                mmt4d_rule(out, node, inputs, tiles)
            })?;
        }
    }
    Ok(())
}

/// Copies a function, letting `rule` replace individual nodes. The rule
/// returns the replacement value, or `None` to keep the node.
fn rewrite_func(
    func: &GraphFunc,
    mut rule: impl FnMut(&mut GraphFunc, &Node, &[ValueId]) -> StatusResult<Option<ValueId>>,
) -> StatusResult<GraphFunc> {
    let mut rebuilt = GraphFunc::new(func.name.clone());
    let mut mapping: hashbrown::HashMap<ValueId, ValueId> = hashbrown::HashMap::new();
    for &parameter in &func.parameters {
        let name = func.values()[parameter.0]
            .name
            .clone()
            .unwrap_or_default();
        let value = rebuilt.add_parameter(name, func.value_type(parameter).clone());
        mapping.insert(parameter, value);
    }
    for node in func.nodes() {
        let inputs: Vec<ValueId> = node
            .inputs
            .iter()
            .map(|input| {
                mapping.get(input).copied().ok_or_else(|| {
                    Status::internal("rewrite encountered an unmapped operand")
                })
            })
            .collect::<StatusResult<_>>()?;
        let replacement = rule(&mut rebuilt, node, &inputs)?;
        let value = match replacement {
            Some(value) => value,
            None => rebuilt.add_node_with_type(
                node.op.clone(),
                inputs,
                func.value_type(node.result).clone(),
            )?,
        };
        mapping.insert(node.result, value);
    }
    for &result in &func.results {
        let value = mapping.get(&result).copied().ok_or_else(|| {
            Status::internal("rewrite lost a function result")
        })?;
        rebuilt.add_result(value);
    }
    Ok(rebuilt)
}

fn static_extents(func: &GraphFunc, value: ValueId) -> Option<Vec<usize>> {
    func.value_type(value).static_extents()
}

/// `conv2d(NHWC, 1x1xCxF)` is a matmul over flattened pixels.
fn conv1x1_rule(
    out: &mut GraphFunc,
    node: &Node,
    inputs: &[ValueId],
) -> StatusResult<Option<ValueId>> {
    if !matches!(node.op, Operation::Conv2d) {
        return Ok(None);
    }
    let Some(filter_extents) = static_extents(out, inputs[1]) else {
        return Ok(None);
    };
    if filter_extents[0] != 1 || filter_extents[1] != 1 {
        return Ok(None);
    }
    let Some(input_extents) = static_extents(out, inputs[0]) else {
        return Ok(None);
    };
    let (pixels, channels, filters) = (
        input_extents[0] * input_extents[1] * input_extents[2],
        input_extents[3],
        filter_extents[3],
    );
    let element = out.value_type(inputs[0]).element;

    let lhs = out.add_node_with_type(
        Operation::Reshape,
        vec![inputs[0]],
        TensorType::static_shape(&[pixels, channels], element),
    )?;
    let rhs = out.add_node_with_type(
        Operation::Reshape,
        vec![inputs[1]],
        TensorType::static_shape(&[channels, filters], element),
    )?;
    let product = out.add_node(Operation::Matmul, vec![lhs, rhs])?;
    let restored = out.add_node_with_type(
        Operation::Reshape,
        vec![product],
        TensorType::static_shape(
            &[input_extents[0], input_extents[1], input_extents[2], filters],
            element,
        ),
    )?;
    Ok(Some(restored))
}

/// General convolutions become im2col followed by a matmul.
fn img2col_rule(
    out: &mut GraphFunc,
    node: &Node,
    inputs: &[ValueId],
) -> StatusResult<Option<ValueId>> {
    if !matches!(node.op, Operation::Conv2d) {
        return Ok(None);
    }
    let (Some(input_extents), Some(filter_extents)) = (
        static_extents(out, inputs[0]),
        static_extents(out, inputs[1]),
    ) else {
        return Ok(None);
    };
    let [n, h, w, _c] = [
        input_extents[0],
        input_extents[1],
        input_extents[2],
        input_extents[3],
    ];
    let [kh, kw, c, f] = [
        filter_extents[0],
        filter_extents[1],
        filter_extents[2],
        filter_extents[3],
    ];
    let (oh, ow) = (h - kh + 1, w - kw + 1);
    let element = out.value_type(inputs[0]).element;

    let columns = out.add_node(
        Operation::Im2col { kernel: [kh, kw] },
        vec![inputs[0]],
    )?;
    let filter_matrix = out.add_node_with_type(
        Operation::Reshape,
        vec![inputs[1]],
        TensorType::static_shape(&[kh * kw * c, f], element),
    )?;
    let product = out.add_node(Operation::Matmul, vec![columns, filter_matrix])?;
    let restored = out.add_node_with_type(
        Operation::Reshape,
        vec![product],
        TensorType::static_shape(&[n, oh, ow, f], element),
    )?;
    Ok(Some(restored))
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Pads matmul dimensions up to multiples of `padding`, slicing the
/// result back to its original extents.
fn pad_matmul_rule(
    out: &mut GraphFunc,
    node: &Node,
    inputs: &[ValueId],
    padding: usize,
) -> StatusResult<Option<ValueId>> {
    if !matches!(node.op, Operation::Matmul) || padding <= 1 {
        return Ok(None);
    }
    let (Some(lhs_extents), Some(rhs_extents)) = (
        static_extents(out, inputs[0]),
        static_extents(out, inputs[1]),
    ) else {
        return Ok(None);
    };
    let (m, k, n) = (lhs_extents[0], lhs_extents[1], rhs_extents[1]);
    let (pm, pk, pn) = (
        round_up(m, padding),
        round_up(k, padding),
        round_up(n, padding),
    );
    if (pm, pk, pn) == (m, k, n) {
        return Ok(None);
    }

    let lhs = out.add_node(
        Operation::Pad {
            low: vec![0, 0],
            high: vec![pm - m, pk - k],
            value: 0.0,
        },
        vec![inputs[0]],
    )?;
    let rhs = out.add_node(
        Operation::Pad {
            low: vec![0, 0],
            high: vec![pk - k, pn - n],
            value: 0.0,
        },
        vec![inputs[1]],
    )?;
    let product = out.add_node(Operation::Matmul, vec![lhs, rhs])?;
    let sliced = out.add_node(
        Operation::Slice {
            offsets: vec![0, 0],
            sizes: vec![m, n],
        },
        vec![product],
    )?;
    Ok(Some(sliced))
}

/// Matmuls whose dimensions divide the tile sizes become mmt4d ops;
/// indivisible matmuls are left alone.
fn mmt4d_rule(
    out: &mut GraphFunc,
    node: &Node,
    inputs: &[ValueId],
    (m0, k0, n0): (usize, usize, usize),
) -> StatusResult<Option<ValueId>> {
    if !matches!(node.op, Operation::Matmul) {
        return Ok(None);
    }
    let (Some(lhs_extents), Some(rhs_extents)) = (
        static_extents(out, inputs[0]),
        static_extents(out, inputs[1]),
    ) else {
        return Ok(None);
    };
    let (m, k, n) = (lhs_extents[0], lhs_extents[1], rhs_extents[1]);
    if m % m0 != 0 || k % k0 != 0 || n % n0 != 0 {
        tracing::debug!(m, k, n, m0, k0, n0, "matmul not divisible by mmt4d tiles");
        return Ok(None);
    }
    let product = out.add_node(Operation::Mmt4d { m0, k0, n0 }, inputs.to_vec())?;
    Ok(Some(product))
}
