//! Host-target lowering: outlined loop nests become serializable kernel
//! programs executed one workgroup at a time by the local device.
//!
//! The payload format is `host-loop`. A payload carries the outlined
//! function body (ops over value indices), the distributed loop nest,
//! and the binding interface; the loader registered with the HAL turns
//! it back into a [`HostKernel`] that walks the indices its workgroup
//! owns and evaluates one output element per iteration.

use std::sync::Arc;

use tensile_base::{Ref, Status, StatusResult};
use tensile_hal::{
    register_executable_format, DescriptorSetLayout, Device, DispatchContext, ElementType,
    Executable, ExecutableLayout, ExecutableLoader, HostKernel,
};
use tensile_io::{BinaryWriter, IoError, IoResult, MemoryReader};

use crate::dispatch::outline::ExecutableIr;
use crate::dispatch::tiling::{owned_indices, Loop, ProcMapping};
use crate::ir::{ConstantData, EwOp, Operation, ReduceOp};

/// Payload format name of host kernels.
pub const HOST_LOOP_FORMAT: &str = "host-loop";

/// A tensor signature on the wire: extents plus an element type code.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WireType {
    extents: Vec<usize>,
    element: ElementType,
}

impl WireType {
    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_var_u64(self.extents.len() as u64)?;
        for &extent in &self.extents {
            writer.write_var_u64(extent as u64)?;
        }
        writer.write_u32(self.element.code())
    }

    fn deserialize(reader: &mut MemoryReader<'_>) -> IoResult<Self> {
        let rank = reader.read_var_u64_capped("rank", 16)? as usize;
        let mut extents = Vec::with_capacity(rank);
        for _ in 0..rank {
            extents.push(reader.read_var_u64()? as usize);
        }
        let element = ElementType::from_code(reader.read_u32()?)
            .ok_or_else(|| IoError::invalid_data("element type", "unknown code"))?;
        Ok(Self { extents, element })
    }
}

/// One program operation over value indices. Value `i` is binding `i`
/// for `i < param_count`, else the output of op `i - param_count`.
#[derive(Debug, Clone, PartialEq)]
enum KernelOp {
    ConstantSplat {
        value: f64,
    },
    ConstantDense {
        data: Vec<u8>,
        element: ElementType,
    },
    Elementwise {
        op: EwOp,
        inputs: Vec<usize>,
    },
    Matmul {
        lhs: usize,
        rhs: usize,
        k: usize,
    },
    Reduce {
        op: ReduceOp,
        input: usize,
        dims: Vec<usize>,
    },
    Conv2d {
        input: usize,
        filter: usize,
    },
    Im2col {
        input: usize,
        kernel: [usize; 2],
    },
    Reshape {
        input: usize,
    },
    Transpose {
        input: usize,
        permutation: Vec<usize>,
    },
    Pad {
        input: usize,
        low: Vec<usize>,
        value: f64,
    },
    Slice {
        input: usize,
        offsets: Vec<usize>,
    },
}

/// One serialized loop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WireLoop {
    extent: usize,
    step: usize,
    mapping: u8,
    cyclic: bool,
    guarded: bool,
}

const MAPPING_NONE: u8 = 0;
const MAPPING_WG_X: u8 = 1;
const MAPPING_WG_Y: u8 = 2;
const MAPPING_WG_Z: u8 = 3;

/// The decoded kernel program.
#[derive(Debug, Clone)]
pub struct KernelProgram {
    entry_name: String,
    param_types: Vec<WireType>,
    output_type: WireType,
    /// Value index of the output.
    output_value: usize,
    /// Result shape of each op, parallel to `ops`.
    op_types: Vec<WireType>,
    ops: Vec<KernelOp>,
    loops: Vec<WireLoop>,
    delinearized_extents: Vec<usize>,
    push_constant_count: usize,
}

/// Lowers an outlined executable into a `host-loop` payload.
pub fn compile_host_executable(executable: &ExecutableIr) -> StatusResult<Vec<u8>> {
    let program = program_from_ir(executable)?;
    encode_program(&program)
        .map_err(|e| Status::internal(format!("host payload encoding failed: {e}")))
}

fn program_from_ir(executable: &ExecutableIr) -> StatusResult<KernelProgram> {
    let func = &executable.func;
    if func.results.len() != 1 {
        return Err(Status::unimplemented(
            "host lowering supports single-result regions",
        ));
    }

    let wire_type = |value| -> StatusResult<WireType> {
        let ty = func.value_type(value);
        let extents = ty.static_extents().ok_or_else(|| {
            Status::unimplemented("host lowering requires static shapes")
        })?;
        Ok(WireType {
            extents,
            element: ty.element,
        })
    };

    let param_count = func.parameters.len();
    let value_index = |value: crate::ir::ValueId| -> StatusResult<usize> {
        if let Some(position) = func.parameters.iter().position(|&p| p == value) {
            return Ok(position);
        }
        let producer = func
            .producer(value)
            .ok_or_else(|| Status::internal("value has no producer and is not a parameter"))?;
        Ok(param_count + producer.0)
    };

    let mut param_types = Vec::with_capacity(param_count);
    for &parameter in &func.parameters {
        param_types.push(wire_type(parameter)?);
    }

    let mut ops = Vec::with_capacity(func.nodes().len());
    let mut op_types = Vec::with_capacity(func.nodes().len());
    for node in func.nodes() {
        let input = |index: usize| value_index(node.inputs[index]);
        let op = match &node.op {
            Operation::Constant { data } => match data {
                ConstantData::Splat(scalar) => KernelOp::ConstantSplat {
                    value: scalar.as_f64(),
                },
                ConstantData::Dense(bytes) => KernelOp::ConstantDense {
                    data: bytes.to_vec(),
                    element: func.value_type(node.result).element,
                },
            },
            Operation::Elementwise { op } => KernelOp::Elementwise {
                op: *op,
                inputs: node
                    .inputs
                    .iter()
                    .map(|&value| value_index(value))
                    .collect::<StatusResult<_>>()?,
            },
            Operation::Matmul | Operation::Mmt4d { .. } => KernelOp::Matmul {
                lhs: input(0)?,
                rhs: input(1)?,
                k: wire_type(node.inputs[0])?.extents[1],
            },
            Operation::Reduce { op, dims } => KernelOp::Reduce {
                op: *op,
                input: input(0)?,
                dims: dims.clone(),
            },
            Operation::Conv2d => KernelOp::Conv2d {
                input: input(0)?,
                filter: input(1)?,
            },
            Operation::Im2col { kernel } => KernelOp::Im2col {
                input: input(0)?,
                kernel: *kernel,
            },
            Operation::Reshape => KernelOp::Reshape { input: input(0)? },
            Operation::Transpose { permutation } => KernelOp::Transpose {
                input: input(0)?,
                permutation: permutation.clone(),
            },
            Operation::Pad { low, value, .. } => KernelOp::Pad {
                input: input(0)?,
                low: low.clone(),
                value: *value as f64,
            },
            Operation::Slice { offsets, .. } => KernelOp::Slice {
                input: input(0)?,
                offsets: offsets.clone(),
            },
        };
        ops.push(op);
        op_types.push(wire_type(node.result)?);
    }

    let loops = executable
        .tiled
        .nest
        .loops
        .iter()
        .map(|r#loop| WireLoop {
            extent: r#loop.extent,
            step: r#loop.step,
            mapping: match r#loop.mapping {
                Some(ProcMapping::WorkgroupX) => MAPPING_WG_X,
                Some(ProcMapping::WorkgroupY) => MAPPING_WG_Y,
                Some(ProcMapping::WorkgroupZ) => MAPPING_WG_Z,
                _ => MAPPING_NONE,
            },
            cyclic: r#loop.cyclic,
            guarded: r#loop.guarded,
        })
        .collect();

    Ok(KernelProgram {
        entry_name: executable.entry_name.clone(),
        param_types,
        output_type: wire_type(func.results[0])?,
        output_value: value_index(func.results[0])?,
        op_types,
        ops,
        loops,
        delinearized_extents: executable.tiled.nest.delinearized_extents.clone(),
        push_constant_count: executable.push_constant_count,
    })
}

fn encode_program(program: &KernelProgram) -> IoResult<Vec<u8>> {
    let mut writer = BinaryWriter::with_capacity(512);
    writer.write_string(&program.entry_name)?;
    writer.write_var_u64(program.param_types.len() as u64)?;
    for ty in &program.param_types {
        ty.serialize(&mut writer)?;
    }
    program.output_type.serialize(&mut writer)?;
    writer.write_var_u64(program.output_value as u64)?;
    writer.write_var_u64(program.push_constant_count as u64)?;

    writer.write_var_u64(program.ops.len() as u64)?;
    for (op, ty) in program.ops.iter().zip(&program.op_types) {
        ty.serialize(&mut writer)?;
        encode_op(op, &mut writer)?;
    }

    writer.write_var_u64(program.loops.len() as u64)?;
    for r#loop in &program.loops {
        writer.write_var_u64(r#loop.extent as u64)?;
        writer.write_var_u64(r#loop.step as u64)?;
        writer.write_u8(r#loop.mapping)?;
        writer.write_bool(r#loop.cyclic)?;
        writer.write_bool(r#loop.guarded)?;
    }
    writer.write_var_u64(program.delinearized_extents.len() as u64)?;
    for &extent in &program.delinearized_extents {
        writer.write_var_u64(extent as u64)?;
    }
    Ok(writer.into_bytes())
}

fn encode_usize_list(values: &[usize], writer: &mut BinaryWriter) -> IoResult<()> {
    writer.write_var_u64(values.len() as u64)?;
    for &value in values {
        writer.write_var_u64(value as u64)?;
    }
    Ok(())
}

fn decode_usize_list(reader: &mut MemoryReader<'_>) -> IoResult<Vec<usize>> {
    let count = reader.read_var_u64_capped("list", 1 << 16)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_var_u64()? as usize);
    }
    Ok(values)
}

fn encode_op(op: &KernelOp, writer: &mut BinaryWriter) -> IoResult<()> {
    match op {
        KernelOp::ConstantSplat { value } => {
            writer.write_u8(0)?;
            writer.write_f64(*value)
        }
        KernelOp::ConstantDense { data, element } => {
            writer.write_u8(1)?;
            writer.write_u32(element.code())?;
            writer.write_bytes(data)
        }
        KernelOp::Elementwise { op, inputs } => {
            writer.write_u8(2)?;
            writer.write_u8(*op as u8)?;
            encode_usize_list(inputs, writer)
        }
        KernelOp::Matmul { lhs, rhs, k } => {
            writer.write_u8(3)?;
            encode_usize_list(&[*lhs, *rhs, *k], writer)
        }
        KernelOp::Reduce { op, input, dims } => {
            writer.write_u8(4)?;
            writer.write_u8(*op as u8)?;
            writer.write_var_u64(*input as u64)?;
            encode_usize_list(dims, writer)
        }
        KernelOp::Conv2d { input, filter } => {
            writer.write_u8(5)?;
            encode_usize_list(&[*input, *filter], writer)
        }
        KernelOp::Im2col { input, kernel } => {
            writer.write_u8(6)?;
            encode_usize_list(&[*input, kernel[0], kernel[1]], writer)
        }
        KernelOp::Reshape { input } => {
            writer.write_u8(7)?;
            writer.write_var_u64(*input as u64)
        }
        KernelOp::Transpose { input, permutation } => {
            writer.write_u8(8)?;
            writer.write_var_u64(*input as u64)?;
            encode_usize_list(permutation, writer)
        }
        KernelOp::Pad { input, low, value } => {
            writer.write_u8(9)?;
            writer.write_var_u64(*input as u64)?;
            encode_usize_list(low, writer)?;
            writer.write_f64(*value)
        }
        KernelOp::Slice { input, offsets } => {
            writer.write_u8(10)?;
            writer.write_var_u64(*input as u64)?;
            encode_usize_list(offsets, writer)
        }
    }
}

fn decode_ew_op(code: u8) -> IoResult<EwOp> {
    Ok(match code {
        0 => EwOp::Add,
        1 => EwOp::Sub,
        2 => EwOp::Mul,
        3 => EwOp::Div,
        4 => EwOp::Min,
        5 => EwOp::Max,
        6 => EwOp::Exp,
        other => {
            return Err(IoError::invalid_data(
                "elementwise op",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn decode_op(reader: &mut MemoryReader<'_>) -> IoResult<KernelOp> {
    Ok(match reader.read_u8()? {
        0 => KernelOp::ConstantSplat {
            value: reader.read_f64()?,
        },
        1 => {
            let element = ElementType::from_code(reader.read_u32()?)
                .ok_or_else(|| IoError::invalid_data("element type", "unknown code"))?;
            KernelOp::ConstantDense {
                data: reader.read_bytes()?.to_vec(),
                element,
            }
        }
        2 => {
            let op = decode_ew_op(reader.read_u8()?)?;
            KernelOp::Elementwise {
                op,
                inputs: decode_usize_list(reader)?,
            }
        }
        3 => {
            let fields = decode_usize_list(reader)?;
            KernelOp::Matmul {
                lhs: fields[0],
                rhs: fields[1],
                k: fields[2],
            }
        }
        4 => {
            let op = match reader.read_u8()? {
                0 => ReduceOp::Sum,
                1 => ReduceOp::Max,
                other => {
                    return Err(IoError::invalid_data(
                        "reduce op",
                        format!("unknown code {other}"),
                    ))
                }
            };
            KernelOp::Reduce {
                op,
                input: reader.read_var_u64()? as usize,
                dims: decode_usize_list(reader)?,
            }
        }
        5 => {
            let fields = decode_usize_list(reader)?;
            KernelOp::Conv2d {
                input: fields[0],
                filter: fields[1],
            }
        }
        6 => {
            let fields = decode_usize_list(reader)?;
            KernelOp::Im2col {
                input: fields[0],
                kernel: [fields[1], fields[2]],
            }
        }
        7 => KernelOp::Reshape {
            input: reader.read_var_u64()? as usize,
        },
        8 => KernelOp::Transpose {
            input: reader.read_var_u64()? as usize,
            permutation: decode_usize_list(reader)?,
        },
        9 => KernelOp::Pad {
            input: reader.read_var_u64()? as usize,
            low: decode_usize_list(reader)?,
            value: reader.read_f64()?,
        },
        10 => KernelOp::Slice {
            input: reader.read_var_u64()? as usize,
            offsets: decode_usize_list(reader)?,
        },
        other => {
            return Err(IoError::invalid_data(
                "kernel op",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn decode_program(data: &[u8]) -> IoResult<KernelProgram> {
    let mut reader = MemoryReader::new(data);
    let entry_name = reader.read_string()?;
    let param_count = reader.read_var_u64_capped("param count", 256)? as usize;
    let mut param_types = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        param_types.push(WireType::deserialize(&mut reader)?);
    }
    let output_type = WireType::deserialize(&mut reader)?;
    let output_value = reader.read_var_u64()? as usize;
    let push_constant_count = reader.read_var_u64_capped("push constant count", 3)? as usize;

    let op_count = reader.read_var_u64_capped("op count", 1 << 16)? as usize;
    let mut ops = Vec::with_capacity(op_count);
    let mut op_types = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        op_types.push(WireType::deserialize(&mut reader)?);
        ops.push(decode_op(&mut reader)?);
    }

    let loop_count = reader.read_var_u64_capped("loop count", 16)? as usize;
    let mut loops = Vec::with_capacity(loop_count);
    for _ in 0..loop_count {
        loops.push(WireLoop {
            extent: reader.read_var_u64()? as usize,
            step: reader.read_var_u64()? as usize,
            mapping: reader.read_u8()?,
            cyclic: reader.read_bool()?,
            guarded: reader.read_bool()?,
        });
    }
    let delinearized_extents = decode_usize_list(&mut reader)?;

    Ok(KernelProgram {
        entry_name,
        param_types,
        output_type,
        output_value,
        op_types,
        ops,
        loops,
        delinearized_extents,
        push_constant_count,
    })
}

fn read_element(data: &[u8], element: ElementType, index: usize) -> StatusResult<f64> {
    let size = element.byte_size();
    let start = index * size;
    let slice = data.get(start..start + size).ok_or_else(|| {
        Status::out_of_range(format!("element {index} out of range"))
    })?;
    Ok(match element {
        ElementType::F32 => f32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as f64,
        ElementType::F64 => f64::from_le_bytes([
            slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
        ]),
        ElementType::I32 => i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as f64,
        ElementType::I64 => i64::from_le_bytes([
            slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
        ]) as f64,
        ElementType::I8 => (slice[0] as i8) as f64,
        ElementType::U8 => slice[0] as f64,
        other => {
            return Err(Status::unimplemented(format!(
                "host kernels do not evaluate {other} elements"
            )))
        }
    })
}

fn write_element(data: &mut [u8], element: ElementType, index: usize, value: f64) -> StatusResult<()> {
    let size = element.byte_size();
    let start = index * size;
    let slice = data.get_mut(start..start + size).ok_or_else(|| {
        Status::out_of_range(format!("element {index} out of range"))
    })?;
    match element {
        ElementType::F32 => slice.copy_from_slice(&(value as f32).to_le_bytes()),
        ElementType::F64 => slice.copy_from_slice(&value.to_le_bytes()),
        ElementType::I32 => slice.copy_from_slice(&(value as i32).to_le_bytes()),
        ElementType::I64 => slice.copy_from_slice(&(value as i64).to_le_bytes()),
        other => {
            return Err(Status::unimplemented(format!(
                "host kernels do not store {other} elements"
            )))
        }
    }
    Ok(())
}

fn linearize(coords: &[usize], extents: &[usize]) -> usize {
    let mut index = 0usize;
    for (coord, extent) in coords.iter().zip(extents) {
        index = index * extent + coord;
    }
    index
}

fn delinearize(mut index: usize, extents: &[usize]) -> Vec<usize> {
    let mut coords = vec![0usize; extents.len()];
    for axis in (0..extents.len()).rev() {
        coords[axis] = index % extents[axis];
        index /= extents[axis];
    }
    coords
}

/// A `host-loop` kernel: evaluates one output element per owned index.
struct HostLoopKernel {
    program: KernelProgram,
}

impl HostLoopKernel {
    fn value_type(&self, value: usize) -> &WireType {
        if value < self.program.param_types.len() {
            &self.program.param_types[value]
        } else {
            &self.program.op_types[value - self.program.param_types.len()]
        }
    }

    fn eval(
        &self,
        context: &DispatchContext<'_>,
        value: usize,
        coords: &[usize],
    ) -> StatusResult<f64> {
        let param_count = self.program.param_types.len();
        if value < param_count {
            let ty = &self.program.param_types[value];
            let data = context.bindings[value].buffer.get()?.read_bytes(
                context.bindings[value].byte_offset,
                context.bindings[value].byte_length,
            )?;
            return read_element(&data, ty.element, linearize(coords, &ty.extents));
        }

        let op_index = value - param_count;
        let op = &self.program.ops[op_index];
        match op {
            KernelOp::ConstantSplat { value } => Ok(*value),
            KernelOp::ConstantDense { data, element } => {
                let ty = &self.program.op_types[op_index];
                read_element(data, *element, linearize(coords, &ty.extents))
            }
            KernelOp::Elementwise { op, inputs } => {
                let mut operands = Vec::with_capacity(inputs.len());
                for &input in inputs {
                    operands.push(self.eval(context, input, coords)?);
                }
                Ok(match op {
                    EwOp::Add => operands[0] + operands[1],
                    EwOp::Sub => operands[0] - operands[1],
                    EwOp::Mul => operands[0] * operands[1],
                    EwOp::Div => operands[0] / operands[1],
                    EwOp::Min => operands[0].min(operands[1]),
                    EwOp::Max => operands[0].max(operands[1]),
                    EwOp::Exp => operands[0].exp(),
                })
            }
            KernelOp::Matmul { lhs, rhs, k } => {
                let (m, n) = (coords[0], coords[1]);
                let mut accumulator = 0.0f64;
                for reduction in 0..*k {
                    accumulator += self.eval(context, *lhs, &[m, reduction])?
                        * self.eval(context, *rhs, &[reduction, n])?;
                }
                Ok(accumulator)
            }
            KernelOp::Reduce { op, input, dims } => {
                let input_extents = self.value_type(*input).extents.clone();
                let mut input_coords = vec![0usize; input_extents.len()];
                let mut kept = coords.iter();
                for (axis, coordinate) in input_coords.iter_mut().enumerate() {
                    if !dims.contains(&axis) {
                        *coordinate = *kept.next().ok_or_else(|| {
                            Status::internal("reduce coordinate underflow")
                        })?;
                    }
                }
                let mut accumulator = match op {
                    ReduceOp::Sum => 0.0f64,
                    ReduceOp::Max => f64::NEG_INFINITY,
                };
                let reduced_extents: Vec<usize> =
                    dims.iter().map(|&axis| input_extents[axis]).collect();
                let total: usize = reduced_extents.iter().product();
                for flat in 0..total.max(1) {
                    let reduction_coords = delinearize(flat, &reduced_extents);
                    for (position, &axis) in dims.iter().enumerate() {
                        input_coords[axis] = reduction_coords[position];
                    }
                    let element = self.eval(context, *input, &input_coords)?;
                    accumulator = match op {
                        ReduceOp::Sum => accumulator + element,
                        ReduceOp::Max => accumulator.max(element),
                    };
                }
                Ok(accumulator)
            }
            KernelOp::Conv2d { input, filter } => {
                let filter_extents = self.value_type(*filter).extents.clone();
                let (kh, kw, channels) =
                    (filter_extents[0], filter_extents[1], filter_extents[2]);
                let (n, oh, ow, f) = (coords[0], coords[1], coords[2], coords[3]);
                let mut accumulator = 0.0f64;
                for dy in 0..kh {
                    for dx in 0..kw {
                        for channel in 0..channels {
                            accumulator += self
                                .eval(context, *input, &[n, oh + dy, ow + dx, channel])?
                                * self.eval(context, *filter, &[dy, dx, channel, f])?;
                        }
                    }
                }
                Ok(accumulator)
            }
            KernelOp::Im2col { input, kernel } => {
                let input_extents = self.value_type(*input).extents.clone();
                let (height, width, channels) =
                    (input_extents[1], input_extents[2], input_extents[3]);
                let (out_h, out_w) = (height - kernel[0] + 1, width - kernel[1] + 1);
                let (row, col) = (coords[0], coords[1]);
                let row_coords = delinearize(row, &[input_extents[0], out_h, out_w]);
                let col_coords = delinearize(col, &[kernel[0], kernel[1], channels]);
                self.eval(
                    context,
                    *input,
                    &[
                        row_coords[0],
                        row_coords[1] + col_coords[0],
                        row_coords[2] + col_coords[1],
                        col_coords[2],
                    ],
                )
            }
            KernelOp::Reshape { input } => {
                let result_extents = self.program.op_types[op_index].extents.clone();
                let input_extents = self.value_type(*input).extents.clone();
                let flat = linearize(coords, &result_extents);
                self.eval(context, *input, &delinearize(flat, &input_extents))
            }
            KernelOp::Transpose { input, permutation } => {
                let mut input_coords = vec![0usize; coords.len()];
                for (axis, &source) in permutation.iter().enumerate() {
                    input_coords[source] = coords[axis];
                }
                self.eval(context, *input, &input_coords)
            }
            KernelOp::Pad { input, low, value } => {
                let input_extents = self.value_type(*input).extents.clone();
                let mut input_coords = Vec::with_capacity(coords.len());
                for (axis, &coordinate) in coords.iter().enumerate() {
                    if coordinate < low[axis] || coordinate - low[axis] >= input_extents[axis] {
                        return Ok(*value);
                    }
                    input_coords.push(coordinate - low[axis]);
                }
                self.eval(context, *input, &input_coords)
            }
            KernelOp::Slice { input, offsets } => {
                let input_coords: Vec<usize> = coords
                    .iter()
                    .zip(offsets)
                    .map(|(&coordinate, &offset)| coordinate + offset)
                    .collect();
                self.eval(context, *input, &input_coords)
            }
        }
    }
}

impl HostKernel for HostLoopKernel {
    fn invoke(&self, context: &DispatchContext<'_>) -> StatusResult<()> {
        let program = &self.program;
        let output_binding = context
            .bindings
            .get(program.param_types.len())
            .ok_or_else(|| Status::invalid_argument("missing output binding"))?;

        // Indices this workgroup owns, loop by loop.
        let mut per_loop: Vec<Vec<usize>> = Vec::with_capacity(program.loops.len());
        for r#loop in &program.loops {
            let distributed = Loop {
                extent: r#loop.extent,
                step: r#loop.step,
                mapping: None,
                cyclic: r#loop.cyclic,
                guarded: r#loop.guarded,
            };
            let indices = match r#loop.mapping {
                MAPPING_WG_X => {
                    owned_indices(&distributed, context.workgroup_id[0], context.workgroup_count[0])
                }
                MAPPING_WG_Y => {
                    owned_indices(&distributed, context.workgroup_id[1], context.workgroup_count[1])
                }
                MAPPING_WG_Z => {
                    owned_indices(&distributed, context.workgroup_id[2], context.workgroup_count[2])
                }
                _ => (0..r#loop.extent).collect(),
            };
            per_loop.push(indices);
        }

        let mut output = vec![0u8; output_binding.byte_length];
        let existing = output_binding.buffer.get()?.read_bytes(
            output_binding.byte_offset,
            output_binding.byte_length,
        )?;
        output.copy_from_slice(&existing);

        let collapsed =
            program.loops.len() == 1 && program.delinearized_extents.len() > 1;
        let mut cursor = vec![0usize; per_loop.len()];
        visit_product(&per_loop, &mut cursor, 0, &mut |tuple| {
            let coords = if collapsed {
                delinearize(tuple[0], &program.delinearized_extents)
            } else {
                tuple.to_vec()
            };
            let value = self.eval(context, program.output_value, &coords)?;
            write_element(
                &mut output,
                program.output_type.element,
                linearize(&coords, &program.output_type.extents),
                value,
            )
        })?;

        output_binding
            .buffer
            .get()?
            .write_bytes(output_binding.byte_offset, &output)
    }
}

fn visit_product(
    per_loop: &[Vec<usize>],
    cursor: &mut [usize],
    depth: usize,
    visit: &mut impl FnMut(&[usize]) -> StatusResult<()>,
) -> StatusResult<()> {
    if depth == per_loop.len() {
        let tuple: Vec<usize> = cursor
            .iter()
            .enumerate()
            .map(|(level, &position)| per_loop[level][position])
            .collect();
        return visit(&tuple);
    }
    for position in 0..per_loop[depth].len() {
        cursor[depth] = position;
        visit_product(per_loop, cursor, depth + 1, visit)?;
    }
    Ok(())
}

struct HostLoopLoader;

impl ExecutableLoader for HostLoopLoader {
    fn load(&self, _device: &dyn Device, data: &[u8]) -> StatusResult<Ref<Executable>> {
        let program = decode_program(data)
            .map_err(|e| Status::invalid_argument(format!("malformed host payload: {e}")))?;
        let binding_count = program.param_types.len() + 1;
        let layout = Arc::new(ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(binding_count))],
            program.push_constant_count,
        ));
        let entry_name = program.entry_name.clone();
        Ok(Ref::new(Executable::for_host(
            entry_name.clone(),
            layout,
            vec![entry_name],
            vec![Arc::new(HostLoopKernel { program })],
        )))
    }
}

/// Registers the `host-loop` loader with the HAL format registry.
/// Safe to call repeatedly; registration happens once per process.
pub fn register_host_loop_format() {
    static REGISTER: std::sync::Once = std::sync::Once::new();
    REGISTER.call_once(|| {
        register_executable_format(HOST_LOOP_FORMAT, Arc::new(HostLoopLoader));
    });
}
