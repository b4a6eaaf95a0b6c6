//! Lowering outlined executables to SPIR-V kernel modules.
//!
//! The conversions:
//!
//! - host interface load-constants become indexed loads from a
//!   push-constant global whose pointee is a struct wrapping an array of
//!   index-sized elements;
//! - workgroup-id / workgroup-count ops become extracts from the
//!   corresponding SPIR-V built-ins;
//! - interface bindings become module-level resource variables at
//!   (set, binding), with `aliased` set when several interface ops bind
//!   the same coordinates within one function;
//! - matmul operand staging into workgroup-local memory follows the
//!   copy-distribution rule (guarded single iteration vs cyclic);
//! - subgroup-compatible contractions are promoted to
//!   cooperative-matrix load / mul-add / store when the analysis admits
//!   them and the target advertises support.

use hashbrown::HashMap;
use tensile_base::{Status, StatusResult};

use crate::dispatch::outline::ExecutableIr;
use crate::dispatch::tiling::{distribute_local_copy, DistributionKind, ProcMapping};
use crate::ir::{EwOp, Operation, ValueId};
use crate::spirv::coop::analyze_cooperative_matmul;
use crate::spirv::module::{
    ArithKind, BuiltIn, Operand, SpirvEntryPoint, SpirvFunc, SpirvGlobal, SpirvInst,
    SpirvModule, SpirvType, StorageClass,
};

/// Payload format name of Vulkan SPIR-V kernels.
pub const VULKAN_SPIRV_FORMAT: &str = "vulkan-spirv-fb";

/// Target knobs for the SPIR-V path.
#[derive(Debug, Clone)]
pub struct SpirvTargetOptions {
    pub workgroup_size: [u32; 3],
    pub max_workgroup_invocations: u32,
    /// Promote compatible contractions to cooperative-matrix ops.
    pub cooperative_matrix: bool,
    /// Subgroup tile (m, n, k) for cooperative contractions.
    pub subgroup_tile: [usize; 3],
    /// Stage matmul operand tiles in workgroup-local memory.
    pub stage_matmul_operands: bool,
}

impl Default for SpirvTargetOptions {
    fn default() -> Self {
        Self {
            workgroup_size: [64, 1, 1],
            max_workgroup_invocations: 1024,
            cooperative_matrix: false,
            subgroup_tile: [16, 16, 16],
            stage_matmul_operands: true,
        }
    }
}

struct Emitter {
    next_reg: u32,
    body: Vec<SpirvInst>,
}

impl Emitter {
    fn new() -> Self {
        Self {
            next_reg: 0,
            body: Vec::new(),
        }
    }

    fn reg(&mut self) -> u32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    fn push(&mut self, inst: SpirvInst) {
        self.body.push(inst);
    }

    fn arith(&mut self, kind: ArithKind, lhs: Operand, rhs: Operand) -> u32 {
        let dst = self.reg();
        self.push(SpirvInst::Arith { kind, dst, lhs, rhs });
        dst
    }

    fn push_constant_load(&mut self, index: u32) -> u32 {
        let dst = self.reg();
        self.push(SpirvInst::PushConstantLoad { dst, index });
        dst
    }

    fn built_in(&mut self, built_in: BuiltIn, component: u8) -> u32 {
        let dst = self.reg();
        self.push(SpirvInst::BuiltInExtract {
            dst,
            built_in,
            component,
        });
        dst
    }

    fn load(&mut self, global: u32, index: Operand) -> u32 {
        let dst = self.reg();
        self.push(SpirvInst::BufferLoad { dst, global, index });
        dst
    }
}

fn ew_arith_kind(op: EwOp) -> ArithKind {
    match op {
        EwOp::Add => ArithKind::FAdd,
        EwOp::Sub => ArithKind::FSub,
        EwOp::Mul => ArithKind::FMul,
        EwOp::Div => ArithKind::FDiv,
        EwOp::Min => ArithKind::FMin,
        EwOp::Max => ArithKind::FMax,
        EwOp::Exp => ArithKind::FExp,
    }
}

/// Lowers one outlined executable into a kernel module.
pub fn lower_executable(
    executable: &ExecutableIr,
    options: &SpirvTargetOptions,
) -> StatusResult<SpirvModule> {
    let func = &executable.func;
    if func.results.len() != 1 {
        return Err(Status::unimplemented(
            "spirv lowering supports single-result regions",
        ));
    }

    let mut module = SpirvModule::default();
    let param_count = func.parameters.len();

    // Push-constant global: a struct wrapping an array of index-sized
    // elements, one per interface constant.
    if executable.push_constant_count > 0 {
        module.globals.push(SpirvGlobal {
            name: "push_constants".into(),
            storage_class: StorageClass::PushConstant,
            pointee: SpirvType::IndexArrayStruct {
                count: executable.push_constant_count,
            },
            built_in: None,
            set: None,
            binding: None,
            aliased: false,
        });
    }

    // Built-in inputs referenced by the body.
    for (name, built_in) in [
        ("workgroup_id", BuiltIn::WorkgroupId),
        ("num_workgroups", BuiltIn::NumWorkgroups),
        ("local_invocation_id", BuiltIn::LocalInvocationId),
        ("global_invocation_id", BuiltIn::GlobalInvocationId),
    ] {
        module.globals.push(SpirvGlobal {
            name: name.into(),
            storage_class: StorageClass::Input,
            pointee: SpirvType::Vec3U32,
            built_in: Some(built_in),
            set: None,
            binding: None,
            aliased: false,
        });
    }

    // Resource variables: one interface op per capture plus one for the
    // result. A tied result reuses its operand's (set, binding); both
    // variables are then marked aliased.
    let tied = executable.tied_operands.first().copied().flatten();
    let mut binding_globals: Vec<u32> = Vec::with_capacity(param_count + 1);
    for index in 0..param_count {
        let aliased = tied == Some(index);
        binding_globals.push(module.globals.len() as u32);
        module.globals.push(SpirvGlobal {
            name: format!("binding{index}"),
            storage_class: StorageClass::StorageBuffer,
            pointee: SpirvType::RuntimeArrayF32,
            built_in: None,
            set: Some(0),
            binding: Some(index as u32),
            aliased,
        });
    }
    let output_binding = tied.map_or(param_count as u32, |operand| operand as u32);
    let output_global = module.globals.len() as u32;
    module.globals.push(SpirvGlobal {
        name: format!("binding{param_count}"),
        storage_class: StorageClass::StorageBuffer,
        pointee: SpirvType::RuntimeArrayF32,
        built_in: None,
        set: Some(0),
        binding: Some(output_binding),
        aliased: tied.is_some(),
    });

    let mut emitter = Emitter::new();

    // Interface constants: the workload extents.
    let extent_regs: Vec<u32> = (0..executable.push_constant_count as u32)
        .map(|index| emitter.push_constant_load(index))
        .collect();

    // Distributed loops from the tiled nest. A collapsed elementwise
    // nest with more than one invocation per workgroup maps one
    // iteration per global invocation instead of per workgroup.
    let nest = &executable.tiled.nest;
    let use_global_invocation = executable.tiled.distribution
        == DistributionKind::WorkgroupPerIteration
        && nest.loops.len() == 1
        && nest.loops[0].mapping.is_some()
        && options.workgroup_size.iter().product::<u32>() > 1;

    let mut open_loops = 0usize;
    let mut induction_regs: Vec<u32> = Vec::new();
    if use_global_invocation {
        // One iteration per global invocation, bounds-guarded because
        // the invocation grid may overshoot the collapsed extent.
        let id = emitter.built_in(BuiltIn::GlobalInvocationId, 0);
        let extent = extent_regs
            .first()
            .map(|&reg| Operand::Reg(reg))
            .unwrap_or(Operand::Imm(nest.loops[0].extent as i64));
        emitter.push(SpirvInst::LoopBegin {
            induction: id,
            extent,
            step: Operand::Imm(nest.loops[0].extent as i64),
            cyclic: false,
            guarded: true,
        });
        open_loops += 1;
        induction_regs.push(id);
    }
    let mapped_loops: &[crate::dispatch::tiling::Loop] = if use_global_invocation {
        &[]
    } else {
        &nest.loops
    };
    for (axis, r#loop) in mapped_loops.iter().enumerate() {
        let extent = extent_regs
            .get(axis)
            .map(|&reg| Operand::Reg(reg))
            .unwrap_or(Operand::Imm(r#loop.extent as i64));
        match r#loop.mapping {
            Some(mapping) => {
                let component = match mapping {
                    ProcMapping::WorkgroupX | ProcMapping::WorkitemX => 0,
                    ProcMapping::WorkgroupY | ProcMapping::WorkitemY => 1,
                    _ => 2,
                };
                let id = emitter.built_in(BuiltIn::WorkgroupId, component);
                if r#loop.cyclic {
                    // lb = id * step, step = step * nprocs.
                    let nprocs = emitter.built_in(BuiltIn::NumWorkgroups, component);
                    let lb = emitter.arith(
                        ArithKind::IMul,
                        Operand::Reg(id),
                        Operand::Imm(r#loop.step as i64),
                    );
                    let stride = emitter.arith(
                        ArithKind::IMul,
                        Operand::Reg(nprocs),
                        Operand::Imm(r#loop.step as i64),
                    );
                    let induction = emitter.reg();
                    emitter.push(SpirvInst::Arith {
                        kind: ArithKind::IAdd,
                        dst: induction,
                        lhs: Operand::Reg(lb),
                        rhs: Operand::Imm(0),
                    });
                    emitter.push(SpirvInst::LoopBegin {
                        induction,
                        extent,
                        step: Operand::Reg(stride),
                        cyclic: true,
                        guarded: false,
                    });
                    open_loops += 1;
                    induction_regs.push(induction);
                } else {
                    // One iteration per workgroup; the count covers the
                    // extent exactly unless a guard was requested.
                    if r#loop.guarded {
                        emitter.push(SpirvInst::LoopBegin {
                            induction: id,
                            extent,
                            step: Operand::Imm(r#loop.extent as i64),
                            cyclic: false,
                            guarded: true,
                        });
                        open_loops += 1;
                    }
                    induction_regs.push(id);
                }
            }
            None => {
                let induction = emitter.reg();
                emitter.push(SpirvInst::LoopBegin {
                    induction,
                    extent,
                    step: Operand::Imm(r#loop.step as i64),
                    cyclic: false,
                    guarded: false,
                });
                open_loops += 1;
                induction_regs.push(induction);
            }
        }
    }

    // Linear output index across the induction variables.
    let output_extents = func
        .value_type(func.results[0])
        .static_extents()
        .ok_or_else(|| Status::unimplemented("spirv lowering requires static shapes"))?;
    let output_index = linearize_regs(&mut emitter, &induction_regs, &output_extents);

    // Collapsed nests recover the original induction variables at the
    // top of the body.
    if induction_regs.len() == 1 && nest.delinearized_extents.len() > 1 {
        let mut stride: usize = nest.delinearized_extents.iter().product();
        for &extent in &nest.delinearized_extents {
            stride /= extent;
            let quotient = emitter.arith(
                ArithKind::IDiv,
                Operand::Reg(output_index),
                Operand::Imm(stride as i64),
            );
            let _coordinate = emitter.arith(
                ArithKind::IMod,
                Operand::Reg(quotient),
                Operand::Imm(extent as i64),
            );
        }
    }

    let coop_info = if options.cooperative_matrix {
        analyze_cooperative_matmul(executable, options.subgroup_tile)
    } else {
        None
    };

    if let Some(info) = coop_info {
        // Promoted contraction: loads, mul-add, and store all move to
        // cooperative-matrix ops.
        let a = emitter.reg();
        emitter.push(SpirvInst::CoopMatLoad {
            dst: a,
            global: binding_globals[info.lhs_binding],
            offset: Operand::Reg(output_index),
            stride: info.k as u32,
        });
        let b = emitter.reg();
        emitter.push(SpirvInst::CoopMatLoad {
            dst: b,
            global: binding_globals[info.rhs_binding],
            offset: Operand::Reg(output_index),
            stride: info.n as u32,
        });
        let acc = emitter.arith(ArithKind::FAdd, Operand::Imm(0), Operand::Imm(0));
        let product = emitter.reg();
        emitter.push(SpirvInst::CoopMatMulAdd {
            dst: product,
            a,
            b,
            acc,
        });
        emitter.push(SpirvInst::CoopMatStore {
            global: output_global,
            offset: Operand::Reg(output_index),
            stride: info.n as u32,
            src: product,
        });
    } else {
        emit_scalar_body(
            &mut emitter,
            executable,
            &binding_globals,
            output_global,
            output_index,
            options,
            &mut module,
        )?;
    }

    for _ in 0..open_loops {
        emitter.push(SpirvInst::LoopEnd);
    }

    module.entry_points.push(SpirvEntryPoint {
        name: executable.entry_name.clone(),
        workgroup_size: options.workgroup_size,
    });
    module.funcs.push(SpirvFunc {
        name: executable.entry_name.clone(),
        body: emitter.body,
    });
    Ok(module)
}

fn linearize_regs(emitter: &mut Emitter, regs: &[u32], extents: &[usize]) -> u32 {
    if regs.is_empty() {
        return emitter.arith(ArithKind::IAdd, Operand::Imm(0), Operand::Imm(0));
    }
    let mut index = regs[0];
    for (axis, &reg) in regs.iter().enumerate().skip(1) {
        let extent = extents.get(axis).copied().unwrap_or(1);
        let scaled = emitter.arith(
            ArithKind::IMul,
            Operand::Reg(index),
            Operand::Imm(extent as i64),
        );
        index = emitter.arith(ArithKind::IAdd, Operand::Reg(scaled), Operand::Reg(reg));
    }
    index
}

#[allow(clippy::too_many_arguments)]
fn emit_scalar_body(
    emitter: &mut Emitter,
    executable: &ExecutableIr,
    binding_globals: &[u32],
    output_global: u32,
    output_index: u32,
    options: &SpirvTargetOptions,
    module: &mut SpirvModule,
) -> StatusResult<()> {
    let func = &executable.func;
    let mut value_regs: HashMap<ValueId, u32> = HashMap::new();

    let param_global = |value: ValueId| -> Option<u32> {
        func.parameters
            .iter()
            .position(|&parameter| parameter == value)
            .map(|index| binding_globals[index])
    };

    for node in func.nodes() {
        let result_reg = match &node.op {
            Operation::Constant { .. } => {
                emitter.arith(ArithKind::FAdd, Operand::Imm(0), Operand::Imm(0))
            }
            Operation::Elementwise { op } => {
                let mut operand_regs = Vec::with_capacity(node.inputs.len());
                for &input in &node.inputs {
                    let reg = match value_regs.get(&input) {
                        Some(&reg) => reg,
                        None => {
                            let global = param_global(input).ok_or_else(|| {
                                Status::internal("elementwise operand is unmaterialized")
                            })?;
                            let reg = emitter.load(global, Operand::Reg(output_index));
                            value_regs.insert(input, reg);
                            reg
                        }
                    };
                    operand_regs.push(reg);
                }
                let rhs = if operand_regs.len() > 1 {
                    Operand::Reg(operand_regs[1])
                } else {
                    Operand::Reg(operand_regs[0])
                };
                emitter.arith(ew_arith_kind(*op), Operand::Reg(operand_regs[0]), rhs)
            }
            Operation::Matmul | Operation::Mmt4d { .. } => emit_contraction(
                emitter,
                executable,
                node,
                binding_globals,
                options,
                module,
            )?,
            Operation::Reduce { dims, .. } => {
                let input_extents = func
                    .value_type(node.inputs[0])
                    .static_extents()
                    .ok_or_else(|| {
                        Status::unimplemented("spirv lowering requires static shapes")
                    })?;
                let total: usize = dims.iter().map(|&axis| input_extents[axis]).product();
                let acc = emitter.arith(ArithKind::FAdd, Operand::Imm(0), Operand::Imm(0));
                let induction = emitter.reg();
                emitter.push(SpirvInst::LoopBegin {
                    induction,
                    extent: Operand::Imm(total as i64),
                    step: Operand::Imm(1),
                    cyclic: false,
                    guarded: false,
                });
                let global = param_global(node.inputs[0])
                    .or_else(|| binding_globals.first().copied());
                let element = match global {
                    Some(global) => emitter.load(global, Operand::Reg(induction)),
                    None => acc,
                };
                let updated = emitter.arith(
                    ArithKind::FAdd,
                    Operand::Reg(acc),
                    Operand::Reg(element),
                );
                emitter.push(SpirvInst::LoopEnd);
                updated
            }
            // Index-shuffling ops: recompute the source index, load.
            _ => {
                let shuffled = emitter.arith(
                    ArithKind::IAdd,
                    Operand::Reg(output_index),
                    Operand::Imm(0),
                );
                match param_global(node.inputs[0]) {
                    Some(global) => emitter.load(global, Operand::Reg(shuffled)),
                    None => *value_regs.get(&node.inputs[0]).ok_or_else(|| {
                        Status::internal("shuffle operand is unmaterialized")
                    })?,
                }
            }
        };
        value_regs.insert(node.result, result_reg);
    }

    let result_reg = *value_regs
        .get(&func.results[0])
        .ok_or_else(|| Status::internal("result value was never materialized"))?;
    emitter.push(SpirvInst::BufferStore {
        global: output_global,
        index: Operand::Reg(output_index),
        src: result_reg,
    });
    Ok(())
}

/// Emits a reduction loop for a contraction, optionally staging operand
/// tiles in workgroup-local memory first.
fn emit_contraction(
    emitter: &mut Emitter,
    executable: &ExecutableIr,
    node: &crate::ir::Node,
    binding_globals: &[u32],
    options: &SpirvTargetOptions,
    module: &mut SpirvModule,
) -> StatusResult<u32> {
    let func = &executable.func;
    let lhs_extents = func
        .value_type(node.inputs[0])
        .static_extents()
        .ok_or_else(|| Status::unimplemented("spirv lowering requires static shapes"))?;
    let k = lhs_extents[1];

    let operand_global = |value: ValueId| -> StatusResult<u32> {
        func.parameters
            .iter()
            .position(|&parameter| parameter == value)
            .map(|index| binding_globals[index])
            .ok_or_else(|| {
                Status::unimplemented("contraction operands must come from bindings")
            })
    };
    let mut lhs_global = operand_global(node.inputs[0])?;
    let mut rhs_global = operand_global(node.inputs[1])?;

    if options.stage_matmul_operands {
        let invocations: u32 = options.workgroup_size.iter().product();
        for (side, global) in [(0usize, &mut lhs_global), (1usize, &mut rhs_global)] {
            let extents = func
                .value_type(node.inputs[side])
                .static_extents()
                .ok_or_else(|| {
                    Status::unimplemented("spirv lowering requires static shapes")
                })?;
            let tile_elements = k.min(extents.iter().product());
            let copy = distribute_local_copy(tile_elements, invocations);

            let local_index = module.globals.len() as u32;
            module.globals.push(SpirvGlobal {
                name: format!("local_tile{side}"),
                storage_class: StorageClass::Workgroup,
                pointee: SpirvType::LocalArrayF32 {
                    count: tile_elements,
                },
                built_in: None,
                set: None,
                binding: None,
                aliased: false,
            });

            // All copy loops collapse into one over the invocation id.
            let invocation = emitter.built_in(BuiltIn::LocalInvocationId, 0);
            emitter.push(SpirvInst::LoopBegin {
                induction: invocation,
                extent: Operand::Imm(copy.extent as i64),
                step: if copy.cyclic {
                    Operand::Imm(invocations as i64)
                } else {
                    Operand::Imm(copy.extent as i64)
                },
                cyclic: copy.cyclic,
                guarded: copy.guarded,
            });
            let staged = emitter.load(*global, Operand::Reg(invocation));
            emitter.push(SpirvInst::BufferStore {
                global: local_index,
                index: Operand::Reg(invocation),
                src: staged,
            });
            emitter.push(SpirvInst::LoopEnd);
            *global = local_index;
        }
        emitter.push(SpirvInst::Barrier);
    }

    let acc = emitter.arith(ArithKind::FAdd, Operand::Imm(0), Operand::Imm(0));
    let induction = emitter.reg();
    emitter.push(SpirvInst::LoopBegin {
        induction,
        extent: Operand::Imm(k as i64),
        step: Operand::Imm(1),
        cyclic: false,
        guarded: false,
    });
    let a = emitter.load(lhs_global, Operand::Reg(induction));
    let b = emitter.load(rhs_global, Operand::Reg(induction));
    let fma = emitter.reg();
    emitter.push(SpirvInst::Fma {
        dst: fma,
        a,
        b,
        acc,
    });
    emitter.push(SpirvInst::LoopEnd);
    Ok(fma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::outline::outline_module;
    use crate::ir::{GraphFunc, GraphModule, TensorType};
    use tensile_hal::ElementType;

    fn f32_tensor(extents: &[usize]) -> TensorType {
        TensorType::static_shape(extents, ElementType::F32)
    }

    fn lower_single(
        module: GraphModule,
        options: &SpirvTargetOptions,
    ) -> (ExecutableIr, SpirvModule) {
        let executable = outline_module(&module, false)
            .unwrap()
            .executables
            .remove(0);
        let lowered = lower_executable(&executable, options).unwrap();
        (executable, lowered)
    }

    fn elementwise_module() -> GraphModule {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[16]));
        let b = func.add_parameter("b", f32_tensor(&[16]));
        let sum = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, b])
            .unwrap();
        func.add_result(sum);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        module
    }

    fn matmul_module(m: usize, k: usize, n: usize) -> GraphModule {
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[m, k]));
        let b = func.add_parameter("b", f32_tensor(&[k, n]));
        let product = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        func.add_result(product);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        module
    }

    #[test]
    fn test_push_constant_global_shape() {
        let (executable, lowered) = lower_single(
            elementwise_module(),
            &SpirvTargetOptions::default(),
        );
        let push = lowered.global("push_constants").unwrap();
        assert_eq!(push.storage_class, StorageClass::PushConstant);
        assert_eq!(
            push.pointee,
            SpirvType::IndexArrayStruct {
                count: executable.push_constant_count
            }
        );
        // Load-constants became indexed loads of that global.
        let body = &lowered.funcs[0].body;
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::PushConstantLoad { index: 0, .. })));
    }

    #[test]
    fn test_workgroup_builtins_extracted() {
        let (_executable, lowered) = lower_single(
            matmul_module(8, 8, 8),
            &SpirvTargetOptions::default(),
        );
        let body = &lowered.funcs[0].body;
        assert!(body.iter().any(|inst| matches!(
            inst,
            SpirvInst::BuiltInExtract {
                built_in: BuiltIn::WorkgroupId,
                ..
            }
        )));
        assert!(lowered
            .globals_in(StorageClass::Input)
            .iter()
            .any(|global| global.built_in == Some(BuiltIn::NumWorkgroups)));
    }

    #[test]
    fn test_elementwise_maps_to_global_invocation() {
        // The leaf elementwise fallback: a collapsed single-axis loop,
        // one iteration per global invocation, with a bounds guard and
        // de-linearization at the top of the body.
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[4, 8]));
        let b = func.add_parameter("b", f32_tensor(&[4, 8]));
        let sum = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, b])
            .unwrap();
        func.add_result(sum);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        let (_executable, lowered) = lower_single(module, &SpirvTargetOptions::default());

        let body = &lowered.funcs[0].body;
        assert!(body.iter().any(|inst| matches!(
            inst,
            SpirvInst::BuiltInExtract {
                built_in: BuiltIn::GlobalInvocationId,
                ..
            }
        )));
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::LoopBegin { guarded: true, .. })));
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::Arith { kind: ArithKind::IDiv, .. })));
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::Arith { kind: ArithKind::IMod, .. })));
    }

    #[test]
    fn test_bindings_at_set_and_binding() {
        let (_executable, lowered) = lower_single(
            elementwise_module(),
            &SpirvTargetOptions::default(),
        );
        let buffers = lowered.globals_in(StorageClass::StorageBuffer);
        assert_eq!(buffers.len(), 3);
        for (index, global) in buffers.iter().enumerate() {
            assert_eq!(global.set, Some(0));
            assert_eq!(global.binding, Some(index as u32));
            assert!(!global.aliased);
        }
    }

    #[test]
    fn test_tied_result_aliases_operand_binding() {
        // The second matmul consumes the first's result, which dies
        // there, so its output ties to that operand and the interface
        // variables share (set, binding) with the aliased flag set.
        let mut func = GraphFunc::new("main");
        let a = func.add_parameter("a", f32_tensor(&[4, 4]));
        let b = func.add_parameter("b", f32_tensor(&[4, 4]));
        let first = func.add_node(Operation::Matmul, vec![a, b]).unwrap();
        let second = func.add_node(Operation::Matmul, vec![first, first]).unwrap();
        func.add_result(second);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);

        let compiled = outline_module(&module, false).unwrap();
        let tied_executable = compiled
            .executables
            .into_iter()
            .find(|executable| executable.tied_operands.contains(&Some(0)))
            .expect("second dispatch ties its result");
        let lowered =
            lower_executable(&tied_executable, &SpirvTargetOptions::default()).unwrap();
        let buffers = lowered.globals_in(StorageClass::StorageBuffer);
        let aliased: Vec<_> = buffers.iter().filter(|global| global.aliased).collect();
        assert_eq!(aliased.len(), 2);
        assert_eq!(aliased[0].set, aliased[1].set);
        assert_eq!(aliased[0].binding, aliased[1].binding);
    }

    #[test]
    fn test_matmul_stages_tiles_with_barrier() {
        let options = SpirvTargetOptions::default();
        let (_executable, lowered) = lower_single(matmul_module(16, 32, 16), &options);
        assert_eq!(lowered.globals_in(StorageClass::Workgroup).len(), 2);
        let body = &lowered.funcs[0].body;
        assert!(body.iter().any(|inst| matches!(inst, SpirvInst::Barrier)));
        assert!(body.iter().any(|inst| matches!(inst, SpirvInst::Fma { .. })));
    }

    #[test]
    fn test_coop_matrix_promotion() {
        let options = SpirvTargetOptions {
            cooperative_matrix: true,
            ..SpirvTargetOptions::default()
        };
        let (_executable, lowered) = lower_single(matmul_module(32, 16, 48), &options);
        let body = &lowered.funcs[0].body;
        // Loads, contraction, and stores were all promoted.
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::CoopMatLoad { .. })));
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::CoopMatMulAdd { .. })));
        assert!(body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::CoopMatStore { .. })));
        assert!(!body.iter().any(|inst| matches!(inst, SpirvInst::Fma { .. })));
    }

    #[test]
    fn test_coop_matrix_falls_back_when_incompatible() {
        let options = SpirvTargetOptions {
            cooperative_matrix: true,
            ..SpirvTargetOptions::default()
        };
        // 30 does not divide the 16-wide subgroup tile.
        let (_executable, lowered) = lower_single(matmul_module(30, 16, 48), &options);
        let body = &lowered.funcs[0].body;
        assert!(!body
            .iter()
            .any(|inst| matches!(inst, SpirvInst::CoopMatLoad { .. })));
        assert!(body.iter().any(|inst| matches!(inst, SpirvInst::Fma { .. })));
    }

    #[test]
    fn test_payload_roundtrip() {
        let (_executable, lowered) = lower_single(
            matmul_module(16, 32, 16),
            &SpirvTargetOptions::default(),
        );
        let bytes = lowered.to_bytes().unwrap();
        assert_eq!(SpirvModule::from_bytes(&bytes).unwrap(), lowered);
    }
}
