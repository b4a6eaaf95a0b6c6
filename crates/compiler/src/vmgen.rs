//! VM bytecode emission.
//!
//! The compiled module becomes a loadable bytecode module: `__init`
//! materializes the cached executable globals behind device-match
//! switches (the runtime counterpart of the resource-cache plan) and
//! initializes module-variable buffers; each entry function records a
//! command buffer, binds buffers, pushes the workload constants,
//! dispatches with the computed workgroup counts, and submits.

use std::sync::Arc;

use hashbrown::HashMap;
use tensile_base::{Status, StatusResult};
use tensile_hal::{BufferUsage, CommandCategory, MemoryType};
use tensile_vm::bytecode::{
    BytecodeModule, FunctionBuilder, GlobalId, ImportId, ModuleBuilder, RodataId,
};
use tensile_vm::{Signature, ValueType};

use crate::dispatch::outline::{CompiledFunc, CompiledModule};
use crate::dispatch::resource_cache::{GlobalKind, ResourceCachePlan};
use crate::ir::ValueId;

/// MIME type of executable payload rodata.
pub const EXECUTABLE_MIME_TYPE: &str = "application/x-tensile-executable";

/// Options for bytecode emission.
#[derive(Debug, Clone, Default)]
pub struct VmGenOptions {
    pub emit_benchmark_funcs: bool,
    pub dispatch_trace: bool,
}

struct HalImports {
    buffer_allocate: ImportId,
    buffer_write: ImportId,
    command_buffer_create: ImportId,
    command_buffer_barrier: ImportId,
    command_buffer_dispatch: ImportId,
    command_buffer_finalize: ImportId,
    submit_and_wait: ImportId,
    executable_create: ImportId,
    executable_null: ImportId,
    device_match: ImportId,
}

fn declare_hal_imports(builder: &mut ModuleBuilder) -> HalImports {
    use ValueType::{I32, I64, Ref};
    HalImports {
        buffer_allocate: builder.import(
            "hal.buffer.allocate",
            Signature::new(vec![I64, I32, I32], vec![Ref]),
        ),
        buffer_write: builder.import(
            "hal.buffer.write",
            Signature::new(vec![Ref, I64, Ref], vec![]),
        ),
        command_buffer_create: builder.import(
            "hal.command_buffer.create",
            Signature::new(vec![I32, I32], vec![Ref]),
        ),
        command_buffer_barrier: builder.import(
            "hal.command_buffer.barrier",
            Signature::new(vec![Ref], vec![]),
        ),
        command_buffer_dispatch: builder.import(
            "hal.command_buffer.dispatch",
            Signature::new(vec![Ref, Ref, I32, I32, I32, I32, Ref, Ref], vec![]),
        ),
        command_buffer_finalize: builder.import(
            "hal.command_buffer.finalize",
            Signature::new(vec![Ref], vec![]),
        ),
        submit_and_wait: builder.import(
            "hal.submit_and_wait",
            Signature::new(vec![Ref], vec![]),
        ),
        executable_create: builder.import(
            "hal.executable.create",
            Signature::new(vec![Ref, Ref], vec![Ref]),
        ),
        executable_null: builder.import(
            "hal.executable.null",
            Signature::new(vec![], vec![Ref]),
        ),
        device_match: builder.import(
            "hal.device.match",
            Signature::new(vec![Ref], vec![I32]),
        ),
    }
}

/// One per-target serialized payload for one executable symbol.
pub type PayloadTable = HashMap<(String, String), Vec<u8>>;

/// Emits the bytecode module for a compiled module.
pub fn generate_vm_module(
    compiled: &CompiledModule,
    plan: &ResourceCachePlan,
    payloads: &PayloadTable,
    options: &VmGenOptions,
) -> StatusResult<Arc<BytecodeModule>> {
    let mut builder = ModuleBuilder::new(compiled.name.clone());
    let imports = declare_hal_imports(&mut builder);

    // Cached executable globals, in plan (dependency) order.
    let mut executable_globals: HashMap<String, GlobalId> = HashMap::new();
    let mut pattern_rodata: HashMap<String, RodataId> = HashMap::new();
    let mut payload_rodata: HashMap<(String, String), RodataId> = HashMap::new();

    for global in &plan.globals {
        let GlobalKind::Executable { source, arms, .. } = &global.kind else {
            // Layout singletons are materialized inside the loaded
            // executables; only executable globals appear in bytecode.
            continue;
        };
        let global_id = builder.global(global.name.clone(), ValueType::Ref);
        executable_globals.insert(global.name.clone(), global_id);
        for arm in arms {
            pattern_rodata
                .entry(arm.filter_pattern.clone())
                .or_insert_with(|| {
                    builder.rodata(arm.filter_pattern.clone().into_bytes(), 1, None)
                });
            pattern_rodata
                .entry(arm.format.clone())
                .or_insert_with(|| builder.rodata(arm.format.clone().into_bytes(), 1, None));
            let key = (source.clone(), arm.format.clone());
            if let Some(payload) = payloads.get(&key) {
                payload_rodata.entry(key.clone()).or_insert_with(|| {
                    builder.rodata(
                        payload.clone(),
                        16,
                        Some(format!("{EXECUTABLE_MIME_TYPE};format={}", arm.format)),
                    )
                });
                builder.target_payload(
                    arm.filter_pattern.clone(),
                    arm.format.clone(),
                    payload.clone(),
                );
            }
        }
    }

    // Module variables: buffers initialized from rodata at __init.
    let mut variable_globals: HashMap<ValueId, GlobalId> = HashMap::new();
    let mut variable_rodata: HashMap<ValueId, RodataId> = HashMap::new();
    for variable in &compiled.variables {
        let global_id = builder.global(variable.name.clone(), ValueType::Ref);
        let rodata_id = builder.rodata(variable.data.clone(), 16, None);
        variable_globals.insert(variable.value, global_id);
        variable_rodata.insert(variable.value, rodata_id);
    }

    emit_init(
        &mut builder,
        &imports,
        plan,
        compiled,
        &executable_globals,
        &pattern_rodata,
        &payload_rodata,
        &variable_globals,
        &variable_rodata,
    )?;

    for func in &compiled.funcs {
        let entry = emit_entry_func(
            func,
            &func.name,
            &imports,
            plan,
            &executable_globals,
            &variable_globals,
            options,
            false,
        )?;
        builder.export_function(entry);
        if options.emit_benchmark_funcs {
            let benchmark = emit_entry_func(
                func,
                &format!("{}_benchmark", func.name),
                &imports,
                plan,
                &executable_globals,
                &variable_globals,
                options,
                true,
            )?;
            builder.export_function(benchmark);
        }
    }

    builder.build()
}

#[allow(clippy::too_many_arguments)]
fn emit_init(
    builder: &mut ModuleBuilder,
    imports: &HalImports,
    plan: &ResourceCachePlan,
    compiled: &CompiledModule,
    executable_globals: &HashMap<String, GlobalId>,
    pattern_rodata: &HashMap<String, RodataId>,
    payload_rodata: &HashMap<(String, String), RodataId>,
    variable_globals: &HashMap<ValueId, GlobalId>,
    variable_rodata: &HashMap<ValueId, RodataId>,
) -> StatusResult<()> {
    let mut init = FunctionBuilder::new("__init", Signature::new(vec![], vec![]));

    for global in &plan.globals {
        let GlobalKind::Executable { source, arms, .. } = &global.kind else {
            continue;
        };
        let global_id = executable_globals[&global.name];
        let end = init.create_label();
        // One arm per candidate backend, first match wins; the default
        // arm stores a null executable.
        for arm in arms {
            let key = (source.clone(), arm.format.clone());
            let Some(&payload) = payload_rodata.get(&key) else {
                continue;
            };
            let pattern = init.const_rodata(pattern_rodata[&arm.filter_pattern]);
            let matched = init.call_import(imports.device_match, &[pattern], 1)[0];
            let hit = init.create_label();
            let miss = init.create_label();
            init.cond_branch(matched, hit, miss);
            init.bind_label(hit);
            let format = init.const_rodata(pattern_rodata[&arm.format]);
            let blob = init.const_rodata(payload);
            let executable = init.call_import(imports.executable_create, &[format, blob], 1);
            init.global_store(global_id, executable[0]);
            init.branch(end);
            init.bind_label(miss);
        }
        let null_executable = init.call_import(imports.executable_null, &[], 1);
        init.global_store(global_id, null_executable[0]);
        init.bind_label(end);
    }

    for variable in &compiled.variables {
        let size = variable.ty.byte_size().ok_or_else(|| {
            Status::unimplemented("module variables require static types")
        })?;
        let size_reg = init.const_i64(size as i64);
        let usage = init.const_i32(
            (BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING).bits()
                as i32,
        );
        let memory = init.const_i32(
            (MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT).bits() as i32,
        );
        let buffer = init.call_import(
            imports.buffer_allocate,
            &[size_reg, usage, memory],
            1,
        )[0];
        let zero = init.const_i64(0);
        let data = init.const_rodata(variable_rodata[&variable.value]);
        init.call_import(imports.buffer_write, &[buffer, zero, data], 0);
        init.global_store(variable_globals[&variable.value], buffer);
    }

    init.ret(&[]);
    builder.export_function(init);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_entry_func(
    func: &CompiledFunc,
    export_name: &str,
    imports: &HalImports,
    plan: &ResourceCachePlan,
    executable_globals: &HashMap<String, GlobalId>,
    variable_globals: &HashMap<ValueId, GlobalId>,
    options: &VmGenOptions,
    synthesize_inputs: bool,
) -> StatusResult<FunctionBuilder> {
    let source = &func.source;
    let signature = if synthesize_inputs {
        Signature::new(vec![], vec![ValueType::Ref; source.results.len()])
    } else {
        Signature::new(
            vec![ValueType::Ref; source.parameters.len()],
            vec![ValueType::Ref; source.results.len()],
        )
    };
    let mut f = FunctionBuilder::new(export_name, signature);
    let mut value_regs: HashMap<ValueId, u16> = HashMap::new();

    let allocate_buffer =
        |f: &mut FunctionBuilder, size: usize| -> u16 {
            let size_reg = f.const_i64(size as i64);
            let usage = f.const_i32(
                (BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING).bits()
                    as i32,
            );
            let memory = f.const_i32(
                (MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT).bits() as i32,
            );
            f.call_import(imports.buffer_allocate, &[size_reg, usage, memory], 1)[0]
        };

    for (index, &parameter) in source.parameters.iter().enumerate() {
        let reg = if synthesize_inputs {
            // Benchmark entries run over freshly allocated inputs.
            let size = source.value_type(parameter).byte_size().ok_or_else(|| {
                Status::unimplemented("benchmark inputs require static types")
            })?;
            allocate_buffer(&mut f, size)
        } else {
            f.arg(index)
        };
        value_regs.insert(parameter, reg);
    }
    let mut variables: Vec<(ValueId, GlobalId)> = variable_globals
        .iter()
        .map(|(&value, &global)| (value, global))
        .collect();
    variables.sort_by_key(|(value, _)| value.0);
    for (value, global) in variables {
        let reg = f.global_load(global);
        value_regs.insert(value, reg);
    }

    let mode = f.const_i32(0);
    let categories = f.const_i32(
        (CommandCategory::TRANSFER | CommandCategory::DISPATCH).bits() as i32,
    );
    let command_buffer =
        f.call_import(imports.command_buffer_create, &[mode, categories], 1)[0];

    for (index, dispatch) in func.dispatches.iter().enumerate() {
        if options.dispatch_trace {
            tracing::info!(
                func = func.name,
                dispatch = dispatch.entry_name,
                workgroups = ?dispatch.workgroup_count,
                operands = dispatch.operands.len(),
                "dispatch trace"
            );
        }

        // Result buffers, honoring tied operands for in-place reuse.
        let mut result_regs = Vec::with_capacity(dispatch.results.len());
        for (result_index, &result) in dispatch.results.iter().enumerate() {
            let tied = dispatch
                .tied_operands
                .get(result_index)
                .copied()
                .flatten();
            let reg = match tied {
                Some(operand_index) => {
                    let operand = dispatch.operands[operand_index];
                    *value_regs.get(&operand).ok_or_else(|| {
                        Status::internal("tied operand has no materialized buffer")
                    })?
                }
                None => {
                    let size = source.value_type(result).byte_size().ok_or_else(|| {
                        Status::unimplemented("dispatch results require static types")
                    })?;
                    allocate_buffer(&mut f, size)
                }
            };
            value_regs.insert(result, reg);
            result_regs.push(reg);
        }

        let bindings = f.list_alloc(
            (dispatch.operands.len() + dispatch.results.len()) as u16,
        );
        for &operand in &dispatch.operands {
            let reg = *value_regs.get(&operand).ok_or_else(|| {
                Status::internal(format!(
                    "dispatch operand {operand:?} has no materialized buffer"
                ))
            })?;
            f.list_push(bindings, reg);
        }
        for &reg in &result_regs {
            f.list_push(bindings, reg);
        }

        // Workload extents ride along as push constants.
        let push_constants = f.list_alloc(dispatch.workload.len() as u16);
        for extent in &dispatch.workload {
            let value = extent.as_static().ok_or_else(|| {
                Status::unimplemented("dynamic workload extents are not dispatchable")
            })?;
            let reg = f.const_i32(value as i32);
            f.list_push(push_constants, reg);
        }

        let global_name = plan.lookup_rewrites.get(&dispatch.executable).ok_or_else(|| {
            Status::internal(format!(
                "no cached global for executable '{}'",
                dispatch.executable
            ))
        })?;
        let executable = f.global_load(executable_globals[global_name]);
        let entry = f.const_i32(0);
        let wx = f.const_i32(dispatch.workgroup_count[0] as i32);
        let wy = f.const_i32(dispatch.workgroup_count[1] as i32);
        let wz = f.const_i32(dispatch.workgroup_count[2] as i32);
        f.call_import(
            imports.command_buffer_dispatch,
            &[command_buffer, executable, entry, wx, wy, wz, bindings, push_constants],
            0,
        );
        if index + 1 < func.dispatches.len() {
            f.call_import(imports.command_buffer_barrier, &[command_buffer], 0);
        }
    }

    f.call_import(imports.command_buffer_finalize, &[command_buffer], 0);
    f.call_import(imports.submit_and_wait, &[command_buffer], 0);

    let result_regs: Vec<u16> = source
        .results
        .iter()
        .map(|result| {
            value_regs.get(result).copied().ok_or_else(|| {
                Status::internal("function result has no materialized buffer")
            })
        })
        .collect::<StatusResult<_>>()?;
    f.ret(&result_regs);
    Ok(f)
}
