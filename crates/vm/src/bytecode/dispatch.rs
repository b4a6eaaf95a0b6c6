//! The interpreter dispatch loop.
//!
//! Each `begin_call` into a bytecode function pushes one frame, drives
//! the function's instructions with the frame's registers, and pops the
//! frame on the way out. Nested calls recurse through the callee
//! module's `begin_call`, so the frame stack mirrors the Rust call
//! stack. On error, the failing frame's backtrace line is attached to
//! the status before the frame is left; as the error propagates, each
//! caller appends its own line, yielding an innermost-first backtrace.

use bytes::Bytes;
use tensile_base::{Ref, Status, StatusResult};

use crate::bytecode::module::{BytecodeFunction, BytecodeModule, BytecodeState};
use crate::bytecode::opcode::Instruction;
use crate::function::ResolvedFunction;
use crate::list::VmList;
use crate::module::CallRecord;
use crate::stack::{FrameType, Stack};
use crate::value::{Value, VmBytes};

/// Runs one bytecode function to completion.
pub(crate) fn execute(
    module: &BytecodeModule,
    stack: &mut Stack,
    function: &BytecodeFunction,
    call: CallRecord,
) -> StatusResult<Vec<Value>> {
    let decl = &function.decl;
    decl.signature.check_arguments(&decl.name, &call.arguments)?;
    if call.arguments.len() > function.register_count as usize {
        return Err(Status::internal(format!(
            "function '{}' declares {} registers but receives {} arguments",
            decl.name,
            function.register_count,
            call.arguments.len()
        )));
    }

    let arguments = call.arguments;
    let self_function = call.function;
    stack.function_enter(
        self_function.clone(),
        FrameType::Bytecode,
        function.register_count as usize,
        None,
    )?;
    {
        let frame = stack.top_mut().expect("frame just entered");
        for (register, value) in frame.registers.iter_mut().zip(arguments) {
            *register = value;
        }
    }

    match run(module, stack, function, &self_function) {
        Ok(results) => {
            stack.function_leave()?;
            decl.signature.check_results(&decl.name, &results)?;
            Ok(results)
        }
        Err(status) => {
            let status = stack.annotate_failure(status);
            stack.function_leave()?;
            Err(status)
        }
    }
}

fn read_register(stack: &Stack, index: u16) -> StatusResult<Value> {
    let frame = stack
        .top()
        .ok_or_else(|| Status::internal("no live frame"))?;
    frame.registers.get(index as usize).cloned().ok_or_else(|| {
        Status::out_of_range(format!("register {index} out of range"))
    })
}

fn write_register(stack: &mut Stack, index: u16, value: Value) -> StatusResult<()> {
    let frame = stack
        .top_mut()
        .ok_or_else(|| Status::internal("no live frame"))?;
    let slot = frame
        .registers
        .get_mut(index as usize)
        .ok_or_else(|| Status::out_of_range(format!("register {index} out of range")))?;
    *slot = value;
    Ok(())
}

/// Reads a resolved import or a global out of the frame's module state.
fn with_state<R>(
    stack: &Stack,
    read: impl FnOnce(&mut BytecodeState) -> StatusResult<R>,
) -> StatusResult<R> {
    let frame = stack
        .top()
        .ok_or_else(|| Status::internal("no live frame"))?;
    let state = frame
        .state
        .upgrade()
        .ok_or_else(|| Status::failed_precondition("module state released"))?;
    let mut guard = state.lock().expect("module state poisoned");
    let state = guard
        .as_any_mut()
        .downcast_mut::<BytecodeState>()
        .ok_or_else(|| Status::internal("module state type confusion"))?;
    read(state)
}

fn branch_target(function: &BytecodeFunction, target: u32) -> StatusResult<usize> {
    let target = target as usize;
    if target >= function.code.len() {
        return Err(Status::out_of_range(format!(
            "branch target {target} out of range for {} instructions",
            function.code.len()
        )));
    }
    Ok(target)
}

fn run(
    module: &BytecodeModule,
    stack: &mut Stack,
    function: &BytecodeFunction,
    self_function: &ResolvedFunction,
) -> StatusResult<Vec<Value>> {
    let mut pc = 0usize;
    loop {
        let instruction = function
            .code
            .get(pc)
            .ok_or_else(|| {
                Status::internal(format!(
                    "function '{}' fell off the end of its body at pc {pc}",
                    function.decl.name
                ))
            })?
            .clone();
        if let Some(frame) = stack.top_mut() {
            frame.pc = pc;
        }

        let mut next_pc = pc + 1;
        match instruction {
            Instruction::ConstI32 { dst, value } => {
                write_register(stack, dst, Value::I32(value))?;
            }
            Instruction::ConstI64 { dst, value } => {
                write_register(stack, dst, Value::I64(value))?;
            }
            Instruction::ConstF32 { dst, value } => {
                write_register(stack, dst, Value::F32(value))?;
            }
            Instruction::ConstF64 { dst, value } => {
                write_register(stack, dst, Value::F64(value))?;
            }
            Instruction::ConstRodata { dst, rodata } => {
                let entry = module.rodata.get(rodata as usize).ok_or_else(|| {
                    Status::out_of_range(format!("rodata index {rodata} out of range"))
                })?;
                let blob = Ref::new(VmBytes::new(Bytes::clone(&entry.data)));
                write_register(stack, dst, Value::Ref(blob.into()))?;
            }
            Instruction::Move { dst, src } => {
                let value = read_register(stack, src)?;
                write_register(stack, dst, value)?;
            }
            Instruction::AddI32 { dst, lhs, rhs } => {
                let result = read_register(stack, lhs)?
                    .as_i32()?
                    .wrapping_add(read_register(stack, rhs)?.as_i32()?);
                write_register(stack, dst, Value::I32(result))?;
            }
            Instruction::SubI32 { dst, lhs, rhs } => {
                let result = read_register(stack, lhs)?
                    .as_i32()?
                    .wrapping_sub(read_register(stack, rhs)?.as_i32()?);
                write_register(stack, dst, Value::I32(result))?;
            }
            Instruction::MulI32 { dst, lhs, rhs } => {
                let result = read_register(stack, lhs)?
                    .as_i32()?
                    .wrapping_mul(read_register(stack, rhs)?.as_i32()?);
                write_register(stack, dst, Value::I32(result))?;
            }
            Instruction::CmpEqI32 { dst, lhs, rhs } => {
                let equal =
                    read_register(stack, lhs)?.as_i32()? == read_register(stack, rhs)?.as_i32()?;
                write_register(stack, dst, Value::I32(i32::from(equal)))?;
            }
            Instruction::Branch { target } => {
                next_pc = branch_target(function, target)?;
            }
            Instruction::CondBranch {
                cond,
                true_target,
                false_target,
            } => {
                let taken = read_register(stack, cond)?.as_i32()? != 0;
                let target = if taken { true_target } else { false_target };
                next_pc = branch_target(function, target)?;
            }
            Instruction::GlobalLoad { dst, global } => {
                let value = with_state(stack, |state| {
                    state.globals.get(global as usize).cloned().ok_or_else(|| {
                        Status::out_of_range(format!("global {global} out of range"))
                    })
                })?;
                write_register(stack, dst, value)?;
            }
            Instruction::GlobalStore { global, src } => {
                let decl = module.globals.get(global as usize).ok_or_else(|| {
                    Status::out_of_range(format!("global {global} out of range"))
                })?;
                let value = read_register(stack, src)?;
                if value.value_type() != decl.ty {
                    return Err(Status::invalid_argument(format!(
                        "global '{}' holds {}, got {}",
                        decl.name,
                        decl.ty,
                        value.value_type()
                    )));
                }
                with_state(stack, |state| {
                    state.globals[global as usize] = value;
                    Ok(())
                })?;
            }
            Instruction::ListAlloc { dst, capacity } => {
                let list = Ref::new(VmList::with_capacity(capacity as usize));
                write_register(stack, dst, Value::Ref(list.into()))?;
            }
            Instruction::ListPush { list, value } => {
                let value = read_register(stack, value)?;
                let list_value = read_register(stack, list)?;
                let list_ref = list_value.as_ref_value()?.downcast::<VmList>()?;
                list_ref.get()?.push(value);
            }
            Instruction::CallImport {
                import,
                args,
                results,
            } => {
                let target = with_state(stack, |state| {
                    state
                        .imports
                        .get(import as usize)
                        .ok_or_else(|| {
                            Status::out_of_range(format!("import {import} out of range"))
                        })?
                        .clone()
                        .ok_or_else(|| {
                            Status::failed_precondition(format!(
                                "import {import} was never resolved"
                            ))
                        })
                })?;
                call_nested(stack, target, &args, &results)?;
            }
            Instruction::CallInternal {
                ordinal,
                args,
                results,
            } => {
                let callee = module.function_for(
                    crate::function::Linkage::Internal,
                    ordinal as usize,
                )?;
                let target = ResolvedFunction {
                    module: std::sync::Arc::clone(&self_function.module),
                    decl: std::sync::Arc::clone(&callee.decl),
                };
                call_nested(stack, target, &args, &results)?;
            }
            Instruction::Return { values } => {
                let mut results = Vec::with_capacity(values.len());
                for index in values {
                    results.push(read_register(stack, index)?);
                }
                return Ok(results);
            }
            Instruction::Fail { kind, message } => {
                let mut status = Status::with_message(kind, message);
                if let Some(location) = function.debug.resolve(pc) {
                    status = status.at(location);
                }
                return Err(status);
            }
        }
        pc = next_pc;
    }
}

fn call_nested(
    stack: &mut Stack,
    target: ResolvedFunction,
    args: &[u16],
    results: &[u16],
) -> StatusResult<()> {
    let mut arguments = Vec::with_capacity(args.len());
    for &index in args {
        arguments.push(read_register(stack, index)?);
    }
    let produced = target.module.clone().begin_call(
        stack,
        CallRecord {
            function: target,
            arguments,
        },
    )?;
    if produced.len() != results.len() {
        return Err(Status::internal(format!(
            "call produced {} results, call site expects {}",
            produced.len(),
            results.len()
        )));
    }
    for (&index, value) in results.iter().zip(produced) {
        write_register(stack, index, value)?;
    }
    Ok(())
}
