//! The HAL module: device operations exposed to bytecode.
//!
//! Compiled artifacts import `hal.*` functions to materialize
//! executables, record command buffers, and submit work. The module is
//! bound to one device at creation; per-context state lives in the
//! closures' captured handles.

use std::sync::Arc;

use bytes::Bytes;
use tensile_base::{AnyRef, Ref, Status, StatusResult};
use tensile_vm::{instance, NativeModule, Signature, Value, ValueType, VmBytes, VmList};

use crate::buffer::{Buffer, BufferUsage, MemoryType};
use crate::buffer_view::BufferView;
use crate::command_buffer::{
    BufferBinding, CommandBuffer, CommandBufferMode, CommandCategory,
};
use crate::device::{Device, QueueCategory};
use crate::element_type::ElementType;
use crate::executable::Executable;

/// Module name bytecode imports resolve against.
pub const HAL_MODULE_NAME: &str = "hal";

/// Wire encoding of [`CommandBufferMode`].
pub fn command_buffer_mode_code(mode: CommandBufferMode) -> i32 {
    match mode {
        CommandBufferMode::OneShot => 0,
        CommandBufferMode::Reusable => 1,
    }
}

fn mode_from_code(code: i32) -> StatusResult<CommandBufferMode> {
    match code {
        0 => Ok(CommandBufferMode::OneShot),
        1 => Ok(CommandBufferMode::Reusable),
        other => Err(Status::invalid_argument(format!(
            "unknown command buffer mode {other}"
        ))),
    }
}

fn ref_arg<T: tensile_base::RefObject>(args: &[Value], index: usize) -> StatusResult<Ref<T>> {
    let handle = args[index].as_ref_value()?.downcast::<T>()?;
    if handle.is_null() {
        return Err(Status::invalid_argument(format!(
            "argument {index} is a null ref"
        )));
    }
    Ok(handle)
}

fn utf8_arg(args: &[Value], index: usize) -> StatusResult<String> {
    let bytes = ref_arg::<VmBytes>(args, index)?;
    String::from_utf8(bytes.get()?.data().to_vec())
        .map_err(|_| Status::invalid_argument(format!("argument {index} is not UTF-8")))
}

fn binding_list(args: &[Value], index: usize) -> StatusResult<Vec<BufferBinding>> {
    let list = ref_arg::<VmList>(args, index)?;
    let items = list.get()?.to_vec();
    let mut bindings = Vec::with_capacity(items.len());
    for item in items {
        let buffer = item.as_ref_value()?.downcast::<Buffer>()?;
        bindings.push(BufferBinding::whole(buffer)?);
    }
    Ok(bindings)
}

fn i32_list(args: &[Value], index: usize) -> StatusResult<Vec<u32>> {
    let list = ref_arg::<VmList>(args, index)?;
    list.get()?
        .to_vec()
        .iter()
        .map(|value| Ok(value.as_i32()? as u32))
        .collect()
}

/// Builds the HAL module bound to `device`.
pub fn create_hal_module(device: Arc<dyn Device>) -> Arc<NativeModule> {
    instance::register_type("hal.buffer");
    instance::register_type("hal.buffer_view");
    instance::register_type("hal.command_buffer");
    instance::register_type("hal.executable");
    instance::register_type("hal.semaphore");

    let cache = device.create_executable_cache();
    let builder = NativeModule::builder(HAL_MODULE_NAME);

    let allocate_device = Arc::clone(&device);
    let match_device = Arc::clone(&device);
    let submit_device = Arc::clone(&device);
    let create_cb_device = Arc::clone(&device);
    let executable_device = Arc::clone(&device);

    let module = builder
        .export(
            "buffer.allocate",
            Signature::new(
                vec![ValueType::I64, ValueType::I32, ValueType::I32],
                vec![ValueType::Ref],
            ),
            move |args| {
                let size = args[0].as_i64()?;
                if size < 0 {
                    return Err(Status::invalid_argument("buffer size is negative"));
                }
                let usage = BufferUsage::from_bits(args[1].as_i32()? as u32)
                    .ok_or_else(|| Status::invalid_argument("unknown buffer usage bits"))?;
                let memory_type = MemoryType::from_bits(args[2].as_i32()? as u32)
                    .ok_or_else(|| Status::invalid_argument("unknown memory type bits"))?;
                let buffer =
                    allocate_device.create_buffer(size as usize, usage, memory_type)?;
                Ok(vec![Value::Ref(buffer.into())])
            },
        )
        .export(
            "buffer.write",
            Signature::new(
                vec![ValueType::Ref, ValueType::I64, ValueType::Ref],
                vec![],
            ),
            |args| {
                let buffer = ref_arg::<Buffer>(args, 0)?;
                let offset = args[1].as_i64()? as usize;
                let data = ref_arg::<VmBytes>(args, 2)?;
                buffer.get()?.write_bytes(offset, data.get()?.data())?;
                Ok(vec![])
            },
        )
        .export(
            "buffer.read",
            Signature::new(
                vec![ValueType::Ref, ValueType::I64, ValueType::I64],
                vec![ValueType::Ref],
            ),
            |args| {
                let buffer = ref_arg::<Buffer>(args, 0)?;
                let offset = args[1].as_i64()? as usize;
                let length = args[2].as_i64()? as usize;
                let data = buffer.get()?.read_bytes(offset, length)?;
                Ok(vec![Value::Ref(
                    Ref::new(VmBytes::new(Bytes::from(data))).into(),
                )])
            },
        )
        .export(
            "buffer.subspan",
            Signature::new(
                vec![ValueType::Ref, ValueType::I64, ValueType::I64],
                vec![ValueType::Ref],
            ),
            |args| {
                let buffer = ref_arg::<Buffer>(args, 0)?;
                let offset = args[1].as_i64()? as usize;
                let length = args[2].as_i64()? as usize;
                let sub = buffer.get()?.subspan(offset, length)?;
                Ok(vec![Value::Ref(sub.into())])
            },
        )
        .export(
            "buffer_view.create",
            Signature::new(
                vec![ValueType::Ref, ValueType::Ref, ValueType::I32],
                vec![ValueType::Ref],
            ),
            |args| {
                let buffer = ref_arg::<Buffer>(args, 0)?;
                let dims = ref_arg::<VmList>(args, 1)?;
                let shape: Vec<usize> = dims
                    .get()?
                    .to_vec()
                    .iter()
                    .map(|value| Ok(value.as_i64()? as usize))
                    .collect::<StatusResult<_>>()?;
                let element_type = ElementType::from_code(args[2].as_i32()? as u32)
                    .ok_or_else(|| Status::invalid_argument("unknown element type code"))?;
                let view = BufferView::create(buffer, shape, element_type)?;
                Ok(vec![Value::Ref(view.into())])
            },
        )
        .export(
            "buffer_view.buffer",
            Signature::new(vec![ValueType::Ref], vec![ValueType::Ref]),
            |args| {
                let view = ref_arg::<BufferView>(args, 0)?;
                let buffer = view.get()?.buffer().retain();
                Ok(vec![Value::Ref(buffer.into())])
            },
        )
        .export(
            "command_buffer.create",
            Signature::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::Ref]),
            move |args| {
                let mode = mode_from_code(args[0].as_i32()?)?;
                let categories = CommandCategory::from_bits(args[1].as_i32()? as u32)
                    .ok_or_else(|| Status::invalid_argument("unknown category bits"))?;
                let command_buffer =
                    create_cb_device.create_command_buffer(mode, categories)?;
                Ok(vec![Value::Ref(command_buffer.into())])
            },
        )
        .export(
            "command_buffer.barrier",
            Signature::new(vec![ValueType::Ref], vec![]),
            |args| {
                ref_arg::<CommandBuffer>(args, 0)?.get()?.execution_barrier()?;
                Ok(vec![])
            },
        )
        .export(
            "command_buffer.copy",
            Signature::new(vec![ValueType::Ref, ValueType::Ref, ValueType::Ref], vec![]),
            |args| {
                let command_buffer = ref_arg::<CommandBuffer>(args, 0)?;
                let source = BufferBinding::whole(ref_arg::<Buffer>(args, 1)?)?;
                let target = BufferBinding::whole(ref_arg::<Buffer>(args, 2)?)?;
                command_buffer.get()?.copy_buffer(source, target)?;
                Ok(vec![])
            },
        )
        .export(
            "command_buffer.dispatch",
            Signature::new(
                vec![
                    ValueType::Ref,
                    ValueType::Ref,
                    ValueType::I32,
                    ValueType::I32,
                    ValueType::I32,
                    ValueType::I32,
                    ValueType::Ref,
                    ValueType::Ref,
                ],
                vec![],
            ),
            |args| {
                let command_buffer = ref_arg::<CommandBuffer>(args, 0)?;
                let executable = ref_arg::<Executable>(args, 1)?;
                let entry = args[2].as_i32()? as usize;
                let workgroups = [
                    args[3].as_i32()? as u32,
                    args[4].as_i32()? as u32,
                    args[5].as_i32()? as u32,
                ];
                let bindings = binding_list(args, 6)?;
                let push_constants = i32_list(args, 7)?;
                command_buffer.get()?.dispatch(
                    executable,
                    entry,
                    workgroups,
                    bindings,
                    push_constants,
                )?;
                Ok(vec![])
            },
        )
        .export(
            "command_buffer.finalize",
            Signature::new(vec![ValueType::Ref], vec![]),
            |args| {
                ref_arg::<CommandBuffer>(args, 0)?.get()?.finalize()?;
                Ok(vec![])
            },
        )
        .export(
            "submit_and_wait",
            Signature::new(vec![ValueType::Ref], vec![]),
            move |args| {
                let command_buffer = ref_arg::<CommandBuffer>(args, 0)?;
                submit_device.queue_submit(
                    QueueCategory::Dispatch,
                    &[command_buffer],
                    &[],
                    &[],
                )?;
                submit_device.wait_idle(None)?;
                Ok(vec![])
            },
        )
        .export(
            "executable.create",
            Signature::new(vec![ValueType::Ref, ValueType::Ref], vec![ValueType::Ref]),
            move |args| {
                let format = utf8_arg(args, 0)?;
                let payload = ref_arg::<VmBytes>(args, 1)?;
                let executable = cache.prepare_executable(
                    executable_device.as_ref(),
                    &format,
                    payload.get()?.data(),
                )?;
                Ok(vec![Value::Ref(executable.into())])
            },
        )
        .export(
            "device.match",
            Signature::new(vec![ValueType::Ref], vec![ValueType::I32]),
            move |args| {
                let pattern = utf8_arg(args, 0)?;
                Ok(vec![Value::I32(i32::from(
                    match_device.matches_filter(&pattern),
                ))])
            },
        )
        .export(
            "executable.null",
            Signature::new(vec![], vec![ValueType::Ref]),
            |_args| Ok(vec![Value::Ref(AnyRef::null())]),
        )
        .build();
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalDevice;
    use std::sync::Arc;
    use tensile_vm::{invoke, Instance, InvocationPolicy, Module};

    fn hal_context() -> (Arc<tensile_vm::Context>, Arc<tensile_vm::Instance>) {
        let instance = Instance::new();
        let device = LocalDevice::new() as Arc<dyn Device>;
        let module = create_hal_module(device);
        let context = instance
            .create_context_with_modules(&[module as Arc<dyn Module>])
            .unwrap();
        (context, instance)
    }

    fn bits(usage: BufferUsage) -> i32 {
        usage.bits() as i32
    }

    #[test]
    fn test_buffer_allocate_write_read() {
        let (context, _instance) = hal_context();
        let policy = InvocationPolicy::default();
        let buffer = invoke(
            &context,
            "hal.buffer.allocate",
            &policy,
            vec![
                Value::I64(8),
                Value::I32(bits(BufferUsage::TRANSFER | BufferUsage::MAPPING)),
                Value::I32(MemoryType::HOST_VISIBLE.bits() as i32),
            ],
        )
        .unwrap();

        let data = Ref::new(VmBytes::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        invoke(
            &context,
            "hal.buffer.write",
            &policy,
            vec![
                buffer[0].clone(),
                Value::I64(0),
                Value::Ref(data.into()),
            ],
        )
        .unwrap();

        let read = invoke(
            &context,
            "hal.buffer.read",
            &policy,
            vec![buffer[0].clone(), Value::I64(2), Value::I64(4)],
        )
        .unwrap();
        let bytes = read[0].as_ref_value().unwrap().downcast::<VmBytes>().unwrap();
        assert_eq!(bytes.get().unwrap().data(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_device_match() {
        let (context, _instance) = hal_context();
        let policy = InvocationPolicy::default();
        let pattern = |text: &str| {
            Value::Ref(Ref::new(VmBytes::from_vec(text.as_bytes().to_vec())).into())
        };
        let hit = invoke(&context, "hal.device.match", &policy, vec![pattern("host-*")])
            .unwrap();
        assert_eq!(hit[0].as_i32().unwrap(), 1);
        let miss = invoke(
            &context,
            "hal.device.match",
            &policy,
            vec![pattern("vulkan-spirv-fb")],
        )
        .unwrap();
        assert_eq!(miss[0].as_i32().unwrap(), 0);
    }

    #[test]
    fn test_null_ref_argument_rejected() {
        let (context, _instance) = hal_context();
        let err = invoke(
            &context,
            "hal.buffer.write",
            &InvocationPolicy::default(),
            vec![
                Value::Ref(AnyRef::null()),
                Value::I64(0),
                Value::Ref(Ref::new(VmBytes::from_vec(vec![0])).into()),
            ],
        )
        .unwrap_err();
        assert!(err.is(tensile_base::StatusKind::InvalidArgument));
    }
}
