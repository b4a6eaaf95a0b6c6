//! The in-process CPU device.
//!
//! Submissions execute synchronously in record order on the calling
//! thread, which makes this device both the reference implementation of
//! the command-buffer contract and the execution vehicle for the
//! compiler's host-target kernels.

use std::sync::Arc;
use std::time::Duration;

use tensile_base::{Ref, Status, StatusResult};

use crate::buffer::{Buffer, BufferUsage, MemoryType};
use crate::command_buffer::{
    Command, CommandBuffer, CommandBufferMode, CommandCategory,
};
use crate::device::{Device, DeviceCapabilities, QueueCategory};
use crate::event::Event;
use crate::executable::DispatchContext;
use crate::executable_cache::ExecutableCache;
use crate::semaphore::Semaphore;

/// Device id of the local CPU device.
pub const LOCAL_DEVICE_ID: &str = "host-loop";

/// An in-process device executing command buffers on the CPU.
pub struct LocalDevice {
    capabilities: DeviceCapabilities,
    cache: Arc<ExecutableCache>,
}

impl LocalDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capabilities: DeviceCapabilities {
                push_descriptors: true,
                max_update_chunk: 64 * 1024,
                max_workgroup_invocations: 1024,
                subgroup_size: 8,
                cooperative_matrix: false,
            },
            cache: Arc::new(ExecutableCache::new(LOCAL_DEVICE_ID)),
        })
    }

    fn execute(&self, command_buffer: &CommandBuffer) -> StatusResult<()> {
        command_buffer.for_each_command(|command| match command {
            Command::ExecutionBarrier => {
                // In-order execution: the barrier is already satisfied.
                Ok(())
            }
            Command::SignalEvent(event) => {
                event.get()?.signal();
                Ok(())
            }
            Command::ResetEvent(event) => {
                event.get()?.reset();
                Ok(())
            }
            Command::WaitEvent(event) => {
                // In-order execution: the event must already be
                // signaled, or the wait could never complete.
                if event.get()?.is_signaled() {
                    Ok(())
                } else {
                    Err(Status::failed_precondition(
                        "wait on an event never signaled on this queue",
                    ))
                }
            }
            Command::FillBuffer { target, pattern } => {
                let bytes = pattern.to_le_bytes();
                let mut data = vec![0u8; target.byte_length];
                for (index, byte) in data.iter_mut().enumerate() {
                    *byte = bytes[index % 4];
                }
                target.write(&data)
            }
            Command::UpdateBuffer { target, data } => target.write(data),
            Command::CopyBuffer { source, target } => {
                let data = source.read()?;
                target.write(&data)
            }
            Command::Dispatch {
                executable,
                entry,
                workgroups,
                bindings,
                push_constants,
            } => {
                let [x, y, z] = *workgroups;
                // A zero count in any axis is a no-op dispatch.
                if x == 0 || y == 0 || z == 0 {
                    return Ok(());
                }
                let executable = executable.get()?;
                let kernel = executable.host_kernel(*entry)?;
                tracing::trace!(
                    executable = executable.name(),
                    entry,
                    x,
                    y,
                    z,
                    "local dispatch"
                );
                for wz in 0..z {
                    for wy in 0..y {
                        for wx in 0..x {
                            kernel.invoke(&DispatchContext {
                                workgroup_id: [wx, wy, wz],
                                workgroup_count: *workgroups,
                                bindings,
                                push_constants,
                            })?;
                        }
                    }
                }
                Ok(())
            }
        })
    }
}

impl Device for LocalDevice {
    fn id(&self) -> &str {
        LOCAL_DEVICE_ID
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(
        &self,
        byte_length: usize,
        usage: BufferUsage,
        memory_type: MemoryType,
    ) -> StatusResult<Ref<Buffer>> {
        Ok(Buffer::allocate(LOCAL_DEVICE_ID, byte_length, usage, memory_type))
    }

    fn create_command_buffer(
        &self,
        mode: CommandBufferMode,
        categories: CommandCategory,
    ) -> StatusResult<Ref<CommandBuffer>> {
        Ok(CommandBuffer::new(
            mode,
            categories,
            self.capabilities.max_update_chunk,
        ))
    }

    fn create_event(&self) -> StatusResult<Ref<Event>> {
        Ok(Ref::new(Event::new()))
    }

    fn create_semaphore(&self, timeline: bool, initial: u64) -> StatusResult<Ref<Semaphore>> {
        Ok(if timeline {
            Semaphore::timeline(initial)
        } else {
            Semaphore::binary()
        })
    }

    fn create_executable_cache(&self) -> Arc<ExecutableCache> {
        Arc::clone(&self.cache)
    }

    fn queue_submit(
        &self,
        _category: QueueCategory,
        command_buffers: &[Ref<CommandBuffer>],
        waits: &[(Ref<Semaphore>, u64)],
        signals: &[(Ref<Semaphore>, u64)],
    ) -> StatusResult<()> {
        crate::semaphore::wait_all(waits, None)?;
        for command_buffer in command_buffers {
            let command_buffer = command_buffer.get()?;
            command_buffer.begin_submission()?;
            let outcome = self.execute(command_buffer);
            command_buffer.end_submission();
            outcome?;
        }
        for (semaphore, value) in signals {
            semaphore.get()?.signal(*value)?;
        }
        Ok(())
    }

    fn wait_idle(&self, _deadline: Option<Duration>) -> StatusResult<()> {
        // Submissions complete before queue_submit returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_buffer::BufferBinding;
    use crate::executable::{Executable, HostKernel};
    use crate::executable_layout::{DescriptorSetLayout, ExecutableLayout};
    use tensile_base::StatusKind;

    fn device_buffer(device: &LocalDevice, len: usize) -> Ref<Buffer> {
        device
            .create_buffer(
                len,
                BufferUsage::TRANSFER | BufferUsage::DISPATCH | BufferUsage::MAPPING,
                MemoryType::HOST_VISIBLE | MemoryType::HOST_COHERENT,
            )
            .unwrap()
    }

    #[test]
    fn test_fill_update_copy() {
        let device = LocalDevice::new();
        let a = device_buffer(&device, 16);
        let b = device_buffer(&device, 16);
        let cb = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::TRANSFER)
            .unwrap();
        {
            let cb = cb.get().unwrap();
            cb.fill_buffer(BufferBinding::whole(a.retain()).unwrap(), 0x01020304)
                .unwrap();
            cb.execution_barrier().unwrap();
            cb.copy_buffer(
                BufferBinding::whole(a.retain()).unwrap(),
                BufferBinding::whole(b.retain()).unwrap(),
            )
            .unwrap();
            cb.finalize().unwrap();
        }
        device
            .queue_submit(QueueCategory::Transfer, &[cb], &[], &[])
            .unwrap();
        let data = b.get().unwrap().map_read(0, 16).unwrap();
        assert_eq!(&data[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&data[12..16], &[0x04, 0x03, 0x02, 0x01]);
    }

    struct CountingKernel {
        counter: std::sync::atomic::AtomicU32,
    }

    impl HostKernel for CountingKernel {
        fn invoke(&self, context: &DispatchContext<'_>) -> StatusResult<()> {
            assert_eq!(context.workgroup_count, [4, 2, 1]);
            self.counter
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn kernel_executable(kernel: Arc<dyn HostKernel>) -> Ref<Executable> {
        let layout = Arc::new(ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(0))],
            0,
        ));
        Ref::new(Executable::for_host(
            "test",
            layout,
            vec!["k".into()],
            vec![kernel],
        ))
    }

    #[test]
    fn test_dispatch_invokes_per_workgroup() {
        let device = LocalDevice::new();
        let kernel = Arc::new(CountingKernel {
            counter: std::sync::atomic::AtomicU32::new(0),
        });
        let executable = kernel_executable(Arc::clone(&kernel) as Arc<dyn HostKernel>);
        let cb = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::DISPATCH)
            .unwrap();
        cb.get()
            .unwrap()
            .dispatch(executable, 0, [4, 2, 1], vec![], vec![])
            .unwrap();
        cb.get().unwrap().finalize().unwrap();
        device
            .queue_submit(QueueCategory::Dispatch, &[cb], &[], &[])
            .unwrap();
        assert_eq!(kernel.counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }

    #[test]
    fn test_zero_workgroup_dispatch_is_noop() {
        let device = LocalDevice::new();
        let kernel = Arc::new(CountingKernel {
            counter: std::sync::atomic::AtomicU32::new(0),
        });
        let executable = kernel_executable(Arc::clone(&kernel) as Arc<dyn HostKernel>);
        let cb = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::DISPATCH)
            .unwrap();
        cb.get()
            .unwrap()
            .dispatch(executable, 0, [4, 0, 1], vec![], vec![])
            .unwrap();
        cb.get().unwrap().finalize().unwrap();
        device
            .queue_submit(QueueCategory::Dispatch, &[cb], &[], &[])
            .unwrap();
        assert_eq!(kernel.counter.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_submit_signals_semaphores() {
        let device = LocalDevice::new();
        let semaphore = device.create_semaphore(true, 0).unwrap();
        let cb = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::TRANSFER)
            .unwrap();
        cb.get().unwrap().finalize().unwrap();
        device
            .queue_submit(
                QueueCategory::Transfer,
                &[cb],
                &[],
                &[(semaphore.retain(), 7)],
            )
            .unwrap();
        assert_eq!(semaphore.get().unwrap().query(), 7);
    }

    #[test]
    fn test_wait_on_unsignaled_event_fails() {
        let device = LocalDevice::new();
        let event = device.create_event().unwrap();
        let cb = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::DISPATCH)
            .unwrap();
        cb.get().unwrap().wait_event(event).unwrap();
        cb.get().unwrap().finalize().unwrap();
        let err = device
            .queue_submit(QueueCategory::Dispatch, &[cb], &[], &[])
            .unwrap_err();
        assert!(err.is(StatusKind::FailedPrecondition));
    }

    #[test]
    fn test_event_signal_then_wait_across_command_buffers() {
        let device = LocalDevice::new();
        let event = device.create_event().unwrap();
        let first = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::DISPATCH)
            .unwrap();
        first.get().unwrap().signal_event(event.retain()).unwrap();
        first.get().unwrap().finalize().unwrap();
        let second = device
            .create_command_buffer(CommandBufferMode::OneShot, CommandCategory::DISPATCH)
            .unwrap();
        second.get().unwrap().wait_event(event).unwrap();
        second.get().unwrap().finalize().unwrap();
        device
            .queue_submit(QueueCategory::Dispatch, &[first, second], &[], &[])
            .unwrap();
    }

    #[test]
    fn test_filter_matching() {
        let device = LocalDevice::new();
        assert!(device.matches_filter("host-loop"));
        assert!(device.matches_filter("host-*"));
        assert!(device.matches_filter("*"));
        assert!(!device.matches_filter("vulkan-spirv-fb"));
    }
}
