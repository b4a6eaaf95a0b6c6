//! Command buffers: recorded sequences of device commands.
//!
//! Commands execute in record order subject to explicit barriers.
//! A command buffer is single-writer during recording; submission
//! transfers write ownership to the queue. Record-time errors poison
//! only the command buffer they occurred on.

use bitflags::bitflags;
use parking_lot::Mutex;
use tensile_base::{ref_object, Ref, Status, StatusResult};

use crate::buffer::Buffer;
use crate::event::Event;
use crate::executable::Executable;

bitflags! {
    /// Command categories a command buffer may record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandCategory: u32 {
        const TRANSFER = 1 << 0;
        const DISPATCH = 1 << 1;
    }
}

/// Reuse policy of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferMode {
    /// Valid for a single submission.
    OneShot,
    /// May be submitted repeatedly.
    Reusable,
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    Recorded,
    Submitted,
    Complete,
    /// A record-time error invalidated this command buffer.
    Invalid,
}

/// A buffer range bound to a command.
#[derive(Clone)]
pub struct BufferBinding {
    pub buffer: Ref<Buffer>,
    pub byte_offset: usize,
    pub byte_length: usize,
}

impl BufferBinding {
    /// Binds a whole buffer.
    pub fn whole(buffer: Ref<Buffer>) -> StatusResult<Self> {
        let byte_length = buffer.get()?.byte_length();
        Ok(Self {
            buffer,
            byte_offset: 0,
            byte_length,
        })
    }

    pub(crate) fn read(&self) -> StatusResult<Vec<u8>> {
        self.buffer
            .get()?
            .read_bytes(self.byte_offset, self.byte_length)
    }

    pub(crate) fn write(&self, data: &[u8]) -> StatusResult<()> {
        self.buffer.get()?.write_bytes(self.byte_offset, data)
    }
}

/// One recorded command.
pub enum Command {
    ExecutionBarrier,
    SignalEvent(Ref<Event>),
    ResetEvent(Ref<Event>),
    WaitEvent(Ref<Event>),
    FillBuffer {
        target: BufferBinding,
        pattern: u32,
    },
    UpdateBuffer {
        target: BufferBinding,
        data: Vec<u8>,
    },
    CopyBuffer {
        source: BufferBinding,
        target: BufferBinding,
    },
    Dispatch {
        executable: Ref<Executable>,
        entry: usize,
        workgroups: [u32; 3],
        bindings: Vec<BufferBinding>,
        push_constants: Vec<u32>,
    },
}

struct Inner {
    state: CommandBufferState,
    commands: Vec<Command>,
}

/// A recorded sequence of device commands.
pub struct CommandBuffer {
    mode: CommandBufferMode,
    categories: CommandCategory,
    /// Device cap on a single inline update; larger updates are split.
    max_update_chunk: usize,
    inner: Mutex<Inner>,
}

ref_object!(CommandBuffer);

impl CommandBuffer {
    pub fn new(
        mode: CommandBufferMode,
        categories: CommandCategory,
        max_update_chunk: usize,
    ) -> Ref<CommandBuffer> {
        Ref::new(Self {
            mode,
            categories,
            max_update_chunk,
            inner: Mutex::new(Inner {
                state: CommandBufferState::Recording,
                commands: Vec::new(),
            }),
        })
    }

    pub fn mode(&self) -> CommandBufferMode {
        self.mode
    }

    pub fn categories(&self) -> CommandCategory {
        self.categories
    }

    pub fn state(&self) -> CommandBufferState {
        self.inner.lock().state
    }

    pub fn command_count(&self) -> usize {
        self.inner.lock().commands.len()
    }

    /// Runs one record step, poisoning the command buffer on failure.
    fn record(
        &self,
        category: CommandCategory,
        build: impl FnOnce() -> StatusResult<Vec<Command>>,
    ) -> StatusResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Recording {
            return Err(Status::failed_precondition(format!(
                "command buffer is {:?}, not recording",
                inner.state
            )));
        }
        if !self.categories.contains(category) {
            inner.state = CommandBufferState::Invalid;
            return Err(Status::invalid_argument(format!(
                "command buffer categories {:?} do not admit {category:?}",
                self.categories
            )));
        }
        match build() {
            Ok(commands) => {
                inner.commands.extend(commands);
                Ok(())
            }
            Err(status) => {
                inner.state = CommandBufferState::Invalid;
                Err(status)
            }
        }
    }

    pub fn execution_barrier(&self) -> StatusResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Recording {
            return Err(Status::failed_precondition("not recording"));
        }
        inner.commands.push(Command::ExecutionBarrier);
        Ok(())
    }

    pub fn signal_event(&self, event: Ref<Event>) -> StatusResult<()> {
        self.record(CommandCategory::DISPATCH, || {
            Ok(vec![Command::SignalEvent(event)])
        })
    }

    pub fn reset_event(&self, event: Ref<Event>) -> StatusResult<()> {
        self.record(CommandCategory::DISPATCH, || {
            Ok(vec![Command::ResetEvent(event)])
        })
    }

    pub fn wait_event(&self, event: Ref<Event>) -> StatusResult<()> {
        self.record(CommandCategory::DISPATCH, || {
            Ok(vec![Command::WaitEvent(event)])
        })
    }

    pub fn fill_buffer(&self, target: BufferBinding, pattern: u32) -> StatusResult<()> {
        self.record(CommandCategory::TRANSFER, || {
            if target.byte_length % 4 != 0 || target.byte_offset % 4 != 0 {
                return Err(Status::invalid_argument(
                    "fill range must be 4-byte aligned",
                ));
            }
            Ok(vec![Command::FillBuffer { target, pattern }])
        })
    }

    /// Records an inline update. Updates larger than the device's
    /// single-update cap are split into order-preserving chunks of at
    /// most the cap.
    pub fn update_buffer(&self, target: BufferBinding, data: &[u8]) -> StatusResult<()> {
        let max_chunk = self.max_update_chunk;
        self.record(CommandCategory::TRANSFER, || {
            if data.len() != target.byte_length {
                return Err(Status::invalid_argument(format!(
                    "update of {} bytes does not match binding of {} bytes",
                    data.len(),
                    target.byte_length
                )));
            }
            let mut commands = Vec::new();
            let mut offset = 0usize;
            while offset < data.len() {
                let chunk = (data.len() - offset).min(max_chunk);
                let target_chunk = BufferBinding {
                    buffer: target.buffer.retain(),
                    byte_offset: target.byte_offset + offset,
                    byte_length: chunk,
                };
                commands.push(Command::UpdateBuffer {
                    target: target_chunk,
                    data: data[offset..offset + chunk].to_vec(),
                });
                offset += chunk;
            }
            Ok(commands)
        })
    }

    pub fn copy_buffer(&self, source: BufferBinding, target: BufferBinding) -> StatusResult<()> {
        self.record(CommandCategory::TRANSFER, || {
            if source.byte_length != target.byte_length {
                return Err(Status::invalid_argument(format!(
                    "copy source of {} bytes does not match target of {} bytes",
                    source.byte_length, target.byte_length
                )));
            }
            Ok(vec![Command::CopyBuffer { source, target }])
        })
    }

    pub fn dispatch(
        &self,
        executable: Ref<Executable>,
        entry: usize,
        workgroups: [u32; 3],
        bindings: Vec<BufferBinding>,
        push_constants: Vec<u32>,
    ) -> StatusResult<()> {
        self.record(CommandCategory::DISPATCH, || {
            let expected = executable.get()?.layout().binding_count();
            if bindings.len() != expected {
                return Err(Status::invalid_argument(format!(
                    "dispatch binds {} buffers, executable layout declares {expected}",
                    bindings.len()
                )));
            }
            let push_expected = executable.get()?.layout().push_constant_count;
            if push_constants.len() != push_expected {
                return Err(Status::invalid_argument(format!(
                    "dispatch pushes {} constants, executable layout declares {push_expected}",
                    push_constants.len()
                )));
            }
            Ok(vec![Command::Dispatch {
                executable,
                entry,
                workgroups,
                bindings,
                push_constants,
            }])
        })
    }

    /// Workgroup counts loaded from a workload buffer at execution time
    /// are not supported by this design.
    pub fn dispatch_indirect(
        &self,
        _executable: Ref<Executable>,
        _entry: usize,
        _workgroups_buffer: BufferBinding,
    ) -> StatusResult<()> {
        Err(Status::unimplemented(
            "dynamic workgroup counts from a workload buffer are rejected",
        ))
    }

    /// Ends recording.
    pub fn finalize(&self) -> StatusResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CommandBufferState::Recording => {
                inner.state = CommandBufferState::Recorded;
                Ok(())
            }
            state => Err(Status::failed_precondition(format!(
                "cannot finalize a {state:?} command buffer"
            ))),
        }
    }

    /// Transitions to Submitted for queue execution.
    pub(crate) fn begin_submission(&self) -> StatusResult<()> {
        let mut inner = self.inner.lock();
        match (inner.state, self.mode) {
            (CommandBufferState::Recorded, _) => {
                inner.state = CommandBufferState::Submitted;
                Ok(())
            }
            (CommandBufferState::Complete, CommandBufferMode::Reusable) => {
                inner.state = CommandBufferState::Submitted;
                Ok(())
            }
            (state, _) => Err(Status::failed_precondition(format!(
                "cannot submit a {state:?} command buffer"
            ))),
        }
    }

    /// Marks execution complete.
    pub(crate) fn end_submission(&self) {
        self.inner.lock().state = CommandBufferState::Complete;
    }

    /// Runs `f` over the recorded commands during execution.
    pub(crate) fn for_each_command(
        &self,
        mut f: impl FnMut(&Command) -> StatusResult<()>,
    ) -> StatusResult<()> {
        let inner = self.inner.lock();
        for command in &inner.commands {
            f(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferUsage, MemoryType};

    fn binding(len: usize) -> BufferBinding {
        BufferBinding::whole(Buffer::allocate(
            "test",
            len,
            BufferUsage::TRANSFER | BufferUsage::DISPATCH,
            MemoryType::DEVICE_LOCAL,
        ))
        .unwrap()
    }

    fn transfer_cb(max_chunk: usize) -> Ref<CommandBuffer> {
        CommandBuffer::new(
            CommandBufferMode::OneShot,
            CommandCategory::TRANSFER,
            max_chunk,
        )
    }

    #[test]
    fn test_state_machine() {
        let cb = transfer_cb(1024);
        let cb = cb.get().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recording);
        cb.execution_barrier().unwrap();
        cb.finalize().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recorded);
        assert!(cb.execution_barrier().is_err());
        assert!(cb.finalize().is_err());
        cb.begin_submission().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Submitted);
        cb.end_submission();
        assert_eq!(cb.state(), CommandBufferState::Complete);
        // One-shot: resubmission is rejected.
        assert!(cb.begin_submission().is_err());
    }

    #[test]
    fn test_reusable_resubmission() {
        let cb = CommandBuffer::new(
            CommandBufferMode::Reusable,
            CommandCategory::TRANSFER,
            1024,
        );
        let cb = cb.get().unwrap();
        cb.finalize().unwrap();
        cb.begin_submission().unwrap();
        cb.end_submission();
        cb.begin_submission().unwrap();
    }

    #[test]
    fn test_update_splits_into_chunks() {
        let cb = transfer_cb(16);
        let cb = cb.get().unwrap();
        let data = (0..40u8).collect::<Vec<_>>();
        cb.update_buffer(binding(40), &data).unwrap();
        // 40 bytes with a 16-byte cap: 16 + 16 + 8, in source order.
        assert_eq!(cb.command_count(), 3);
        let mut offsets = Vec::new();
        let mut lengths = Vec::new();
        cb.for_each_command(|command| {
            if let Command::UpdateBuffer { target, data } = command {
                offsets.push(target.byte_offset);
                lengths.push(data.len());
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(offsets, vec![0, 16, 32]);
        assert_eq!(lengths, vec![16, 16, 8]);
    }

    #[test]
    fn test_update_under_cap_is_single_command() {
        let cb = transfer_cb(1024);
        let cb = cb.get().unwrap();
        cb.update_buffer(binding(8), &[0u8; 8]).unwrap();
        assert_eq!(cb.command_count(), 1);
    }

    #[test]
    fn test_category_violation_poisons() {
        let cb = transfer_cb(1024);
        let cb = cb.get().unwrap();
        let layout = std::sync::Arc::new(crate::executable_layout::ExecutableLayout::new(
            vec![],
            0,
        ));
        let executable = Ref::new(Executable::new("e", layout, vec!["k".into()], vec![]));
        let err = cb
            .dispatch(executable, 0, [1, 1, 1], vec![], vec![])
            .unwrap_err();
        assert!(err.message().unwrap_or_default().contains("categories"));
        assert_eq!(cb.state(), CommandBufferState::Invalid);
    }

    #[test]
    fn test_record_error_poisons_only_that_buffer() {
        let cb_bad = transfer_cb(1024);
        let cb_good = transfer_cb(1024);
        // Mismatched copy lengths: record error.
        assert!(cb_bad
            .get()
            .unwrap()
            .copy_buffer(binding(8), binding(16))
            .is_err());
        assert_eq!(cb_bad.get().unwrap().state(), CommandBufferState::Invalid);
        assert_eq!(
            cb_good.get().unwrap().state(),
            CommandBufferState::Recording
        );
    }

    #[test]
    fn test_dispatch_indirect_rejected() {
        let cb = CommandBuffer::new(
            CommandBufferMode::OneShot,
            CommandCategory::DISPATCH,
            1024,
        );
        let layout = std::sync::Arc::new(crate::executable_layout::ExecutableLayout::new(
            vec![],
            0,
        ));
        let executable = Ref::new(Executable::new("e", layout, vec!["k".into()], vec![]));
        let err = cb
            .get()
            .unwrap()
            .dispatch_indirect(executable, 0, binding(12))
            .unwrap_err();
        assert!(err.is(tensile_base::StatusKind::Unimplemented));
    }
}
