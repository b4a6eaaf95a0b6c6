//! The device contract: allocator, queues, factories, synchronization.

use std::sync::Arc;
use std::time::Duration;

use tensile_base::{Ref, StatusResult};

use crate::buffer::{Buffer, BufferUsage, MemoryType};
use crate::command_buffer::{CommandBuffer, CommandBufferMode, CommandCategory};
use crate::event::Event;
use crate::executable_cache::ExecutableCache;
use crate::semaphore::Semaphore;

/// Capabilities a device advertises.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Descriptor sets are pushed inline rather than pool-allocated.
    pub push_descriptors: bool,
    /// Largest single inline buffer update, in bytes.
    pub max_update_chunk: usize,
    /// Maximum invocations in one workgroup.
    pub max_workgroup_invocations: u32,
    /// Subgroup width for cooperative operations.
    pub subgroup_size: u32,
    /// Whether cooperative-matrix operations are supported.
    pub cooperative_matrix: bool,
}

/// Queue categories a submission can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCategory {
    Dispatch,
    Transfer,
}

/// The contract every device backend satisfies.
pub trait Device: Send + Sync {
    /// Stable identifier, e.g. `"host-loop"`.
    fn id(&self) -> &str;

    /// Matches a device filter pattern; a trailing `*` is a wildcard.
    fn matches_filter(&self, pattern: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.id().starts_with(prefix),
            None => self.id() == pattern,
        }
    }

    fn capabilities(&self) -> &DeviceCapabilities;

    /// Allocates a buffer on this device's allocator.
    fn create_buffer(
        &self,
        byte_length: usize,
        usage: BufferUsage,
        memory_type: MemoryType,
    ) -> StatusResult<Ref<Buffer>>;

    fn create_command_buffer(
        &self,
        mode: CommandBufferMode,
        categories: CommandCategory,
    ) -> StatusResult<Ref<CommandBuffer>>;

    fn create_event(&self) -> StatusResult<Ref<Event>>;

    fn create_semaphore(&self, timeline: bool, initial: u64) -> StatusResult<Ref<Semaphore>>;

    fn create_executable_cache(&self) -> Arc<ExecutableCache>;

    /// Submits command buffers to a queue. The submission waits for the
    /// given (semaphore, value) pairs, executes, then signals.
    fn queue_submit(
        &self,
        category: QueueCategory,
        command_buffers: &[Ref<CommandBuffer>],
        waits: &[(Ref<Semaphore>, u64)],
        signals: &[(Ref<Semaphore>, u64)],
    ) -> StatusResult<()>;

    /// Waits until all queued work drains or the deadline passes.
    fn wait_idle(&self, deadline: Option<Duration>) -> StatusResult<()>;
}
