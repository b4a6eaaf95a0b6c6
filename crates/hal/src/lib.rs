//! # Tensile HAL
//!
//! The hardware abstraction layer: devices, buffers, buffer views,
//! command buffers, events, semaphores, executables, and resource
//! caches. Compiled programs drive devices either directly through the
//! [`Device`] trait or from bytecode through the [`vm_module`] exports.
//!
//! The in-process [`LocalDevice`](local::LocalDevice) executes recorded
//! command buffers synchronously on the CPU and is the reference
//! implementation of the device contract.

/// Buffers and their usage/memory-type bits
pub mod buffer;
/// Buffers observed through a shape and element type
pub mod buffer_view;
/// Recorded command sequences
pub mod command_buffer;
/// The device contract
pub mod device;
/// Process-wide driver registry
pub mod driver;
/// Tensor element type descriptors
pub mod element_type;
/// Intra-queue events
pub mod event;
/// Executables and per-target binaries
pub mod executable;
/// Process-wide executable payload loaders
pub mod executable_format;
/// Descriptor-set and executable layouts
pub mod executable_layout;
/// Layout/executable singleton cache
pub mod executable_cache;
/// The in-process CPU device
pub mod local;
/// Binary and timeline semaphores
pub mod semaphore;
/// The HAL module exposed to the VM
pub mod vm_module;

pub use buffer::{Buffer, BufferUsage, MemoryType};
pub use buffer_view::BufferView;
pub use command_buffer::{
    BufferBinding, Command, CommandBuffer, CommandBufferMode, CommandBufferState,
    CommandCategory,
};
pub use device::{Device, DeviceCapabilities, QueueCategory};
pub use element_type::{ElementCategory, ElementType};
pub use event::Event;
pub use executable::{DispatchContext, Executable, HostKernel, TargetBinary};
pub use executable_cache::ExecutableCache;
pub use executable_format::{register_executable_format, ExecutableLoader};
pub use executable_layout::{
    DescriptorAccess, DescriptorSetLayout, DescriptorSetLayoutBinding, DescriptorType,
    ExecutableLayout,
};
pub use local::LocalDevice;
pub use semaphore::Semaphore;
pub use vm_module::{create_hal_module, HAL_MODULE_NAME};
