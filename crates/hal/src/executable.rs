//! Executables: bundles of entry points compiled for one or more device
//! targets.

use std::sync::Arc;

use bytes::Bytes;
use tensile_base::{ref_object, Status, StatusResult};

use crate::command_buffer::BufferBinding;
use crate::executable_layout::ExecutableLayout;

/// One device-targeted binary inside an executable.
#[derive(Debug, Clone)]
pub struct TargetBinary {
    /// Device filter pattern this binary applies to, e.g.
    /// `"vulkan-spirv-fb"` or `"host-*"`.
    pub filter_pattern: String,
    /// Payload format name.
    pub format: String,
    /// Serialized module (e.g. a SPIR-V module and its entry names).
    pub data: Bytes,
    /// Entry point names in ordinal order.
    pub entry_points: Vec<String>,
}

/// Per-dispatch invocation context handed to host kernels.
pub struct DispatchContext<'a> {
    pub workgroup_id: [u32; 3],
    pub workgroup_count: [u32; 3],
    pub bindings: &'a [BufferBinding],
    pub push_constants: &'a [u32],
}

/// A compiled entry point executable on the host device. One invocation
/// per workgroup.
pub trait HostKernel: Send + Sync {
    fn invoke(&self, context: &DispatchContext<'_>) -> StatusResult<()>;
}

impl std::fmt::Debug for dyn HostKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostKernel")
    }
}

/// A bundle of entry points with a shared resource interface.
pub struct Executable {
    name: String,
    layout: Arc<ExecutableLayout>,
    entry_names: Vec<String>,
    targets: Vec<TargetBinary>,
    host_kernels: Vec<Arc<dyn HostKernel>>,
}

ref_object!(Executable);

impl Executable {
    /// Creates an executable carrying serialized target binaries.
    pub fn new(
        name: impl Into<String>,
        layout: Arc<ExecutableLayout>,
        entry_names: Vec<String>,
        targets: Vec<TargetBinary>,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            entry_names,
            targets,
            host_kernels: Vec::new(),
        }
    }

    /// Creates an executable prepared for the host device: one kernel
    /// per entry point.
    pub fn for_host(
        name: impl Into<String>,
        layout: Arc<ExecutableLayout>,
        entry_names: Vec<String>,
        host_kernels: Vec<Arc<dyn HostKernel>>,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            entry_names,
            targets: Vec::new(),
            host_kernels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &Arc<ExecutableLayout> {
        &self.layout
    }

    pub fn entry_names(&self) -> &[String] {
        &self.entry_names
    }

    pub fn targets(&self) -> &[TargetBinary] {
        &self.targets
    }

    /// Ordinal of a named entry point.
    pub fn entry_ordinal(&self, name: &str) -> StatusResult<usize> {
        self.entry_names
            .iter()
            .position(|entry| entry == name)
            .ok_or_else(|| {
                Status::not_found(format!(
                    "executable '{}' has no entry point '{name}'",
                    self.name
                ))
            })
    }

    /// The host kernel for an entry ordinal, if this executable was
    /// prepared for the host device.
    pub fn host_kernel(&self, entry: usize) -> StatusResult<&Arc<dyn HostKernel>> {
        self.host_kernels.get(entry).ok_or_else(|| {
            Status::unimplemented(format!(
                "executable '{}' has no host kernel for entry {entry}",
                self.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable_layout::DescriptorSetLayout;
    use tensile_base::StatusKind;

    #[test]
    fn test_entry_ordinals() {
        let layout = Arc::new(ExecutableLayout::new(
            vec![Arc::new(DescriptorSetLayout::storage_buffers(2))],
            0,
        ));
        let executable = Executable::new(
            "main",
            layout,
            vec!["main_dispatch_0".into(), "main_dispatch_1".into()],
            vec![],
        );
        assert_eq!(executable.entry_ordinal("main_dispatch_1").unwrap(), 1);
        assert!(executable
            .entry_ordinal("missing")
            .unwrap_err()
            .is(StatusKind::NotFound));
    }

    #[test]
    fn test_missing_host_kernel_is_unimplemented() {
        let layout = Arc::new(ExecutableLayout::new(vec![], 0));
        let executable = Executable::new("gpu_only", layout, vec!["e".into()], vec![]);
        assert!(executable
            .host_kernel(0)
            .unwrap_err()
            .is(StatusKind::Unimplemented));
    }
}
