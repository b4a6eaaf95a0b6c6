//! The pass pipeline: preprocessing through bytecode emission.

use std::sync::Arc;

use tensile_base::{Status, StatusResult};
use tensile_vm::bytecode::BytecodeModule;

use crate::dispatch::dedup::deduplicate_executables;
use crate::dispatch::outline::{outline_module, CompiledModule};
use crate::dispatch::resource_cache::{
    materialize_resource_cache, ResourceCachePlan, TargetArm,
};
use crate::host;
use crate::ir::GraphModule;
use crate::preprocess::{self, PreprocessOptions};
use crate::spirv;
use crate::vmgen::{self, PayloadTable, VmGenOptions};

/// Everything the driver can steer.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub preprocess: PreprocessOptions,
    /// Target backends, e.g. `["host-loop", "vulkan-spirv-fb"]`.
    pub targets: Vec<String>,
    pub constrained_workgroup_count: bool,
    pub emit_benchmark_funcs: bool,
    pub dispatch_trace: bool,
    pub spirv: spirv::SpirvTargetOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            preprocess: PreprocessOptions::default(),
            targets: vec![host::HOST_LOOP_FORMAT.to_string()],
            constrained_workgroup_count: false,
            emit_benchmark_funcs: false,
            dispatch_trace: false,
            spirv: spirv::SpirvTargetOptions::default(),
        }
    }
}

/// The compiled artifacts of one pipeline run.
#[derive(Debug)]
pub struct CompileOutput {
    pub module: CompiledModule,
    pub plan: ResourceCachePlan,
    pub vm_module: Arc<BytecodeModule>,
    /// Executables removed by deduplication.
    pub dedup_removed: usize,
}

fn target_arm(name: &str) -> StatusResult<TargetArm> {
    Ok(match name {
        "host" | "host-loop" => TargetArm {
            filter_pattern: "host-*".into(),
            format: host::HOST_LOOP_FORMAT.into(),
        },
        "vulkan" | "vulkan-spirv-fb" => TargetArm {
            filter_pattern: spirv::VULKAN_SPIRV_FORMAT.into(),
            format: spirv::VULKAN_SPIRV_FORMAT.into(),
        },
        other => {
            return Err(Status::invalid_argument(format!(
                "unknown target backend '{other}'"
            )))
        }
    })
}

/// Runs the whole pipeline over a graph module.
pub fn compile(mut graph: GraphModule, options: &CompileOptions) -> StatusResult<CompileOutput> {
    host::register_host_loop_format();

    preprocess::run(&mut graph, &options.preprocess)?;

    let mut module = outline_module(&graph, options.constrained_workgroup_count)?;
    let dedup_removed = deduplicate_executables(&mut module)?;
    tracing::debug!(
        executables = module.executables.len(),
        removed = dedup_removed,
        "dispatch formation complete"
    );

    let targets = options
        .targets
        .iter()
        .map(|name| target_arm(name))
        .collect::<StatusResult<Vec<_>>>()?;
    if targets.is_empty() {
        return Err(Status::invalid_argument("no target backends selected"));
    }
    let plan = materialize_resource_cache(&module, &targets)?;

    let mut payloads = PayloadTable::new();
    for executable in &module.executables {
        for target in &targets {
            let payload = match target.format.as_str() {
                host::HOST_LOOP_FORMAT => host::compile_host_executable(executable)?,
                spirv::VULKAN_SPIRV_FORMAT => {
                    spirv::lower_executable(executable, &options.spirv)?.to_bytes()?
                }
                other => {
                    return Err(Status::internal(format!(
                        "no lowering for target format '{other}'"
                    )))
                }
            };
            payloads.insert((executable.name.clone(), target.format.clone()), payload);
        }
    }

    let vm_module = vmgen::generate_vm_module(
        &module,
        &plan,
        &payloads,
        &VmGenOptions {
            emit_benchmark_funcs: options.emit_benchmark_funcs,
            dispatch_trace: options.dispatch_trace,
        },
    )?;

    Ok(CompileOutput {
        module,
        plan,
        vm_module,
        dedup_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{EwOp, GraphFunc, Operation, TensorType};
    use tensile_hal::ElementType;

    fn add_graph() -> GraphModule {
        let mut func = GraphFunc::new("main");
        let ty = TensorType::static_shape(&[16], ElementType::F32);
        let a = func.add_parameter("a", ty.clone());
        let b = func.add_parameter("b", ty);
        let sum = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, b])
            .unwrap();
        func.add_result(sum);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        module
    }

    #[test]
    fn test_compile_host_target() {
        let output = compile(add_graph(), &CompileOptions::default()).unwrap();
        assert_eq!(output.module.executables.len(), 1);
        assert_eq!(output.vm_module.targets().len(), 1);
    }

    #[test]
    fn test_compile_multi_target() {
        let options = CompileOptions {
            targets: vec!["host-loop".into(), "vulkan-spirv-fb".into()],
            ..CompileOptions::default()
        };
        let output = compile(add_graph(), &options).unwrap();
        // One payload per target per executable.
        assert_eq!(output.vm_module.targets().len(), 2);
    }

    #[test]
    fn test_unknown_target_rejected() {
        let options = CompileOptions {
            targets: vec!["metal".into()],
            ..CompileOptions::default()
        };
        let err = compile(add_graph(), &options).unwrap_err();
        assert!(err.is(tensile_base::StatusKind::InvalidArgument));
    }
}
