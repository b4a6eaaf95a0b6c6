//! Resource-cache materialization.
//!
//! To avoid re-creating descriptor-set layouts and executable layouts at
//! every dispatch, the module gets cached singleton globals with
//! one-shot initializers:
//!
//! - one global per unique descriptor-set-layout bindings attribute;
//! - one global per unique (ordered set layouts, push constant count)
//!   tuple, loading the individual set-layout globals in order;
//! - one global per source executable whose initializer switches on
//!   device-match conditions, one arm per candidate target backend,
//!   with a null-executable default arm.
//!
//! Lookups in user functions become plain loads of these globals.
//! Initialization order places dependencies before dependents.

use indexmap::IndexMap;
use tensile_base::StatusResult;
use tensile_hal::{DescriptorSetLayout, ExecutableLayout};

use crate::dispatch::outline::CompiledModule;

/// One candidate target backend arm of an executable initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArm {
    /// Device filter pattern tested by `hal.device.match`.
    pub filter_pattern: String,
    /// Payload format to load when the pattern matches.
    pub format: String,
}

/// What a materialized global holds.
#[derive(Debug, Clone)]
pub enum GlobalKind {
    DescriptorSetLayout {
        layout: DescriptorSetLayout,
    },
    ExecutableLayout {
        /// Names of previously materialized set-layout globals, in
        /// set order.
        set_layout_globals: Vec<String>,
        push_constant_count: usize,
    },
    Executable {
        /// The source executable symbol this global caches.
        source: String,
        /// Name of the executable-layout global it builds against.
        layout_global: String,
        /// One arm per candidate backend; the default arm yields null.
        arms: Vec<TargetArm>,
    },
}

/// One cached singleton global plus its one-shot initializer spec.
#[derive(Debug, Clone)]
pub struct MaterializedGlobal {
    pub name: String,
    pub kind: GlobalKind,
}

/// The materialization plan: globals in initialization order and the
/// lookup rewrite map.
#[derive(Debug, Clone, Default)]
pub struct ResourceCachePlan {
    /// Dependencies strictly precede dependents.
    pub globals: Vec<MaterializedGlobal>,
    /// Executable symbol -> global name serving lookups of it.
    pub lookup_rewrites: IndexMap<String, String>,
}

impl ResourceCachePlan {
    pub fn global(&self, name: &str) -> Option<&MaterializedGlobal> {
        self.globals.iter().find(|global| global.name == name)
    }

    /// The global serving lookups of an executable symbol.
    pub fn executable_global(&self, symbol: &str) -> Option<&MaterializedGlobal> {
        self.lookup_rewrites
            .get(symbol)
            .and_then(|name| self.global(name))
    }
}

/// Builds the plan for a compiled module against candidate targets.
pub fn materialize_resource_cache(
    module: &CompiledModule,
    targets: &[TargetArm],
) -> StatusResult<ResourceCachePlan> {
    let mut plan = ResourceCachePlan::default();
    // Structural keys keep one global per unique attribute.
    let mut set_layout_globals: IndexMap<DescriptorSetLayout, String> = IndexMap::new();
    let mut layout_globals: IndexMap<ExecutableLayout, String> = IndexMap::new();

    for executable in &module.executables {
        let set_layout = DescriptorSetLayout::storage_buffers(executable.binding_count);
        let set_global_name = match set_layout_globals.get(&set_layout) {
            Some(name) => name.clone(),
            None => {
                let name = format!("__set_layout_{}", set_layout_globals.len());
                plan.globals.push(MaterializedGlobal {
                    name: name.clone(),
                    kind: GlobalKind::DescriptorSetLayout {
                        layout: set_layout.clone(),
                    },
                });
                set_layout_globals.insert(set_layout.clone(), name.clone());
                name
            }
        };

        let layout = ExecutableLayout::new(
            vec![std::sync::Arc::new(set_layout)],
            executable.push_constant_count,
        );
        let layout_global_name = match layout_globals.get(&layout) {
            Some(name) => name.clone(),
            None => {
                let name = format!("__executable_layout_{}", layout_globals.len());
                plan.globals.push(MaterializedGlobal {
                    name: name.clone(),
                    kind: GlobalKind::ExecutableLayout {
                        set_layout_globals: vec![set_global_name],
                        push_constant_count: executable.push_constant_count,
                    },
                });
                layout_globals.insert(layout, name.clone());
                name
            }
        };

        let global_name = format!("__executable_{}", executable.name);
        plan.globals.push(MaterializedGlobal {
            name: global_name.clone(),
            kind: GlobalKind::Executable {
                source: executable.name.clone(),
                layout_global: layout_global_name,
                arms: targets.to_vec(),
            },
        });
        plan.lookup_rewrites
            .insert(executable.name.clone(), global_name);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::outline::outline_module;
    use crate::ir::{EwOp, GraphFunc, GraphModule, Operation, TensorType};
    use tensile_hal::ElementType;

    fn targets() -> Vec<TargetArm> {
        vec![
            TargetArm {
                filter_pattern: "host-*".into(),
                format: "host-loop".into(),
            },
            TargetArm {
                filter_pattern: "vulkan-spirv-fb".into(),
                format: "vulkan-spirv-fb".into(),
            },
        ]
    }

    fn compiled_module() -> CompiledModule {
        let mut func = GraphFunc::new("main");
        let ty = TensorType::static_shape(&[16], ElementType::F32);
        let a = func.add_parameter("a", ty.clone());
        let b = func.add_parameter("b", ty);
        let sum1 = func
            .add_node(Operation::Elementwise { op: EwOp::Add }, vec![a, b])
            .unwrap();
        let sum2 = func
            .add_node(Operation::Elementwise { op: EwOp::Mul }, vec![b, a])
            .unwrap();
        func.add_result(sum1);
        func.add_result(sum2);
        let mut module = GraphModule::new("model");
        module.funcs.push(func);
        outline_module(&module, false).unwrap()
    }

    #[test]
    fn test_unique_layouts_shared() {
        let compiled = compiled_module();
        let plan = materialize_resource_cache(&compiled, &targets()).unwrap();
        // Both executables bind three buffers, so one set layout and
        // one executable layout serve both.
        let set_layout_count = plan
            .globals
            .iter()
            .filter(|global| matches!(global.kind, GlobalKind::DescriptorSetLayout { .. }))
            .count();
        let layout_count = plan
            .globals
            .iter()
            .filter(|global| matches!(global.kind, GlobalKind::ExecutableLayout { .. }))
            .count();
        assert_eq!(set_layout_count, 1);
        assert_eq!(layout_count, 1);
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let compiled = compiled_module();
        let plan = materialize_resource_cache(&compiled, &targets()).unwrap();
        let position = |name: &str| {
            plan.globals
                .iter()
                .position(|global| global.name == name)
                .unwrap()
        };
        for global in &plan.globals {
            match &global.kind {
                GlobalKind::ExecutableLayout {
                    set_layout_globals, ..
                } => {
                    for dependency in set_layout_globals {
                        assert!(position(dependency) < position(&global.name));
                    }
                }
                GlobalKind::Executable { layout_global, .. } => {
                    assert!(position(layout_global) < position(&global.name));
                }
                GlobalKind::DescriptorSetLayout { .. } => {}
            }
        }
    }

    #[test]
    fn test_lookup_rewrites_cover_all_executables() {
        let compiled = compiled_module();
        let plan = materialize_resource_cache(&compiled, &targets()).unwrap();
        for executable in &compiled.executables {
            let global = plan.executable_global(&executable.name).unwrap();
            let GlobalKind::Executable { source, arms, .. } = &global.kind else {
                panic!("lookup rewrite does not name an executable global");
            };
            assert_eq!(source, &executable.name);
            assert_eq!(arms.len(), 2);
        }
    }
}
