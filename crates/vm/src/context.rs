//! Execution contexts: sandboxes binding modules, their per-context
//! state, and import resolutions.
//!
//! Modules appear in registration order; later modules resolve imports
//! against earlier ones, and name lookups scan in reverse so later
//! modules override. Once frozen, the module list is immutable and the
//! context is safe for concurrent readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tensile_base::{Status, StatusResult};

use crate::function::{Linkage, ResolvedFunction};
use crate::module::{CallRecord, Module, SharedState, StateResolver};
use crate::stack::{Stack, StackLimits};

/// Name of the optional initializer export run at registration.
pub const INIT_EXPORT: &str = "__init";

/// Name of the optional finalizer export run at context teardown.
pub const DEINIT_EXPORT: &str = "__deinit";

struct RegisteredModule {
    module: Arc<dyn Module>,
    state: SharedState,
    initialized: bool,
}

/// An execution sandbox owning an ordered list of (module, state) pairs.
pub struct Context {
    id: u64,
    modules: RwLock<Vec<RegisteredModule>>,
    frozen: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("frozen", &self.is_frozen())
            .field("module_count", &self.module_count())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            modules: RwLock::new(Vec::new()),
            frozen: AtomicBool::new(false),
        })
    }

    /// The context's instance-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.modules.read().expect("context poisoned").len()
    }

    /// True once the module list is immutable.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freezes the module list. Safe to call more than once.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Registers modules in order.
    ///
    /// For each module: retain, allocate state, resolve imports against
    /// previously registered modules (scanning in reverse so later
    /// modules win), check conv strings, then run its `__init` export.
    /// Any failure rolls the context back to its prior module count;
    /// partially registered contexts are never observable.
    pub fn register_modules(
        self: &Arc<Self>,
        modules: &[Arc<dyn Module>],
    ) -> StatusResult<()> {
        if self.is_frozen() {
            return Err(Status::failed_precondition(
                "context is frozen; modules can no longer be registered",
            ));
        }

        let rollback_count = self.module_count();
        let result = self.register_modules_inner(modules);
        if result.is_err() {
            self.rollback_to(rollback_count);
        }
        result
    }

    fn register_modules_inner(
        self: &Arc<Self>,
        modules: &[Arc<dyn Module>],
    ) -> StatusResult<()> {
        for module in modules {
            let state = self.wire_module(module).map_err(|status| {
                status.annotate(format!("while registering module '{}'", module.name()))
            })?;
            {
                let mut registered = self.modules.write().expect("context poisoned");
                registered.push(RegisteredModule {
                    module: Arc::clone(module),
                    state,
                    initialized: false,
                });
            }
            self.run_initializer(module)?;
            if let Some(entry) = self
                .modules
                .write()
                .expect("context poisoned")
                .last_mut()
            {
                entry.initialized = true;
            }
        }
        Ok(())
    }

    /// Allocates state and resolves all imports for one module.
    fn wire_module(&self, module: &Arc<dyn Module>) -> StatusResult<SharedState> {
        let mut state = module.alloc_state()?;
        let import_count = module.signature().import_count;
        for import_index in 0..import_count {
            let import_decl = module.lookup_function_by_ordinal(Linkage::Import, import_index)?;
            let (target_module_name, target_fn_name) =
                split_qualified_name(&import_decl.name)?;
            let target = self
                .resolve_export(target_module_name, target_fn_name)
                .map_err(|status| {
                    status.annotate(format!(
                        "while resolving import {import_index} '{}'",
                        import_decl.name
                    ))
                })?;
            crate::convention::check_conv_match(
                module.name(),
                &import_decl.conv,
                target.module.name(),
                &target.decl.conv,
            )?;
            module.resolve_import(
                state.as_mut(),
                import_index,
                target,
                &import_decl.signature,
            )?;
        }
        Ok(Arc::new(Mutex::new(state)))
    }

    fn run_initializer(self: &Arc<Self>, module: &Arc<dyn Module>) -> StatusResult<()> {
        let Ok(decl) = module.lookup_function_by_name(Linkage::Export, INIT_EXPORT) else {
            return Ok(());
        };
        let function = ResolvedFunction {
            module: Arc::clone(module),
            decl,
        };
        let mut stack = Stack::new(
            Arc::clone(self) as Arc<dyn StateResolver>,
            StackLimits::default(),
        );
        module
            .begin_call(
                &mut stack,
                CallRecord {
                    function,
                    arguments: Vec::new(),
                },
            )
            .map_err(|status| {
                status.annotate(format!("while initializing module '{}'", module.name()))
            })?;
        Ok(())
    }

    /// Releases modules registered past `count`, finalizing in reverse
    /// order.
    fn rollback_to(self: &Arc<Self>, count: usize) {
        loop {
            let entry = {
                let mut registered = self.modules.write().expect("context poisoned");
                if registered.len() <= count {
                    break;
                }
                registered.pop()
            };
            if let Some(entry) = entry {
                if entry.initialized {
                    self.run_finalizer(&entry.module);
                }
            }
        }
    }

    fn run_finalizer(self: &Arc<Self>, module: &Arc<dyn Module>) {
        let Ok(decl) = module.lookup_function_by_name(Linkage::Export, DEINIT_EXPORT) else {
            return;
        };
        let function = ResolvedFunction {
            module: Arc::clone(module),
            decl,
        };
        let mut stack = Stack::new(
            Arc::clone(self) as Arc<dyn StateResolver>,
            StackLimits::default(),
        );
        if let Err(status) = module.begin_call(
            &mut stack,
            CallRecord {
                function,
                arguments: Vec::new(),
            },
        ) {
            log::warn!(
                "finalizer of module '{}' failed: {status}",
                module.name()
            );
        }
    }

    /// Finalizes all modules in reverse registration order. Called from
    /// the instance when the context is released; also safe at drop.
    pub fn teardown(self: &Arc<Self>) {
        self.rollback_to(0);
    }

    /// Resolves `module.function` against the registered exports,
    /// scanning modules in reverse so later modules override earlier
    /// ones.
    pub fn resolve_function(&self, qualified_name: &str) -> StatusResult<ResolvedFunction> {
        let (module_name, fn_name) = split_qualified_name(qualified_name)?;
        self.resolve_export(module_name, fn_name)
    }

    /// Resolves an export by module and function name with reverse scan.
    pub fn resolve_export(
        &self,
        module_name: &str,
        fn_name: &str,
    ) -> StatusResult<ResolvedFunction> {
        let registered = self.modules.read().expect("context poisoned");
        for entry in registered.iter().rev() {
            if entry.module.name() != module_name {
                continue;
            }
            if let Ok(decl) = entry
                .module
                .lookup_function_by_name(Linkage::Export, fn_name)
            {
                return Ok(ResolvedFunction {
                    module: Arc::clone(&entry.module),
                    decl,
                });
            }
        }
        Err(Status::not_found(format!(
            "no export '{module_name}.{fn_name}' in context"
        )))
    }
}

impl StateResolver for Context {
    fn resolve_state(&self, module_name: &str) -> StatusResult<SharedState> {
        let registered = self.modules.read().expect("context poisoned");
        registered
            .iter()
            .rev()
            .find(|entry| entry.module.name() == module_name)
            .map(|entry| Arc::clone(&entry.state))
            .ok_or_else(|| {
                Status::not_found(format!("module '{module_name}' is not registered"))
            })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Finalizers need an Arc<Self> for the state resolver, which is
        // gone by drop time; contexts torn down through the instance run
        // them properly. Here we only release the module list.
        let mut registered = self.modules.write().expect("context poisoned");
        while registered.pop().is_some() {}
    }
}

fn split_qualified_name(qualified: &str) -> StatusResult<(&str, &str)> {
    qualified.split_once('.').ok_or_else(|| {
        Status::invalid_argument(format!(
            "'{qualified}' is not a qualified 'module.function' name"
        ))
    })
}
