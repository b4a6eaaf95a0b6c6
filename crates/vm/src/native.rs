//! Host modules assembled from named closures.
//!
//! A [`NativeModule`] exposes host functions to bytecode under declared
//! signatures and conv strings. Calls run synchronously inside a native
//! stack frame; errors are annotated with the frame's backtrace line
//! before the frame is left.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tensile_base::{Status, StatusResult};

use crate::convention::ConvString;
use crate::function::{FunctionDecl, Linkage, ResolvedFunction, Signature};
use crate::module::{CallRecord, Module, ModuleSignature, ModuleState};
use crate::stack::{FrameType, Stack};
use crate::value::Value;

/// A host function callable from bytecode.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> StatusResult<Vec<Value>> + Send + Sync>;

struct NativeExport {
    decl: Arc<FunctionDecl>,
    handler: NativeFn,
}

/// Builder for [`NativeModule`].
pub struct NativeModuleBuilder {
    name: String,
    exports: Vec<NativeExport>,
    by_name: HashMap<String, usize>,
}

impl NativeModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registers an export with its signature-derived conv string.
    pub fn export<F>(mut self, name: &str, signature: Signature, handler: F) -> Self
    where
        F: Fn(&[Value]) -> StatusResult<Vec<Value>> + Send + Sync + 'static,
    {
        let conv = ConvString::for_signature(&signature);
        let ordinal = self.exports.len();
        self.by_name.insert(name.to_string(), ordinal);
        self.exports.push(NativeExport {
            decl: Arc::new(FunctionDecl {
                name: name.to_string(),
                linkage: Linkage::Export,
                ordinal,
                signature,
                conv: conv.as_str().to_string(),
            }),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn build(self) -> Arc<NativeModule> {
        Arc::new(NativeModule {
            name: self.name,
            exports: self.exports,
            by_name: self.by_name,
        })
    }
}

/// Per-context state of a native module. Native modules keep their real
/// state inside their closures; this placeholder satisfies the module
/// contract.
struct NativeState;

impl ModuleState for NativeState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A module whose exports are host closures.
pub struct NativeModule {
    name: String,
    exports: Vec<NativeExport>,
    by_name: HashMap<String, usize>,
}

impl NativeModule {
    pub fn builder(name: impl Into<String>) -> NativeModuleBuilder {
        NativeModuleBuilder::new(name)
    }
}

impl Module for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> ModuleSignature {
        ModuleSignature {
            import_count: 0,
            export_count: self.exports.len(),
            internal_count: 0,
        }
    }

    fn lookup_function_by_name(
        &self,
        linkage: Linkage,
        name: &str,
    ) -> StatusResult<Arc<FunctionDecl>> {
        if linkage != Linkage::Export {
            return Err(Status::not_found(format!(
                "native module '{}' has no {linkage} functions",
                self.name
            )));
        }
        self.by_name
            .get(name)
            .map(|&ordinal| Arc::clone(&self.exports[ordinal].decl))
            .ok_or_else(|| {
                Status::not_found(format!(
                    "native module '{}' has no export '{name}'",
                    self.name
                ))
            })
    }

    fn lookup_function_by_ordinal(
        &self,
        linkage: Linkage,
        ordinal: usize,
    ) -> StatusResult<Arc<FunctionDecl>> {
        if linkage != Linkage::Export {
            return Err(Status::not_found(format!(
                "native module '{}' has no {linkage} functions",
                self.name
            )));
        }
        self.exports
            .get(ordinal)
            .map(|export| Arc::clone(&export.decl))
            .ok_or_else(|| {
                Status::out_of_range(format!(
                    "native module '{}' export ordinal {ordinal} out of range",
                    self.name
                ))
            })
    }

    fn alloc_state(&self) -> StatusResult<Box<dyn ModuleState>> {
        Ok(Box::new(NativeState))
    }

    fn resolve_import(
        &self,
        _state: &mut dyn ModuleState,
        import_index: usize,
        _target: ResolvedFunction,
        _expected: &Signature,
    ) -> StatusResult<()> {
        Err(Status::out_of_range(format!(
            "native module '{}' has no import {import_index}",
            self.name
        )))
    }

    fn begin_call(&self, stack: &mut Stack, call: CallRecord) -> StatusResult<Vec<Value>> {
        let export = self
            .exports
            .get(call.function.decl.ordinal)
            .ok_or_else(|| {
                Status::out_of_range(format!(
                    "native module '{}' export ordinal {} out of range",
                    self.name, call.function.decl.ordinal
                ))
            })?;
        export
            .decl
            .signature
            .check_arguments(&export.decl.name, &call.arguments)?;

        stack.function_enter(call.function.clone(), FrameType::Native, 0, None)?;
        let outcome = (export.handler)(&call.arguments);
        let outcome = match outcome {
            Ok(results) => Ok(results),
            Err(status) => Err(stack.annotate_failure(status)),
        };
        stack.function_leave()?;
        let results = outcome?;
        export
            .decl
            .signature
            .check_results(&export.decl.name, &results)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{SharedState, StateResolver};
    use crate::stack::StackLimits;
    use crate::value::ValueType;
    use std::sync::Mutex;
    use tensile_base::StatusKind;

    struct FixedResolver(SharedState);
    impl StateResolver for FixedResolver {
        fn resolve_state(&self, _module_name: &str) -> StatusResult<SharedState> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn test_stack(module: &Arc<NativeModule>) -> Stack {
        let state = Arc::new(Mutex::new(module.alloc_state().unwrap()));
        Stack::new(Arc::new(FixedResolver(state)), StackLimits::default())
    }

    fn resolved(module: &Arc<NativeModule>, name: &str) -> ResolvedFunction {
        ResolvedFunction {
            module: Arc::clone(module) as Arc<dyn Module>,
            decl: module
                .lookup_function_by_name(Linkage::Export, name)
                .unwrap(),
        }
    }

    #[test]
    fn test_native_call() {
        let module = NativeModule::builder("math")
            .export(
                "add",
                Signature::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]),
                |args| {
                    let sum = args[0].as_i32()? + args[1].as_i32()?;
                    Ok(vec![Value::I32(sum)])
                },
            )
            .build();
        let mut stack = test_stack(&module);
        let results = module
            .begin_call(
                &mut stack,
                CallRecord {
                    function: resolved(&module, "add"),
                    arguments: vec![Value::I32(2), Value::I32(3)],
                },
            )
            .unwrap();
        assert_eq!(results[0].as_i32().unwrap(), 5);
        assert_eq!(stack.used_bytes(), 0);
    }

    #[test]
    fn test_native_error_annotated_and_balanced() {
        let module = NativeModule::builder("failing")
            .export("boom", Signature::new(vec![], vec![]), |_args| {
                Err(Status::invalid_argument("bad input"))
            })
            .build();
        let mut stack = test_stack(&module);
        let err = module
            .begin_call(
                &mut stack,
                CallRecord {
                    function: resolved(&module, "boom"),
                    arguments: vec![],
                },
            )
            .unwrap_err();
        assert!(err.is(StatusKind::InvalidArgument));
        assert_eq!(err.annotations().len(), 1);
        assert!(err.annotations()[0].contains("failing.boom"));
        assert_eq!(stack.used_bytes(), 0);
    }

    #[test]
    fn test_argument_check() {
        let module = NativeModule::builder("m")
            .export(
                "one",
                Signature::new(vec![ValueType::I32], vec![]),
                |_| Ok(vec![]),
            )
            .build();
        let mut stack = test_stack(&module);
        let err = module
            .begin_call(
                &mut stack,
                CallRecord {
                    function: resolved(&module, "one"),
                    arguments: vec![Value::F32(1.0)],
                },
            )
            .unwrap_err();
        assert!(err.is(StatusKind::InvalidArgument));
    }

    #[test]
    fn test_conv_string_derived() {
        let module = NativeModule::builder("m")
            .export(
                "f",
                Signature::new(vec![ValueType::Ref, ValueType::I32], vec![ValueType::Ref]),
                |_| Ok(vec![Value::Ref(Default::default())]),
            )
            .build();
        let decl = module
            .lookup_function_by_name(Linkage::Export, "f")
            .unwrap();
        assert_eq!(decl.conv, "0ri_r");
    }
}
