//! Bytecode modules: tables, per-context state, and the module-interface
//! implementation backed by the interpreter.

use std::any::Any;
use std::sync::Arc;

use hashbrown::HashMap;

use bytes::Bytes;
use tensile_base::{SourceLocation, Status, StatusResult};

use crate::bytecode::dispatch;
use crate::bytecode::opcode::Instruction;
use crate::function::{FunctionDecl, Linkage, ResolvedFunction, Signature};
use crate::module::{CallRecord, Module, ModuleSignature, ModuleState};
use crate::stack::{Frame, Stack};
use crate::value::{Value, ValueType};

/// Optional per-function debug info: a source file and a sorted
/// `pc -> line` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionDebug {
    pub source_file: Option<String>,
    /// Sorted by pc; the entry with the largest pc not above the query
    /// wins.
    pub lines: Vec<(u32, u32)>,
}

impl FunctionDebug {
    /// Resolves the source line covering `pc`.
    pub fn resolve(&self, pc: usize) -> Option<SourceLocation> {
        let file = self.source_file.as_ref()?;
        let mut best = None;
        for &(entry_pc, line) in &self.lines {
            if entry_pc as usize <= pc {
                best = Some(line);
            } else {
                break;
            }
        }
        best.map(|line| SourceLocation::new(file.clone(), line))
    }
}

/// One compiled function.
#[derive(Debug, Clone)]
pub struct BytecodeFunction {
    pub decl: Arc<FunctionDecl>,
    pub register_count: u16,
    pub code: Vec<Instruction>,
    pub debug: FunctionDebug,
}

/// One rodata segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RodataEntry {
    pub data: Bytes,
    pub alignment: u32,
    pub mime_type: Option<String>,
}

/// One module-level mutable global slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: ValueType,
}

/// One per-target executable payload, keyed by a device filter pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPayload {
    pub filter_pattern: String,
    pub format: String,
    pub data: Bytes,
}

/// A loadable unit of compiled bytecode.
#[derive(Debug)]
pub struct BytecodeModule {
    pub(crate) name: String,
    pub(crate) imports: Vec<Arc<FunctionDecl>>,
    pub(crate) exports: Vec<Arc<BytecodeFunction>>,
    pub(crate) internals: Vec<Arc<BytecodeFunction>>,
    pub(crate) rodata: Vec<RodataEntry>,
    pub(crate) globals: Vec<GlobalDecl>,
    pub(crate) targets: Vec<TargetPayload>,
    export_index: HashMap<String, usize>,
}

impl BytecodeModule {
    pub(crate) fn new(
        name: String,
        imports: Vec<Arc<FunctionDecl>>,
        exports: Vec<Arc<BytecodeFunction>>,
        internals: Vec<Arc<BytecodeFunction>>,
        rodata: Vec<RodataEntry>,
        globals: Vec<GlobalDecl>,
        targets: Vec<TargetPayload>,
    ) -> Self {
        let export_index = exports
            .iter()
            .enumerate()
            .map(|(index, function)| (function.decl.name.clone(), index))
            .collect();
        Self {
            name,
            imports,
            exports,
            internals,
            rodata,
            globals,
            targets,
            export_index,
        }
    }

    /// Import declarations in ordinal order.
    pub fn imports(&self) -> &[Arc<FunctionDecl>] {
        &self.imports
    }

    /// Exported functions in ordinal order.
    pub fn exports(&self) -> &[Arc<BytecodeFunction>] {
        &self.exports
    }

    /// Internal functions in ordinal order.
    pub fn internals(&self) -> &[Arc<BytecodeFunction>] {
        &self.internals
    }

    /// Rodata segments in index order.
    pub fn rodata(&self) -> &[RodataEntry] {
        &self.rodata
    }

    /// Global declarations in slot order.
    pub fn globals(&self) -> &[GlobalDecl] {
        &self.globals
    }

    /// Per-target executable payloads.
    pub fn targets(&self) -> &[TargetPayload] {
        &self.targets
    }

    pub(crate) fn function_for(
        &self,
        linkage: Linkage,
        ordinal: usize,
    ) -> StatusResult<&Arc<BytecodeFunction>> {
        let table = match linkage {
            Linkage::Export => &self.exports,
            Linkage::Internal => &self.internals,
            Linkage::Import => {
                return Err(Status::invalid_argument(format!(
                    "imports of module '{}' have no body",
                    self.name
                )))
            }
        };
        table.get(ordinal).ok_or_else(|| {
            Status::out_of_range(format!(
                "module '{}' has no {linkage} function at ordinal {ordinal}",
                self.name
            ))
        })
    }
}

/// Per-context state: resolved import slots plus global storage.
pub struct BytecodeState {
    pub(crate) imports: Vec<Option<ResolvedFunction>>,
    pub(crate) globals: Vec<Value>,
}

impl ModuleState for BytecodeState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Module for BytecodeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> ModuleSignature {
        ModuleSignature {
            import_count: self.imports.len(),
            export_count: self.exports.len(),
            internal_count: self.internals.len(),
        }
    }

    fn lookup_function_by_name(
        &self,
        linkage: Linkage,
        name: &str,
    ) -> StatusResult<Arc<FunctionDecl>> {
        match linkage {
            Linkage::Export => self
                .export_index
                .get(name)
                .map(|&index| Arc::clone(&self.exports[index].decl))
                .ok_or_else(|| {
                    Status::not_found(format!(
                        "module '{}' has no export '{name}'",
                        self.name
                    ))
                }),
            Linkage::Internal => self
                .internals
                .iter()
                .find(|function| function.decl.name == name)
                .map(|function| Arc::clone(&function.decl))
                .ok_or_else(|| {
                    Status::not_found(format!(
                        "module '{}' has no internal function '{name}'",
                        self.name
                    ))
                }),
            Linkage::Import => self
                .imports
                .iter()
                .find(|decl| decl.name == name)
                .map(Arc::clone)
                .ok_or_else(|| {
                    Status::not_found(format!(
                        "module '{}' has no import '{name}'",
                        self.name
                    ))
                }),
        }
    }

    fn lookup_function_by_ordinal(
        &self,
        linkage: Linkage,
        ordinal: usize,
    ) -> StatusResult<Arc<FunctionDecl>> {
        match linkage {
            Linkage::Import => self.imports.get(ordinal).map(Arc::clone).ok_or_else(|| {
                Status::out_of_range(format!(
                    "module '{}' import ordinal {ordinal} out of range",
                    self.name
                ))
            }),
            _ => Ok(Arc::clone(&self.function_for(linkage, ordinal)?.decl)),
        }
    }

    fn alloc_state(&self) -> StatusResult<Box<dyn ModuleState>> {
        Ok(Box::new(BytecodeState {
            imports: vec![None; self.imports.len()],
            globals: self
                .globals
                .iter()
                .map(|decl| Value::default_for(decl.ty))
                .collect(),
        }))
    }

    fn resolve_import(
        &self,
        state: &mut dyn ModuleState,
        import_index: usize,
        target: ResolvedFunction,
        expected: &Signature,
    ) -> StatusResult<()> {
        if target.decl.signature != *expected {
            return Err(Status::failed_precondition(format!(
                "import {import_index} of module '{}' expects a different signature \
                 than '{}' exports",
                self.name,
                target.qualified_name()
            )));
        }
        let state = state
            .as_any_mut()
            .downcast_mut::<BytecodeState>()
            .ok_or_else(|| Status::internal("module state type confusion"))?;
        let slot = state.imports.get_mut(import_index).ok_or_else(|| {
            Status::out_of_range(format!(
                "module '{}' import ordinal {import_index} out of range",
                self.name
            ))
        })?;
        *slot = Some(target);
        Ok(())
    }

    fn begin_call(&self, stack: &mut Stack, call: CallRecord) -> StatusResult<Vec<Value>> {
        let function = Arc::clone(self.function_for(
            call.function.decl.linkage,
            call.function.decl.ordinal,
        )?);
        dispatch::execute(self, stack, &function, call)
    }

    fn resolve_source_location(&self, frame: &Frame) -> Option<SourceLocation> {
        let function = self
            .function_for(frame.function.decl.linkage, frame.function.decl.ordinal)
            .ok()?;
        function.debug.resolve(frame.pc)
    }
}
