//! Builders for bytecode modules and functions.
//!
//! The compiler's VM emission and the test suites assemble modules
//! through these builders; build-time validation catches malformed
//! register, rodata, global, and branch references before a module can
//! be instantiated.

use std::sync::Arc;

use bytes::Bytes;
use tensile_base::{Status, StatusKind, StatusResult};

use crate::bytecode::module::{
    BytecodeFunction, BytecodeModule, FunctionDebug, GlobalDecl, RodataEntry, TargetPayload,
};
use crate::bytecode::opcode::Instruction;
use crate::convention::ConvString;
use crate::function::{FunctionDecl, Linkage, Signature};
use crate::value::ValueType;

/// Handle to a declared import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportId(pub u32);

/// Handle to a rodata segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RodataId(pub u32);

/// Handle to a module global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalId(pub u32);

/// Handle to a not-yet-bound branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct ImportSpec {
    full_name: String,
    signature: Signature,
    conv: String,
}

/// Builds one function body.
pub struct FunctionBuilder {
    name: String,
    signature: Signature,
    next_register: u32,
    code: Vec<Instruction>,
    labels: Vec<Option<u32>>,
    debug: FunctionDebug,
}

impl FunctionBuilder {
    /// Starts a function; argument registers are allocated up front in
    /// signature order.
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        let next_register = signature.args().len() as u32;
        Self {
            name: name.into(),
            signature,
            next_register,
            code: Vec::new(),
            labels: Vec::new(),
            debug: FunctionDebug::default(),
        }
    }

    /// Attaches a source file for debug info.
    pub fn source_file(&mut self, file: impl Into<String>) -> &mut Self {
        self.debug.source_file = Some(file.into());
        self
    }

    /// Records that instructions emitted from now on map to `line`.
    pub fn source_line(&mut self, line: u32) -> &mut Self {
        self.debug.lines.push((self.code.len() as u32, line));
        self
    }

    /// The register holding argument `index`.
    pub fn arg(&self, index: usize) -> u16 {
        index as u16
    }

    /// Allocates a fresh register.
    pub fn new_register(&mut self) -> u16 {
        let register = self.next_register;
        self.next_register += 1;
        register as u16
    }

    /// Creates an unbound label.
    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the next emitted instruction.
    pub fn bind_label(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len() as u32);
    }

    pub fn const_i32(&mut self, value: i32) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ConstI32 { dst, value });
        dst
    }

    pub fn const_i64(&mut self, value: i64) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ConstI64 { dst, value });
        dst
    }

    pub fn const_f32(&mut self, value: f32) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ConstF32 { dst, value });
        dst
    }

    pub fn const_f64(&mut self, value: f64) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ConstF64 { dst, value });
        dst
    }

    pub fn const_rodata(&mut self, rodata: RodataId) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ConstRodata {
            dst,
            rodata: rodata.0,
        });
        dst
    }

    pub fn move_value(&mut self, dst: u16, src: u16) {
        self.code.push(Instruction::Move { dst, src });
    }

    pub fn add_i32(&mut self, lhs: u16, rhs: u16) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::AddI32 { dst, lhs, rhs });
        dst
    }

    pub fn sub_i32(&mut self, lhs: u16, rhs: u16) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::SubI32 { dst, lhs, rhs });
        dst
    }

    pub fn mul_i32(&mut self, lhs: u16, rhs: u16) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::MulI32 { dst, lhs, rhs });
        dst
    }

    pub fn cmp_eq_i32(&mut self, lhs: u16, rhs: u16) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::CmpEqI32 { dst, lhs, rhs });
        dst
    }

    pub fn branch(&mut self, target: Label) {
        self.code.push(Instruction::Branch {
            target: target.0 as u32,
        });
    }

    pub fn cond_branch(&mut self, cond: u16, true_target: Label, false_target: Label) {
        self.code.push(Instruction::CondBranch {
            cond,
            true_target: true_target.0 as u32,
            false_target: false_target.0 as u32,
        });
    }

    pub fn global_load(&mut self, global: GlobalId) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::GlobalLoad {
            dst,
            global: global.0,
        });
        dst
    }

    pub fn global_store(&mut self, global: GlobalId, src: u16) {
        self.code.push(Instruction::GlobalStore {
            global: global.0,
            src,
        });
    }

    pub fn list_alloc(&mut self, capacity: u16) -> u16 {
        let dst = self.new_register();
        self.code.push(Instruction::ListAlloc { dst, capacity });
        dst
    }

    pub fn list_push(&mut self, list: u16, value: u16) {
        self.code.push(Instruction::ListPush { list, value });
    }

    /// Emits a call to an import, allocating result registers.
    pub fn call_import(
        &mut self,
        import: ImportId,
        args: &[u16],
        result_count: usize,
    ) -> Vec<u16> {
        let results: Vec<u16> = (0..result_count).map(|_| self.new_register()).collect();
        self.code.push(Instruction::CallImport {
            import: import.0,
            args: args.to_vec(),
            results: results.clone(),
        });
        results
    }

    /// Emits a call to an internal function, allocating result registers.
    pub fn call_internal(
        &mut self,
        ordinal: u32,
        args: &[u16],
        result_count: usize,
    ) -> Vec<u16> {
        let results: Vec<u16> = (0..result_count).map(|_| self.new_register()).collect();
        self.code.push(Instruction::CallInternal {
            ordinal,
            args: args.to_vec(),
            results: results.clone(),
        });
        results
    }

    pub fn ret(&mut self, values: &[u16]) {
        self.code.push(Instruction::Return {
            values: values.to_vec(),
        });
    }

    pub fn fail(&mut self, kind: StatusKind, message: impl Into<String>) {
        self.code.push(Instruction::Fail {
            kind,
            message: message.into(),
        });
    }

    /// Resolves labels to instruction offsets.
    fn finish(mut self) -> StatusResult<(String, Signature, u16, Vec<Instruction>, FunctionDebug)>
    {
        let resolve = |label: u32, labels: &[Option<u32>]| -> StatusResult<u32> {
            labels
                .get(label as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    Status::internal(format!("unbound label {label} in function"))
                })
        };
        for instruction in &mut self.code {
            match instruction {
                Instruction::Branch { target } => {
                    *target = resolve(*target, &self.labels)?;
                }
                Instruction::CondBranch {
                    true_target,
                    false_target,
                    ..
                } => {
                    *true_target = resolve(*true_target, &self.labels)?;
                    *false_target = resolve(*false_target, &self.labels)?;
                }
                _ => {}
            }
        }
        if self.next_register > u16::MAX as u32 + 1 {
            return Err(Status::resource_exhausted(format!(
                "function '{}' needs {} registers",
                self.name, self.next_register
            )));
        }
        Ok((
            self.name,
            self.signature,
            self.next_register as u16,
            self.code,
            self.debug,
        ))
    }
}

/// Builds a [`BytecodeModule`].
pub struct ModuleBuilder {
    name: String,
    imports: Vec<ImportSpec>,
    exports: Vec<FunctionBuilder>,
    internals: Vec<FunctionBuilder>,
    rodata: Vec<RodataEntry>,
    globals: Vec<GlobalDecl>,
    targets: Vec<TargetPayload>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            exports: Vec::new(),
            internals: Vec::new(),
            rodata: Vec::new(),
            globals: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Declares an import by fully qualified `module.function` name.
    /// The conv string is derived canonically from the signature.
    pub fn import(&mut self, full_name: impl Into<String>, signature: Signature) -> ImportId {
        let conv = ConvString::for_signature(&signature).as_str().to_string();
        self.imports.push(ImportSpec {
            full_name: full_name.into(),
            signature,
            conv,
        });
        ImportId(self.imports.len() as u32 - 1)
    }

    /// Adds a rodata segment.
    pub fn rodata(
        &mut self,
        data: impl Into<Bytes>,
        alignment: u32,
        mime_type: Option<String>,
    ) -> RodataId {
        self.rodata.push(RodataEntry {
            data: data.into(),
            alignment,
            mime_type,
        });
        RodataId(self.rodata.len() as u32 - 1)
    }

    /// Declares a module global.
    pub fn global(&mut self, name: impl Into<String>, ty: ValueType) -> GlobalId {
        self.globals.push(GlobalDecl {
            name: name.into(),
            ty,
        });
        GlobalId(self.globals.len() as u32 - 1)
    }

    /// Adds a per-target executable payload.
    pub fn target_payload(
        &mut self,
        filter_pattern: impl Into<String>,
        format: impl Into<String>,
        data: impl Into<Bytes>,
    ) {
        self.targets.push(TargetPayload {
            filter_pattern: filter_pattern.into(),
            format: format.into(),
            data: data.into(),
        });
    }

    /// Adds an exported function.
    pub fn export_function(&mut self, function: FunctionBuilder) {
        self.exports.push(function);
    }

    /// Adds an internal function; returns its ordinal.
    pub fn internal_function(&mut self, function: FunctionBuilder) -> u32 {
        self.internals.push(function);
        self.internals.len() as u32 - 1
    }

    /// Validates and builds the module.
    pub fn build(self) -> StatusResult<Arc<BytecodeModule>> {
        let imports: Vec<Arc<FunctionDecl>> = self
            .imports
            .into_iter()
            .enumerate()
            .map(|(ordinal, spec)| {
                Arc::new(FunctionDecl {
                    name: spec.full_name,
                    linkage: Linkage::Import,
                    ordinal,
                    signature: spec.signature,
                    conv: spec.conv,
                })
            })
            .collect();

        let finish_table = |builders: Vec<FunctionBuilder>,
                            linkage: Linkage|
         -> StatusResult<Vec<Arc<BytecodeFunction>>> {
            builders
                .into_iter()
                .enumerate()
                .map(|(ordinal, builder)| {
                    let (name, signature, register_count, code, debug) = builder.finish()?;
                    let conv = ConvString::for_signature(&signature).as_str().to_string();
                    Ok(Arc::new(BytecodeFunction {
                        decl: Arc::new(FunctionDecl {
                            name,
                            linkage,
                            ordinal,
                            signature,
                            conv,
                        }),
                        register_count,
                        code,
                        debug,
                    }))
                })
                .collect()
        };

        let exports = finish_table(self.exports, Linkage::Export)?;
        let internals = finish_table(self.internals, Linkage::Internal)?;

        let module = BytecodeModule::new(
            self.name,
            imports,
            exports,
            internals,
            self.rodata,
            self.globals,
            self.targets,
        );
        validate(&module)?;
        Ok(Arc::new(module))
    }
}

/// Structural validation of a finished module.
fn validate(module: &BytecodeModule) -> StatusResult<()> {
    let import_count = module.imports().len() as u32;
    let rodata_count = module.rodata().len() as u32;
    let global_count = module.globals().len() as u32;
    for function in module.exports().iter().chain(module.internals()) {
        let code_len = function.code.len() as u32;
        for (pc, instruction) in function.code.iter().enumerate() {
            let check = |ok: bool, what: &str, index: u32| -> StatusResult<()> {
                if ok {
                    Ok(())
                } else {
                    Err(Status::invalid_argument(format!(
                        "function '{}' pc {pc}: {what} {index} out of range",
                        function.decl.name
                    )))
                }
            };
            match instruction {
                Instruction::ConstRodata { rodata, .. } => {
                    check(*rodata < rodata_count, "rodata", *rodata)?;
                }
                Instruction::Branch { target } => {
                    check(*target < code_len, "branch target", *target)?;
                }
                Instruction::CondBranch {
                    true_target,
                    false_target,
                    ..
                } => {
                    check(*true_target < code_len, "branch target", *true_target)?;
                    check(*false_target < code_len, "branch target", *false_target)?;
                }
                Instruction::GlobalLoad { global, .. }
                | Instruction::GlobalStore { global, .. } => {
                    check(*global < global_count, "global", *global)?;
                }
                Instruction::CallImport { import, .. } => {
                    check(*import < import_count, "import", *import)?;
                }
                Instruction::CallInternal { ordinal, .. } => {
                    check(
                        (*ordinal as usize) < module.internals().len(),
                        "internal ordinal",
                        *ordinal,
                    )?;
                }
                _ => {}
            }
        }
        if function.code.is_empty() {
            return Err(Status::invalid_argument(format!(
                "function '{}' has an empty body",
                function.decl.name
            )));
        }
    }
    Ok(())
}
