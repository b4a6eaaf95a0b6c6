//! The SPIR-V kernel module model.
//!
//! This is the structured form serialized into `vulkan-spirv-fb`
//! executable payloads: module-level globals (push constants, built-in
//! inputs, resource variables at (set, binding)), entry points with
//! workgroup sizes, and function bodies over virtual registers.

use tensile_base::{Status, StatusResult};
use tensile_io::{BinaryWriter, IoError, IoResult, MemoryReader};

/// Storage class of a module-level global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    PushConstant,
    StorageBuffer,
    Workgroup,
    Input,
}

/// Built-in input variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltIn {
    WorkgroupId,
    NumWorkgroups,
    LocalInvocationId,
    GlobalInvocationId,
}

/// Pointee types of globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpirvType {
    Index,
    F32,
    I32,
    Vec3U32,
    /// A struct wrapping an array of index-sized elements, the
    /// push-constant shape.
    IndexArrayStruct {
        count: usize,
    },
    /// A runtime array of f32, the storage-buffer shape.
    RuntimeArrayF32,
    /// A fixed workgroup-local tile.
    LocalArrayF32 {
        count: usize,
    },
}

/// One module-level global variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvGlobal {
    pub name: String,
    pub storage_class: StorageClass,
    pub pointee: SpirvType,
    pub built_in: Option<BuiltIn>,
    /// Descriptor coordinates for resource variables.
    pub set: Option<u32>,
    pub binding: Option<u32>,
    /// Set when several interface bindings share this (set, binding)
    /// within one function.
    pub aliased: bool,
}

/// An instruction operand: a virtual register or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u32),
    Imm(i64),
}

/// Scalar arithmetic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithKind {
    IAdd,
    IMul,
    IDiv,
    IMod,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    FExp,
}

/// Function-body instructions over virtual registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpirvInst {
    /// Indexed load from the push-constant struct global.
    PushConstantLoad { dst: u32, index: u32 },
    /// Extract of one component of a built-in input.
    BuiltInExtract {
        dst: u32,
        built_in: BuiltIn,
        component: u8,
    },
    Arith {
        kind: ArithKind,
        dst: u32,
        lhs: Operand,
        rhs: Operand,
    },
    /// Load from a resource or workgroup-local variable.
    BufferLoad {
        dst: u32,
        global: u32,
        index: Operand,
    },
    BufferStore {
        global: u32,
        index: Operand,
        src: u32,
    },
    Fma {
        dst: u32,
        a: u32,
        b: u32,
        acc: u32,
    },
    /// Structured loop; cyclic loops step by the processor count and
    /// guarded loops bound-check the induction variable.
    LoopBegin {
        induction: u32,
        extent: Operand,
        step: Operand,
        cyclic: bool,
        guarded: bool,
    },
    LoopEnd,
    /// Workgroup control barrier.
    Barrier,
    CoopMatLoad {
        dst: u32,
        global: u32,
        offset: Operand,
        stride: u32,
    },
    CoopMatMulAdd {
        dst: u32,
        a: u32,
        b: u32,
        acc: u32,
    },
    CoopMatStore {
        global: u32,
        offset: Operand,
        stride: u32,
        src: u32,
    },
}

/// One entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvEntryPoint {
    pub name: String,
    pub workgroup_size: [u32; 3],
}

/// One function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvFunc {
    pub name: String,
    pub body: Vec<SpirvInst>,
}

/// A lowered kernel module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpirvModule {
    pub globals: Vec<SpirvGlobal>,
    pub entry_points: Vec<SpirvEntryPoint>,
    pub funcs: Vec<SpirvFunc>,
}

impl SpirvModule {
    /// Finds a global by name.
    pub fn global(&self, name: &str) -> Option<&SpirvGlobal> {
        self.globals.iter().find(|global| global.name == name)
    }

    /// Globals in a storage class.
    pub fn globals_in(&self, storage_class: StorageClass) -> Vec<&SpirvGlobal> {
        self.globals
            .iter()
            .filter(|global| global.storage_class == storage_class)
            .collect()
    }

    /// Serializes into an executable payload.
    pub fn to_bytes(&self) -> StatusResult<Vec<u8>> {
        encode_module(self)
            .map_err(|e| Status::internal(format!("spirv payload encoding failed: {e}")))
    }

    /// Decodes an executable payload.
    pub fn from_bytes(data: &[u8]) -> StatusResult<Self> {
        decode_module(data)
            .map_err(|e| Status::invalid_argument(format!("malformed spirv payload: {e}")))
    }
}

fn storage_class_code(storage_class: StorageClass) -> u8 {
    match storage_class {
        StorageClass::PushConstant => 0,
        StorageClass::StorageBuffer => 1,
        StorageClass::Workgroup => 2,
        StorageClass::Input => 3,
    }
}

fn storage_class_from(code: u8) -> IoResult<StorageClass> {
    Ok(match code {
        0 => StorageClass::PushConstant,
        1 => StorageClass::StorageBuffer,
        2 => StorageClass::Workgroup,
        3 => StorageClass::Input,
        other => {
            return Err(IoError::invalid_data(
                "storage class",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn built_in_code(built_in: BuiltIn) -> u8 {
    match built_in {
        BuiltIn::WorkgroupId => 0,
        BuiltIn::NumWorkgroups => 1,
        BuiltIn::LocalInvocationId => 2,
        BuiltIn::GlobalInvocationId => 3,
    }
}

fn built_in_from(code: u8) -> IoResult<BuiltIn> {
    Ok(match code {
        0 => BuiltIn::WorkgroupId,
        1 => BuiltIn::NumWorkgroups,
        2 => BuiltIn::LocalInvocationId,
        3 => BuiltIn::GlobalInvocationId,
        other => {
            return Err(IoError::invalid_data(
                "built-in",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn encode_type(ty: &SpirvType, writer: &mut BinaryWriter) -> IoResult<()> {
    match ty {
        SpirvType::Index => writer.write_u8(0),
        SpirvType::F32 => writer.write_u8(1),
        SpirvType::I32 => writer.write_u8(2),
        SpirvType::Vec3U32 => writer.write_u8(3),
        SpirvType::IndexArrayStruct { count } => {
            writer.write_u8(4)?;
            writer.write_var_u64(*count as u64)
        }
        SpirvType::RuntimeArrayF32 => writer.write_u8(5),
        SpirvType::LocalArrayF32 { count } => {
            writer.write_u8(6)?;
            writer.write_var_u64(*count as u64)
        }
    }
}

fn decode_type(reader: &mut MemoryReader<'_>) -> IoResult<SpirvType> {
    Ok(match reader.read_u8()? {
        0 => SpirvType::Index,
        1 => SpirvType::F32,
        2 => SpirvType::I32,
        3 => SpirvType::Vec3U32,
        4 => SpirvType::IndexArrayStruct {
            count: reader.read_var_u64()? as usize,
        },
        5 => SpirvType::RuntimeArrayF32,
        6 => SpirvType::LocalArrayF32 {
            count: reader.read_var_u64()? as usize,
        },
        other => {
            return Err(IoError::invalid_data(
                "spirv type",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn encode_operand(operand: Operand, writer: &mut BinaryWriter) -> IoResult<()> {
    match operand {
        Operand::Reg(reg) => {
            writer.write_u8(0)?;
            writer.write_u32(reg)
        }
        Operand::Imm(value) => {
            writer.write_u8(1)?;
            writer.write_i64(value)
        }
    }
}

fn decode_operand(reader: &mut MemoryReader<'_>) -> IoResult<Operand> {
    Ok(match reader.read_u8()? {
        0 => Operand::Reg(reader.read_u32()?),
        1 => Operand::Imm(reader.read_i64()?),
        other => {
            return Err(IoError::invalid_data(
                "operand",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn encode_inst(inst: &SpirvInst, writer: &mut BinaryWriter) -> IoResult<()> {
    match inst {
        SpirvInst::PushConstantLoad { dst, index } => {
            writer.write_u8(0)?;
            writer.write_u32(*dst)?;
            writer.write_u32(*index)
        }
        SpirvInst::BuiltInExtract {
            dst,
            built_in,
            component,
        } => {
            writer.write_u8(1)?;
            writer.write_u32(*dst)?;
            writer.write_u8(built_in_code(*built_in))?;
            writer.write_u8(*component)
        }
        SpirvInst::Arith { kind, dst, lhs, rhs } => {
            writer.write_u8(2)?;
            writer.write_u8(*kind as u8)?;
            writer.write_u32(*dst)?;
            encode_operand(*lhs, writer)?;
            encode_operand(*rhs, writer)
        }
        SpirvInst::BufferLoad { dst, global, index } => {
            writer.write_u8(3)?;
            writer.write_u32(*dst)?;
            writer.write_u32(*global)?;
            encode_operand(*index, writer)
        }
        SpirvInst::BufferStore { global, index, src } => {
            writer.write_u8(4)?;
            writer.write_u32(*global)?;
            encode_operand(*index, writer)?;
            writer.write_u32(*src)
        }
        SpirvInst::Fma { dst, a, b, acc } => {
            writer.write_u8(5)?;
            writer.write_u32(*dst)?;
            writer.write_u32(*a)?;
            writer.write_u32(*b)?;
            writer.write_u32(*acc)
        }
        SpirvInst::LoopBegin {
            induction,
            extent,
            step,
            cyclic,
            guarded,
        } => {
            writer.write_u8(6)?;
            writer.write_u32(*induction)?;
            encode_operand(*extent, writer)?;
            encode_operand(*step, writer)?;
            writer.write_bool(*cyclic)?;
            writer.write_bool(*guarded)
        }
        SpirvInst::LoopEnd => writer.write_u8(7),
        SpirvInst::Barrier => writer.write_u8(8),
        SpirvInst::CoopMatLoad {
            dst,
            global,
            offset,
            stride,
        } => {
            writer.write_u8(9)?;
            writer.write_u32(*dst)?;
            writer.write_u32(*global)?;
            encode_operand(*offset, writer)?;
            writer.write_u32(*stride)
        }
        SpirvInst::CoopMatMulAdd { dst, a, b, acc } => {
            writer.write_u8(10)?;
            writer.write_u32(*dst)?;
            writer.write_u32(*a)?;
            writer.write_u32(*b)?;
            writer.write_u32(*acc)
        }
        SpirvInst::CoopMatStore {
            global,
            offset,
            stride,
            src,
        } => {
            writer.write_u8(11)?;
            writer.write_u32(*global)?;
            encode_operand(*offset, writer)?;
            writer.write_u32(*stride)?;
            writer.write_u32(*src)
        }
    }
}

fn decode_arith_kind(code: u8) -> IoResult<ArithKind> {
    Ok(match code {
        0 => ArithKind::IAdd,
        1 => ArithKind::IMul,
        2 => ArithKind::IDiv,
        3 => ArithKind::IMod,
        4 => ArithKind::FAdd,
        5 => ArithKind::FSub,
        6 => ArithKind::FMul,
        7 => ArithKind::FDiv,
        8 => ArithKind::FMin,
        9 => ArithKind::FMax,
        10 => ArithKind::FExp,
        other => {
            return Err(IoError::invalid_data(
                "arith kind",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn decode_inst(reader: &mut MemoryReader<'_>) -> IoResult<SpirvInst> {
    Ok(match reader.read_u8()? {
        0 => SpirvInst::PushConstantLoad {
            dst: reader.read_u32()?,
            index: reader.read_u32()?,
        },
        1 => SpirvInst::BuiltInExtract {
            dst: reader.read_u32()?,
            built_in: built_in_from(reader.read_u8()?)?,
            component: reader.read_u8()?,
        },
        2 => SpirvInst::Arith {
            kind: decode_arith_kind(reader.read_u8()?)?,
            dst: reader.read_u32()?,
            lhs: decode_operand(reader)?,
            rhs: decode_operand(reader)?,
        },
        3 => SpirvInst::BufferLoad {
            dst: reader.read_u32()?,
            global: reader.read_u32()?,
            index: decode_operand(reader)?,
        },
        4 => SpirvInst::BufferStore {
            global: reader.read_u32()?,
            index: decode_operand(reader)?,
            src: reader.read_u32()?,
        },
        5 => SpirvInst::Fma {
            dst: reader.read_u32()?,
            a: reader.read_u32()?,
            b: reader.read_u32()?,
            acc: reader.read_u32()?,
        },
        6 => SpirvInst::LoopBegin {
            induction: reader.read_u32()?,
            extent: decode_operand(reader)?,
            step: decode_operand(reader)?,
            cyclic: reader.read_bool()?,
            guarded: reader.read_bool()?,
        },
        7 => SpirvInst::LoopEnd,
        8 => SpirvInst::Barrier,
        9 => SpirvInst::CoopMatLoad {
            dst: reader.read_u32()?,
            global: reader.read_u32()?,
            offset: decode_operand(reader)?,
            stride: reader.read_u32()?,
        },
        10 => SpirvInst::CoopMatMulAdd {
            dst: reader.read_u32()?,
            a: reader.read_u32()?,
            b: reader.read_u32()?,
            acc: reader.read_u32()?,
        },
        11 => SpirvInst::CoopMatStore {
            global: reader.read_u32()?,
            offset: decode_operand(reader)?,
            stride: reader.read_u32()?,
            src: reader.read_u32()?,
        },
        other => {
            return Err(IoError::invalid_data(
                "spirv inst",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn encode_module(module: &SpirvModule) -> IoResult<Vec<u8>> {
    let mut writer = BinaryWriter::with_capacity(1024);
    writer.write_var_u64(module.globals.len() as u64)?;
    for global in &module.globals {
        writer.write_string(&global.name)?;
        writer.write_u8(storage_class_code(global.storage_class))?;
        encode_type(&global.pointee, &mut writer)?;
        match global.built_in {
            Some(built_in) => {
                writer.write_bool(true)?;
                writer.write_u8(built_in_code(built_in))?;
            }
            None => writer.write_bool(false)?,
        }
        writer.write_bool(global.set.is_some())?;
        if let (Some(set), Some(binding)) = (global.set, global.binding) {
            writer.write_u32(set)?;
            writer.write_u32(binding)?;
        }
        writer.write_bool(global.aliased)?;
    }
    writer.write_var_u64(module.entry_points.len() as u64)?;
    for entry in &module.entry_points {
        writer.write_string(&entry.name)?;
        for &extent in &entry.workgroup_size {
            writer.write_u32(extent)?;
        }
    }
    writer.write_var_u64(module.funcs.len() as u64)?;
    for func in &module.funcs {
        writer.write_string(&func.name)?;
        writer.write_var_u64(func.body.len() as u64)?;
        for inst in &func.body {
            encode_inst(inst, &mut writer)?;
        }
    }
    Ok(writer.into_bytes())
}

fn decode_module(data: &[u8]) -> IoResult<SpirvModule> {
    let mut reader = MemoryReader::new(data);
    let global_count = reader.read_var_u64_capped("global count", 4096)? as usize;
    let mut globals = Vec::with_capacity(global_count);
    for _ in 0..global_count {
        let name = reader.read_string()?;
        let storage_class = storage_class_from(reader.read_u8()?)?;
        let pointee = decode_type(&mut reader)?;
        let built_in = if reader.read_bool()? {
            Some(built_in_from(reader.read_u8()?)?)
        } else {
            None
        };
        let (set, binding) = if reader.read_bool()? {
            (Some(reader.read_u32()?), Some(reader.read_u32()?))
        } else {
            (None, None)
        };
        let aliased = reader.read_bool()?;
        globals.push(SpirvGlobal {
            name,
            storage_class,
            pointee,
            built_in,
            set,
            binding,
            aliased,
        });
    }
    let entry_count = reader.read_var_u64_capped("entry count", 256)? as usize;
    let mut entry_points = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let name = reader.read_string()?;
        let workgroup_size = [reader.read_u32()?, reader.read_u32()?, reader.read_u32()?];
        entry_points.push(SpirvEntryPoint {
            name,
            workgroup_size,
        });
    }
    let func_count = reader.read_var_u64_capped("func count", 256)? as usize;
    let mut funcs = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        let name = reader.read_string()?;
        let inst_count = reader.read_var_u64_capped("inst count", 1 << 20)? as usize;
        let mut body = Vec::with_capacity(inst_count);
        for _ in 0..inst_count {
            body.push(decode_inst(&mut reader)?);
        }
        funcs.push(SpirvFunc { name, body });
    }
    Ok(SpirvModule {
        globals,
        entry_points,
        funcs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_roundtrip() {
        let module = SpirvModule {
            globals: vec![
                SpirvGlobal {
                    name: "push_constants".into(),
                    storage_class: StorageClass::PushConstant,
                    pointee: SpirvType::IndexArrayStruct { count: 2 },
                    built_in: None,
                    set: None,
                    binding: None,
                    aliased: false,
                },
                SpirvGlobal {
                    name: "binding0".into(),
                    storage_class: StorageClass::StorageBuffer,
                    pointee: SpirvType::RuntimeArrayF32,
                    built_in: None,
                    set: Some(0),
                    binding: Some(0),
                    aliased: true,
                },
            ],
            entry_points: vec![SpirvEntryPoint {
                name: "main_dispatch_0".into(),
                workgroup_size: [64, 1, 1],
            }],
            funcs: vec![SpirvFunc {
                name: "main_dispatch_0".into(),
                body: vec![
                    SpirvInst::PushConstantLoad { dst: 0, index: 1 },
                    SpirvInst::BuiltInExtract {
                        dst: 1,
                        built_in: BuiltIn::WorkgroupId,
                        component: 0,
                    },
                    SpirvInst::LoopBegin {
                        induction: 2,
                        extent: Operand::Reg(0),
                        step: Operand::Imm(1),
                        cyclic: true,
                        guarded: false,
                    },
                    SpirvInst::BufferLoad {
                        dst: 3,
                        global: 1,
                        index: Operand::Reg(2),
                    },
                    SpirvInst::Fma {
                        dst: 4,
                        a: 3,
                        b: 3,
                        acc: 3,
                    },
                    SpirvInst::BufferStore {
                        global: 1,
                        index: Operand::Reg(2),
                        src: 4,
                    },
                    SpirvInst::LoopEnd,
                ],
            }],
        };
        let bytes = module.to_bytes().unwrap();
        assert_eq!(SpirvModule::from_bytes(&bytes).unwrap(), module);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(SpirvModule::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
