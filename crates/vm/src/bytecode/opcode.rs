//! The register-based instruction set and its binary encoding.
//!
//! Instructions address registers in the current frame payload by index.
//! Branch targets are instruction indices within the function body.

use tensile_base::StatusKind;
use tensile_io::{BinaryWriter, IoError, IoResult, MemoryReader};

/// Opcode bytes used by the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    ConstI32 = 0x01,
    ConstI64 = 0x02,
    ConstF32 = 0x03,
    ConstF64 = 0x04,
    ConstRodata = 0x05,
    Move = 0x06,
    AddI32 = 0x10,
    SubI32 = 0x11,
    MulI32 = 0x12,
    CmpEqI32 = 0x13,
    Branch = 0x20,
    CondBranch = 0x21,
    GlobalLoad = 0x30,
    GlobalStore = 0x31,
    ListAlloc = 0x38,
    ListPush = 0x39,
    CallImport = 0x40,
    CallInternal = 0x41,
    Return = 0x42,
    Fail = 0x43,
}

impl Opcode {
    fn from_byte(byte: u8) -> IoResult<Self> {
        Ok(match byte {
            0x01 => Opcode::ConstI32,
            0x02 => Opcode::ConstI64,
            0x03 => Opcode::ConstF32,
            0x04 => Opcode::ConstF64,
            0x05 => Opcode::ConstRodata,
            0x06 => Opcode::Move,
            0x10 => Opcode::AddI32,
            0x11 => Opcode::SubI32,
            0x12 => Opcode::MulI32,
            0x13 => Opcode::CmpEqI32,
            0x20 => Opcode::Branch,
            0x21 => Opcode::CondBranch,
            0x30 => Opcode::GlobalLoad,
            0x31 => Opcode::GlobalStore,
            0x38 => Opcode::ListAlloc,
            0x39 => Opcode::ListPush,
            0x40 => Opcode::CallImport,
            0x41 => Opcode::CallInternal,
            0x42 => Opcode::Return,
            0x43 => Opcode::Fail,
            other => {
                return Err(IoError::invalid_data(
                    "opcode",
                    format!("unknown opcode {other:#04x}"),
                ))
            }
        })
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    ConstI32 { dst: u16, value: i32 },
    ConstI64 { dst: u16, value: i64 },
    ConstF32 { dst: u16, value: f32 },
    ConstF64 { dst: u16, value: f64 },
    /// Loads a `VmBytes` ref over a rodata segment.
    ConstRodata { dst: u16, rodata: u32 },
    Move { dst: u16, src: u16 },
    AddI32 { dst: u16, lhs: u16, rhs: u16 },
    SubI32 { dst: u16, lhs: u16, rhs: u16 },
    MulI32 { dst: u16, lhs: u16, rhs: u16 },
    /// `dst = (lhs == rhs) as i32`
    CmpEqI32 { dst: u16, lhs: u16, rhs: u16 },
    Branch { target: u32 },
    CondBranch { cond: u16, true_target: u32, false_target: u32 },
    GlobalLoad { dst: u16, global: u32 },
    GlobalStore { global: u32, src: u16 },
    ListAlloc { dst: u16, capacity: u16 },
    ListPush { list: u16, value: u16 },
    CallImport { import: u32, args: Vec<u16>, results: Vec<u16> },
    CallInternal { ordinal: u32, args: Vec<u16>, results: Vec<u16> },
    Return { values: Vec<u16> },
    /// Raises a status of the given kind at the current PC.
    Fail { kind: StatusKind, message: String },
}

/// Maps a status kind to its wire code.
pub fn status_kind_code(kind: StatusKind) -> u8 {
    match kind {
        StatusKind::InvalidArgument => 1,
        StatusKind::NotFound => 2,
        StatusKind::AlreadyExists => 3,
        StatusKind::FailedPrecondition => 4,
        StatusKind::OutOfRange => 5,
        StatusKind::ResourceExhausted => 6,
        StatusKind::Unimplemented => 7,
        StatusKind::Internal => 8,
        StatusKind::DeadlineExceeded => 9,
        StatusKind::Aborted => 10,
        StatusKind::Unavailable => 11,
    }
}

/// Maps a wire code back to a status kind.
pub fn status_kind_from_code(code: u8) -> IoResult<StatusKind> {
    Ok(match code {
        1 => StatusKind::InvalidArgument,
        2 => StatusKind::NotFound,
        3 => StatusKind::AlreadyExists,
        4 => StatusKind::FailedPrecondition,
        5 => StatusKind::OutOfRange,
        6 => StatusKind::ResourceExhausted,
        7 => StatusKind::Unimplemented,
        8 => StatusKind::Internal,
        9 => StatusKind::DeadlineExceeded,
        10 => StatusKind::Aborted,
        11 => StatusKind::Unavailable,
        other => {
            return Err(IoError::invalid_data(
                "status kind",
                format!("unknown code {other}"),
            ))
        }
    })
}

fn write_reg_list(writer: &mut BinaryWriter, regs: &[u16]) -> IoResult<()> {
    writer.write_var_u64(regs.len() as u64)?;
    for &reg in regs {
        writer.write_u16(reg)?;
    }
    Ok(())
}

fn read_reg_list(reader: &mut MemoryReader<'_>) -> IoResult<Vec<u16>> {
    let count = reader.read_var_u64_capped("register list", u16::MAX as u64)? as usize;
    let mut regs = Vec::with_capacity(count);
    for _ in 0..count {
        regs.push(reader.read_u16()?);
    }
    Ok(regs)
}

impl Instruction {
    /// Encodes one instruction.
    pub fn encode(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        match self {
            Instruction::ConstI32 { dst, value } => {
                writer.write_u8(Opcode::ConstI32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_i32(*value)
            }
            Instruction::ConstI64 { dst, value } => {
                writer.write_u8(Opcode::ConstI64 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_i64(*value)
            }
            Instruction::ConstF32 { dst, value } => {
                writer.write_u8(Opcode::ConstF32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_f32(*value)
            }
            Instruction::ConstF64 { dst, value } => {
                writer.write_u8(Opcode::ConstF64 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_f64(*value)
            }
            Instruction::ConstRodata { dst, rodata } => {
                writer.write_u8(Opcode::ConstRodata as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u32(*rodata)
            }
            Instruction::Move { dst, src } => {
                writer.write_u8(Opcode::Move as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*src)
            }
            Instruction::AddI32 { dst, lhs, rhs } => {
                writer.write_u8(Opcode::AddI32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*lhs)?;
                writer.write_u16(*rhs)
            }
            Instruction::SubI32 { dst, lhs, rhs } => {
                writer.write_u8(Opcode::SubI32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*lhs)?;
                writer.write_u16(*rhs)
            }
            Instruction::MulI32 { dst, lhs, rhs } => {
                writer.write_u8(Opcode::MulI32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*lhs)?;
                writer.write_u16(*rhs)
            }
            Instruction::CmpEqI32 { dst, lhs, rhs } => {
                writer.write_u8(Opcode::CmpEqI32 as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*lhs)?;
                writer.write_u16(*rhs)
            }
            Instruction::Branch { target } => {
                writer.write_u8(Opcode::Branch as u8)?;
                writer.write_u32(*target)
            }
            Instruction::CondBranch {
                cond,
                true_target,
                false_target,
            } => {
                writer.write_u8(Opcode::CondBranch as u8)?;
                writer.write_u16(*cond)?;
                writer.write_u32(*true_target)?;
                writer.write_u32(*false_target)
            }
            Instruction::GlobalLoad { dst, global } => {
                writer.write_u8(Opcode::GlobalLoad as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u32(*global)
            }
            Instruction::GlobalStore { global, src } => {
                writer.write_u8(Opcode::GlobalStore as u8)?;
                writer.write_u32(*global)?;
                writer.write_u16(*src)
            }
            Instruction::ListAlloc { dst, capacity } => {
                writer.write_u8(Opcode::ListAlloc as u8)?;
                writer.write_u16(*dst)?;
                writer.write_u16(*capacity)
            }
            Instruction::ListPush { list, value } => {
                writer.write_u8(Opcode::ListPush as u8)?;
                writer.write_u16(*list)?;
                writer.write_u16(*value)
            }
            Instruction::CallImport {
                import,
                args,
                results,
            } => {
                writer.write_u8(Opcode::CallImport as u8)?;
                writer.write_u32(*import)?;
                write_reg_list(writer, args)?;
                write_reg_list(writer, results)
            }
            Instruction::CallInternal {
                ordinal,
                args,
                results,
            } => {
                writer.write_u8(Opcode::CallInternal as u8)?;
                writer.write_u32(*ordinal)?;
                write_reg_list(writer, args)?;
                write_reg_list(writer, results)
            }
            Instruction::Return { values } => {
                writer.write_u8(Opcode::Return as u8)?;
                write_reg_list(writer, values)
            }
            Instruction::Fail { kind, message } => {
                writer.write_u8(Opcode::Fail as u8)?;
                writer.write_u8(status_kind_code(*kind))?;
                writer.write_string(message)
            }
        }
    }

    /// Decodes one instruction.
    pub fn decode(reader: &mut MemoryReader<'_>) -> IoResult<Self> {
        let opcode = Opcode::from_byte(reader.read_u8()?)?;
        Ok(match opcode {
            Opcode::ConstI32 => Instruction::ConstI32 {
                dst: reader.read_u16()?,
                value: reader.read_i32()?,
            },
            Opcode::ConstI64 => Instruction::ConstI64 {
                dst: reader.read_u16()?,
                value: reader.read_i64()?,
            },
            Opcode::ConstF32 => Instruction::ConstF32 {
                dst: reader.read_u16()?,
                value: reader.read_f32()?,
            },
            Opcode::ConstF64 => Instruction::ConstF64 {
                dst: reader.read_u16()?,
                value: reader.read_f64()?,
            },
            Opcode::ConstRodata => Instruction::ConstRodata {
                dst: reader.read_u16()?,
                rodata: reader.read_u32()?,
            },
            Opcode::Move => Instruction::Move {
                dst: reader.read_u16()?,
                src: reader.read_u16()?,
            },
            Opcode::AddI32 => Instruction::AddI32 {
                dst: reader.read_u16()?,
                lhs: reader.read_u16()?,
                rhs: reader.read_u16()?,
            },
            Opcode::SubI32 => Instruction::SubI32 {
                dst: reader.read_u16()?,
                lhs: reader.read_u16()?,
                rhs: reader.read_u16()?,
            },
            Opcode::MulI32 => Instruction::MulI32 {
                dst: reader.read_u16()?,
                lhs: reader.read_u16()?,
                rhs: reader.read_u16()?,
            },
            Opcode::CmpEqI32 => Instruction::CmpEqI32 {
                dst: reader.read_u16()?,
                lhs: reader.read_u16()?,
                rhs: reader.read_u16()?,
            },
            Opcode::Branch => Instruction::Branch {
                target: reader.read_u32()?,
            },
            Opcode::CondBranch => Instruction::CondBranch {
                cond: reader.read_u16()?,
                true_target: reader.read_u32()?,
                false_target: reader.read_u32()?,
            },
            Opcode::GlobalLoad => Instruction::GlobalLoad {
                dst: reader.read_u16()?,
                global: reader.read_u32()?,
            },
            Opcode::GlobalStore => Instruction::GlobalStore {
                global: reader.read_u32()?,
                src: reader.read_u16()?,
            },
            Opcode::ListAlloc => Instruction::ListAlloc {
                dst: reader.read_u16()?,
                capacity: reader.read_u16()?,
            },
            Opcode::ListPush => Instruction::ListPush {
                list: reader.read_u16()?,
                value: reader.read_u16()?,
            },
            Opcode::CallImport => Instruction::CallImport {
                import: reader.read_u32()?,
                args: read_reg_list(reader)?,
                results: read_reg_list(reader)?,
            },
            Opcode::CallInternal => Instruction::CallInternal {
                ordinal: reader.read_u32()?,
                args: read_reg_list(reader)?,
                results: read_reg_list(reader)?,
            },
            Opcode::Return => Instruction::Return {
                values: read_reg_list(reader)?,
            },
            Opcode::Fail => Instruction::Fail {
                kind: status_kind_from_code(reader.read_u8()?)?,
                message: reader.read_string()?,
            },
        })
    }
}
