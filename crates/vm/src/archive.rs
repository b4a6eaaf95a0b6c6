//! The persisted artifact format.
//!
//! A compiled module serializes as a flat record: magic, version,
//! feature bits, module name, import table, export table, rodata table,
//! globals, per-function code blobs, per-function debug info, and
//! per-target executable payloads keyed by device filter pattern.
//!
//! Rodata entries with identical (mime-type, value) pairs are merged at
//! serialization time, retaining the maximum alignment; instruction
//! operands are remapped to the surviving indices.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tensile_base::{Status, StatusResult};
use tensile_io::{BinaryWriter, IoError, IoResult, MemoryReader};

use crate::bytecode::module::{
    BytecodeFunction, BytecodeModule, FunctionDebug, GlobalDecl, RodataEntry, TargetPayload,
};
use crate::bytecode::opcode::Instruction;
use crate::convention::ConvString;
use crate::function::{FunctionDecl, Linkage};
use crate::module::Module;
use crate::value::ValueType;

/// Magic bytes opening every artifact.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"TSLA";

/// Current format version.
pub const ARCHIVE_VERSION: u16 = 1;

/// Feature bits; none are defined yet.
pub const ARCHIVE_FEATURES: u32 = 0;

const MAX_TABLE_ENTRIES: u64 = 1 << 20;

fn io_status(err: IoError) -> Status {
    Status::invalid_argument(format!("malformed artifact: {err}"))
}

fn value_type_code(ty: ValueType) -> u8 {
    match ty {
        ValueType::I32 => 1,
        ValueType::I64 => 2,
        ValueType::F32 => 3,
        ValueType::F64 => 4,
        ValueType::Ref => 5,
    }
}

fn value_type_from_code(code: u8) -> IoResult<ValueType> {
    Ok(match code {
        1 => ValueType::I32,
        2 => ValueType::I64,
        3 => ValueType::F32,
        4 => ValueType::F64,
        5 => ValueType::Ref,
        other => {
            return Err(IoError::invalid_data(
                "value type",
                format!("unknown code {other}"),
            ))
        }
    })
}

/// Serializes a module into artifact bytes.
pub fn serialize_module(module: &BytecodeModule) -> StatusResult<Vec<u8>> {
    let (rodata, remap) = dedupe_rodata(module.rodata());

    let mut writer = BinaryWriter::with_capacity(4096);
    (|| -> IoResult<()> {
        writer.write_raw(&ARCHIVE_MAGIC)?;
        writer.write_u16(ARCHIVE_VERSION)?;
        writer.write_u32(ARCHIVE_FEATURES)?;
        writer.write_string(module.name())?;

        // Import table: qualified names with conv strings.
        writer.write_var_u64(module.imports().len() as u64)?;
        for import in module.imports() {
            writer.write_string(&import.name)?;
            writer.write_string(&import.conv)?;
        }

        write_function_table(&mut writer, module.exports(), &remap)?;
        write_function_table(&mut writer, module.internals(), &remap)?;

        // Rodata table, deduplicated.
        writer.write_var_u64(rodata.len() as u64)?;
        for entry in &rodata {
            writer.write_u32(entry.alignment)?;
            match &entry.mime_type {
                Some(mime) => {
                    writer.write_bool(true)?;
                    writer.write_string(mime)?;
                }
                None => writer.write_bool(false)?,
            }
            writer.write_bytes(&entry.data)?;
        }

        // Globals.
        writer.write_var_u64(module.globals().len() as u64)?;
        for global in module.globals() {
            writer.write_string(&global.name)?;
            writer.write_u8(value_type_code(global.ty))?;
        }

        // Per-target executable payloads.
        writer.write_var_u64(module.targets().len() as u64)?;
        for target in module.targets() {
            writer.write_string(&target.filter_pattern)?;
            writer.write_string(&target.format)?;
            writer.write_bytes(&target.data)?;
        }
        Ok(())
    })()
    .map_err(io_status)?;
    Ok(writer.into_bytes())
}

fn write_function_table(
    writer: &mut BinaryWriter,
    functions: &[Arc<BytecodeFunction>],
    rodata_remap: &[u32],
) -> IoResult<()> {
    writer.write_var_u64(functions.len() as u64)?;
    for function in functions {
        writer.write_string(&function.decl.name)?;
        writer.write_string(&function.decl.conv)?;
        writer.write_u16(function.register_count)?;

        let mut code = BinaryWriter::with_capacity(function.code.len() * 8);
        code.write_var_u64(function.code.len() as u64)?;
        for instruction in &function.code {
            match instruction {
                Instruction::ConstRodata { dst, rodata } => Instruction::ConstRodata {
                    dst: *dst,
                    rodata: rodata_remap[*rodata as usize],
                }
                .encode(&mut code)?,
                other => other.encode(&mut code)?,
            }
        }
        writer.write_bytes(&code.into_bytes())?;

        match &function.debug.source_file {
            Some(file) => {
                writer.write_bool(true)?;
                writer.write_string(file)?;
                writer.write_var_u64(function.debug.lines.len() as u64)?;
                for &(pc, line) in &function.debug.lines {
                    writer.write_u32(pc)?;
                    writer.write_u32(line)?;
                }
            }
            None => writer.write_bool(false)?,
        }
    }
    Ok(())
}

/// Merges rodata entries with identical (mime, value), keeping the
/// maximum alignment. Returns the surviving table and an old-to-new
/// index map.
fn dedupe_rodata(rodata: &[RodataEntry]) -> (Vec<RodataEntry>, Vec<u32>) {
    let mut surviving: Vec<RodataEntry> = Vec::new();
    let mut remap = Vec::with_capacity(rodata.len());
    let mut by_content: HashMap<(Option<String>, Bytes), usize> = HashMap::new();
    for entry in rodata {
        let key = (entry.mime_type.clone(), entry.data.clone());
        match by_content.get(&key) {
            Some(&index) => {
                let kept = &mut surviving[index];
                kept.alignment = kept.alignment.max(entry.alignment);
                remap.push(index as u32);
            }
            None => {
                by_content.insert(key, surviving.len());
                remap.push(surviving.len() as u32);
                surviving.push(entry.clone());
            }
        }
    }
    (surviving, remap)
}

/// Deserializes artifact bytes back into a module.
pub fn deserialize_module(data: &[u8]) -> StatusResult<Arc<BytecodeModule>> {
    let mut reader = MemoryReader::new(data);
    (|| -> IoResult<Arc<BytecodeModule>> {
        let magic = reader.read_raw(4)?;
        if magic != ARCHIVE_MAGIC {
            return Err(IoError::invalid_data("magic", "not a Tensile artifact"));
        }
        let version = reader.read_u16()?;
        if version != ARCHIVE_VERSION {
            return Err(IoError::invalid_data(
                "version",
                format!("unsupported version {version}"),
            ));
        }
        let _features = reader.read_u32()?;
        let name = reader.read_string()?;

        let import_count = reader.read_var_u64_capped("import count", MAX_TABLE_ENTRIES)?;
        let mut imports = Vec::with_capacity(import_count as usize);
        for ordinal in 0..import_count as usize {
            let full_name = reader.read_string()?;
            let conv = reader.read_string()?;
            let signature = ConvString::parse(&conv)
                .map_err(|status| IoError::invalid_data("import conv", status.to_string()))?
                .signature()
                .clone();
            imports.push(Arc::new(FunctionDecl {
                name: full_name,
                linkage: Linkage::Import,
                ordinal,
                signature,
                conv,
            }));
        }

        let exports = read_function_table(&mut reader, Linkage::Export)?;
        let internals = read_function_table(&mut reader, Linkage::Internal)?;

        let rodata_count = reader.read_var_u64_capped("rodata count", MAX_TABLE_ENTRIES)?;
        let mut rodata = Vec::with_capacity(rodata_count as usize);
        for _ in 0..rodata_count {
            let alignment = reader.read_u32()?;
            let mime_type = if reader.read_bool()? {
                Some(reader.read_string()?)
            } else {
                None
            };
            let data = Bytes::copy_from_slice(reader.read_bytes()?);
            rodata.push(RodataEntry {
                data,
                alignment,
                mime_type,
            });
        }

        let global_count = reader.read_var_u64_capped("global count", MAX_TABLE_ENTRIES)?;
        let mut globals = Vec::with_capacity(global_count as usize);
        for _ in 0..global_count {
            let name = reader.read_string()?;
            let ty = value_type_from_code(reader.read_u8()?)?;
            globals.push(GlobalDecl { name, ty });
        }

        let target_count = reader.read_var_u64_capped("target count", MAX_TABLE_ENTRIES)?;
        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            let filter_pattern = reader.read_string()?;
            let format = reader.read_string()?;
            let data = Bytes::copy_from_slice(reader.read_bytes()?);
            targets.push(TargetPayload {
                filter_pattern,
                format,
                data,
            });
        }

        Ok(Arc::new(BytecodeModule::new(
            name, imports, exports, internals, rodata, globals, targets,
        )))
    })()
    .map_err(io_status)
}

fn read_function_table(
    reader: &mut MemoryReader<'_>,
    linkage: Linkage,
) -> IoResult<Vec<Arc<BytecodeFunction>>> {
    let count = reader.read_var_u64_capped("function count", MAX_TABLE_ENTRIES)?;
    let mut functions = Vec::with_capacity(count as usize);
    for ordinal in 0..count as usize {
        let name = reader.read_string()?;
        let conv = reader.read_string()?;
        let signature = ConvString::parse(&conv)
            .map_err(|status| IoError::invalid_data("function conv", status.to_string()))?
            .signature()
            .clone();
        let register_count = reader.read_u16()?;

        let code_bytes = reader.read_bytes()?;
        let mut code_reader = MemoryReader::new(code_bytes);
        let instruction_count =
            code_reader.read_var_u64_capped("instruction count", MAX_TABLE_ENTRIES)?;
        let mut code = Vec::with_capacity(instruction_count as usize);
        for _ in 0..instruction_count {
            code.push(Instruction::decode(&mut code_reader)?);
        }

        let debug = if reader.read_bool()? {
            let source_file = Some(reader.read_string()?);
            let line_count = reader.read_var_u64_capped("debug line count", MAX_TABLE_ENTRIES)?;
            let mut lines = Vec::with_capacity(line_count as usize);
            for _ in 0..line_count {
                let pc = reader.read_u32()?;
                let line = reader.read_u32()?;
                lines.push((pc, line));
            }
            FunctionDebug { source_file, lines }
        } else {
            FunctionDebug::default()
        };

        functions.push(Arc::new(BytecodeFunction {
            decl: Arc::new(FunctionDecl {
                name,
                linkage,
                ordinal,
                signature: signature.clone(),
                conv,
            }),
            register_count,
            code,
            debug,
        }));
    }
    Ok(functions)
}
