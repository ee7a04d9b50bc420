//! Binary module reader.
//!
//! Parses the image the writer produces, re-verifying the additive
//! checksum as sections stream past. Used for accepting pre-compiled
//! module inputs, for round-trip tests, and for the CLI's listing mode.

use crate::error::{CompileError, CompileResult};
use ejs_bytecode::{
    BytecodeReader, Checksum, ConstantPool, ExceptionEntry, GlobalRef, SectionTag, FILE_VERSION,
    MAGIC,
};

#[derive(Debug, Clone)]
pub struct LoadedProperty {
    pub name: String,
    pub space: String,
    pub attributes: u32,
    pub slot: i64,
    pub type_ref: GlobalRef,
    pub value: Option<String>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedFunction {
    pub name: String,
    pub space: String,
    pub next_slot: u32,
    pub attributes: u32,
    pub lang: u8,
    pub result_type: GlobalRef,
    pub slot: i64,
    pub num_args: u32,
    pub num_locals: u32,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionEntry>,
    pub locals: Vec<LoadedProperty>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedClass {
    pub name: String,
    pub space: String,
    pub attributes: u32,
    pub slot: i64,
    pub base: GlobalRef,
    pub num_statics: u32,
    pub num_instance: u32,
    pub interfaces: Vec<GlobalRef>,
    pub functions: Vec<LoadedFunction>,
    pub properties: Vec<LoadedProperty>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedDependency {
    pub name: String,
    pub checksum: u32,
    pub min_version: u64,
    pub max_version: u64,
}

#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name: String,
    pub version: u64,
    pub checksum: u32,
    pub pool: ConstantPool,
    pub dependencies: Vec<LoadedDependency>,
    pub initializer: Option<LoadedFunction>,
    pub classes: Vec<LoadedClass>,
    pub functions: Vec<LoadedFunction>,
    pub properties: Vec<LoadedProperty>,
}

/// Read a whole module file.
pub fn read_file(data: &[u8]) -> CompileResult<Vec<LoadedModule>> {
    let mut r = BytecodeReader::new(data);

    let magic = r.read_u32().map_err(CompileError::from)?;
    if magic != MAGIC {
        return Err(CompileError::fatal(format!(
            "bad module magic {:#010x}",
            magic
        )));
    }
    let version = r.read_u32().map_err(CompileError::from)?;
    if version != FILE_VERSION {
        return Err(CompileError::fatal(format!(
            "unsupported module file version {}",
            version
        )));
    }
    let _flags = r.read_u32().map_err(CompileError::from)?;

    let mut modules = Vec::new();
    while !r.at_end() {
        modules.push(read_module(&mut r)?);
    }
    Ok(modules)
}

fn read_module(r: &mut BytecodeReader) -> CompileResult<LoadedModule> {
    expect_tag(r, SectionTag::Module)?;
    let mut sum = Checksum::new();

    let name = r.read_cstring()?;
    let version = r.read_num()? as u64;
    sum.add_name(&name);
    sum.add_num(version as i64);

    let stored_checksum = r.read_u32()?;

    let pool_len = r.read_num()? as usize;
    let pool_bytes = r.read_bytes(pool_len)?;
    let pool = ConstantPool::from_bytes(pool_bytes);

    let mut module = LoadedModule {
        name,
        version,
        checksum: stored_checksum,
        pool,
        dependencies: Vec::new(),
        initializer: None,
        classes: Vec::new(),
        functions: Vec::new(),
        properties: Vec::new(),
    };

    let mut pending_doc: Option<String> = None;
    loop {
        let tag_byte = r.read_u8()?;
        let tag = SectionTag::from_u8(tag_byte)
            .ok_or_else(|| CompileError::fatal(format!("unknown section tag {}", tag_byte)))?;
        match tag {
            SectionTag::Dependency => {
                let name = read_pool_string(r, &module.pool)?;
                let checksum = r.read_num()? as u32;
                let min_version = r.read_num()? as u64;
                let max_version = r.read_num()? as u64;
                sum.add_name(&name);
                module.dependencies.push(LoadedDependency {
                    name,
                    checksum,
                    min_version,
                    max_version,
                });
            }
            SectionTag::Function => {
                let f = read_function(r, &module.pool, &mut sum, pending_doc.take())?;
                if module.initializer.is_none()
                    && module.classes.is_empty()
                    && module.functions.is_empty()
                    && f.name == "-initializer-"
                {
                    module.initializer = Some(f);
                } else {
                    module.functions.push(f);
                }
            }
            SectionTag::Class => {
                let c = read_class(r, &module.pool, &mut sum, pending_doc.take())?;
                module.classes.push(c);
            }
            SectionTag::Property => {
                let p = read_property(r, &module.pool, &mut sum, pending_doc.take())?;
                module.properties.push(p);
            }
            SectionTag::Doc => {
                pending_doc = Some(read_pool_string(r, &module.pool)?);
            }
            SectionTag::ModuleEnd => break,
            other => {
                return Err(CompileError::fatal(format!(
                    "unexpected section {:?} at module level",
                    other
                )))
            }
        }
    }

    if sum.value() != stored_checksum {
        return Err(CompileError::fatal(format!(
            "module '{}' checksum mismatch: stored {:#010x}, computed {:#010x}",
            module.name,
            stored_checksum,
            sum.value()
        )));
    }
    Ok(module)
}

fn read_class(
    r: &mut BytecodeReader,
    pool: &ConstantPool,
    sum: &mut Checksum,
    doc: Option<String>,
) -> CompileResult<LoadedClass> {
    let name = read_pool_string(r, pool)?;
    let space = read_pool_string(r, pool)?;
    let attributes = r.read_num()? as u32;
    let slot = r.read_num()?;
    let base = GlobalRef::decode(r)?;
    let num_statics = r.read_num()? as u32;
    let num_instance = r.read_num()? as u32;
    let num_interfaces = r.read_num()? as usize;
    let mut interfaces = Vec::with_capacity(num_interfaces);
    for _ in 0..num_interfaces {
        interfaces.push(GlobalRef::decode(r)?);
    }

    sum.add_name(&name);
    sum.add_num(slot);

    let mut class = LoadedClass {
        name,
        space,
        attributes,
        slot,
        base,
        num_statics,
        num_instance,
        interfaces,
        functions: Vec::new(),
        properties: Vec::new(),
        doc,
    };

    let mut pending_doc: Option<String> = None;
    loop {
        let tag_byte = r.read_u8()?;
        let tag = SectionTag::from_u8(tag_byte)
            .ok_or_else(|| CompileError::fatal(format!("unknown section tag {}", tag_byte)))?;
        match tag {
            SectionTag::Function => {
                let f = read_function(r, pool, sum, pending_doc.take())?;
                class.functions.push(f);
            }
            SectionTag::Property => {
                let p = read_property(r, pool, sum, pending_doc.take())?;
                class.properties.push(p);
            }
            SectionTag::Doc => pending_doc = Some(read_pool_string(r, pool)?),
            SectionTag::ClassEnd => break,
            other => {
                return Err(CompileError::fatal(format!(
                    "unexpected section {:?} inside class",
                    other
                )))
            }
        }
    }
    Ok(class)
}

fn read_function(
    r: &mut BytecodeReader,
    pool: &ConstantPool,
    sum: &mut Checksum,
    doc: Option<String>,
) -> CompileResult<LoadedFunction> {
    let name = read_pool_string(r, pool)?;
    let space = read_pool_string(r, pool)?;
    let next_slot = r.read_num()? as u32;
    let attributes = r.read_num()? as u32;
    let lang = r.read_num()? as u8;
    let result_type = GlobalRef::decode(r)?;
    let slot = r.read_num()?;
    let num_args = r.read_num()? as u32;
    let num_locals = r.read_num()? as u32;
    let num_handlers = r.read_num()? as usize;
    let code_len = r.read_num()? as usize;
    let code = r.read_bytes(code_len)?.to_vec();

    let mut exceptions = Vec::with_capacity(num_handlers);
    if num_handlers > 0 {
        expect_tag(r, SectionTag::Exception)?;
        for _ in 0..num_handlers {
            exceptions.push(ExceptionEntry {
                flags: r.read_num()? as u32,
                try_start: r.read_num()? as u32,
                try_end: r.read_num()? as u32,
                handler_start: r.read_num()? as u32,
                handler_end: r.read_num()? as u32,
                num_blocks: r.read_num()? as u32,
                num_stack: r.read_num()? as u32,
                catch_type: GlobalRef::decode(r)?,
            });
        }
    }

    sum.add_name(&name);
    sum.add_num(slot);
    sum.add_num(num_args as i64);

    let mut locals = Vec::new();
    let mut pending_doc: Option<String> = None;
    loop {
        let tag_byte = r.read_u8()?;
        let tag = SectionTag::from_u8(tag_byte)
            .ok_or_else(|| CompileError::fatal(format!("unknown section tag {}", tag_byte)))?;
        match tag {
            SectionTag::Property => {
                locals.push(read_property(r, pool, sum, pending_doc.take())?);
            }
            SectionTag::Doc => pending_doc = Some(read_pool_string(r, pool)?),
            SectionTag::FunctionEnd => break,
            other => {
                return Err(CompileError::fatal(format!(
                    "unexpected section {:?} inside function",
                    other
                )))
            }
        }
    }

    Ok(LoadedFunction {
        name,
        space,
        next_slot,
        attributes,
        lang,
        result_type,
        slot,
        num_args,
        num_locals,
        code,
        exceptions,
        locals,
        doc,
    })
}

fn read_property(
    r: &mut BytecodeReader,
    pool: &ConstantPool,
    sum: &mut Checksum,
    doc: Option<String>,
) -> CompileResult<LoadedProperty> {
    let name = read_pool_string(r, pool)?;
    let space = read_pool_string(r, pool)?;
    let attributes = r.read_num()? as u32;
    let slot = r.read_num()?;
    let type_ref = GlobalRef::decode(r)?;
    let has_value = r.read_u8()? != 0;
    let value = if has_value {
        Some(read_pool_string(r, pool)?)
    } else {
        None
    };

    sum.add_name(&name);
    sum.add_num(slot);

    Ok(LoadedProperty {
        name,
        space,
        attributes,
        slot,
        type_ref,
        value,
        doc,
    })
}

fn read_pool_string(r: &mut BytecodeReader, pool: &ConstantPool) -> CompileResult<String> {
    let offset = r.read_num()? as u32;
    pool.get(offset)
        .map(str::to_string)
        .ok_or_else(|| CompileError::fatal(format!("bad constant pool offset {}", offset)))
}

fn expect_tag(r: &mut BytecodeReader, expected: SectionTag) -> CompileResult<()> {
    let byte = r.read_u8()?;
    if SectionTag::from_u8(byte) != Some(expected) {
        return Err(CompileError::fatal(format!(
            "expected {:?} section, found tag {}",
            expected, byte
        )));
    }
    Ok(())
}
