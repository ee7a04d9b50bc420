//! Binary module format primitives: magic, section tags, global-reference
//! encoding, exception entries, and the additive checksum.
//!
//! The section layout itself is produced by the compiler's module writer;
//! this module defines the wire-level vocabulary both the writer and the
//! reader share.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};

/// Module file magic, little-endian on the wire.
pub const MAGIC: u32 = 0xC7DA_0001;

/// Current module file format version.
pub const FILE_VERSION: u32 = 3;

/// Header flag: the file was built as the core (empty-interpreter) module.
pub const FLAG_EMPTY_INTERP: u32 = 1 << 0;

/// Section tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionTag {
    Module = 1,
    Dependency = 2,
    Class = 3,
    ClassEnd = 4,
    Function = 5,
    FunctionEnd = 6,
    Block = 7,
    BlockEnd = 8,
    Property = 9,
    Exception = 10,
    Doc = 11,
    ModuleEnd = 12,
}

impl SectionTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Module),
            2 => Some(Self::Dependency),
            3 => Some(Self::Class),
            4 => Some(Self::ClassEnd),
            5 => Some(Self::Function),
            6 => Some(Self::FunctionEnd),
            7 => Some(Self::Block),
            8 => Some(Self::BlockEnd),
            9 => Some(Self::Property),
            10 => Some(Self::Exception),
            11 => Some(Self::Doc),
            12 => Some(Self::ModuleEnd),
            _ => None,
        }
    }
}

/// Exception-record flags.
pub const EX_CATCH: u32 = 1 << 0;
pub const EX_FINALLY: u32 = 1 << 1;
pub const EX_ITERATION: u32 = 1 << 2;

/// One exception-table entry. Offsets are relative to the owning
/// function's bytecode after all buffer concatenations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub flags: u32,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub num_blocks: u32,
    pub num_stack: u32,
    /// Catch type as a global reference; `GlobalRef::None` for finally
    /// handlers (the `void` catch type).
    pub catch_type: GlobalRef,
}

impl ExceptionEntry {
    /// Shift all offsets by `base`, for splicing a child buffer into its
    /// parent.
    pub fn rebased(&self, base: u32) -> Self {
        Self {
            try_start: self.try_start + base,
            try_end: self.try_end + base,
            handler_start: self.handler_start + base,
            handler_end: self.handler_end + base,
            ..self.clone()
        }
    }

    /// `tryStart <= tryEnd <= handlerStart <= handlerEnd`.
    pub fn is_ordered(&self) -> bool {
        self.try_start <= self.try_end
            && self.try_end <= self.handler_start
            && self.handler_start <= self.handler_end
    }
}

/// A reference to a global property. The low two bits of the encoded
/// number select the form; the rest carry the slot or the name offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GlobalRef {
    #[default]
    None,
    /// Bound global slot.
    Slot(u32),
    /// Unbound: constant-pool offsets of the name and its namespace.
    Name { name: u32, space: u32 },
}

const REF_NONE: i64 = 0;
const REF_SLOT: i64 = 1;
const REF_NAME: i64 = 2;

impl GlobalRef {
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        match self {
            GlobalRef::None => writer.emit_num(REF_NONE),
            GlobalRef::Slot(slot) => writer.emit_num(((*slot as i64) << 2) | REF_SLOT),
            GlobalRef::Name { name, space } => {
                writer.emit_num(((*name as i64) << 2) | REF_NAME);
                writer.emit_num(*space as i64);
            }
        }
    }

    pub fn decode(reader: &mut BytecodeReader) -> Result<Self, DecodeError> {
        let word = reader.read_num()?;
        match word & 3 {
            REF_SLOT => Ok(GlobalRef::Slot((word >> 2) as u32)),
            REF_NAME => {
                let space = reader.read_num()? as u32;
                Ok(GlobalRef::Name {
                    name: (word >> 2) as u32,
                    space,
                })
            }
            _ => Ok(GlobalRef::None),
        }
    }
}

/// The module checksum: a running sum of name characters and per-section
/// integers, accumulated while sections are emitted and patched into the
/// reserved header slot afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_name(&mut self, name: &str) {
        for b in name.bytes() {
            self.sum = self.sum.wrapping_add(b as u32);
        }
    }

    pub fn add_num(&mut self, value: i64) {
        self.sum = self.sum.wrapping_add(value as u32);
    }

    pub fn value(&self) -> u32 {
        self.sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_tag_roundtrip() {
        for tag in [
            SectionTag::Module,
            SectionTag::Dependency,
            SectionTag::Class,
            SectionTag::ClassEnd,
            SectionTag::Function,
            SectionTag::FunctionEnd,
            SectionTag::Block,
            SectionTag::BlockEnd,
            SectionTag::Property,
            SectionTag::Exception,
            SectionTag::Doc,
            SectionTag::ModuleEnd,
        ] {
            assert_eq!(SectionTag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(SectionTag::from_u8(0), None);
        assert_eq!(SectionTag::from_u8(13), None);
    }

    #[test]
    fn test_global_ref_roundtrip() {
        for r in [
            GlobalRef::None,
            GlobalRef::Slot(0),
            GlobalRef::Slot(300),
            GlobalRef::Name { name: 17, space: 5 },
        ] {
            let mut w = BytecodeWriter::new();
            r.encode(&mut w);
            let bytes = w.into_bytes();
            let mut rd = BytecodeReader::new(&bytes);
            assert_eq!(GlobalRef::decode(&mut rd).unwrap(), r);
        }
    }

    #[test]
    fn test_exception_rebase_preserves_order() {
        let entry = ExceptionEntry {
            flags: EX_CATCH,
            try_start: 0,
            try_end: 4,
            handler_start: 4,
            handler_end: 9,
            num_blocks: 0,
            num_stack: 0,
            catch_type: GlobalRef::None,
        };
        assert!(entry.is_ordered());
        let moved = entry.rebased(100);
        assert!(moved.is_ordered());
        assert_eq!(moved.try_start, 100);
        assert_eq!(moved.handler_end, 109);
    }

    #[test]
    fn test_checksum_accumulates() {
        let mut c = Checksum::new();
        c.add_name("ab");
        c.add_num(5);
        assert_eq!(c.value(), ('a' as u32) + ('b' as u32) + 5);
    }
}
