//! Bytecode definitions and binary module format for the Ejscript VM.

pub mod constants;
pub mod disasm;
pub mod encoder;
pub mod module;
pub mod opcode;

pub use constants::{ConstantPool, PoolError};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use module::{
    Checksum, ExceptionEntry, GlobalRef, SectionTag, EX_CATCH, EX_FINALLY, EX_ITERATION,
    FILE_VERSION, FLAG_EMPTY_INTERP, MAGIC,
};
pub use opcode::{Opcode, Operand};
