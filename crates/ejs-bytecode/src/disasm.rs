//! Bytecode disassembler.
//!
//! Produces a one-instruction-per-line listing, resolving string operands
//! through the constant pool when one is supplied. Used by tests and the
//! CLI's listing mode.

use crate::constants::ConstantPool;
use crate::encoder::{BytecodeReader, DecodeError};
use crate::opcode::{Opcode, Operand};
use std::fmt::Write as _;

/// Disassemble `code` into a listing.
pub fn disassemble(code: &[u8], pool: Option<&ConstantPool>) -> Result<String, DecodeError> {
    let mut out = String::new();
    let mut reader = BytecodeReader::new(code);

    while !reader.at_end() {
        let at = reader.pos();
        let op = reader.read_opcode()?;
        write!(out, "{:6}  {:?}", at, op).unwrap();

        match op {
            Opcode::NewObject => {
                let type_ref = reader.read_num()?;
                let fields = reader.read_num()?;
                write!(out, " type={} fields={}", type_ref, fields).unwrap();
                for _ in 0..fields {
                    let space = reader.read_num()?;
                    let name = reader.read_num()?;
                    write!(out, " ({},{})", space, name).unwrap();
                }
            }
            Opcode::InitDefaultArgs => {
                let count = reader.read_num()?;
                write!(out, " n={}", count).unwrap();
                for _ in 0..count {
                    write!(out, " {}", reader.read_i32()?).unwrap();
                }
            }
            Opcode::InitDefaultArgs8 => {
                let count = reader.read_num()?;
                write!(out, " n={}", count).unwrap();
                for _ in 0..count {
                    write!(out, " {}", reader.read_i8()?).unwrap();
                }
            }
            op => {
                for operand in op.operands() {
                    match operand {
                        Operand::Num => {
                            let value = reader.read_num()?;
                            match (op, pool) {
                                (
                                    Opcode::LoadString
                                    | Opcode::LoadNamespace
                                    | Opcode::LoadRegExp
                                    | Opcode::LoadXml
                                    | Opcode::AddNamespace,
                                    Some(pool),
                                ) => {
                                    let s = pool.get(value as u32).unwrap_or("?");
                                    write!(out, " {:?}", s).unwrap();
                                }
                                _ => write!(out, " {}", value).unwrap(),
                            }
                        }
                        Operand::Word => write!(out, " ->{}", reader.read_i32()?).unwrap(),
                        Operand::Byte => write!(out, " ->{}", reader.read_i8()?).unwrap(),
                        Operand::Double => write!(out, " {}", reader.read_f64()?).unwrap(),
                    }
                }
            }
        }
        out.push('\n');
    }
    Ok(out)
}

/// Decode just the opcodes of a buffer, skipping operands. Handy for
/// structural assertions in tests.
pub fn opcodes(code: &[u8]) -> Result<Vec<Opcode>, DecodeError> {
    let mut out = Vec::new();
    let mut reader = BytecodeReader::new(code);
    while !reader.at_end() {
        let op = reader.read_opcode()?;
        out.push(op);
        match op {
            Opcode::NewObject => {
                reader.read_num()?;
                let fields = reader.read_num()?;
                for _ in 0..fields {
                    reader.read_num()?;
                    reader.read_num()?;
                }
            }
            Opcode::InitDefaultArgs => {
                let count = reader.read_num()?;
                for _ in 0..count {
                    reader.read_i32()?;
                }
            }
            Opcode::InitDefaultArgs8 => {
                let count = reader.read_num()?;
                for _ in 0..count {
                    reader.read_i8()?;
                }
            }
            op => {
                for operand in op.operands() {
                    match operand {
                        Operand::Num => {
                            reader.read_num()?;
                        }
                        Operand::Word => {
                            reader.read_i32()?;
                        }
                        Operand::Byte => {
                            reader.read_i8()?;
                        }
                        Operand::Double => {
                            reader.read_f64()?;
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BytecodeWriter;

    #[test]
    fn test_listing() {
        let mut pool = ConstantPool::new();
        let hello = pool.add("hello").unwrap();

        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::LoadString);
        w.emit_num(hello as i64);
        w.emit_opcode(Opcode::Load1);
        w.emit_opcode(Opcode::Add);
        w.emit_opcode(Opcode::ReturnValue);

        let text = disassemble(w.buffer(), Some(&pool)).unwrap();
        assert!(text.contains("LoadString \"hello\""));
        assert!(text.contains("Add"));
        assert!(text.contains("ReturnValue"));
    }

    #[test]
    fn test_opcodes_skips_operands() {
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::LoadInt);
        w.emit_num(100_000);
        w.emit_opcode(Opcode::PutGlobalSlot);
        w.emit_num(3);
        w.emit_opcode(Opcode::Return);

        let ops = opcodes(w.buffer()).unwrap();
        assert_eq!(
            ops,
            vec![Opcode::LoadInt, Opcode::PutGlobalSlot, Opcode::Return]
        );
    }

    #[test]
    fn test_init_default_args_decoding() {
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::InitDefaultArgs8);
        w.emit_num(2);
        w.emit_i8(4);
        w.emit_i8(9);
        w.emit_opcode(Opcode::Return);

        let ops = opcodes(w.buffer()).unwrap();
        assert_eq!(ops, vec![Opcode::InitDefaultArgs8, Opcode::Return]);
    }
}
