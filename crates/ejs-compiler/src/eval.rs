//! Embedded constant evaluator.
//!
//! Conditional-compilation expressions are compiled into the initializer of
//! an ephemeral module and then executed here. The evaluator covers the
//! constant subset of the instruction set: literal loads, arithmetic,
//! comparison, logical negation, branches, and global constant slot loads.
//! Anything else makes the expression non-constant, which is reported as a
//! semantic error at the hash site.

use crate::graph::{ObjGraph, Value};
use ejs_bytecode::{BytecodeReader, ConstantPool, Opcode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("expression is not a compile-time constant ({0:?} is not evaluable)")]
    NotConstant(Opcode),

    #[error("malformed constant expression: {0}")]
    Decode(#[from] ejs_bytecode::DecodeError),

    #[error("constant evaluation stack underflow")]
    Underflow,

    #[error("constant evaluation did not terminate")]
    NoProgress,
}

/// A value produced by constant evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Namespace(String),
}

impl EvalValue {
    pub fn truthy(&self) -> bool {
        match self {
            EvalValue::Undefined | EvalValue::Null => false,
            EvalValue::Bool(b) => *b,
            EvalValue::Number(n) => *n != 0.0 && !n.is_nan(),
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Namespace(_) => true,
        }
    }

    fn number(&self) -> f64 {
        match self {
            EvalValue::Number(n) => *n,
            EvalValue::Bool(true) => 1.0,
            EvalValue::Bool(false) | EvalValue::Null => 0.0,
            EvalValue::Str(s) => s.parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    fn loosely_equals(&self, other: &EvalValue) -> bool {
        use EvalValue::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Str(a), Str(b)) => a == b,
            (a, b) => {
                let (x, y) = (a.number(), b.number());
                x == y
            }
        }
    }

    fn strictly_equals(&self, other: &EvalValue) -> bool {
        self == other
    }
}

fn graph_value(value: &Value) -> Option<EvalValue> {
    match value {
        Value::Null => Some(EvalValue::Null),
        Value::Undefined => Some(EvalValue::Undefined),
        Value::Bool(b) => Some(EvalValue::Bool(*b)),
        Value::Number(n) => Some(EvalValue::Number(*n)),
        Value::Str(s) => Some(EvalValue::Str(s.clone())),
        Value::Namespace(s) => Some(EvalValue::Namespace(s.clone())),
        Value::Empty => Some(EvalValue::Undefined),
        _ => None,
    }
}

const STEP_LIMIT: usize = 100_000;

/// Execute `code` against the graph's global constants.
pub fn execute(code: &[u8], pool: &ConstantPool, graph: &ObjGraph) -> Result<EvalValue, EvalError> {
    let mut stack: Vec<EvalValue> = Vec::new();
    let mut pc = 0usize;
    let mut steps = 0usize;

    macro_rules! pop {
        () => {
            stack.pop().ok_or(EvalError::Underflow)?
        };
    }

    while pc < code.len() {
        steps += 1;
        if steps > STEP_LIMIT {
            return Err(EvalError::NoProgress);
        }

        let mut reader = BytecodeReader::new(&code[pc..]);
        let op = reader.read_opcode()?;
        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                pop!();
            }
            Opcode::Dup => {
                let top = stack.last().ok_or(EvalError::Underflow)?.clone();
                stack.push(top);
            }
            Opcode::LoadTrue => stack.push(EvalValue::Bool(true)),
            Opcode::LoadFalse => stack.push(EvalValue::Bool(false)),
            Opcode::LoadNull => stack.push(EvalValue::Null),
            Opcode::LoadUndefined => stack.push(EvalValue::Undefined),
            Opcode::Load0
            | Opcode::Load1
            | Opcode::Load2
            | Opcode::Load3
            | Opcode::Load4
            | Opcode::Load5
            | Opcode::Load6
            | Opcode::Load7
            | Opcode::Load8
            | Opcode::Load9 => {
                stack.push(EvalValue::Number(
                    (op.to_u8() - Opcode::Load0.to_u8()) as f64,
                ));
            }
            Opcode::LoadInt => {
                let n = reader.read_num()?;
                stack.push(EvalValue::Number(n as f64));
            }
            Opcode::LoadDouble => {
                let n = reader.read_f64()?;
                stack.push(EvalValue::Number(n));
            }
            Opcode::LoadString => {
                let off = reader.read_num()? as u32;
                stack.push(EvalValue::Str(pool.get(off).unwrap_or("").to_string()));
            }
            Opcode::LoadNamespace => {
                let off = reader.read_num()? as u32;
                stack.push(EvalValue::Namespace(
                    pool.get(off).unwrap_or("").to_string(),
                ));
            }
            Opcode::GetGlobalSlot => {
                let slot = reader.read_num()? as u32;
                let prop = graph
                    .block(graph.global)
                    .live()
                    .find(|(_, p)| p.slot == slot)
                    .map(|(_, p)| p);
                match prop.and_then(|p| graph_value(&p.value)) {
                    Some(v) => stack.push(v),
                    None => return Err(EvalError::NotConstant(op)),
                }
            }
            Opcode::Add => {
                let b = pop!();
                let a = pop!();
                match (&a, &b) {
                    (EvalValue::Str(x), _) => {
                        stack.push(EvalValue::Str(format!("{}{}", x, display(&b))))
                    }
                    (_, EvalValue::Str(y)) => {
                        stack.push(EvalValue::Str(format!("{}{}", display(&a), y)))
                    }
                    _ => stack.push(EvalValue::Number(a.number() + b.number())),
                }
            }
            Opcode::Sub => binary_num(&mut stack, |a, b| a - b)?,
            Opcode::Mul => binary_num(&mut stack, |a, b| a * b)?,
            Opcode::Div => binary_num(&mut stack, |a, b| a / b)?,
            Opcode::Rem => binary_num(&mut stack, |a, b| a % b)?,
            Opcode::Shl => binary_int(&mut stack, |a, b| a << (b & 31))?,
            Opcode::Shr => binary_int(&mut stack, |a, b| a >> (b & 31))?,
            Opcode::Ushr => {
                binary_int(&mut stack, |a, b| ((a as u32) >> (b as u32 & 31)) as i32)?
            }
            Opcode::BitAnd => binary_int(&mut stack, |a, b| a & b)?,
            Opcode::BitOr => binary_int(&mut stack, |a, b| a | b)?,
            Opcode::BitXor => binary_int(&mut stack, |a, b| a ^ b)?,
            Opcode::Neg => {
                let a = pop!();
                stack.push(EvalValue::Number(-a.number()));
            }
            Opcode::BitNot => {
                let a = pop!();
                stack.push(EvalValue::Number(!(a.number() as i64 as i32) as f64));
            }
            Opcode::LogicalNot => {
                let a = pop!();
                stack.push(EvalValue::Bool(!a.truthy()));
            }
            Opcode::CompareEq => binary_bool(&mut stack, |a, b| a.loosely_equals(&b))?,
            Opcode::CompareNe => binary_bool(&mut stack, |a, b| !a.loosely_equals(&b))?,
            Opcode::CompareStrictlyEq => binary_bool(&mut stack, |a, b| a.strictly_equals(&b))?,
            Opcode::CompareStrictlyNe => binary_bool(&mut stack, |a, b| !a.strictly_equals(&b))?,
            Opcode::CompareLt => binary_bool(&mut stack, |a, b| a.number() < b.number())?,
            Opcode::CompareLe => binary_bool(&mut stack, |a, b| a.number() <= b.number())?,
            Opcode::CompareGt => binary_bool(&mut stack, |a, b| a.number() > b.number())?,
            Opcode::CompareGe => binary_bool(&mut stack, |a, b| a.number() >= b.number())?,
            Opcode::Goto => {
                let disp = reader.read_i32()?;
                pc = jump(pc, reader.pos(), disp as i64);
                continue;
            }
            Opcode::Goto8 => {
                let disp = reader.read_i8()?;
                pc = jump(pc, reader.pos(), disp as i64);
                continue;
            }
            Opcode::BranchTrue | Opcode::BranchFalse => {
                let disp = reader.read_i32()?;
                let cond = pop!().truthy();
                if cond == (op == Opcode::BranchTrue) {
                    pc = jump(pc, reader.pos(), disp as i64);
                    continue;
                }
            }
            Opcode::BranchTrue8 | Opcode::BranchFalse8 => {
                let disp = reader.read_i8()?;
                let cond = pop!().truthy();
                if cond == (op == Opcode::BranchTrue8) {
                    pc = jump(pc, reader.pos(), disp as i64);
                    continue;
                }
            }
            Opcode::ReturnValue => {
                return Ok(pop!());
            }
            Opcode::Return => return Ok(EvalValue::Undefined),
            other => return Err(EvalError::NotConstant(other)),
        }
        pc += reader.pos();
    }
    Ok(stack.pop().unwrap_or(EvalValue::Undefined))
}

fn display(v: &EvalValue) -> String {
    match v {
        EvalValue::Undefined => "undefined".to_string(),
        EvalValue::Null => "null".to_string(),
        EvalValue::Bool(b) => b.to_string(),
        EvalValue::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        EvalValue::Str(s) | EvalValue::Namespace(s) => s.clone(),
    }
}

fn jump(pc: usize, operand_len: usize, disp: i64) -> usize {
    (pc as i64 + operand_len as i64 + disp) as usize
}

fn binary_num(
    stack: &mut Vec<EvalValue>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), EvalError> {
    let b = stack.pop().ok_or(EvalError::Underflow)?;
    let a = stack.pop().ok_or(EvalError::Underflow)?;
    stack.push(EvalValue::Number(f(a.number(), b.number())));
    Ok(())
}

fn binary_int(
    stack: &mut Vec<EvalValue>,
    f: impl Fn(i32, i32) -> i32,
) -> Result<(), EvalError> {
    let b = stack.pop().ok_or(EvalError::Underflow)?;
    let a = stack.pop().ok_or(EvalError::Underflow)?;
    stack.push(EvalValue::Number(
        f(a.number() as i64 as i32, b.number() as i64 as i32) as f64,
    ));
    Ok(())
}

fn binary_bool(
    stack: &mut Vec<EvalValue>,
    f: impl Fn(EvalValue, EvalValue) -> bool,
) -> Result<(), EvalError> {
    let b = stack.pop().ok_or(EvalError::Underflow)?;
    let a = stack.pop().ok_or(EvalError::Underflow)?;
    stack.push(EvalValue::Bool(f(a, b)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ejs_bytecode::BytecodeWriter;

    fn run(build: impl FnOnce(&mut BytecodeWriter)) -> EvalValue {
        let graph = ObjGraph::new();
        let pool = ConstantPool::new();
        let mut w = BytecodeWriter::new();
        build(&mut w);
        execute(w.buffer(), &pool, &graph).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let v = run(|w| {
            w.emit_opcode(Opcode::Load2);
            w.emit_opcode(Opcode::Load3);
            w.emit_opcode(Opcode::Mul);
            w.emit_opcode(Opcode::ReturnValue);
        });
        assert_eq!(v, EvalValue::Number(6.0));
    }

    #[test]
    fn test_comparison_and_not() {
        let v = run(|w| {
            w.emit_opcode(Opcode::Load1);
            w.emit_opcode(Opcode::Load2);
            w.emit_opcode(Opcode::CompareLt);
            w.emit_opcode(Opcode::LogicalNot);
            w.emit_opcode(Opcode::ReturnValue);
        });
        assert_eq!(v, EvalValue::Bool(false));
    }

    #[test]
    fn test_branch() {
        // true ? 7 : 9
        let v = run(|w| {
            w.emit_opcode(Opcode::LoadTrue);
            w.emit_opcode(Opcode::BranchFalse);
            w.emit_i32(2); // skip the then-part
            w.emit_opcode(Opcode::Load7);
            w.emit_opcode(Opcode::ReturnValue);
            w.emit_opcode(Opcode::Load9);
            w.emit_opcode(Opcode::ReturnValue);
        });
        assert_eq!(v, EvalValue::Number(7.0));
    }

    #[test]
    fn test_global_constant_read() {
        use crate::graph::{Trait, Value};
        use ejs_parser::ast::QName;

        let mut graph = ObjGraph::new();
        let slot = graph
            .define(
                graph.global,
                QName::new("", "FEATURE"),
                Trait::default(),
                Value::Bool(true),
            )
            .unwrap();

        let pool = ConstantPool::new();
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::GetGlobalSlot);
        w.emit_num(slot as i64);
        w.emit_opcode(Opcode::ReturnValue);

        let v = execute(w.buffer(), &pool, &graph).unwrap();
        assert_eq!(v, EvalValue::Bool(true));
    }

    #[test]
    fn test_non_constant_rejected() {
        let graph = ObjGraph::new();
        let pool = ConstantPool::new();
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::CallGlobalSlot);
        w.emit_num(0);
        w.emit_num(0);
        assert!(matches!(
            execute(w.buffer(), &pool, &graph),
            Err(EvalError::NotConstant(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!EvalValue::Undefined.truthy());
        assert!(!EvalValue::Number(0.0).truthy());
        assert!(!EvalValue::Str(String::new()).truthy());
        assert!(EvalValue::Number(0.5).truthy());
        assert!(EvalValue::Str("x".into()).truthy());
    }
}
