//! Per-function code buffers.
//!
//! A buffer owns its bytecode, pending jump fixups, exception records, and
//! a tracked virtual stack depth. Control-flow constructs build their arms
//! in child buffers, measure them, and splice them back with `append`,
//! which rebases fixup offsets and exception entries.

use ejs_bytecode::{BytecodeWriter, ExceptionEntry, Opcode};

/// Jump kinds a buffer may carry fixups for.
pub const JUMP_BREAK: u8 = 1 << 0;
pub const JUMP_CONTINUE: u8 = 1 << 1;

/// A forward jump waiting for its displacement. `offset` addresses the
/// 32-bit displacement word inside the buffer.
#[derive(Debug, Clone)]
pub struct JumpFixup {
    pub offset: usize,
    pub kind: u8,
    pub label: Option<String>,
}

#[derive(Debug, Default)]
pub struct CodeBuf {
    writer: BytecodeWriter,
    pub fixups: Vec<JumpFixup>,
    pub exceptions: Vec<ExceptionEntry>,
    /// Tracked operand stack depth at the current emission point.
    pub stack: i32,
    pub max_stack: i32,
    /// Which jump kinds may legally be emitted here.
    pub jump_kinds: u8,
    /// Stack depth recorded at loop/switch entry; break unwinds to it.
    pub break_mark: i32,
    /// Open runtime blocks at the current point.
    pub block_count: u32,
    last_op: Option<Opcode>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child buffer inherits the jump permissions, stack depth, break
    /// mark, and open-block count of its parent.
    pub fn child(&self) -> Self {
        Self {
            jump_kinds: self.jump_kinds,
            stack: self.stack,
            max_stack: self.stack,
            break_mark: self.break_mark,
            block_count: self.block_count,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.writer.offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.writer.buffer()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_bytes()
    }

    pub fn last_op(&self) -> Option<Opcode> {
        self.last_op
    }

    /// Adjust the tracked stack depth. Depth must never go negative.
    pub fn adjust(&mut self, delta: i32) {
        self.stack += delta;
        debug_assert!(self.stack >= 0, "operand stack underflow in codegen");
        if self.stack < 0 {
            self.stack = 0;
        }
        if self.stack > self.max_stack {
            self.max_stack = self.stack;
        }
    }

    pub fn emit(&mut self, op: Opcode) {
        self.writer.emit_opcode(op);
        self.last_op = Some(op);
    }

    pub fn emit_num(&mut self, value: i64) {
        self.writer.emit_num(value);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.writer.emit_i32(value);
    }

    pub fn emit_i8(&mut self, value: i8) {
        self.writer.emit_i8(value);
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.writer.emit_f64(value);
    }

    /// Emit a 32-bit jump displacement placeholder, returning its offset
    /// for later patching.
    pub fn emit_word_placeholder(&mut self) -> usize {
        let at = self.writer.offset();
        self.writer.emit_i32(0);
        at
    }

    pub fn patch_word(&mut self, offset: usize, value: i32) {
        self.writer.patch_i32(offset, value);
    }

    /// Splice a child buffer onto the end of this one, rebasing its
    /// fixups and exception records and adopting its stack counters.
    pub fn append(&mut self, child: CodeBuf) {
        let base = self.len();
        self.writer.emit_bytes(child.writer.buffer());
        for fixup in child.fixups {
            self.fixups.push(JumpFixup {
                offset: fixup.offset + base,
                ..fixup
            });
        }
        for entry in child.exceptions {
            self.exceptions.push(entry.rebased(base as u32));
        }
        self.stack = child.stack;
        if child.max_stack > self.max_stack {
            self.max_stack = child.max_stack;
        }
        self.block_count = child.block_count;
        if child.last_op.is_some() {
            self.last_op = child.last_op;
        }
    }

    /// Resolve the break/continue fixups recorded inside an assembled
    /// loop: break jumps to `break_target`, continue to
    /// `continue_target`. A switch passes no continue target, leaving
    /// continue fixups for the enclosing loop. Labeled fixups are left
    /// for an outer construct.
    pub fn resolve_loop_fixups(&mut self, break_target: usize, continue_target: Option<usize>) {
        let mut remaining = Vec::new();
        for fixup in std::mem::take(&mut self.fixups) {
            if fixup.label.is_some() {
                remaining.push(fixup);
                continue;
            }
            let target = match fixup.kind {
                k if k == JUMP_BREAK => break_target,
                k if k == JUMP_CONTINUE => match continue_target {
                    Some(t) => t,
                    None => {
                        remaining.push(fixup);
                        continue;
                    }
                },
                _ => {
                    remaining.push(fixup);
                    continue;
                }
            };
            let disp = target as i64 - (fixup.offset as i64 + 4);
            self.writer.patch_i32(fixup.offset, disp as i32);
        }
        self.fixups = remaining;
    }

    /// Encode a global reference operand in place.
    pub fn emit_global_ref(&mut self, gref: &ejs_bytecode::GlobalRef) {
        gref.encode(&mut self.writer);
    }

    /// Check every recorded fixup offset lies inside the buffer.
    pub fn fixups_in_bounds(&self) -> bool {
        self.fixups.iter().all(|f| f.offset + 4 <= self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits() {
        let mut parent = CodeBuf::new();
        parent.jump_kinds = JUMP_BREAK | JUMP_CONTINUE;
        parent.adjust(2);
        parent.break_mark = 1;
        parent.block_count = 3;

        let child = parent.child();
        assert_eq!(child.jump_kinds, JUMP_BREAK | JUMP_CONTINUE);
        assert_eq!(child.stack, 2);
        assert_eq!(child.break_mark, 1);
        assert_eq!(child.block_count, 3);
        assert!(child.is_empty());
    }

    #[test]
    fn test_append_rebases_fixups() {
        let mut parent = CodeBuf::new();
        parent.emit(Opcode::Nop);
        parent.emit(Opcode::Nop);

        let mut child = CodeBuf::new();
        child.emit(Opcode::Goto);
        let at = child.emit_word_placeholder();
        child.fixups.push(JumpFixup {
            offset: at,
            kind: JUMP_BREAK,
            label: None,
        });

        parent.append(child);
        assert_eq!(parent.fixups[0].offset, 2 + 1);
        assert!(parent.fixups_in_bounds());
    }

    #[test]
    fn test_append_rebases_exceptions() {
        use ejs_bytecode::{GlobalRef, EX_CATCH};

        let mut parent = CodeBuf::new();
        parent.emit(Opcode::Nop);

        let mut child = CodeBuf::new();
        child.emit(Opcode::Nop);
        child.exceptions.push(ExceptionEntry {
            flags: EX_CATCH,
            try_start: 0,
            try_end: 1,
            handler_start: 1,
            handler_end: 1,
            num_blocks: 0,
            num_stack: 0,
            catch_type: GlobalRef::None,
        });

        parent.append(child);
        assert_eq!(parent.exceptions[0].try_start, 1);
        assert!(parent.exceptions[0].is_ordered());
    }

    #[test]
    fn test_resolve_loop_fixups() {
        let mut buf = CodeBuf::new();
        buf.emit(Opcode::Goto);
        let brk = buf.emit_word_placeholder();
        buf.fixups.push(JumpFixup {
            offset: brk,
            kind: JUMP_BREAK,
            label: None,
        });
        buf.emit(Opcode::Goto);
        let cont = buf.emit_word_placeholder();
        buf.fixups.push(JumpFixup {
            offset: cont,
            kind: JUMP_CONTINUE,
            label: None,
        });
        buf.emit(Opcode::Nop);

        let end = buf.len();
        buf.resolve_loop_fixups(end, Some(0));
        assert!(buf.fixups.is_empty());

        let bytes = buf.bytes();
        let d1 = i32::from_le_bytes(bytes[brk..brk + 4].try_into().unwrap());
        assert_eq!(d1 as usize, end - (brk + 4));
        let d2 = i32::from_le_bytes(bytes[cont..cont + 4].try_into().unwrap());
        assert_eq!(d2, -((cont + 4) as i32));
    }

    #[test]
    fn test_max_stack_tracking() {
        let mut buf = CodeBuf::new();
        buf.adjust(3);
        buf.adjust(-2);
        buf.adjust(1);
        assert_eq!(buf.stack, 2);
        assert_eq!(buf.max_stack, 3);
    }
}
