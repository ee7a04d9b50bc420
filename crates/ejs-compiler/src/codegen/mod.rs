//! The code generator.
//!
//! One walk per source file emits bytecode into per-function code buffers.
//! Control-flow arms are built in child buffers, measured, and spliced so
//! forward branches can pick the 8-bit form when the distance fits and the
//! optimizer is on. The tracked stack depth must stay non-negative at
//! every instruction and converge at control-flow joins; statement
//! boundaries discard any excess.

pub mod buffer;

use crate::graph::{FinalCode, FunId, TypeId, Value, NS_CONSTRUCT};
use crate::state::ValueUse;
use crate::Compiler;
use buffer::{CodeBuf, JumpFixup, JUMP_BREAK, JUMP_CONTINUE};
use ejs_bytecode::{ConstantPool, ExceptionEntry, GlobalRef, Opcode, EX_CATCH, EX_FINALLY, EX_ITERATION};
use ejs_parser::ast::{
    BinOp, BoundValue, CaseKind, ContainerRef, Kind, LitValue, Lookup, NodeFlags, NodeId, PostOp,
    QName, UnOp,
};
use ejs_parser::parser::SourceTree;

/// Maximum displacement for the 8-bit branch forms.
const SHORT_JUMP_MAX: usize = 0x7F;

impl Compiler {
    // ========================================================================
    // Driver
    // ========================================================================

    /// Generate code for all trees, producing per-module initializers and
    /// finalized function bodies in the graph.
    pub(crate) fn phase_codegen(&mut self, trees: &[SourceTree]) {
        let mut init_bufs: Vec<CodeBuf> = (0..self.modules.len()).map(|_| CodeBuf::new()).collect();

        for tree in trees {
            log::debug!("codegen: {}", tree.path);
            self.states.top_mut().module =
                Some(self.modules.iter().position(|m| m.name == self.options.module_name).unwrap_or(0));
            if let Some(dirs) = tree.ast.child(tree.root, 0) {
                self.gen_module_directives(tree, dirs, &mut init_bufs);
            }
        }

        for (index, buf) in init_bufs.into_iter().enumerate() {
            if buf.is_empty() {
                continue;
            }
            let mut buf = buf;
            if !matches!(buf.last_op(), Some(op) if op.is_return()) {
                buf.emit(Opcode::Return);
            }
            if !buf.fixups.is_empty() {
                self.internal_error("unresolved jump fixups in module initializer");
            }
            let fid = self
                .graph
                .alloc_function(QName::new("", "-initializer-"), Default::default());
            self.finalize_function(fid, buf);
            self.modules[index].initializer = Some(fid);
        }
    }

    /// Top-level directives: module definitions switch the target
    /// initializer buffer; everything else lands in the current module's.
    fn gen_module_directives(
        &mut self,
        tree: &SourceTree,
        dirs: NodeId,
        bufs: &mut Vec<CodeBuf>,
    ) {
        for &child in tree.ast.children(dirs) {
            match tree.ast.kind(child).clone() {
                Kind::Module { name, .. } => {
                    let index = self.modules.iter().position(|m| m.name == name).unwrap_or(0);
                    self.states.push();
                    self.states.top_mut().module = Some(index);
                    if let Some(body) = tree.ast.children(child).last().copied() {
                        for &inner in tree.ast.children(body) {
                            let module = self.states.top().module.unwrap_or(0);
                            self.gen_statement(tree, &mut bufs[module], inner);
                        }
                    }
                    self.states.pop();
                }
                _ => {
                    let module = self.states.top().module.unwrap_or(0);
                    self.gen_statement(tree, &mut bufs[module], child);
                }
            }
        }
    }

    /// Compile a conditional-compilation guard into a standalone code
    /// buffer with its own pool, for the constant evaluator.
    pub(crate) fn gen_constant_expr(
        &mut self,
        tree: &SourceTree,
        expr: NodeId,
    ) -> Result<(Vec<u8>, ConstantPool), String> {
        self.hash_pool = Some(ConstantPool::new());
        let mut buf = CodeBuf::new();
        self.gen_expr(tree, &mut buf, expr, ValueUse::Returned);
        buf.emit(Opcode::ReturnValue);
        buf.adjust(-1);
        let pool = self.hash_pool.take().expect("hash pool");
        Ok((buf.into_bytes(), pool))
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn gen_statement(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let mark = buf.stack;

        if self.options.debug {
            self.emit_debug(tree, buf, id);
        }

        let terminated = match tree.ast.kind(id).clone() {
            Kind::Directives | Kind::Pragmas => {
                for &child in tree.ast.children(id) {
                    self.gen_statement(tree, buf, child);
                }
                false
            }
            Kind::Nop | Kind::Pragma(_) | Kind::UseModule { .. } => false,
            Kind::UseNamespace { .. } => {
                // Inside function bodies namespaces open at run time.
                if self.states.top().in_function {
                    let uri = tree
                        .ast
                        .node(id)
                        .qname
                        .as_ref()
                        .map(|q| q.name.clone())
                        .unwrap_or_default();
                    let off = self.intern(&uri);
                    buf.emit(Opcode::AddNamespace);
                    buf.emit_num(off);
                }
                false
            }
            Kind::VarDefinition(_) => {
                self.gen_var_def(tree, buf, id);
                false
            }
            Kind::Class(_) => {
                self.gen_class(tree, buf, id);
                false
            }
            Kind::Function(_) => {
                self.gen_function_def(tree, buf, id);
                false
            }
            Kind::If => {
                self.gen_if(tree, buf, id);
                false
            }
            Kind::For => {
                self.gen_for(tree, buf, id);
                false
            }
            Kind::Do => {
                self.gen_do(tree, buf, id);
                false
            }
            Kind::ForIn { .. } => {
                self.gen_for_in(tree, buf, id);
                false
            }
            Kind::Switch => {
                self.gen_switch(tree, buf, id);
                false
            }
            Kind::Try => {
                self.gen_try(tree, buf, id);
                false
            }
            Kind::With => {
                self.gen_with(tree, buf, id);
                false
            }
            Kind::Block => {
                self.gen_block(tree, buf, id);
                false
            }
            Kind::Hash => {
                if !tree.ast.node(id).flags.contains(NodeFlags::DISABLED) {
                    if let Some(body) = tree.ast.child(id, 1) {
                        self.gen_statement(tree, buf, body);
                    }
                }
                false
            }
            Kind::Break { label } => {
                self.gen_break_continue(tree, buf, id, true, label);
                true
            }
            Kind::Continue { label } => {
                self.gen_break_continue(tree, buf, id, false, label);
                true
            }
            Kind::Return => {
                self.gen_return(tree, buf, id);
                true
            }
            Kind::Throw => {
                if let Some(value) = tree.ast.child(id, 0) {
                    self.gen_expr(tree, buf, value, ValueUse::Consumed);
                }
                buf.emit(Opcode::Throw);
                buf.adjust(-1);
                true
            }
            Kind::EndFunction => {
                if !matches!(buf.last_op(), Some(op) if op.is_return()) {
                    buf.emit(Opcode::Return);
                }
                true
            }
            Kind::Super => {
                // super(args) in statement position: base constructor call.
                let argc = self.gen_args(tree, buf, tree.ast.child(id, 0));
                buf.emit(Opcode::CallNextConstructor);
                buf.emit_num(argc as i64);
                buf.adjust(-(argc as i32));
                false
            }
            _ => {
                self.gen_expr(tree, buf, id, ValueUse::Discarded);
                false
            }
        };

        if terminated {
            buf.stack = mark;
            return;
        }

        // Statement boundary: the stack must return to its mark.
        let excess = buf.stack - mark;
        if excess == 1 {
            buf.emit(Opcode::Pop);
            buf.adjust(-1);
        } else if excess > 1 {
            buf.emit(Opcode::PopItems);
            buf.emit_num(excess as i64);
            buf.adjust(-excess);
        }
        debug_assert_eq!(buf.stack, mark, "statement did not converge");
    }

    fn emit_debug(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let loc = tree.ast.node(id).loc.clone();
        let file = self.intern(&loc.file);
        let text = self.intern(&loc.text);
        buf.emit(Opcode::Debug);
        buf.emit_num(file);
        buf.emit_num(loc.line as i64);
        buf.emit_num(text);
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    fn gen_var_def(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        for &item in tree.ast.children(id) {
            let node = tree.ast.node(item);
            if node.flags.contains(NodeFlags::INSTANCE_VAR) {
                // Instance initializers run inside the constructor.
                continue;
            }
            let init = match tree.ast.child(item, 1) {
                Some(init) if !matches!(tree.ast.kind(init), Kind::Nop) => init,
                _ => continue,
            };
            self.gen_expr(tree, buf, init, ValueUse::Consumed);
            let lookup = tree.ast.node(item).lookup.clone();
            let qname = tree.ast.node(item).qname.clone().unwrap_or_default();
            self.gen_store_scoped(buf, &lookup, &qname);
        }
    }

    fn gen_function_def(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        self.gen_function_body(tree, id);

        // Local functions are installed at run time so they can capture
        // the live scope chain.
        let lookup = tree.ast.node(id).lookup.clone();
        if let (Some(ContainerRef::Function(_) | ContainerRef::Block(_)), true) =
            (lookup.obj, lookup.slot >= 0)
        {
            if self.states.top().in_function {
                buf.emit(Opcode::DefineFunction);
                buf.emit_num(lookup.slot as i64);
                buf.emit_num(lookup.nth_block as i64);
            }
        }
    }

    /// Generate and finalize the body of a function definition.
    fn gen_function_body(&mut self, tree: &SourceTree, id: NodeId) {
        let fid = match tree.ast.node(id).lookup.value {
            Some(BoundValue::Function(fid)) => fid,
            _ => return,
        };
        let has_body = matches!(tree.ast.kind(id), Kind::Function(info) if info.has_body);
        if !has_body {
            return;
        }

        self.states.push();
        {
            let top = self.states.top_mut();
            top.fun = Some(fid);
            top.fun_node = Some(id);
            top.in_function = true;
            top.capture_break = false;
        }

        let mut fbuf = CodeBuf::new();
        self.gen_default_args(tree, &mut fbuf, id, fid);

        if let Some(body) = tree.ast.child(id, 2) {
            for &child in tree.ast.children(body) {
                self.gen_statement(tree, &mut fbuf, child);
            }
        }
        if !matches!(fbuf.last_op(), Some(op) if op.is_return()) {
            fbuf.emit(Opcode::Return);
        }
        if !fbuf.fixups.is_empty() {
            let loc = tree.ast.node(id).loc.clone();
            self.error(&loc, "can not find label for break or continue");
        }

        self.finalize_function(fid, fbuf);
        self.states.pop();
    }

    /// Emit the default-argument dispatch table: one entry per defaulted
    /// parameter plus the all-supplied entry, each the offset of the next
    /// initializer (or the body) relative to the end of the table.
    fn gen_default_args(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId, fid: FunId) {
        let num_defaults = self.graph.fun(fid).num_defaults;
        if num_defaults == 0 {
            return;
        }
        let args = match tree.ast.child(id, 0) {
            Some(args) => args,
            None => return,
        };

        let mut init_bufs: Vec<CodeBuf> = Vec::new();
        for &param in tree.ast.children(args) {
            let default = match tree.ast.child(param, 1) {
                Some(d) if !matches!(tree.ast.kind(d), Kind::Nop) => d,
                _ => continue,
            };
            let mut ibuf = CodeBuf::new();
            self.gen_expr(tree, &mut ibuf, default, ValueUse::Consumed);
            let slot = tree.ast.node(param).lookup.slot.max(0) as u32;
            self.emit_slot_op(
                &mut ibuf,
                Opcode::PutLocalSlot0,
                Opcode::PutLocalSlot,
                slot,
            );
            ibuf.adjust(-1);
            init_bufs.push(ibuf);
        }

        let entries = init_bufs.len() + 1;
        let mut offsets = Vec::with_capacity(entries);
        let mut acc = 0usize;
        for ibuf in &init_bufs {
            offsets.push(acc);
            acc += ibuf.len();
        }
        offsets.push(acc);

        let short_form = offsets.iter().all(|&o| o <= SHORT_JUMP_MAX);
        if short_form {
            buf.emit(Opcode::InitDefaultArgs8);
            buf.emit_num(entries as i64);
            for &o in &offsets {
                buf.emit_i8(o as i8);
            }
        } else {
            buf.emit(Opcode::InitDefaultArgs);
            buf.emit_num(entries as i64);
            for &o in &offsets {
                buf.emit_i32(o as i32);
            }
        }
        for ibuf in init_bufs {
            buf.append(ibuf);
        }
    }

    /// Generate the members of a class: method bodies, the instance
    /// initializer (prepended to the constructor), and the static
    /// initializer. The class itself is installed with `DefineClass`.
    fn gen_class(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let tid = match tree.ast.node(id).lookup.value {
            Some(BoundValue::Type(tid)) => tid,
            _ => return,
        };

        self.states.push();
        {
            let top = self.states.top_mut();
            top.class = Some(tid);
            top.in_class = true;
        }

        let mut instance_init = CodeBuf::new();
        let mut static_init = CodeBuf::new();

        if let Some(body) = tree.ast.children(id).last().copied() {
            for &member in tree.ast.children(body) {
                match tree.ast.kind(member).clone() {
                    Kind::Function(_) => self.gen_function_body(tree, member),
                    Kind::VarDefinition(_) => {
                        for &item in tree.ast.children(member) {
                            let init = match tree.ast.child(item, 1) {
                                Some(i) if !matches!(tree.ast.kind(i), Kind::Nop) => i,
                                _ => continue,
                            };
                            let lookup = tree.ast.node(item).lookup.clone();
                            if tree.ast.node(item).flags.contains(NodeFlags::INSTANCE_VAR) {
                                self.states.push();
                                self.states.top_mut().instance_code = true;
                                self.gen_expr(tree, &mut instance_init, init, ValueUse::Consumed);
                                self.states.pop();
                                self.emit_slot_op(
                                    &mut instance_init,
                                    Opcode::PutThisSlot0,
                                    Opcode::PutThisSlot,
                                    lookup.slot.max(0) as u32,
                                );
                                instance_init.adjust(-1);
                            } else {
                                self.gen_expr(tree, &mut static_init, init, ValueUse::Consumed);
                                static_init.emit(Opcode::PutThisTypeSlot);
                                static_init.emit_num(lookup.slot.max(0) as i64);
                                static_init.emit_num(0);
                                static_init.adjust(-1);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.attach_constructor_code(tid, instance_init);
        self.attach_static_initializer(tid, static_init);
        self.states.pop();

        // Global classes are installed by name in the module initializer.
        let qname = tree.ast.node(id).qname.clone().unwrap_or_default();
        let space = self.intern(&qname.space);
        let name = self.intern(&qname.name);
        buf.emit(Opcode::DefineClass);
        buf.emit_num(space);
        buf.emit_num(name);
    }

    /// Prepend instance-variable initializer code to the constructor,
    /// rebasing its exception regions; synthesize a default constructor
    /// when the base class requires one.
    fn attach_constructor_code(&mut self, tid: TypeId, instance_init: CodeBuf) {
        let base_has_ctor = {
            let mut current = self.graph.type_def(tid).base;
            let mut found = false;
            while let Some(b) = current {
                if self.graph.type_def(b).has_constructor {
                    found = true;
                    break;
                }
                current = self.graph.type_def(b).base;
            }
            found
        };

        if let Some(ctor) = self.graph.type_def(tid).constructor {
            if instance_init.is_empty() {
                return;
            }
            let inserted = instance_init.len() as u32;
            let init_max = instance_init.max_stack.max(0) as u32;
            let mut bytes = instance_init.into_bytes();
            if self.graph.fun(ctor).code.is_some() {
                let code = self.graph.fun_mut(ctor).code.as_mut().expect("ctor code");
                bytes.extend_from_slice(&code.bytes);
                code.bytes = bytes;
                code.exceptions = code
                    .exceptions
                    .iter()
                    .map(|e| e.rebased(inserted))
                    .collect();
                code.max_stack = code.max_stack.max(init_max);
            } else {
                bytes.push(Opcode::Return.to_u8());
                self.graph.fun_mut(ctor).code = Some(FinalCode {
                    bytes,
                    exceptions: Vec::new(),
                    max_stack: init_max,
                });
            }
            return;
        }

        if instance_init.is_empty() && !base_has_ctor {
            return;
        }

        // Synthesized default constructor.
        let name = self.graph.type_def(tid).qname.name.clone();
        let fid = self.graph.alloc_function(
            QName::new(NS_CONSTRUCT, name.clone()),
            ejs_parser::ast::Attributes::CONSTRUCTOR,
        );
        let mut buf = CodeBuf::new();
        let init_empty = instance_init.is_empty();
        if !init_empty {
            buf.append(instance_init);
        }
        if base_has_ctor {
            buf.emit(Opcode::CallNextConstructor);
            buf.emit_num(0);
        }
        buf.emit(Opcode::Return);
        self.finalize_function(fid, buf);

        let instance = self.graph.type_def(tid).instance;
        let ctor_name = QName::new(NS_CONSTRUCT, name);
        if let Some(index) = self.graph.find_exact(instance, &ctor_name) {
            self.graph.prop_mut(instance, index).value = Value::Function(fid);
        }
        self.graph.type_mut(tid).constructor = Some(fid);
    }

    fn attach_static_initializer(&mut self, tid: TypeId, static_init: CodeBuf) {
        if static_init.is_empty() {
            return;
        }
        let mut buf = static_init;
        buf.emit(Opcode::Return);
        let fid = self
            .graph
            .alloc_function(QName::new("", "-initializer-"), Default::default());
        self.finalize_function(fid, buf);

        let statics = self.graph.type_def(tid).statics;
        let init_name = QName::new("", crate::phases::define::STATIC_INITIALIZER);
        if let Some(index) = self.graph.find_exact(statics, &init_name) {
            self.graph.prop_mut(statics, index).value = Value::Function(fid);
        }
    }

    pub(crate) fn finalize_function(&mut self, fid: FunId, buf: CodeBuf) {
        debug_assert!(buf.fixups_in_bounds());
        debug_assert!(buf.exceptions.iter().all(|e| e.is_ordered()));
        let max_stack = buf.max_stack.max(0) as u32;
        let exceptions = buf.exceptions.clone();
        self.graph.fun_mut(fid).code = Some(FinalCode {
            bytes: buf.into_bytes(),
            exceptions,
            max_stack,
        });
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn gen_if(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let cond = tree.ast.child(id, 0).expect("if condition");
        self.gen_expr(tree, buf, cond, ValueUse::Consumed);
        buf.adjust(-1); // consumed by the branch below

        let mut then_buf = buf.child();
        if let Some(then) = tree.ast.child(id, 1) {
            self.gen_statement(tree, &mut then_buf, then);
        }

        match tree.ast.child(id, 2) {
            Some(otherwise) => {
                let mut else_buf = buf.child();
                self.gen_statement(tree, &mut else_buf, otherwise);

                debug_assert_eq!(then_buf.stack, else_buf.stack, "if arms did not converge");

                // The then-arm ends with a goto over the else-arm.
                self.emit_forward_branch(&mut then_buf, Opcode::Goto, else_buf.len());
                self.emit_forward_branch(buf, Opcode::BranchFalse, then_buf.len());
                buf.append(then_buf);
                buf.append(else_buf);
            }
            None => {
                self.emit_forward_branch(buf, Opcode::BranchFalse, then_buf.len());
                buf.append(then_buf);
            }
        }
    }

    /// For-shaped loops (`for`, and `while` rewritten by the parser):
    /// `[cond][BranchFalse end][body][per-loop][Goto cond]`.
    fn gen_for(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let init = tree.ast.child(id, 0).expect("for init");
        let cond = tree.ast.child(id, 1).expect("for cond");
        let incr = tree.ast.child(id, 2).expect("for incr");
        let body = tree.ast.child(id, 3).expect("for body");

        if !matches!(tree.ast.kind(init), Kind::Nop) {
            self.gen_statement(tree, buf, init);
        }

        let mut loop_buf = buf.child();
        loop_buf.jump_kinds |= JUMP_BREAK | JUMP_CONTINUE;
        loop_buf.break_mark = loop_buf.stack;

        let has_cond = !matches!(tree.ast.kind(cond), Kind::Nop);
        if has_cond {
            self.gen_expr(tree, &mut loop_buf, cond, ValueUse::Consumed);
            loop_buf.adjust(-1); // consumed by BranchFalse
        }
        let cond_len = loop_buf.len();

        let mut body_buf = loop_buf.child();
        self.gen_statement(tree, &mut body_buf, body);

        let mut per_buf = loop_buf.child();
        if !matches!(tree.ast.kind(incr), Kind::Nop) {
            self.gen_statement(tree, &mut per_buf, incr);
        }

        // Forward branch over body + per-loop + back-goto; sizes are
        // computed with the 32-bit goto first, then the goto shrinks if it
        // fits.
        let body_len = body_buf.len();
        let per_len = per_buf.len();

        let branch_len = if has_cond {
            self.branch_len(body_len + per_len + 5)
        } else {
            0
        };
        let back_total = cond_len + branch_len + body_len + per_len;
        let goto_len = if self.options.optimize >= 1 && back_total + 2 <= 0x80 {
            2
        } else {
            5
        };

        if has_cond {
            // The branch form was fixed when back_total was computed; emit
            // that form even if the shrunken goto would now allow a
            // shorter one.
            let dist = body_len + per_len + goto_len;
            if branch_len == 2 {
                loop_buf.emit(Opcode::BranchFalse8);
                loop_buf.emit_i8(dist as i8);
            } else {
                loop_buf.emit(Opcode::BranchFalse);
                loop_buf.emit_i32(dist as i32);
            }
        }
        loop_buf.append(body_buf);
        loop_buf.append(per_buf);

        let back = (loop_buf.len() + goto_len) as i64;
        if goto_len == 2 {
            loop_buf.emit(Opcode::Goto8);
            loop_buf.emit_i8((-back) as i8);
        } else {
            loop_buf.emit(Opcode::Goto);
            loop_buf.emit_i32((-back) as i32);
        }

        let end = loop_buf.len();
        let per_start = cond_len + branch_len + body_len;
        loop_buf.resolve_loop_fixups(end, Some(per_start));

        buf.append(loop_buf);
    }

    /// do/while: `[body][cond][BranchTrue body]`.
    fn gen_do(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let body = tree.ast.child(id, 0).expect("do body");
        let cond = tree.ast.child(id, 1).expect("do cond");

        let mut loop_buf = buf.child();
        loop_buf.jump_kinds |= JUMP_BREAK | JUMP_CONTINUE;
        loop_buf.break_mark = loop_buf.stack;

        let mut body_buf = loop_buf.child();
        self.gen_statement(tree, &mut body_buf, body);
        let body_len = body_buf.len();
        loop_buf.append(body_buf);

        self.gen_expr(tree, &mut loop_buf, cond, ValueUse::Consumed);
        loop_buf.adjust(-1);

        let back = (loop_buf.len() + 5) as i64;
        loop_buf.emit(Opcode::BranchTrue);
        loop_buf.emit_i32((-back) as i32);

        let end = loop_buf.len();
        loop_buf.resolve_loop_fixups(end, Some(body_len));
        buf.append(loop_buf);
    }

    /// for/in: acquire the iterator, then loop dispatching `next` on a
    /// duplicated iterator reference. The `StopIteration` exception exits
    /// the loop through an iteration-flagged handler that covers only the
    /// dispatch instruction.
    fn gen_for_in(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let iter_var = tree.ast.child(id, 0).expect("for-in variable");
        let get_call = tree.ast.child(id, 1).expect("for-in iterator call");
        let body = tree.ast.child(id, 2).expect("for-in body");

        self.gen_expr(tree, buf, get_call, ValueUse::Consumed);

        let mut loop_buf = buf.child();
        loop_buf.jump_kinds |= JUMP_BREAK | JUMP_CONTINUE;
        loop_buf.break_mark = loop_buf.stack;

        loop_buf.emit(Opcode::Dup);
        loop_buf.adjust(1);

        let dispatch_start = loop_buf.len();
        loop_buf.emit(Opcode::CallObjSlot);
        loop_buf.emit_num(0); // Iterator.next lives in instance slot 0
        loop_buf.emit_num(0);
        loop_buf.adjust(-1);
        let dispatch_end = loop_buf.len();

        loop_buf.emit(Opcode::PushResult);
        loop_buf.adjust(1);

        let target = match tree.ast.kind(iter_var) {
            Kind::VarDefinition(_) => tree.ast.child(iter_var, 0).unwrap_or(iter_var),
            _ => iter_var,
        };
        let lookup = tree.ast.node(target).lookup.clone();
        let qname = tree.ast.node(target).qname.clone().unwrap_or_default();
        self.gen_store_scoped(&mut loop_buf, &lookup, &qname);

        self.gen_statement(tree, &mut loop_buf, body);

        let back = (loop_buf.len() + 5) as i64;
        loop_buf.emit(Opcode::Goto);
        loop_buf.emit_i32((-back) as i32);

        let end = loop_buf.len();
        loop_buf.resolve_loop_fixups(end, Some(0));

        let stop_iteration = self.global_type_ref("StopIteration");
        loop_buf.exceptions.push(ExceptionEntry {
            flags: EX_ITERATION | EX_CATCH,
            try_start: dispatch_start as u32,
            try_end: dispatch_end as u32,
            handler_start: end as u32,
            handler_end: end as u32,
            num_blocks: loop_buf.block_count,
            num_stack: loop_buf.break_mark.max(0) as u32,
            catch_type: stop_iteration,
        });

        buf.append(loop_buf);
        buf.emit(Opcode::Pop); // the iterator
        buf.adjust(-1);
    }

    /// switch: the discriminant stays on the stack; each case tests a
    /// duplicate against its expression and bodies fall through. Section
    /// lengths are computed from the last case backwards.
    fn gen_switch(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let disc = tree.ast.child(id, 0).expect("switch discriminant");
        let cases = tree.ast.child(id, 1).expect("switch cases");

        let entry_mark = buf.stack;
        self.gen_expr(tree, buf, disc, ValueUse::Consumed);

        let mut sw = buf.child();
        sw.jump_kinds |= JUMP_BREAK;
        sw.break_mark = entry_mark;

        let labels: Vec<NodeId> = tree.ast.children(cases).to_vec();
        let mut tests: Vec<Option<CodeBuf>> = Vec::new();
        let mut bodies: Vec<CodeBuf> = Vec::new();

        for &label in &labels {
            let (test, body_node) = match tree.ast.kind(label).clone() {
                Kind::CaseLabel(CaseKind::Case) => {
                    let expr = tree.ast.child(label, 0).expect("case expression");
                    let mut tbuf = sw.child();
                    tbuf.emit(Opcode::Dup);
                    tbuf.adjust(1);
                    self.gen_expr(tree, &mut tbuf, expr, ValueUse::Consumed);
                    tbuf.emit(Opcode::CompareStrictlyEq);
                    tbuf.adjust(-1);
                    tbuf.adjust(-1); // consumed by the mismatch branch
                    (Some(tbuf), tree.ast.child(label, 1))
                }
                Kind::CaseLabel(CaseKind::Default) => (None, tree.ast.child(label, 0)),
                _ => (None, None),
            };
            let mut bbuf = sw.child();
            if let Some(body_node) = body_node {
                self.gen_statement(tree, &mut bbuf, body_node);
            }
            tests.push(test);
            bodies.push(bbuf);
        }

        // Work out section sizes from the last case backwards: each body
        // ends with a goto into the next body (skipping its test), each
        // test ends with a mismatch branch over its body.
        let n = labels.len();
        let mut test_branch_len = vec![0usize; n];
        let mut body_goto_len = vec![0usize; n];
        let mut body_full = vec![0usize; n];

        for i in (0..n).rev() {
            body_goto_len[i] = if i + 1 < n {
                let skip = tests[i + 1].as_ref().map(|t| t.len()).unwrap_or(0)
                    + test_branch_len[i + 1];
                self.branch_len(skip)
            } else {
                0
            };
            body_full[i] = bodies[i].len() + body_goto_len[i];
            test_branch_len[i] = if tests[i].is_some() {
                self.branch_len(body_full[i])
            } else {
                0
            };
        }

        for i in 0..n {
            if let Some(test) = tests[i].take() {
                let branch_over = body_full[i];
                sw.append(test);
                self.emit_forward_branch(&mut sw, Opcode::BranchFalse, branch_over);
            }
            let fall_goto = body_goto_len[i];
            let bbuf = std::mem::replace(&mut bodies[i], CodeBuf::new());
            sw.append(bbuf);
            if fall_goto > 0 {
                let skip = tests[i + 1].as_ref().map(|t| t.len()).unwrap_or(0)
                    + test_branch_len[i + 1];
                self.emit_forward_branch(&mut sw, Opcode::Goto, skip);
            }
        }

        sw.emit(Opcode::Pop); // the discriminant, on fall-out
        sw.adjust(-1);
        let end = sw.len();
        sw.resolve_loop_fixups(end, None);
        buf.append(sw);
    }

    /// try/catch/finally. Each region is built in its own buffer; normal
    /// exits from try and catch run the pending finally first, as do
    /// break/continue/return inside them (the capture flag).
    fn gen_try(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let try_block = tree.ast.child(id, 0).expect("try block");
        let clauses = tree.ast.child(id, 1).expect("catch clauses");
        let finally = tree.ast.child(id, 2).expect("finally slot");
        let has_finally = matches!(tree.ast.kind(finally), Kind::Block);

        let entry_blocks = buf.block_count;
        let entry_stack = buf.stack.max(0) as u32;

        self.states.push();
        if has_finally {
            self.states.top_mut().capture_break = true;
        }

        let mut try_buf = buf.child();
        self.gen_statement(tree, &mut try_buf, try_block);
        if has_finally {
            try_buf.emit(Opcode::Finally);
        }

        let mut catch_bufs: Vec<(Option<GlobalRef>, CodeBuf)> = Vec::new();
        for &catch in tree.ast.children(clauses) {
            let arg = tree.ast.child(catch, 0);
            let body = tree.ast.child(catch, 1).expect("catch body");

            let mut cbuf = buf.child();
            let mut catch_type = None;
            let mut opened_block = false;
            if let Some(arg) = arg {
                if matches!(tree.ast.kind(arg), Kind::CatchArg) {
                    catch_type = tree
                        .ast
                        .node(arg)
                        .lookup
                        .trait_type
                        .map(|tid| self.type_ref(tid));
                    // The catch variable lives in its own block object.
                    cbuf.emit(Opcode::OpenBlock);
                    cbuf.emit_num(cbuf.block_count as i64);
                    cbuf.emit_num(0);
                    cbuf.block_count += 1;
                    opened_block = true;
                    cbuf.emit(Opcode::PushCatchArg);
                    cbuf.adjust(1);
                    let slot = tree.ast.node(arg).lookup.slot.max(0) as u32;
                    cbuf.emit(Opcode::PutBlockSlot);
                    cbuf.emit_num(slot as i64);
                    cbuf.emit_num(0);
                    cbuf.adjust(-1);
                }
            }
            self.gen_statement(tree, &mut cbuf, body);
            if opened_block {
                cbuf.emit(Opcode::CloseBlock);
                cbuf.block_count -= 1;
            }
            if has_finally {
                cbuf.emit(Opcode::Finally);
            }
            catch_bufs.push((catch_type, cbuf));
        }

        self.states.pop();

        let mut finally_buf = buf.child();
        if has_finally {
            self.gen_statement(tree, &mut finally_buf, finally);
            finally_buf.emit(Opcode::EndException);
        }

        // Layout: [try][goto end][catch...][goto end][finally] end:
        let goto_len = 5usize; // patched words stay wide

        let mut total = try_buf.len() + goto_len;
        for (_, cbuf) in &catch_bufs {
            total += cbuf.len() + goto_len;
        }
        let finally_start = total;
        total += finally_buf.len();
        let end = total;

        let base = buf.len();
        let try_start = 0usize;
        let try_end = try_buf.len();
        buf.append(try_buf);
        buf.emit(Opcode::Goto);
        buf.emit_i32((end - (try_end + goto_len)) as i32);

        let mut cursor = try_end + goto_len;
        let mut catch_regions: Vec<(usize, usize, Option<GlobalRef>)> = Vec::new();
        for (catch_type, cbuf) in catch_bufs {
            let start = cursor;
            let len = cbuf.len();
            buf.append(cbuf);
            buf.emit(Opcode::Goto);
            buf.emit_i32((end - (start + len + goto_len)) as i32);
            catch_regions.push((start, start + len, catch_type));
            cursor = start + len + goto_len;
        }
        debug_assert_eq!(cursor, finally_start);

        let last_catch_end = catch_regions
            .last()
            .map(|(_, e, _)| *e)
            .unwrap_or(try_end);
        let has_catches = !catch_regions.is_empty();

        if has_finally {
            buf.append(finally_buf);
        }

        for (start, region_end, catch_type) in catch_regions {
            buf.exceptions.push(
                ExceptionEntry {
                    flags: EX_CATCH,
                    try_start: try_start as u32,
                    try_end: try_end as u32,
                    handler_start: start as u32,
                    handler_end: region_end as u32,
                    num_blocks: entry_blocks,
                    num_stack: entry_stack,
                    catch_type: catch_type.unwrap_or(GlobalRef::None),
                }
                .rebased(base as u32),
            );
        }
        if has_finally {
            let covered_end = if has_catches { last_catch_end } else { try_end };
            buf.exceptions.push(
                ExceptionEntry {
                    flags: EX_FINALLY,
                    try_start: try_start as u32,
                    try_end: covered_end as u32,
                    handler_start: finally_start as u32,
                    handler_end: end as u32,
                    num_blocks: entry_blocks,
                    num_stack: entry_stack,
                    catch_type: GlobalRef::None,
                }
                .rebased(base as u32),
            );
        }
    }

    fn gen_with(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let obj = tree.ast.child(id, 0).expect("with object");
        let body = tree.ast.child(id, 1).expect("with body");

        self.gen_expr(tree, buf, obj, ValueUse::Consumed);
        buf.emit(Opcode::OpenWith);
        buf.adjust(-1);
        buf.block_count += 1;

        self.gen_statement(tree, buf, body);

        buf.emit(Opcode::CloseBlock);
        buf.block_count -= 1;
    }

    fn gen_block(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let needs_object = tree
            .ast
            .node(id)
            .flags
            .contains(NodeFlags::CREATE_BLOCK_OBJECT);
        if needs_object {
            buf.emit(Opcode::OpenBlock);
            buf.emit_num(buf.block_count as i64);
            buf.emit_num(0);
            buf.block_count += 1;
        }
        for &child in tree.ast.children(id) {
            self.gen_statement(tree, buf, child);
        }
        if needs_object {
            buf.emit(Opcode::CloseBlock);
            buf.block_count -= 1;
        }
    }

    fn gen_break_continue(
        &mut self,
        tree: &SourceTree,
        buf: &mut CodeBuf,
        id: NodeId,
        is_break: bool,
        label: Option<String>,
    ) {
        let kind_flag = if is_break { JUMP_BREAK } else { JUMP_CONTINUE };
        if buf.jump_kinds & kind_flag == 0 {
            let loc = tree.ast.node(id).loc.clone();
            let what = if is_break { "break" } else { "continue" };
            self.error(&loc, format!("{} outside of a loop", what));
            return;
        }

        // Unwind operand stack to the loop entry mark.
        let excess = buf.stack - buf.break_mark;
        if excess == 1 {
            buf.emit(Opcode::Pop);
            buf.adjust(-1);
        } else if excess > 1 {
            buf.emit(Opcode::PopItems);
            buf.emit_num(excess as i64);
            buf.adjust(-excess);
        }

        if self.states.top().capture_break {
            buf.emit(Opcode::Finally);
        }

        buf.emit(Opcode::Goto);
        let at = buf.emit_word_placeholder();
        buf.fixups.push(JumpFixup {
            offset: at,
            kind: kind_flag,
            label,
        });
    }

    fn gen_return(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        match tree.ast.child(id, 0) {
            Some(value) => {
                self.gen_expr(tree, buf, value, ValueUse::Returned);
                if self.states.top().capture_break {
                    buf.emit(Opcode::Finally);
                }
                buf.emit(Opcode::ReturnValue);
                buf.adjust(-1);
            }
            None => {
                if self.states.top().capture_break {
                    buf.emit(Opcode::Finally);
                }
                buf.emit(Opcode::Return);
            }
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn gen_expr(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId, usage: ValueUse) {
        match tree.ast.kind(id).clone() {
            Kind::Literal(lit) => self.gen_literal(buf, &lit),
            Kind::QName => {
                let lookup = tree.ast.node(id).lookup.clone();
                let qname = tree.ast.node(id).qname.clone().unwrap_or_default();
                self.gen_load_scoped(buf, &lookup, &qname);
            }
            Kind::This => {
                buf.emit(Opcode::LoadThis);
                buf.adjust(1);
            }
            Kind::Ref => {
                let shared = tree.ast.child(id, 0).expect("shared reference");
                self.gen_expr(tree, buf, shared, ValueUse::Consumed);
            }
            Kind::Dot => self.gen_dot_load(tree, buf, id),
            Kind::Call => self.gen_call(tree, buf, id),
            Kind::New => self.gen_new(tree, buf, id),
            Kind::Super => {
                let argc = self.gen_args(tree, buf, tree.ast.child(id, 0));
                buf.emit(Opcode::CallNextConstructor);
                buf.emit_num(argc as i64);
                buf.adjust(-(argc as i32));
                buf.emit(Opcode::PushResult);
                buf.adjust(1);
            }
            Kind::BinaryOp(op) => self.gen_binary(tree, buf, id, op),
            Kind::UnaryOp(op) => self.gen_unary(tree, buf, id, op, usage),
            Kind::PostfixOp(op) => self.gen_postfix(tree, buf, id, op, usage),
            Kind::AssignOp(_) => self.gen_assign(tree, buf, id, usage),
            Kind::Conditional => self.gen_conditional(tree, buf, id),
            Kind::Expressions => {
                let children = tree.ast.children(id).to_vec();
                for (i, &child) in children.iter().enumerate() {
                    if i + 1 == children.len() {
                        self.gen_expr(tree, buf, child, usage);
                    } else {
                        let mark = buf.stack;
                        self.gen_expr(tree, buf, child, ValueUse::Discarded);
                        let excess = buf.stack - mark;
                        if excess == 1 {
                            buf.emit(Opcode::Pop);
                            buf.adjust(-1);
                        } else if excess > 1 {
                            buf.emit(Opcode::PopItems);
                            buf.emit_num(excess as i64);
                            buf.adjust(-excess);
                        }
                    }
                }
            }
            Kind::ObjectLiteral => self.gen_object_literal(tree, buf, id),
            Kind::ArrayLiteral => {
                let count = tree.ast.children(id).len();
                for &element in &tree.ast.children(id).to_vec() {
                    self.gen_expr(tree, buf, element, ValueUse::Consumed);
                }
                buf.emit(Opcode::NewArray);
                buf.emit_num(count as i64);
                buf.adjust(-(count as i32) + 1);
            }
            Kind::Function(_) => {
                // Hoisted function literal: generate the body, then load
                // the hidden slot it was bound to.
                self.gen_function_body(tree, id);
                let lookup = tree.ast.node(id).lookup.clone();
                let qname = tree.ast.node(id).qname.clone().unwrap_or_default();
                if self.states.top().in_function {
                    if let (Some(_), true) = (lookup.obj, lookup.slot >= 0) {
                        buf.emit(Opcode::DefineFunction);
                        buf.emit_num(lookup.slot as i64);
                        buf.emit_num(lookup.nth_block as i64);
                    }
                }
                self.gen_load_scoped(buf, &lookup, &qname);
            }
            Kind::Nop | Kind::Void => {
                buf.emit(Opcode::LoadUndefined);
                buf.adjust(1);
            }
            other => {
                let loc = tree.ast.node(id).loc.clone();
                self.internal_error_at(&loc, format!("can not generate expression {:?}", other));
            }
        }
    }

    fn gen_literal(&mut self, buf: &mut CodeBuf, lit: &LitValue) {
        match lit {
            LitValue::Null => buf.emit(Opcode::LoadNull),
            LitValue::Undefined => buf.emit(Opcode::LoadUndefined),
            LitValue::True => buf.emit(Opcode::LoadTrue),
            LitValue::False => buf.emit(Opcode::LoadFalse),
            LitValue::Int(n) => {
                if (0..=9).contains(n) {
                    let op = Opcode::from_u8(Opcode::Load0.to_u8() + *n as u8).expect("load-k");
                    buf.emit(op);
                } else {
                    buf.emit(Opcode::LoadInt);
                    buf.emit_num(*n);
                }
            }
            LitValue::Double(n) => {
                buf.emit(Opcode::LoadDouble);
                buf.emit_f64(*n);
            }
            LitValue::Str(s) => {
                let off = self.intern(s);
                buf.emit(Opcode::LoadString);
                buf.emit_num(off);
            }
            LitValue::Regex(s) => {
                let off = self.intern(s);
                buf.emit(Opcode::LoadRegExp);
                buf.emit_num(off);
            }
            LitValue::Xml(s) => {
                let off = self.intern(s);
                buf.emit(Opcode::LoadXml);
                buf.emit_num(off);
            }
            LitValue::Namespace(s) => {
                let off = self.intern(s);
                buf.emit(Opcode::LoadNamespace);
                buf.emit_num(off);
            }
        }
        buf.adjust(1);
    }

    /// Load through a scoped lookup, narrowest opcode first.
    fn gen_load_scoped(&mut self, buf: &mut CodeBuf, lookup: &Lookup, qname: &QName) {
        if lookup.slot < 0 || lookup.obj.is_none() {
            let space = self.intern(&qname.space);
            let name = self.intern(&qname.name);
            buf.emit(Opcode::GetScopedName);
            buf.emit_num(space);
            buf.emit_num(name);
            buf.adjust(1);
            return;
        }
        let slot = lookup.slot as u32;
        match lookup.obj.unwrap() {
            ContainerRef::Function(f) if Some(f) == self.states.top().fun => {
                self.emit_slot_op(buf, Opcode::GetLocalSlot0, Opcode::GetLocalSlot, slot);
            }
            ContainerRef::Function(_) | ContainerRef::Block(_) => {
                buf.emit(Opcode::GetBlockSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_block as i64);
            }
            ContainerRef::Instance(_) if lookup.use_this => {
                self.emit_slot_op(buf, Opcode::GetThisSlot0, Opcode::GetThisSlot, slot);
            }
            ContainerRef::Type(_) if lookup.use_this => {
                buf.emit(Opcode::GetThisTypeSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_base as i64);
            }
            ContainerRef::Global => {
                buf.emit(Opcode::GetGlobalSlot);
                buf.emit_num(slot as i64);
            }
            ContainerRef::Type(_) => {
                buf.emit(Opcode::GetTypeSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_base as i64);
            }
            ContainerRef::Instance(_) => {
                // No usable receiver; fall back to dynamic lookup.
                let space = self.intern(&qname.space);
                let name = self.intern(&qname.name);
                buf.emit(Opcode::GetScopedName);
                buf.emit_num(space);
                buf.emit_num(name);
            }
        }
        buf.adjust(1);
    }

    /// Store through a scoped lookup. Pops the value.
    fn gen_store_scoped(&mut self, buf: &mut CodeBuf, lookup: &Lookup, qname: &QName) {
        if lookup.slot < 0 || lookup.obj.is_none() {
            let space = self.intern(&qname.space);
            let name = self.intern(&qname.name);
            buf.emit(Opcode::PutScopedName);
            buf.emit_num(space);
            buf.emit_num(name);
            buf.adjust(-1);
            return;
        }
        let slot = lookup.slot as u32;
        match lookup.obj.unwrap() {
            ContainerRef::Function(f) if Some(f) == self.states.top().fun => {
                self.emit_slot_op(buf, Opcode::PutLocalSlot0, Opcode::PutLocalSlot, slot);
            }
            ContainerRef::Function(_) | ContainerRef::Block(_) => {
                buf.emit(Opcode::PutBlockSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_block as i64);
            }
            ContainerRef::Instance(_) if lookup.use_this => {
                self.emit_slot_op(buf, Opcode::PutThisSlot0, Opcode::PutThisSlot, slot);
            }
            ContainerRef::Type(_) if lookup.use_this => {
                buf.emit(Opcode::PutThisTypeSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_base as i64);
            }
            ContainerRef::Global => {
                buf.emit(Opcode::PutGlobalSlot);
                buf.emit_num(slot as i64);
            }
            ContainerRef::Type(_) => {
                buf.emit(Opcode::PutTypeSlot);
                buf.emit_num(slot as i64);
                buf.emit_num(lookup.nth_base as i64);
            }
            ContainerRef::Instance(_) => {
                let space = self.intern(&qname.space);
                let name = self.intern(&qname.name);
                buf.emit(Opcode::PutScopedName);
                buf.emit_num(space);
                buf.emit_num(name);
            }
        }
        buf.adjust(-1);
    }

    /// `obj.name` or `obj[expr]` in load position.
    fn gen_dot_load(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let lhs = tree.ast.child(id, 0).expect("dot object");
        let rhs = tree.ast.child(id, 1).expect("dot member");

        // `super.x` reads through the receiver; the slot is absolute.
        if matches!(tree.ast.kind(lhs), Kind::Super) {
            buf.emit(Opcode::LoadThis);
            buf.adjust(1);
        } else {
            self.gen_expr(tree, buf, lhs, ValueUse::Consumed);
        }

        if matches!(tree.ast.kind(rhs), Kind::QName) {
            let lookup = tree.ast.node(rhs).lookup.clone();
            let qname = tree.ast.node(rhs).qname.clone().unwrap_or_default();
            if lookup.slot >= 0 && lookup.obj.is_some() {
                self.emit_slot_op(
                    buf,
                    Opcode::GetObjSlot0,
                    Opcode::GetObjSlot,
                    lookup.slot as u32,
                );
            } else {
                let space = self.intern(&qname.space);
                let name = self.intern(&qname.name);
                buf.emit(Opcode::GetObjName);
                buf.emit_num(space);
                buf.emit_num(name);
            }
            // Pops the object, pushes the value.
        } else {
            self.gen_expr(tree, buf, rhs, ValueUse::Consumed);
            buf.emit(Opcode::GetObjNameExpr);
            buf.adjust(-1);
        }
    }

    fn gen_args(&mut self, tree: &SourceTree, buf: &mut CodeBuf, args: Option<NodeId>) -> usize {
        let mut argc = 0;
        if let Some(args) = args {
            for &arg in &tree.ast.children(args).to_vec() {
                self.gen_expr(tree, buf, arg, ValueUse::Consumed);
                argc += 1;
            }
        }
        argc
    }

    fn gen_call(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let callee = tree.ast.child(id, 0).expect("callee");
        let args = tree.ast.child(id, 1);

        match tree.ast.kind(callee).clone() {
            Kind::QName => {
                let argc = self.gen_args(tree, buf, args);
                let lookup = tree.ast.node(callee).lookup.clone();
                let qname = tree.ast.node(callee).qname.clone().unwrap_or_default();

                if lookup.slot < 0 || lookup.obj.is_none() {
                    let space = self.intern(&qname.space);
                    let name = self.intern(&qname.name);
                    buf.emit(Opcode::CallScopedName);
                    buf.emit_num(space);
                    buf.emit_num(name);
                    buf.emit_num(argc as i64);
                } else {
                    match lookup.obj.unwrap() {
                        ContainerRef::Global => {
                            buf.emit(Opcode::CallGlobalSlot);
                            buf.emit_num(lookup.slot as i64);
                            buf.emit_num(argc as i64);
                        }
                        ContainerRef::Instance(_) if lookup.use_this => {
                            buf.emit(Opcode::CallThisSlot);
                            buf.emit_num(lookup.slot as i64);
                            buf.emit_num(argc as i64);
                        }
                        ContainerRef::Type(_) if lookup.use_this => {
                            buf.emit(Opcode::CallThisStaticSlot);
                            buf.emit_num(lookup.slot as i64);
                            buf.emit_num(argc as i64);
                        }
                        ContainerRef::Function(_) | ContainerRef::Block(_) => {
                            buf.emit(Opcode::CallBlockSlot);
                            buf.emit_num(lookup.slot as i64);
                            buf.emit_num(lookup.nth_block as i64);
                            buf.emit_num(argc as i64);
                        }
                        _ => {
                            let space = self.intern(&qname.space);
                            let name = self.intern(&qname.name);
                            buf.emit(Opcode::CallScopedName);
                            buf.emit_num(space);
                            buf.emit_num(name);
                            buf.emit_num(argc as i64);
                        }
                    }
                }
                buf.adjust(-(argc as i32));
            }
            Kind::Dot => {
                let obj = tree.ast.child(callee, 0).expect("call object");
                let member = tree.ast.child(callee, 1).expect("call member");

                if matches!(tree.ast.kind(obj), Kind::Super) {
                    buf.emit(Opcode::LoadThis);
                    buf.adjust(1);
                } else {
                    self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                }
                let argc = self.gen_args(tree, buf, args);

                if matches!(tree.ast.kind(member), Kind::QName) {
                    let lookup = tree.ast.node(member).lookup.clone();
                    let qname = tree.ast.node(member).qname.clone().unwrap_or_default();
                    if lookup.slot >= 0 && lookup.obj.is_some() {
                        let op = if lookup.owner_is_type {
                            Opcode::CallObjStaticSlot
                        } else if lookup.instance_property {
                            Opcode::CallObjInstanceSlot
                        } else {
                            Opcode::CallObjSlot
                        };
                        buf.emit(op);
                        buf.emit_num(lookup.slot as i64);
                        buf.emit_num(argc as i64);
                    } else {
                        let space = self.intern(&qname.space);
                        let name = self.intern(&qname.name);
                        buf.emit(Opcode::CallObjName);
                        buf.emit_num(space);
                        buf.emit_num(name);
                        buf.emit_num(argc as i64);
                    }
                } else {
                    // Computed member call: name value joins the operands.
                    self.gen_expr(tree, buf, member, ValueUse::Consumed);
                    buf.emit(Opcode::CallObjName);
                    buf.emit_num(0);
                    buf.emit_num(0);
                    buf.emit_num(argc as i64);
                    buf.adjust(-1);
                }
                buf.adjust(-(argc as i32) - 1);
            }
            _ => {
                // Computed callee in expression position: the receiver is
                // null. This preserves the long-standing call shape for
                // non-name callees.
                let argc = self.gen_args(tree, buf, args);
                self.gen_expr(tree, buf, callee, ValueUse::Consumed);
                buf.emit(Opcode::LoadNull);
                buf.adjust(1);
                buf.emit(Opcode::Call);
                buf.emit_num(argc as i64);
                buf.adjust(-(argc as i32) - 2);
            }
        }

        buf.emit(Opcode::PushResult);
        buf.adjust(1);
    }

    fn gen_new(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let callee = tree.ast.child(id, 0).expect("new type");
        let args = tree.ast.child(id, 1);

        self.gen_expr(tree, buf, callee, ValueUse::Consumed);
        buf.emit(Opcode::New); // pops the type, pushes the instance

        let argc = self.gen_args(tree, buf, args);
        buf.emit(Opcode::CallConstructor);
        buf.emit_num(argc as i64);
        buf.adjust(-(argc as i32));
    }

    fn gen_binary(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId, op: BinOp) {
        if matches!(op, BinOp::And | BinOp::Or) {
            // Short-circuit: duplicate the left value for the test.
            let lhs = tree.ast.child(id, 0).expect("lhs");
            let rhs = tree.ast.child(id, 1).expect("rhs");

            self.gen_expr(tree, buf, lhs, ValueUse::Consumed);
            buf.emit(Opcode::Dup);
            buf.adjust(1);

            let mut rhs_buf = buf.child();
            rhs_buf.adjust(-2); // branch consumes the dup, pop the original
            rhs_buf.emit(Opcode::Pop);
            self.gen_expr(tree, &mut rhs_buf, rhs, ValueUse::Consumed);

            let branch = if op == BinOp::And {
                Opcode::BranchFalse
            } else {
                Opcode::BranchTrue
            };
            buf.adjust(-1); // the dup, consumed by the branch
            self.emit_forward_branch(buf, branch, rhs_buf.len());
            buf.append(rhs_buf);
            return;
        }

        let lhs = tree.ast.child(id, 0).expect("lhs");
        let rhs = tree.ast.child(id, 1).expect("rhs");
        self.gen_expr(tree, buf, lhs, ValueUse::Consumed);
        self.gen_expr(tree, buf, rhs, ValueUse::Consumed);

        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Rem => Opcode::Rem,
            BinOp::Shl => Opcode::Shl,
            BinOp::Shr => Opcode::Shr,
            BinOp::Ushr => Opcode::Ushr,
            BinOp::BitAnd => Opcode::BitAnd,
            BinOp::BitOr => Opcode::BitOr,
            BinOp::BitXor => Opcode::BitXor,
            BinOp::Eq => Opcode::CompareEq,
            BinOp::Ne => Opcode::CompareNe,
            BinOp::StrictEq => Opcode::CompareStrictlyEq,
            BinOp::StrictNe => Opcode::CompareStrictlyNe,
            BinOp::Lt => Opcode::CompareLt,
            BinOp::Le => Opcode::CompareLe,
            BinOp::Gt => Opcode::CompareGt,
            BinOp::Ge => Opcode::CompareGe,
            BinOp::In => Opcode::In,
            BinOp::InstanceOf => Opcode::InstanceOf,
            BinOp::Is => Opcode::IsA,
            BinOp::Cast => Opcode::CastOp,
            BinOp::Like => Opcode::Like,
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        buf.emit(opcode);
        buf.adjust(-1);
    }

    fn gen_unary(
        &mut self,
        tree: &SourceTree,
        buf: &mut CodeBuf,
        id: NodeId,
        op: UnOp,
        usage: ValueUse,
    ) {
        let operand = tree.ast.child(id, 0).expect("operand");
        match op {
            UnOp::Neg => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
                buf.emit(Opcode::Neg);
            }
            UnOp::Plus => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
            }
            UnOp::Not => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
                buf.emit(Opcode::LogicalNot);
            }
            UnOp::BitNot => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
                buf.emit(Opcode::BitNot);
            }
            UnOp::TypeOf => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
                buf.emit(Opcode::TypeOf);
            }
            UnOp::Void => {
                self.gen_expr(tree, buf, operand, ValueUse::Consumed);
                buf.emit(Opcode::Pop);
                buf.adjust(-1);
                buf.emit(Opcode::LoadUndefined);
                buf.adjust(1);
            }
            UnOp::Delete => match tree.ast.kind(operand).clone() {
                Kind::QName => {
                    let qname = tree.ast.node(operand).qname.clone().unwrap_or_default();
                    let space = self.intern(&qname.space);
                    let name = self.intern(&qname.name);
                    buf.emit(Opcode::DeleteScopedName);
                    buf.emit_num(space);
                    buf.emit_num(name);
                    buf.adjust(1); // pushes the deletion result
                }
                Kind::Dot => {
                    let obj = tree.ast.child(operand, 0).expect("delete object");
                    let member = tree.ast.child(operand, 1).expect("delete member");
                    self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                    let qname = tree.ast.node(member).qname.clone().unwrap_or_default();
                    let space = self.intern(&qname.space);
                    let name = self.intern(&qname.name);
                    buf.emit(Opcode::DeleteObjName);
                    buf.emit_num(space);
                    buf.emit_num(name);
                    // Pops the object, pushes the result.
                }
                _ => {
                    let loc = tree.ast.node(id).loc.clone();
                    self.error(&loc, "invalid delete target");
                }
            },
            UnOp::PreInc | UnOp::PreDec => {
                let add = if op == UnOp::PreInc {
                    Opcode::Add
                } else {
                    Opcode::Sub
                };
                self.gen_incdec(tree, buf, operand, add, usage, false);
            }
        }
    }

    fn gen_postfix(
        &mut self,
        tree: &SourceTree,
        buf: &mut CodeBuf,
        id: NodeId,
        op: PostOp,
        usage: ValueUse,
    ) {
        let operand = tree.ast.child(id, 0).expect("operand");
        let add = if op == PostOp::Inc {
            Opcode::Add
        } else {
            Opcode::Sub
        };
        self.gen_incdec(tree, buf, operand, add, usage, true);
    }

    /// Shared increment/decrement: load, adjust by one, store. Postfix in
    /// value position duplicates the original value first.
    fn gen_incdec(
        &mut self,
        tree: &SourceTree,
        buf: &mut CodeBuf,
        operand: NodeId,
        add: Opcode,
        usage: ValueUse,
        postfix: bool,
    ) {
        if !matches!(tree.ast.kind(operand), Kind::QName) {
            // Re-evaluate the object expression for the store side.
            self.gen_expr(tree, buf, operand, ValueUse::Consumed);
            if postfix && usage.needs_value() {
                buf.emit(Opcode::Dup);
                buf.adjust(1);
            }
            buf.emit(Opcode::Load1);
            buf.adjust(1);
            buf.emit(add);
            buf.adjust(-1);
            if !postfix && usage.needs_value() {
                buf.emit(Opcode::Dup);
                buf.adjust(1);
            }
            self.gen_store_of(tree, buf, operand);
            if !usage.needs_value() && postfix {
                // The duplicate was skipped; nothing remains.
            }
            return;
        }

        let lookup = tree.ast.node(operand).lookup.clone();
        let qname = tree.ast.node(operand).qname.clone().unwrap_or_default();
        self.gen_load_scoped(buf, &lookup, &qname);
        if postfix && usage.needs_value() {
            buf.emit(Opcode::Dup);
            buf.adjust(1);
        }
        buf.emit(Opcode::Load1);
        buf.adjust(1);
        buf.emit(add);
        buf.adjust(-1);
        if !postfix && usage.needs_value() {
            buf.emit(Opcode::Dup);
            buf.adjust(1);
        }
        self.gen_store_scoped(buf, &lookup, &qname);
    }

    /// Store to an arbitrary lvalue whose value is on top of the stack.
    /// For Dot targets the object expression is re-evaluated.
    fn gen_store_of(&mut self, tree: &SourceTree, buf: &mut CodeBuf, target: NodeId) {
        match tree.ast.kind(target).clone() {
            Kind::QName => {
                let lookup = tree.ast.node(target).lookup.clone();
                let qname = tree.ast.node(target).qname.clone().unwrap_or_default();
                self.gen_store_scoped(buf, &lookup, &qname);
            }
            Kind::Dot => {
                let obj = tree.ast.child(target, 0).expect("store object");
                let member = tree.ast.child(target, 1).expect("store member");
                self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                buf.emit(Opcode::Swap);
                if matches!(tree.ast.kind(member), Kind::QName) {
                    let lookup = tree.ast.node(member).lookup.clone();
                    let qname = tree.ast.node(member).qname.clone().unwrap_or_default();
                    if lookup.slot >= 0 && lookup.obj.is_some() {
                        self.emit_slot_op(
                            buf,
                            Opcode::PutObjSlot0,
                            Opcode::PutObjSlot,
                            lookup.slot as u32,
                        );
                    } else {
                        let space = self.intern(&qname.space);
                        let name = self.intern(&qname.name);
                        buf.emit(Opcode::PutObjName);
                        buf.emit_num(space);
                        buf.emit_num(name);
                    }
                    buf.adjust(-2);
                } else {
                    self.gen_expr(tree, buf, member, ValueUse::Consumed);
                    buf.emit(Opcode::PutObjNameExpr);
                    buf.adjust(-3);
                }
            }
            _ => {
                let loc = tree.ast.node(target).loc.clone();
                self.error(&loc, "invalid assignment target");
            }
        }
    }

    fn gen_assign(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId, usage: ValueUse) {
        let lhs = tree.ast.child(id, 0).expect("assignment target");
        let rhs = tree.ast.child(id, 1).expect("assignment value");

        match tree.ast.kind(lhs).clone() {
            Kind::QName => {
                let lookup = tree.ast.node(lhs).lookup.clone();
                let qname = tree.ast.node(lhs).qname.clone().unwrap_or_default();
                self.gen_expr(tree, buf, rhs, ValueUse::Consumed);
                if usage.needs_value() {
                    buf.emit(Opcode::Dup);
                    buf.adjust(1);
                }
                self.gen_store_scoped(buf, &lookup, &qname);
            }
            Kind::Dot => {
                let obj = tree.ast.child(lhs, 0).expect("target object");
                let member = tree.ast.child(lhs, 1).expect("target member");

                if usage.needs_value() {
                    // Value first, duplicated beneath the store operands.
                    self.gen_expr(tree, buf, rhs, ValueUse::Consumed);
                    buf.emit(Opcode::Dup);
                    buf.adjust(1);
                    self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                    if matches!(tree.ast.kind(member), Kind::QName) {
                        buf.emit(Opcode::Swap);
                        self.emit_member_store(tree, buf, member);
                        buf.adjust(-2);
                    } else {
                        self.gen_expr(tree, buf, member, ValueUse::Consumed);
                        buf.emit(Opcode::PutObjNameExpr);
                        buf.adjust(-3);
                    }
                } else {
                    match tree.ast.kind(member).clone() {
                        Kind::QName => {
                            self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                            self.gen_expr(tree, buf, rhs, ValueUse::Consumed);
                            self.emit_member_store(tree, buf, member);
                            buf.adjust(-2);
                        }
                        _ => {
                            self.gen_expr(tree, buf, rhs, ValueUse::Consumed);
                            self.gen_expr(tree, buf, obj, ValueUse::Consumed);
                            self.gen_expr(tree, buf, member, ValueUse::Consumed);
                            buf.emit(Opcode::PutObjNameExpr);
                            buf.adjust(-3);
                        }
                    }
                }
            }
            _ => {
                let loc = tree.ast.node(id).loc.clone();
                self.error(&loc, "invalid assignment target");
            }
        }
    }

    /// Emit the member-store opcode for `[.., obj, value]`.
    fn emit_member_store(&mut self, tree: &SourceTree, buf: &mut CodeBuf, member: NodeId) {
        let lookup = tree.ast.node(member).lookup.clone();
        let qname = tree.ast.node(member).qname.clone().unwrap_or_default();
        if lookup.slot >= 0 && lookup.obj.is_some() {
            self.emit_slot_op(buf, Opcode::PutObjSlot0, Opcode::PutObjSlot, lookup.slot as u32);
        } else {
            let space = self.intern(&qname.space);
            let name = self.intern(&qname.name);
            buf.emit(Opcode::PutObjName);
            buf.emit_num(space);
            buf.emit_num(name);
        }
    }

    fn gen_conditional(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let cond = tree.ast.child(id, 0).expect("condition");
        let then = tree.ast.child(id, 1).expect("then value");
        let otherwise = tree.ast.child(id, 2).expect("else value");

        self.gen_expr(tree, buf, cond, ValueUse::Consumed);
        buf.adjust(-1);

        let mut then_buf = buf.child();
        self.gen_expr(tree, &mut then_buf, then, ValueUse::Consumed);
        let mut else_buf = buf.child();
        self.gen_expr(tree, &mut else_buf, otherwise, ValueUse::Consumed);

        debug_assert_eq!(
            then_buf.stack, else_buf.stack,
            "conditional arms did not converge"
        );

        self.emit_forward_branch(&mut then_buf, Opcode::Goto, else_buf.len());
        self.emit_forward_branch(buf, Opcode::BranchFalse, then_buf.len());
        let then_stack = then_buf.stack;
        buf.append(then_buf);
        buf.append(else_buf);
        buf.stack = then_stack;
    }

    fn gen_object_literal(&mut self, tree: &SourceTree, buf: &mut CodeBuf, id: NodeId) {
        let fields: Vec<NodeId> = tree.ast.children(id).to_vec();
        let mut names = Vec::with_capacity(fields.len());
        for &field in &fields {
            if let Kind::Field(info) = tree.ast.kind(field).clone() {
                if let Some(value) = tree.ast.child(field, 0) {
                    self.gen_expr(tree, buf, value, ValueUse::Consumed);
                }
                names.push((self.intern(&info.space), self.intern(&info.name)));
            }
        }
        let object_ref = self.global_type_ref("Object");
        buf.emit(Opcode::NewObject);
        buf.emit_global_ref(&object_ref);
        buf.emit_num(names.len() as i64);
        for (space, name) in &names {
            buf.emit_num(*space);
            buf.emit_num(*name);
        }
        buf.adjust(-(names.len() as i32) + 1);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Emit a slot-family opcode: the dedicated form for slots 0-9, the
    /// generic form with an operand otherwise.
    fn emit_slot_op(&mut self, buf: &mut CodeBuf, base: Opcode, generic: Opcode, slot: u32) {
        match Opcode::slot_form(base, slot) {
            Some(op) => buf.emit(op),
            None => {
                buf.emit(generic);
                buf.emit_num(slot as i64);
            }
        }
    }

    /// Bytes a forward branch of `distance` will occupy.
    fn branch_len(&self, distance: usize) -> usize {
        if self.options.optimize >= 1 && distance < SHORT_JUMP_MAX {
            2
        } else {
            5
        }
    }

    /// Emit a forward branch over `distance` bytes, selecting the 8-bit
    /// form when it fits and the optimizer allows it.
    fn emit_forward_branch(&mut self, buf: &mut CodeBuf, op32: Opcode, distance: usize) {
        let op8 = match op32 {
            Opcode::Goto => Some(Opcode::Goto8),
            Opcode::BranchTrue => Some(Opcode::BranchTrue8),
            Opcode::BranchFalse => Some(Opcode::BranchFalse8),
            _ => None,
        };
        match op8 {
            Some(op8) if self.options.optimize >= 1 && distance < SHORT_JUMP_MAX => {
                buf.emit(op8);
                buf.emit_i8(distance as i8);
            }
            _ => {
                buf.emit(op32);
                buf.emit_i32(distance as i32);
            }
        }
    }

    /// Global reference to a named core type.
    fn global_type_ref(&self, name: &str) -> GlobalRef {
        match self
            .graph
            .find_in_block(self.graph.global, &QName::unqualified(name))
        {
            Some(index) => GlobalRef::Slot(self.graph.prop(self.graph.global, index).slot),
            None => GlobalRef::None,
        }
    }

    /// Global reference to a resolved type id.
    fn type_ref(&self, tid: TypeId) -> GlobalRef {
        let qname = self.graph.type_def(tid).qname.clone();
        match self.graph.find_exact(self.graph.global, &qname) {
            Some(index) => GlobalRef::Slot(self.graph.prop(self.graph.global, index).slot),
            None => GlobalRef::None,
        }
    }

    /// Intern a string into the current module's pool (or the ephemeral
    /// pool during conditional-expression compilation).
    pub(crate) fn intern(&mut self, s: &str) -> i64 {
        let result = if let Some(pool) = self.hash_pool.as_mut() {
            pool.add(s)
        } else {
            let index = self.states.top().module.unwrap_or(0);
            self.modules[index].pool.add(s)
        };
        match result {
            Ok(offset) => offset as i64,
            Err(err) => {
                self.status.fatal = true;
                self.internal_error(format!("{}", err));
                0
            }
        }
    }
}
