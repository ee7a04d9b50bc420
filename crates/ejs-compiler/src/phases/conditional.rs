//! Phase 2 — Conditional.
//!
//! Evaluates `#expr { body }` guards by re-entering the full pipeline on a
//! synthetic tree holding just the expression, generating its initializer,
//! and executing it with the embedded constant evaluator. A false guard
//! disables the body and removes the declarations phase 1 created for it.
//!
//! The phase also hoists block-local `var` declarations into the nearest
//! function/class/global scope under a fresh hoisted namespace, and
//! decides which lexical blocks still need a runtime block object.

use crate::eval;
use crate::phases::ScopeEntry;
use crate::Compiler;
use ejs_parser::ast::{Ast, ContainerRef, Kind, NodeFlags, NodeId, QName, VarKind};
use ejs_parser::parser::SourceTree;

impl Compiler {
    pub(crate) fn phase_conditional(&mut self, tree: &mut SourceTree) {
        log::debug!("conditional: {}", tree.path);
        self.states.top_mut().var_block = Some(ContainerRef::Global);
        self.scopes = vec![ScopeEntry::new(ContainerRef::Global)];
        self.conditional_node(tree, tree.root);
    }

    fn conditional_children(&mut self, tree: &mut SourceTree, id: NodeId) {
        for child in tree.ast.children(id).to_vec() {
            self.conditional_node(tree, child);
        }
    }

    fn conditional_node(&mut self, tree: &mut SourceTree, id: NodeId) {
        match tree.ast.kind(id).clone() {
            Kind::Hash => self.conditional_hash(tree, id),
            Kind::Block => {
                self.states.push();
                if let Some(ContainerRef::Block(bid)) = tree.ast.node(id).lookup.obj {
                    self.states.top_mut().let_block = Some(bid);
                }
                self.conditional_children(tree, id);
                self.states.pop();

                self.hoist_block_vars(tree, id);
                self.decide_block_object(tree, id);
            }
            Kind::Function(_) => {
                if let Some(ejs_parser::ast::BoundValue::Function(fid)) =
                    tree.ast.node(id).lookup.value.clone()
                {
                    self.states.push();
                    self.states.top_mut().var_block = Some(ContainerRef::Function(fid));
                    self.states.top_mut().let_block = None;
                    self.states.top_mut().in_function = true;
                    self.conditional_children(tree, id);
                    self.states.pop();
                } else {
                    self.conditional_children(tree, id);
                }
            }
            Kind::Class(_) => {
                if let Some(ejs_parser::ast::BoundValue::Type(tid)) =
                    tree.ast.node(id).lookup.value.clone()
                {
                    self.states.push();
                    self.states.top_mut().var_block = Some(ContainerRef::Instance(tid));
                    self.states.top_mut().in_class = true;
                    self.conditional_children(tree, id);
                    self.states.pop();
                } else {
                    self.conditional_children(tree, id);
                }
            }
            _ => self.conditional_children(tree, id),
        }
    }

    // ========================================================================
    // Hash evaluation
    // ========================================================================

    fn conditional_hash(&mut self, tree: &mut SourceTree, id: NodeId) {
        let expr = match tree.ast.child(id, 0) {
            Some(e) => e,
            None => return,
        };
        let body = tree.ast.child(id, 1);

        match self.evaluate_hash(tree, expr) {
            Some(false) => {
                tree.ast.node_mut(id).flags |= NodeFlags::DISABLED;
                if let Some(body) = body {
                    self.disable_subtree(tree, body);
                }
            }
            _ => {
                if let Some(body) = body {
                    self.conditional_node(tree, body);
                }
            }
        }
    }

    /// Run the pipeline re-entrantly on a synthetic tree holding a copy of
    /// the guard expression, then execute its initializer.
    fn evaluate_hash(&mut self, tree: &SourceTree, expr: NodeId) -> Option<bool> {
        let loc = tree.ast.node(expr).loc.clone();

        let mut ast = Ast::new();
        let root = ast.alloc(Kind::Program, loc.clone());
        let dirs = ast.alloc(Kind::Directives, loc.clone());
        ast.append(root, dirs);
        let copy = tree.ast.deep_copy_into(expr, &mut ast);
        ast.append(dirs, copy);

        let mut sub = SourceTree {
            ast,
            root,
            path: format!("{}#", tree.path),
            errors: Vec::new(),
            error_count: 0,
            warnings: Vec::new(),
        };

        // Save everything the nested pipeline would clobber, including the
        // graph arena sizes so synthetic entities do not leak out.
        let saved_states = self.states.save();
        let saved_scopes = std::mem::take(&mut self.scopes);
        let saved_hoist = self.hoist_counter;
        let saved_blocks = self.graph.blocks.len();
        let saved_types = self.graph.types.len();
        let saved_funcs = self.graph.funcs.len();
        let saved_globals = self.graph.block(self.graph.global).properties.len();

        self.phase_define(&mut sub);
        self.phase_conditional(&mut sub);
        self.phase_fixup();
        self.phase_bind(&mut sub);

        let outcome = self.gen_constant_expr(&sub, copy).and_then(|(code, pool)| {
            eval::execute(&code, &pool, &self.graph).map_err(|e| e.to_string())
        });

        self.graph.blocks.truncate(saved_blocks);
        self.graph.types.truncate(saved_types);
        self.graph.funcs.truncate(saved_funcs);
        self.graph
            .block_mut(self.graph.global)
            .properties
            .truncate(saved_globals);
        self.hoist_counter = saved_hoist;
        self.scopes = saved_scopes;
        self.states.restore(saved_states);

        match outcome {
            Ok(value) => Some(value.truthy()),
            Err(message) => {
                self.error(&loc, format!("invalid conditional expression: {}", message));
                None
            }
        }
    }

    /// Mark a disabled subtree and tombstone every declaration phase 1
    /// created inside it.
    fn disable_subtree(&mut self, tree: &mut SourceTree, body: NodeId) {
        for node in tree.ast.preorder(body) {
            tree.ast.node_mut(node).flags |= NodeFlags::DISABLED;
            let (obj, qname) = {
                let n = tree.ast.node(node);
                (n.lookup.obj, n.qname.clone())
            };
            if let (Some(container), Some(qname)) = (obj, qname) {
                let block = self.graph.container_block(container);
                if let Some(index) = self.graph.find_exact(block, &qname) {
                    self.graph.prop_mut(block, index).deleted = true;
                }
            }
        }
    }

    // ========================================================================
    // Hoisting and block objects
    // ========================================================================

    /// Move `var` declarations out of a lexical block into the enclosing
    /// var scope, re-qualified with a fresh hoisted namespace that is
    /// opened on the target block.
    fn hoist_block_vars(&mut self, tree: &mut SourceTree, block_node: NodeId) {
        let bid = match tree.ast.node(block_node).lookup.obj {
            Some(ContainerRef::Block(b)) => b,
            _ => return,
        };
        let target = self.states.top().var_block.unwrap_or(ContainerRef::Global);

        let mut hoisted_space: Option<String> = None;
        for node in tree.ast.preorder(block_node) {
            if !matches!(tree.ast.kind(node), Kind::VarDefinition(VarKind::Var)) {
                continue;
            }
            for item in tree.ast.children(node).to_vec() {
                let item_node = tree.ast.node(item);
                if item_node.lookup.obj != Some(ContainerRef::Block(bid)) {
                    continue;
                }
                let qname = match item_node.qname.clone() {
                    Some(q) => q,
                    None => continue,
                };

                let space = hoisted_space.get_or_insert_with(|| {
                    let s = format!("-hoisted-{}", self.hoist_counter);
                    self.hoist_counter += 1;
                    s
                });
                let new_qname = QName::new(space.clone(), qname.name.clone());

                let (trait_, value, doc) = match self.graph.find_exact(bid, &qname) {
                    Some(index) => {
                        let prop = self.graph.prop_mut(bid, index);
                        prop.deleted = true;
                        (prop.trait_.clone(), prop.value.clone(), prop.doc.clone())
                    }
                    None => continue,
                };

                let target_block = self.graph.container_block(target);
                match self.graph.define(target_block, new_qname.clone(), trait_, value) {
                    Ok(index) => {
                        self.graph.prop_mut(target_block, index as usize).doc = doc;
                        let n = tree.ast.node_mut(item);
                        n.qname = Some(new_qname);
                        n.flags |= NodeFlags::HOISTED;
                        n.lookup.obj = Some(target);
                        n.lookup.slot = index as i32;
                    }
                    Err(dup) => {
                        let loc = tree.ast.node(item).loc.clone();
                        self.error(&loc, format!("'{}' is already defined", dup.qname.name));
                    }
                }
            }
        }

        if let Some(space) = hoisted_space {
            let target_block = self.graph.container_block(target);
            self.graph
                .block_mut(target_block)
                .open_namespaces
                .push(space);
        }
    }

    /// A block still holding live properties needs a runtime block object.
    fn decide_block_object(&mut self, tree: &mut SourceTree, block_node: NodeId) {
        if let Some(ContainerRef::Block(bid)) = tree.ast.node(block_node).lookup.obj {
            if self.graph.block(bid).live_count() > 0 {
                tree.ast.node_mut(block_node).flags |= NodeFlags::CREATE_BLOCK_OBJECT;
            }
        }
    }
}
