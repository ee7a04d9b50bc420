//! Phase 1 — Define.
//!
//! Creates the VM entity for every declaration: types with their static
//! and instance blocks, functions with activation blocks, variable and
//! namespace slots. Constructor and static-initializer slots are reserved
//! here and trimmed during fixup when unused. Each declaration node's
//! Lookup records where its entity was defined so later phases and the
//! code generator can reach it.

use crate::graph::{Trait, Value, NS_CONSTRUCT, NS_PRIVATE};
use crate::phases::{declared_space, ScopeEntry};
use crate::Compiler;
use ejs_parser::ast::{
    Attributes, BoundValue, ContainerRef, Kind, LitValue, NodeFlags, NodeId, PragmaKind, QName,
    VarKind,
};
use ejs_parser::parser::SourceTree;

/// Name of the reserved static-initializer slot.
pub const STATIC_INITIALIZER: &str = "-initializer-";

impl Compiler {
    pub(crate) fn phase_define(&mut self, tree: &mut SourceTree) {
        log::debug!("define: {}", tree.path);
        self.states.top_mut().mode = self.options.mode;
        self.states.top_mut().lang = self.options.lang;
        self.states.top_mut().var_block = Some(ContainerRef::Global);
        self.states.top_mut().module = Some(self.module_index(&self.options.module_name.clone(), 0));
        self.scopes = vec![ScopeEntry::new(ContainerRef::Global)];
        self.define_node(tree, tree.root);
    }

    fn define_children(&mut self, tree: &mut SourceTree, id: NodeId) {
        for child in tree.ast.children(id).to_vec() {
            self.define_node(tree, child);
        }
    }

    pub(crate) fn define_node(&mut self, tree: &mut SourceTree, id: NodeId) {
        match tree.ast.kind(id).clone() {
            Kind::Program | Kind::Directives | Kind::Pragmas | Kind::CaseElements => {
                self.define_children(tree, id)
            }
            Kind::Module { name, version } => {
                let index = self.module_index(&name, version);
                self.states.push();
                self.states.top_mut().module = Some(index);
                self.states.top_mut().default_namespace = Some(name);
                self.define_children(tree, id);
                self.states.pop();
            }
            Kind::Pragma(PragmaKind::Mode(mode)) => self.states.top_mut().mode = mode,
            Kind::Pragma(PragmaKind::Lang(lang)) => self.states.top_mut().lang = lang,
            Kind::Pragma(PragmaKind::Require(name)) => self.add_dependency(&name, 0, 0),
            Kind::UseModule {
                min_version,
                max_version,
            } => {
                let name = qname_of(tree, id).name;
                self.add_dependency(&name, min_version, max_version);
            }
            Kind::UseNamespace { default, .. } => {
                let name = qname_of(tree, id).name;
                if default {
                    self.states.top_mut().default_namespace = Some(name.clone());
                }
                let block = self
                    .graph
                    .container_block(self.scopes.last().expect("scope chain").container);
                self.graph.block_mut(block).open_namespaces.push(name);
            }
            Kind::Class(_) => self.define_class(tree, id),
            Kind::Function(_) => self.define_function(tree, id),
            Kind::VarDefinition(kind) => self.define_vars(tree, id, kind),
            Kind::Block => self.define_block(tree, id),
            Kind::Hash => {
                // Declarations inside the body are defined now and removed
                // again if the guard evaluates false.
                if let Some(body) = tree.ast.child(id, 1) {
                    self.define_node(tree, body);
                }
            }
            Kind::Catch => self.define_catch(tree, id),
            _ => self.define_children(tree, id),
        }
    }

    // ========================================================================
    // Classes
    // ========================================================================

    fn define_class(&mut self, tree: &mut SourceTree, id: NodeId) {
        let info = match tree.ast.kind(id) {
            Kind::Class(info) => info.clone(),
            _ => unreachable!(),
        };
        let node = tree.ast.node(id);
        let attrs = node.attributes;
        let loc = node.loc.clone();
        let doc = node.doc.clone();
        let mut qname = qname_of(tree, id);
        qname.space = declared_space(&qname, attrs);
        tree.ast.node_mut(id).qname = Some(qname.clone());

        let tid = self.graph.alloc_type(qname.clone(), attrs, info.is_interface);
        self.graph.type_mut(tid).base_name = info.base.clone();
        self.graph.type_mut(tid).interface_names = info.implements.clone();
        self.graph.type_mut(tid).doc = doc;

        // Reserved slots: the constructor in the instance block, the static
        // initializer in the statics block.
        let instance = self.graph.type_def(tid).instance;
        let statics = self.graph.type_def(tid).statics;
        self.graph
            .define(
                instance,
                QName::new(NS_CONSTRUCT, qname.name.clone()),
                Trait {
                    ty: None,
                    attributes: Attributes::CONSTRUCTOR,
                },
                Value::Empty,
            )
            .expect("fresh instance block");
        self.graph
            .define(
                statics,
                QName::new("", STATIC_INITIALIZER),
                Trait {
                    ty: None,
                    attributes: Attributes::INITIALIZER,
                },
                Value::Empty,
            )
            .expect("fresh statics block");

        let container = self
            .states
            .top()
            .var_block
            .unwrap_or(ContainerRef::Global);
        let block = self.graph.container_block(container);
        match self.graph.define(
            block,
            qname.clone(),
            Trait {
                ty: None,
                attributes: attrs | Attributes::READONLY,
            },
            Value::Type(tid),
        ) {
            Ok(index) => {
                let module = self.module_name();
                self.graph.prop_mut(block, index as usize).module = Some(module);
                let lookup = &mut tree.ast.node_mut(id).lookup;
                lookup.obj = Some(container);
                lookup.slot = index as i32;
                lookup.value = Some(BoundValue::Type(tid));
            }
            Err(dup) => self.error(&loc, format!("'{}' is already defined", dup.qname)),
        }

        self.states.push();
        {
            let top = self.states.top_mut();
            top.class = Some(tid);
            top.in_class = true;
            top.in_interface = info.is_interface;
            top.var_block = Some(ContainerRef::Instance(tid));
        }
        self.scopes.push(ScopeEntry::new(ContainerRef::Type(tid)));
        self.scopes.push(ScopeEntry::new(ContainerRef::Instance(tid)));

        if let Some(body) = tree.ast.children(id).last().copied() {
            self.define_node(tree, body);
        }

        self.scopes.pop();
        self.scopes.pop();
        self.states.pop();
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn define_function(&mut self, tree: &mut SourceTree, id: NodeId) {
        let info = match tree.ast.kind(id) {
            Kind::Function(info) => info.clone(),
            _ => unreachable!(),
        };
        let node = tree.ast.node(id);
        let mut attrs = node.attributes;
        let loc = node.loc.clone();
        let doc = node.doc.clone();

        let mut qname = match &node.qname {
            Some(q) => q.clone(),
            None => {
                // Anonymous function expressions are hoisted into a hidden
                // literal slot.
                let n = self.literal_counter;
                self.literal_counter += 1;
                QName::new("", format!("-fun-{}", n))
            }
        };
        qname.space = declared_space(&qname, attrs);
        tree.ast.node_mut(id).qname = Some(qname.clone());

        let in_class_body = self.states.top().in_class && !self.states.top().in_function;
        if info.constructor {
            attrs |= Attributes::CONSTRUCTOR;
        }

        let fid = self.graph.alloc_function(qname.clone(), attrs);
        {
            let f = self.graph.fun_mut(fid);
            f.num_args = info.num_args;
            f.num_defaults = info.num_defaults;
            f.has_rest = info.has_rest;
            f.doc = doc;
        }
        if let Some(result) = tree.ast.child(id, 1) {
            if matches!(tree.ast.kind(result), Kind::Void) {
                self.graph.fun_mut(fid).declared_void = true;
            }
        }

        // Parameters get private-namespace slots in the activation block.
        let activation = self.graph.fun(fid).activation;
        if let Some(args) = tree.ast.child(id, 0) {
            for param in tree.ast.children(args).to_vec() {
                let pname = qname_of(tree, param);
                let mut pattrs = Attributes::empty();
                if tree.ast.node(param).flags.contains(NodeFlags::IS_REST) {
                    pattrs |= Attributes::READONLY;
                }
                let pqname = QName::new(NS_PRIVATE, pname.name.clone());
                match self.graph.define(
                    activation,
                    pqname.clone(),
                    Trait {
                        ty: None,
                        attributes: pattrs,
                    },
                    Value::Empty,
                ) {
                    Ok(index) => {
                        tree.ast.node_mut(param).qname = Some(pqname);
                        let lookup = &mut tree.ast.node_mut(param).lookup;
                        lookup.obj = Some(ContainerRef::Function(fid));
                        lookup.slot = index as i32;
                    }
                    Err(dup) => {
                        let ploc = tree.ast.node(param).loc.clone();
                        self.error(&ploc, format!("duplicate parameter '{}'", dup.qname.name));
                    }
                }
            }
        }

        // Define the function property in its container.
        if info.constructor && in_class_body {
            let tid = self.states.top().class.expect("constructor outside class");
            let instance = self.graph.type_def(tid).instance;
            let ctor_name = QName::new(NS_CONSTRUCT, self.graph.type_def(tid).qname.name.clone());
            if let Some(index) = self.graph.find_exact(instance, &ctor_name) {
                self.graph.prop_mut(instance, index).value = Value::Function(fid);
                self.graph.type_mut(tid).has_constructor = true;
                self.graph.type_mut(tid).constructor = Some(fid);
                let lookup = &mut tree.ast.node_mut(id).lookup;
                lookup.obj = Some(ContainerRef::Instance(tid));
                lookup.slot = index as i32;
                lookup.value = Some(BoundValue::Function(fid));
            }
        } else {
            let container = if in_class_body {
                let tid = self.states.top().class.expect("class body");
                if attrs.contains(Attributes::STATIC) {
                    ContainerRef::Type(tid)
                } else {
                    ContainerRef::Instance(tid)
                }
            } else if self.states.top().in_function {
                ContainerRef::Function(self.states.top().fun.expect("enclosing function"))
            } else {
                self.states.top().var_block.unwrap_or(ContainerRef::Global)
            };
            let block = self.graph.container_block(container);
            match self.graph.define(
                block,
                qname.clone(),
                Trait {
                    ty: None,
                    attributes: attrs,
                },
                Value::Function(fid),
            ) {
                Ok(index) => {
                    if matches!(container, ContainerRef::Global) {
                        let module = self.module_name();
                        self.graph.prop_mut(block, index as usize).module = Some(module);
                    }
                    self.link_accessor_pair(block, index as usize, fid, attrs, &qname);
                    let lookup = &mut tree.ast.node_mut(id).lookup;
                    lookup.obj = Some(container);
                    lookup.slot = index as i32;
                    lookup.value = Some(BoundValue::Function(fid));
                }
                Err(dup) => self.error(&loc, format!("'{}' is already defined", dup.qname)),
            }
        }

        // Walk the body for nested declarations.
        self.states.push();
        {
            let top = self.states.top_mut();
            top.fun = Some(fid);
            top.fun_node = Some(id);
            top.in_function = true;
            top.in_method = in_class_body;
            top.var_block = Some(ContainerRef::Function(fid));
            top.let_block = None;
        }
        self.scopes.push(ScopeEntry::new(ContainerRef::Function(fid)));
        if let Some(body) = tree.ast.child(id, 2) {
            self.define_children(tree, body);
        }
        self.scopes.pop();
        self.states.pop();
    }

    /// Record getter/setter linkage: each accessor's `next_slot` is one
    /// past its partner's slot.
    fn link_accessor_pair(
        &mut self,
        block: crate::graph::BlockId,
        index: usize,
        fid: crate::graph::FunId,
        attrs: Attributes,
        qname: &QName,
    ) {
        if !attrs.contains(Attributes::GETTER) && !attrs.contains(Attributes::SETTER) {
            return;
        }
        let partner = self.graph.block(block).properties.iter().position(|p| {
            !p.deleted
                && p.qname == *qname
                && p.slot != index as u32
                && (p.trait_.attributes.contains(Attributes::GETTER)
                    || p.trait_.attributes.contains(Attributes::SETTER))
        });
        if let Some(partner_index) = partner {
            let partner_slot = self.graph.prop(block, partner_index).slot;
            if let Value::Function(partner_fid) = self.graph.prop(block, partner_index).value {
                self.graph.fun_mut(fid).next_slot = partner_slot + 1;
                self.graph.fun_mut(partner_fid).next_slot = index as u32 + 1;
            }
        }
    }

    // ========================================================================
    // Variables and namespaces
    // ========================================================================

    fn define_vars(&mut self, tree: &mut SourceTree, id: NodeId, kind: VarKind) {
        let def_attrs = tree.ast.node(id).attributes;
        let def_doc = tree.ast.node(id).doc.clone();
        let in_class_body = self.states.top().in_class && !self.states.top().in_function;

        for item in tree.ast.children(id).to_vec() {
            let node = tree.ast.node(item);
            let loc = node.loc.clone();
            let flags = node.flags;
            let mut qname = qname_of(tree, item);
            qname.space = declared_space(&qname, def_attrs);
            tree.ast.node_mut(item).qname = Some(qname.clone());

            let init = tree.ast.child(item, 1);
            let has_init = init
                .map(|i| !matches!(tree.ast.kind(i), Kind::Nop))
                .unwrap_or(false);

            let container = if in_class_body {
                let tid = self.states.top().class.expect("class body");
                if def_attrs.contains(Attributes::STATIC) {
                    if has_init {
                        self.graph.type_mut(tid).has_static_initializers = true;
                    }
                    ContainerRef::Type(tid)
                } else {
                    if has_init {
                        self.graph.type_mut(tid).has_instance_initializers = true;
                    }
                    tree.ast.node_mut(item).flags |= NodeFlags::INSTANCE_VAR;
                    ContainerRef::Instance(tid)
                }
            } else if kind != VarKind::Var {
                // let/const bind in the innermost lexical block.
                self.states
                    .top()
                    .let_block
                    .map(ContainerRef::Block)
                    .or(self.states.top().var_block)
                    .unwrap_or(ContainerRef::Global)
            } else {
                // var declarations also start in the let block; phase 2
                // hoists them into the var block.
                self.states
                    .top()
                    .let_block
                    .map(ContainerRef::Block)
                    .or(self.states.top().var_block)
                    .unwrap_or(ContainerRef::Global)
            };

            // Only literal initializers at module level become compile-time
            // constants; they are erased again after conditional evaluation.
            let (value, transient) = if flags.contains(NodeFlags::IS_NAMESPACE) {
                match init.map(|i| tree.ast.kind(i).clone()) {
                    Some(Kind::Literal(LitValue::Namespace(uri))) => (Value::Namespace(uri), false),
                    _ => (Value::Namespace(qname.name.clone()), false),
                }
            } else if matches!(container, ContainerRef::Global) && has_init {
                match init.map(|i| tree.ast.kind(i).clone()) {
                    Some(Kind::Literal(lit)) => (literal_value(&lit), true),
                    _ => (Value::Empty, false),
                }
            } else {
                (Value::Empty, false)
            };

            let block = self.graph.container_block(container);
            match self.graph.define(
                block,
                qname.clone(),
                Trait {
                    ty: None,
                    attributes: def_attrs,
                },
                value,
            ) {
                Ok(index) => {
                    {
                        let prop = self.graph.prop_mut(block, index as usize);
                        prop.transient = transient;
                        prop.doc = def_doc.clone();
                    }
                    if matches!(container, ContainerRef::Global) {
                        let module = self.module_name();
                        self.graph.prop_mut(block, index as usize).module = Some(module);
                    }
                    let lookup = &mut tree.ast.node_mut(item).lookup;
                    lookup.obj = Some(container);
                    lookup.slot = index as i32;
                }
                Err(dup) => self.error(&loc, format!("'{}' is already defined", dup.qname)),
            }

            // Initializers may contain function literals.
            if let Some(init) = init {
                self.define_node(tree, init);
            }
        }
    }

    // ========================================================================
    // Blocks and catch clauses
    // ========================================================================

    fn define_block(&mut self, tree: &mut SourceTree, id: NodeId) {
        let bid = self.graph.alloc_block("-block-");
        tree.ast.node_mut(id).lookup.obj = Some(ContainerRef::Block(bid));

        self.states.push();
        self.states.top_mut().let_block = Some(bid);
        self.states.top_mut().let_block_node = Some(id);
        self.states.top_mut().block_nest_count += 1;
        self.scopes.push(ScopeEntry::new(ContainerRef::Block(bid)));

        self.define_children(tree, id);

        self.scopes.pop();
        self.states.pop();
    }

    fn define_catch(&mut self, tree: &mut SourceTree, id: NodeId) {
        let bid = self.graph.alloc_block("-catch-");
        tree.ast.node_mut(id).lookup.obj = Some(ContainerRef::Block(bid));

        if let Some(arg) = tree.ast.child(id, 0) {
            if matches!(tree.ast.kind(arg), Kind::CatchArg) {
                let qname = qname_of(tree, arg);
                match self
                    .graph
                    .define(bid, qname, Trait::default(), Value::Empty)
                {
                    Ok(index) => {
                        let lookup = &mut tree.ast.node_mut(arg).lookup;
                        lookup.obj = Some(ContainerRef::Block(bid));
                        lookup.slot = index as i32;
                    }
                    Err(dup) => {
                        let loc = tree.ast.node(arg).loc.clone();
                        self.error(&loc, format!("'{}' is already defined", dup.qname));
                    }
                }
            }
        }

        self.states.push();
        self.states.top_mut().let_block = Some(bid);
        self.scopes.push(ScopeEntry::new(ContainerRef::Block(bid)));

        if let Some(body) = tree.ast.child(id, 1) {
            self.define_node(tree, body);
        }

        self.scopes.pop();
        self.states.pop();
    }

    // ========================================================================
    // Modules
    // ========================================================================

    pub(crate) fn module_index(&mut self, name: &str, version: u64) -> usize {
        if let Some(i) = self.modules.iter().position(|m| m.name == name) {
            if version != 0 {
                self.modules[i].version = version;
            }
            return i;
        }
        self.modules.push(crate::ModuleUnit::new(name, version));
        self.modules.len() - 1
    }

    fn module_name(&self) -> String {
        let index = self.states.top().module.unwrap_or(0);
        self.modules
            .get(index)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| self.options.module_name.clone())
    }

    fn add_dependency(&mut self, name: &str, min_version: u64, max_version: u64) {
        let index = self.states.top().module.unwrap_or(0);
        if let Some(module) = self.modules.get_mut(index) {
            if module.name != name && !module.dependencies.iter().any(|d| d.name == name) {
                module.dependencies.push(crate::Dependency {
                    name: name.to_string(),
                    min_version,
                    max_version,
                    checksum: 0,
                });
            }
        }
    }
}

fn qname_of(tree: &SourceTree, id: NodeId) -> QName {
    tree.ast
        .node(id)
        .qname
        .clone()
        .unwrap_or_else(|| QName::unqualified(""))
}

fn literal_value(lit: &LitValue) -> Value {
    match lit {
        LitValue::Null => Value::Null,
        LitValue::Undefined => Value::Undefined,
        LitValue::True => Value::Bool(true),
        LitValue::False => Value::Bool(false),
        LitValue::Int(n) => Value::Number(*n as f64),
        LitValue::Double(n) => Value::Number(*n),
        LitValue::Str(s) => Value::Str(s.clone()),
        LitValue::Namespace(s) => Value::Namespace(s.clone()),
        LitValue::Regex(_) | LitValue::Xml(_) => Value::Empty,
    }
}
