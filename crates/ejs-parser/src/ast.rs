//! Arena AST for Ejscript.
//!
//! Nodes live in a typed arena and refer to each other through `NodeId`
//! indices; parents are back references into the same arena. The `children`
//! list is the authoritative ordering — `left`/`right` are views of
//! `children[0]`/`children[1]`.

use bitflags::bitflags;
use std::rc::Rc;

/// Index of a node within an [`Ast`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A qualified name: a namespace/name pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QName {
    pub space: String,
    pub name: String,
}

impl QName {
    pub fn new(space: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            name: name.into(),
        }
    }

    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            space: String::new(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.space.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}::{}", self.space, self.name)
        }
    }
}

/// Source location of a node, with a snapshot of the source line.
#[derive(Debug, Clone, Default)]
pub struct Loc {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
    pub text: Rc<str>,
}

bitflags! {
    /// Declaration attributes, accumulated by the parser and consumed by
    /// the semantic phases and the module writer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u32 {
        const PUBLIC       = 1 << 0;
        const PRIVATE      = 1 << 1;
        const PROTECTED    = 1 << 2;
        const INTERNAL     = 1 << 3;
        const INTRINSIC    = 1 << 4;
        const STATIC       = 1 << 5;
        const FINAL        = 1 << 6;
        const NATIVE       = 1 << 7;
        const OVERRIDE     = 1 << 8;
        const ENUMERABLE   = 1 << 9;
        const DYNAMIC      = 1 << 10;
        const READONLY     = 1 << 11;
        const SYNCHRONIZED = 1 << 12;
        const VOLATILE     = 1 << 13;
        const GETTER       = 1 << 14;
        const SETTER       = 1 << 15;
        const CONSTRUCTOR  = 1 << 16;
        const CONST        = 1 << 17;
        const INITIALIZER  = 1 << 18;
    }
}

bitflags! {
    /// Per-node boolean state threaded between the phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u32 {
        const CREATE_BLOCK_OBJECT = 1 << 0;
        const BLOCK_CREATED       = 1 << 1;
        const LITERAL_NAMESPACE   = 1 << 2;
        const NEED_THIS           = 1 << 3;
        const NEED_DUP_OBJ        = 1 << 4;
        const IS_TYPE             = 1 << 5;
        const IS_ATTRIBUTE        = 1 << 6;
        const IS_REST             = 1 << 7;
        const IS_NAMESPACE        = 1 << 8;
        const INSTANCE_VAR        = 1 << 9;
        const LET_SCOPE           = 1 << 10;
        const DISABLED            = 1 << 11;
        const COMPOUND_ASSIGN     = 1 << 12;
        const HOISTED             = 1 << 13;
    }
}

/// The container a resolved name lives in. Indices refer into the
/// compiler's object graph; the AST only carries the opaque reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRef {
    Global,
    Block(u32),
    Type(u32),
    Instance(u32),
    Function(u32),
}

/// The value found at a bound slot, when the binder knows it.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Type(u32),
    Function(u32),
    Namespace(String),
}

/// Result of resolving a qualified name against a scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookup {
    /// Owning container, if resolution succeeded.
    pub obj: Option<ContainerRef>,
    /// Property slot; -1 means unbound (dynamic access).
    pub slot: i32,
    /// Enclosing lexical blocks above the current one.
    pub nth_block: u32,
    /// Base-class hops from `obj` to the owner of the property.
    pub nth_base: u32,
    /// Access can go through the implicit receiver.
    pub use_this: bool,
    /// Property belongs to the instance block, not the type.
    pub instance_property: bool,
    /// The left-hand side is a type reference (static access).
    pub owner_is_type: bool,
    /// Attributes of the resolved property's trait.
    pub trait_attrs: Attributes,
    /// Declared type of the resolved property, if any.
    pub trait_type: Option<u32>,
    /// Value currently bound at the slot, when known.
    pub value: Option<BoundValue>,
}

impl Lookup {
    pub fn unbound() -> Self {
        Self {
            slot: -1,
            ..Default::default()
        }
    }

    pub fn is_bound(&self) -> bool {
        self.slot >= 0 && self.obj.is_some()
    }
}

/// Factor for the packed `(major, minor, patch)` module version triple.
pub const VERSION_FACTOR: u64 = 10_000;

/// Pack a version triple as `major*F² + minor*F + patch`, F = 10000.
pub fn pack_version(major: u64, minor: u64, patch: u64) -> u64 {
    major * VERSION_FACTOR * VERSION_FACTOR + minor * VERSION_FACTOR + patch
}

/// Unpack a version produced by [`pack_version`].
pub fn unpack_version(version: u64) -> (u64, u64, u64) {
    (
        version / (VERSION_FACTOR * VERSION_FACTOR),
        version / VERSION_FACTOR % VERSION_FACTOR,
        version % VERSION_FACTOR,
    )
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    InstanceOf,
    Is,
    Cast,
    Like,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Plus,
    Not,
    BitNot,
    TypeOf,
    Delete,
    Void,
    PreInc,
    PreDec,
}

/// Postfix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    Inc,
    Dec,
}

/// Variable definition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Var,
    Let,
    Const,
}

/// Literal payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum LitValue {
    Null,
    Undefined,
    True,
    False,
    Int(i64),
    Double(f64),
    Str(String),
    Regex(String),
    Xml(String),
    Namespace(String),
}

/// Language level selected by `use lang`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LangLevel {
    Ecma,
    #[default]
    Plus,
    Fixed,
}

/// Compilation mode selected by `use strict` / `use standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Standard,
    Strict,
}

/// Pragma payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum PragmaKind {
    Mode(Mode),
    Lang(LangLevel),
    Require(String),
}

/// Case label kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    Case,
    Default,
}

/// Class payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassInfo {
    pub is_interface: bool,
    pub base: Option<QName>,
    pub implements: Vec<QName>,
}

/// Function payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunInfo {
    pub getter: bool,
    pub setter: bool,
    pub constructor: bool,
    pub has_body: bool,
    pub num_args: u32,
    pub num_defaults: u32,
    pub has_rest: bool,
}

/// Field payload for object literals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldInfo {
    pub space: String,
    pub name: String,
}

/// Node kind with per-kind payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Program,
    Module { name: String, version: u64 },
    Directives,
    Block,
    Class(ClassInfo),
    Function(FunInfo),
    VarDefinition(VarKind),
    QName,
    Dot,
    Call,
    BinaryOp(BinOp),
    Conditional,
    AssignOp(Option<BinOp>),
    UnaryOp(UnOp),
    PostfixOp(PostOp),
    Literal(LitValue),
    ObjectLiteral,
    ArrayLiteral,
    Field(FieldInfo),
    If,
    For,
    ForIn { each: bool },
    Do,
    Switch,
    CaseLabel(CaseKind),
    CaseElements,
    Break { label: Option<String> },
    Continue { label: Option<String> },
    Return,
    Throw,
    Try,
    Catch,
    CatchClauses,
    CatchArg,
    With,
    New,
    Super,
    This,
    Hash,
    UseNamespace { default: bool, literal: bool },
    UseModule { min_version: u64, max_version: u64 },
    Pragma(PragmaKind),
    Pragmas,
    Args,
    Expressions,
    TypeIdentifiers,
    Ref,
    Nop,
    EndFunction,
    Void,
    Attributes,
}

impl Kind {
    /// True for kinds that introduce a lexical block scope.
    pub fn opens_block(&self) -> bool {
        matches!(self, Kind::Block | Kind::Directives)
    }
}

/// One AST node.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: Kind,
    pub loc: Loc,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub qname: Option<QName>,
    pub lookup: Lookup,
    pub doc: Option<String>,
    pub flags: NodeFlags,
    pub attributes: Attributes,
}

impl Node {
    fn new(kind: Kind, loc: Loc) -> Self {
        Self {
            kind,
            loc,
            parent: None,
            children: Vec::new(),
            qname: None,
            lookup: Lookup::unbound(),
            doc: None,
            flags: NodeFlags::empty(),
            attributes: Attributes::empty(),
        }
    }
}

/// Arena of nodes for one source file (or one synthetic module).
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a new parentless node.
    pub fn alloc(&mut self, kind: Kind, loc: Loc) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(kind, loc));
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &Kind {
        &self.node(id).kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn child(&self, id: NodeId, n: usize) -> Option<NodeId> {
        self.node(id).children.get(n).copied()
    }

    /// `children[0]`, the binary-operation left operand.
    pub fn left(&self, id: NodeId) -> Option<NodeId> {
        self.child(id, 0)
    }

    /// `children[1]`, the binary-operation right operand.
    pub fn right(&self, id: NodeId) -> Option<NodeId> {
        self.child(id, 1)
    }

    /// Append `child` to `parent`, transferring ownership.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    /// Append `child` without reparenting it. Used for the shared
    /// left-hand-side reference of compound assignment, where the child is
    /// owned elsewhere; such edges go through a `Ref` node.
    pub fn append_shared(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(parent).children.push(child);
    }

    /// Insert `child` at `index` in `parent`'s child list.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.insert(index, child);
    }

    /// Detach `child` from `parent`. The child keeps its subtree and loses
    /// its parent back reference.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(parent).children.retain(|&c| c != child);
        if self.node(child).parent == Some(parent) {
            self.node_mut(child).parent = None;
        }
    }

    /// Walk `id`'s subtree in preorder, collecting node ids.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            for &c in self.children(n).iter().rev() {
                // Shared LHS edges would revisit owned subtrees.
                if self.node(n).kind == Kind::Ref {
                    continue;
                }
                stack.push(c);
            }
        }
        out
    }

    /// Deep-copy the subtree at `id` into `dst`, returning the new root.
    /// Shared `Ref` edges are not followed; the copy gets a fresh `Ref`
    /// with no target and must not be used for compound-assign subtrees.
    pub fn deep_copy_into(&self, id: NodeId, dst: &mut Ast) -> NodeId {
        let node = self.node(id);
        let copy = dst.alloc(node.kind.clone(), node.loc.clone());
        dst.node_mut(copy).qname = node.qname.clone();
        dst.node_mut(copy).flags = node.flags;
        dst.node_mut(copy).attributes = node.attributes;
        dst.node_mut(copy).doc = node.doc.clone();
        if node.kind != Kind::Ref {
            for &child in &node.children {
                let c = self.deep_copy_into(child, dst);
                dst.append(copy, c);
            }
        }
        copy
    }

    /// Verify the tree invariants below `root`:
    /// every child's parent back reference points at the node listing it,
    /// except for the shared edges under `Ref` nodes.
    pub fn check_well_formed(&self, root: NodeId) -> Result<(), String> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.kind == Kind::Ref {
                continue;
            }
            for &child in &node.children {
                if self.node(child).parent != Some(id) {
                    return Err(format!(
                        "child {:?} of {:?} has parent {:?}",
                        child,
                        id,
                        self.node(child).parent
                    ));
                }
                stack.push(child);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Loc {
        Loc::default()
    }

    #[test]
    fn test_append_sets_parent() {
        let mut ast = Ast::new();
        let parent = ast.alloc(Kind::Directives, loc());
        let child = ast.alloc(Kind::Nop, loc());
        ast.append(parent, child);

        assert_eq!(ast.node(child).parent, Some(parent));
        assert_eq!(ast.children(parent), &[child]);
        assert!(ast.check_well_formed(parent).is_ok());
    }

    #[test]
    fn test_left_right_track_children() {
        let mut ast = Ast::new();
        let op = ast.alloc(Kind::BinaryOp(BinOp::Add), loc());
        let a = ast.alloc(Kind::Literal(LitValue::Int(1)), loc());
        let b = ast.alloc(Kind::Literal(LitValue::Int(2)), loc());
        ast.append(op, a);
        ast.append(op, b);

        assert_eq!(ast.left(op), Some(a));
        assert_eq!(ast.right(op), Some(b));

        ast.remove_child(op, a);
        assert_eq!(ast.left(op), Some(b));
        assert_eq!(ast.right(op), None);
    }

    #[test]
    fn test_shared_lhs_via_ref() {
        // a += b builds: Assign(a, Binary(Ref->a, b)) without reparenting a.
        let mut ast = Ast::new();
        let assign = ast.alloc(Kind::AssignOp(Some(BinOp::Add)), loc());
        let lhs = ast.alloc(Kind::QName, loc());
        let rhs = ast.alloc(Kind::BinaryOp(BinOp::Add), loc());
        let shared = ast.alloc(Kind::Ref, loc());
        let b = ast.alloc(Kind::Literal(LitValue::Int(2)), loc());

        ast.append(assign, lhs);
        ast.append(assign, rhs);
        ast.append(rhs, shared);
        ast.append(rhs, b);
        ast.append_shared(shared, lhs);

        assert_eq!(ast.node(lhs).parent, Some(assign));
        assert!(ast.check_well_formed(assign).is_ok());
    }

    #[test]
    fn test_preorder() {
        let mut ast = Ast::new();
        let root = ast.alloc(Kind::Directives, loc());
        let a = ast.alloc(Kind::Nop, loc());
        let b = ast.alloc(Kind::Nop, loc());
        ast.append(root, a);
        ast.append(root, b);

        assert_eq!(ast.preorder(root), vec![root, a, b]);
    }
}
