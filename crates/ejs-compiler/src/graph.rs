//! The VM object graph the compiler populates: blocks of slotted
//! properties, types with static and instance blocks, functions with
//! activation blocks, and the global block.
//!
//! Everything is arena-allocated and referenced by index, including the
//! back references from types to their bases.

use ejs_bytecode::ExceptionEntry;
use ejs_parser::ast::{Attributes, ContainerRef, QName};

pub type TypeId = u32;
pub type FunId = u32;
pub type BlockId = u32;

/// Reserved namespace names.
pub const NS_PUBLIC: &str = "public";
pub const NS_PRIVATE: &str = "private";
pub const NS_PROTECTED: &str = "protected";
pub const NS_INTERNAL: &str = "internal";
pub const NS_INTRINSIC: &str = "intrinsic";
pub const NS_ITERATOR: &str = "iterator";
pub const NS_CONSTRUCT: &str = "construct";

/// Property metadata: declared type and attribute bits.
#[derive(Debug, Clone, Default)]
pub struct Trait {
    pub ty: Option<TypeId>,
    pub attributes: Attributes,
}

/// The value bound at a slot, when the compiler knows it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    Str(String),
    Namespace(String),
    Type(TypeId),
    Function(FunId),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }
}

/// One slotted property of a block.
#[derive(Debug, Clone)]
pub struct Property {
    pub qname: QName,
    pub trait_: Trait,
    pub value: Value,
    pub doc: Option<String>,
    /// Final slot number, assigned during fixup renumbering.
    pub slot: u32,
    /// Removed by conditional compilation or placeholder cleanup; keeps
    /// indices of surviving properties stable.
    pub deleted: bool,
    /// Constant stamped only for conditional evaluation; cleared by the
    /// Erase phase.
    pub transient: bool,
    /// Overrides the base-class slot with this number instead of taking a
    /// fresh one.
    pub override_slot: Option<u32>,
    /// Name of the module that declared this property (globals only).
    pub module: Option<String>,
}

impl Property {
    fn new(qname: QName, trait_: Trait, value: Value) -> Self {
        Self {
            qname,
            trait_,
            value,
            doc: None,
            slot: 0,
            deleted: false,
            transient: false,
            override_slot: None,
            module: None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self.value, Value::Function(_))
    }
}

/// A block: an ordered slot table plus its open-namespace list.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub name: String,
    pub properties: Vec<Property>,
    /// Open namespaces, oldest first; lookup iterates newest-to-oldest.
    pub open_namespaces: Vec<String>,
    /// Hidden blocks are not counted by `nth_block`.
    pub hidden: bool,
}

impl Block {
    /// Live (non-deleted) properties.
    pub fn live(&self) -> impl Iterator<Item = (usize, &Property)> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.deleted)
    }

    pub fn live_count(&self) -> u32 {
        self.properties.iter().filter(|p| !p.deleted).count() as u32
    }
}

/// A class or interface.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub qname: QName,
    pub attributes: Attributes,
    pub is_interface: bool,
    pub dynamic_instance: bool,
    pub builtin: bool,
    /// Unresolved names from the declaration; resolved during fixup.
    pub base_name: Option<QName>,
    pub interface_names: Vec<QName>,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub statics: BlockId,
    pub instance: BlockId,
    /// First instance slot of this type; the base layout occupies
    /// `0..instance_slot_offset`.
    pub instance_slot_offset: u32,
    pub has_constructor: bool,
    pub has_instance_initializers: bool,
    pub has_static_initializers: bool,
    pub constructor: Option<FunId>,
    pub fixed: bool,
    pub in_fixup: bool,
    /// Writer-side transitive-emission guard.
    pub written: bool,
    pub doc: Option<String>,
}

/// Finalized bytecode of a function.
#[derive(Debug, Clone, Default)]
pub struct FinalCode {
    pub bytes: Vec<u8>,
    pub exceptions: Vec<ExceptionEntry>,
    pub max_stack: u32,
}

/// A function: parameters and locals live in its activation block.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub qname: QName,
    pub attributes: Attributes,
    pub activation: BlockId,
    pub num_args: u32,
    pub num_defaults: u32,
    pub has_rest: bool,
    pub result_type: Option<TypeId>,
    pub declared_void: bool,
    /// Getter/setter linkage: one past the partner's slot, 0 if unused.
    pub next_slot: u32,
    pub lang: u8,
    /// Whether the function must carry a scope chain; cleared by the
    /// binder for functions that never reach outside themselves.
    pub full_scope: bool,
    pub code: Option<FinalCode>,
    pub doc: Option<String>,
}

/// Error from [`ObjGraph::define`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateProperty {
    pub qname: QName,
}

/// The whole graph.
#[derive(Debug, Default)]
pub struct ObjGraph {
    pub blocks: Vec<Block>,
    pub types: Vec<TypeDef>,
    pub funcs: Vec<FunctionDef>,
    pub global: BlockId,
    /// Number of leading global slots holding core builtins; those stay
    /// bindable even when global binding is off.
    pub core_slots: u32,
}

impl ObjGraph {
    pub fn new() -> Self {
        let mut graph = Self::default();
        graph.global = graph.alloc_block("-global-");
        graph.block_mut(graph.global).open_namespaces = vec![
            String::new(),
            NS_PUBLIC.to_string(),
            NS_INTERNAL.to_string(),
            NS_ITERATOR.to_string(),
        ];
        graph
    }

    // ===== Blocks =====

    pub fn alloc_block(&mut self, name: &str) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block {
            name: name.to_string(),
            open_namespaces: vec![String::new()],
            ..Default::default()
        });
        id
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }

    /// Define a property in `block`. A clash on the same qualified name in
    /// the same block is an error, except for the getter/setter pairing
    /// which shares the name with distinct accessor attributes.
    pub fn define(
        &mut self,
        block: BlockId,
        qname: QName,
        trait_: Trait,
        value: Value,
    ) -> Result<u32, DuplicateProperty> {
        let accessor =
            trait_.attributes.contains(Attributes::GETTER) as u8 * 2
                + trait_.attributes.contains(Attributes::SETTER) as u8;
        for p in &self.blocks[block as usize].properties {
            if p.deleted || p.qname != qname {
                continue;
            }
            let existing = p.trait_.attributes.contains(Attributes::GETTER) as u8 * 2
                + p.trait_.attributes.contains(Attributes::SETTER) as u8;
            // Getter + setter may share a name; anything else clashes.
            if accessor == 0 || existing == 0 || accessor == existing {
                return Err(DuplicateProperty { qname });
            }
        }
        let b = &mut self.blocks[block as usize];
        let index = b.properties.len() as u32;
        let mut prop = Property::new(qname, trait_, value);
        prop.slot = index;
        b.properties.push(prop);
        Ok(index)
    }

    /// Find a property by exact qualified name. Returns its index.
    pub fn find_exact(&self, block: BlockId, qname: &QName) -> Option<usize> {
        self.block(block)
            .properties
            .iter()
            .position(|p| !p.deleted && p.qname == *qname)
    }

    /// Find `name` in `block`, trying the given namespace spaces
    /// newest-to-oldest. An explicit `space` restricts to that namespace.
    pub fn find_in_block(&self, block: BlockId, qname: &QName) -> Option<usize> {
        if !qname.space.is_empty() {
            return self.find_exact(block, qname);
        }
        let b = self.block(block);
        for space in b.open_namespaces.iter().rev() {
            if let Some(idx) = b
                .properties
                .iter()
                .position(|p| !p.deleted && p.qname.name == qname.name && p.qname.space == *space)
            {
                return Some(idx);
            }
        }
        None
    }

    pub fn prop(&self, block: BlockId, index: usize) -> &Property {
        &self.block(block).properties[index]
    }

    pub fn prop_mut(&mut self, block: BlockId, index: usize) -> &mut Property {
        &mut self.blocks[block as usize].properties[index]
    }

    // ===== Types =====

    pub fn alloc_type(
        &mut self,
        qname: QName,
        attributes: Attributes,
        is_interface: bool,
    ) -> TypeId {
        let statics = self.alloc_block(&format!("{}-statics", qname.name));
        let instance = self.alloc_block(&format!("{}-instance", qname.name));
        let id = self.types.len() as TypeId;
        self.types.push(TypeDef {
            qname,
            attributes,
            is_interface,
            dynamic_instance: attributes.contains(Attributes::DYNAMIC),
            builtin: false,
            base_name: None,
            interface_names: Vec::new(),
            base: None,
            interfaces: Vec::new(),
            statics,
            instance,
            instance_slot_offset: 0,
            has_constructor: false,
            has_instance_initializers: false,
            has_static_initializers: false,
            constructor: None,
            fixed: false,
            in_fixup: false,
            written: false,
            doc: None,
        });
        id
    }

    #[inline]
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id as usize]
    }

    #[inline]
    pub fn type_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id as usize]
    }

    /// Total instance slot count of a type, including its base layout.
    pub fn instance_slot_count(&self, id: TypeId) -> u32 {
        let t = self.type_def(id);
        let local: u32 = self
            .block(t.instance)
            .properties
            .iter()
            .filter(|p| !p.deleted && p.override_slot.is_none())
            .count() as u32;
        t.instance_slot_offset + local
    }

    /// Search the instance block of `id` and its base chain for `qname`.
    /// Returns the owning type, property index, and base hops from `id`.
    pub fn find_instance_property(
        &self,
        id: TypeId,
        qname: &QName,
    ) -> Option<(TypeId, usize, u32)> {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(t) = current {
            let block = self.type_def(t).instance;
            if let Some(idx) = self.find_in_block(block, qname) {
                return Some((t, idx, hops));
            }
            current = self.type_def(t).base;
            hops += 1;
        }
        None
    }

    /// Search the static block of `id` and its base chain.
    pub fn find_static_property(&self, id: TypeId, qname: &QName) -> Option<(TypeId, usize, u32)> {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(t) = current {
            let block = self.type_def(t).statics;
            if let Some(idx) = self.find_in_block(block, qname) {
                return Some((t, idx, hops));
            }
            current = self.type_def(t).base;
            hops += 1;
        }
        None
    }

    // ===== Functions =====

    pub fn alloc_function(&mut self, qname: QName, attributes: Attributes) -> FunId {
        let activation = self.alloc_block(&format!("{}-activation", qname.name));
        self.block_mut(activation).open_namespaces =
            vec![String::new(), NS_PRIVATE.to_string()];
        let id = self.funcs.len() as FunId;
        self.funcs.push(FunctionDef {
            qname,
            attributes,
            activation,
            num_args: 0,
            num_defaults: 0,
            has_rest: false,
            result_type: None,
            declared_void: false,
            next_slot: 0,
            lang: 0,
            full_scope: true,
            code: None,
            doc: None,
        });
        id
    }

    #[inline]
    pub fn fun(&self, id: FunId) -> &FunctionDef {
        &self.funcs[id as usize]
    }

    #[inline]
    pub fn fun_mut(&mut self, id: FunId) -> &mut FunctionDef {
        &mut self.funcs[id as usize]
    }

    /// The block a container reference addresses.
    pub fn container_block(&self, container: ContainerRef) -> BlockId {
        match container {
            ContainerRef::Global => self.global,
            ContainerRef::Block(b) => b,
            ContainerRef::Type(t) => self.type_def(t).statics,
            ContainerRef::Instance(t) => self.type_def(t).instance,
            ContainerRef::Function(f) => self.fun(f).activation,
        }
    }

    /// Seed the core builtin types that occupy the leading global slots.
    pub fn seed_core_types(&mut self) {
        const CORE: &[(&str, bool)] = &[
            ("Object", true),
            ("Boolean", false),
            ("Number", false),
            ("String", false),
            ("Array", true),
            ("Function", false),
            ("Void", false),
            ("Error", false),
            ("RegExp", false),
            ("XML", true),
            ("XMLList", true),
            ("Iterator", false),
            ("StopIteration", false),
        ];
        for &(name, dynamic) in CORE {
            let qname = QName::new(NS_INTRINSIC, name);
            let tid = self.alloc_type(qname.clone(), Attributes::INTRINSIC, false);
            self.type_mut(tid).builtin = true;
            self.type_mut(tid).fixed = true;
            self.type_mut(tid).dynamic_instance = dynamic;
            if name == "Iterator" {
                // Instance slot 0 is `next`, dispatched by for/in loops.
                let next = self.alloc_function(QName::new(NS_PUBLIC, "next"), Attributes::empty());
                let block = self.type_def(tid).instance;
                self.define(
                    block,
                    QName::new(NS_PUBLIC, "next"),
                    Trait::default(),
                    Value::Function(next),
                )
                .expect("fresh instance block");
            }
            self.define(
                self.global,
                qname,
                Trait {
                    ty: None,
                    attributes: Attributes::INTRINSIC,
                },
                Value::Type(tid),
            )
            .expect("fresh global");
        }
        self.block_mut(self.global)
            .open_namespaces
            .push(NS_INTRINSIC.to_string());
        self.core_slots = self.block(self.global).live_count();
    }

    /// Resolve a named type among the globals (used for base classes,
    /// catch types, and annotations).
    pub fn find_global_type(&self, qname: &QName) -> Option<TypeId> {
        let idx = self.find_in_block(self.global, qname)?;
        match self.prop(self.global, idx).value {
            Value::Type(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_find() {
        let mut g = ObjGraph::new();
        let slot = g
            .define(
                g.global,
                QName::new("", "x"),
                Trait::default(),
                Value::Empty,
            )
            .unwrap();
        assert_eq!(slot, 0);
        assert_eq!(g.find_in_block(g.global, &QName::new("", "x")), Some(0));
        assert_eq!(g.find_in_block(g.global, &QName::new("", "y")), None);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut g = ObjGraph::new();
        let q = QName::new("", "x");
        g.define(g.global, q.clone(), Trait::default(), Value::Empty)
            .unwrap();
        assert!(g
            .define(g.global, q, Trait::default(), Value::Empty)
            .is_err());
    }

    #[test]
    fn test_getter_setter_share_name() {
        let mut g = ObjGraph::new();
        let q = QName::new("", "width");
        let getter = Trait {
            ty: None,
            attributes: Attributes::GETTER,
        };
        let setter = Trait {
            ty: None,
            attributes: Attributes::SETTER,
        };
        g.define(g.global, q.clone(), getter.clone(), Value::Empty)
            .unwrap();
        g.define(g.global, q.clone(), setter, Value::Empty).unwrap();
        assert!(g.define(g.global, q, getter, Value::Empty).is_err());
    }

    #[test]
    fn test_namespace_shadowing_order() {
        // Newest open namespace wins for unqualified lookup.
        let mut g = ObjGraph::new();
        g.define(
            g.global,
            QName::new(NS_PUBLIC, "x"),
            Trait::default(),
            Value::Number(1.0),
        )
        .unwrap();
        g.define(
            g.global,
            QName::new(NS_INTERNAL, "x"),
            Trait::default(),
            Value::Number(2.0),
        )
        .unwrap();
        let idx = g.find_in_block(g.global, &QName::new("", "x")).unwrap();
        // "internal" was opened after "public".
        assert_eq!(g.prop(g.global, idx).qname.space, NS_INTERNAL);
    }

    #[test]
    fn test_explicit_space_shortcuts() {
        let mut g = ObjGraph::new();
        g.define(
            g.global,
            QName::new(NS_PUBLIC, "x"),
            Trait::default(),
            Value::Empty,
        )
        .unwrap();
        assert!(g
            .find_in_block(g.global, &QName::new(NS_PUBLIC, "x"))
            .is_some());
        assert!(g
            .find_in_block(g.global, &QName::new(NS_PRIVATE, "x"))
            .is_none());
    }

    #[test]
    fn test_instance_chain_search() {
        let mut g = ObjGraph::new();
        let base = g.alloc_type(QName::new("", "Base"), Attributes::empty(), false);
        let derived = g.alloc_type(QName::new("", "Derived"), Attributes::empty(), false);
        g.type_mut(derived).base = Some(base);

        let block = g.type_def(base).instance;
        g.define(
            block,
            QName::new("", "size"),
            Trait::default(),
            Value::Empty,
        )
        .unwrap();

        let (owner, _, hops) = g
            .find_instance_property(derived, &QName::new("", "size"))
            .unwrap();
        assert_eq!(owner, base);
        assert_eq!(hops, 1);
    }

    #[test]
    fn test_core_types_seeded() {
        let mut g = ObjGraph::new();
        g.seed_core_types();
        assert!(g.core_slots > 0);
        assert!(g.find_global_type(&QName::new("", "Object")).is_some());
        let xml = g.find_global_type(&QName::new("", "XML")).unwrap();
        assert!(g.type_def(xml).dynamic_instance);
        let iter = g.find_global_type(&QName::new("", "Iterator")).unwrap();
        let next = g
            .find_in_block(g.type_def(iter).instance, &QName::new("", "next"))
            .unwrap();
        assert_eq!(next, 0);
    }

    #[test]
    fn test_deleted_properties_invisible() {
        let mut g = ObjGraph::new();
        let q = QName::new("", "gone");
        g.define(g.global, q.clone(), Trait::default(), Value::Empty)
            .unwrap();
        let idx = g.find_in_block(g.global, &q).unwrap();
        g.prop_mut(g.global, idx).deleted = true;
        assert_eq!(g.find_in_block(g.global, &q), None);
        // And redefinition works.
        assert!(g.define(g.global, q, Trait::default(), Value::Empty).is_ok());
    }
}
